//! Traffic scenarios behind the ego car.

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// RV-001: one vehicle closing in the ego lane
    SingleTarget,

    /// RV-002: a faster vehicle overtakes in the left lane and leaves the field of view
    Overtake,

    /// RV-003: two vehicles in adjacent lanes driving side by side
    ParallelPair,

    /// RV-004: one vehicle among uniform false detections
    Clutter,

    /// RV-005: a vehicle disappears for a few cycles and comes back
    Dropout,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SingleTarget,
            ScenarioId::Overtake,
            ScenarioId::ParallelPair,
            ScenarioId::Clutter,
            ScenarioId::Dropout,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SingleTarget => "single_target",
            ScenarioId::Overtake => "overtake",
            ScenarioId::ParallelPair => "parallel_pair",
            ScenarioId::Clutter => "clutter",
            ScenarioId::Dropout => "dropout",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SingleTarget => "One vehicle closing from 30 m at 2 m/s in the ego lane",
            ScenarioId::Overtake => "Vehicle passes at 8 m/s in the left lane, track must age out",
            ScenarioId::ParallelPair => "Two vehicles 7 m apart laterally, tracks must stay separate",
            ScenarioId::Clutter => "One vehicle plus 3 false detections per cycle",
            ScenarioId::Dropout => "Detections vanish for 4 cycles, track must coast and recover",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single_target" | "single" | "rv-001" => Ok(ScenarioId::SingleTarget),
            "overtake" | "rv-002" => Ok(ScenarioId::Overtake),
            "parallel_pair" | "parallel" | "rv-003" => Ok(ScenarioId::ParallelPair),
            "clutter" | "rv-004" => Ok(ScenarioId::Clutter),
            "dropout" | "rv-005" => Ok(ScenarioId::Dropout),
            _ => Err(SimError::unknown_scenario(s)),
        }
    }
}
