//! Scenario runner - drives the track manager with oracle detections and
//! scores the resulting tracks against the reference trajectories.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector2;
use serde::Serialize;
use tracing::{debug, info};

use rearview_core::{ReferenceList, TrackId, TrackManager, TrackerConfig};

use crate::error::SimError;
use crate::oracle::{Oracle, RadarConfig};
use crate::scenarios::ScenarioId;

/// Tracks farther than this from a reference point are not matched to it.
const MATCH_RADIUS: f64 = 5.0;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Radar cycles executed
    pub cycles: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Live tracks at the end
    pub track_count: usize,

    /// Active or Coasting tracks at the end
    pub confirmed_count: usize,

    /// Position RMSE of confirmed tracks against the reference, in meters
    pub rmse: Option<f64>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Detections originating from a target
    pub target_detections: u64,

    /// False detections
    pub clutter_detections: u64,

    pub tracks_created: u64,

    pub tracks_deleted: u64,

    pub merges: u64,

    /// Largest number of simultaneously confirmed tracks
    pub max_confirmed: usize,

    /// Every track that was ever confirmed
    pub confirmed_ids: BTreeSet<TrackId>,
}

/// Everything recorded while driving one scenario.
struct Run {
    manager: TrackManager,
    metrics: ScenarioMetrics,
    references: BTreeMap<u64, ReferenceList>,
    /// Confirmed track positions per MCC
    confirmed_positions: BTreeMap<u64, Vec<Vector2<f64>>>,
    final_time_secs: f64,
}

impl Run {
    /// RMSE over all in-view reference samples that have a confirmed track
    /// within `MATCH_RADIUS`.
    fn rmse(&self, oracle: &Oracle) -> Option<f64> {
        let mut sum = 0.0;
        let mut samples = 0usize;

        for reference in self.references.values().flat_map(|list| list.iter()) {
            let truth = Vector2::new(reference.target_x, reference.target_y);
            if !oracle.in_field_of_view(&truth) {
                continue;
            }
            let Some(positions) = self.confirmed_positions.get(&reference.mcc_left) else {
                continue;
            };
            let nearest = positions
                .iter()
                .map(|p| (p - truth).norm())
                .fold(f64::INFINITY, f64::min);
            if nearest <= MATCH_RADIUS {
                sum += nearest * nearest;
                samples += 1;
            }
        }

        (samples > 0).then(|| (sum / samples as f64).sqrt())
    }

    fn confirmed_near(&self, truth: Vector2<f64>, radius: f64) -> bool {
        self.manager
            .tracks()
            .filter(|t| t.state().is_confirmed())
            .any(|t| (t.position() - truth).norm() <= radius)
    }
}

/// Runs rear-radar scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Radar cycles per scenario
    cycles: u64,

    /// Track manager configuration
    config: TrackerConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            cycles: 200,
            config: TrackerConfig::default(),
        }
    }

    /// Sets the number of radar cycles.
    pub fn with_cycles(mut self, cycles: u64) -> Self {
        self.cycles = cycles;
        self
    }

    /// Sets the track manager configuration.
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    fn oracle(&self, radar: RadarConfig) -> Result<Oracle, SimError> {
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        Ok(Oracle::new(physics_seed, radar)?.with_ego_speed(25.0))
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        match scenario {
            ScenarioId::SingleTarget => self.run_single_target(),
            ScenarioId::Overtake => self.run_overtake(),
            ScenarioId::ParallelPair => self.run_parallel_pair(),
            ScenarioId::Clutter => self.run_clutter(),
            ScenarioId::Dropout => self.run_dropout(),
        }
    }

    /// Steps the oracle and the track manager through all cycles.
    fn drive(&self, oracle: &mut Oracle) -> Result<Run, SimError> {
        let mut run = Run {
            manager: TrackManager::new(self.config.clone())?,
            metrics: ScenarioMetrics::default(),
            references: BTreeMap::new(),
            confirmed_positions: BTreeMap::new(),
            final_time_secs: 0.0,
        };
        let dt = self.config.filter.dt_sample;

        for cycle in 0..self.cycles {
            if cycle > 0 {
                oracle.step(dt);
            }

            let detections = oracle.generate_cycle()?;
            let stats = oracle.last_stats();
            let snapshot = run.manager.advance_cycle(detections)?;

            let metrics = &mut run.metrics;
            metrics.target_detections += stats.target_detections as u64;
            metrics.clutter_detections += stats.clutter as u64;
            metrics.tracks_created += snapshot.created.len() as u64;
            metrics.tracks_deleted += snapshot.deleted.len() as u64;
            metrics.merges += snapshot.merges.len() as u64;

            let confirmed: Vec<_> = snapshot.confirmed().collect();
            metrics.max_confirmed = metrics.max_confirmed.max(confirmed.len());
            metrics.confirmed_ids.extend(confirmed.iter().map(|t| t.id));
            run.confirmed_positions
                .insert(snapshot.mcc, confirmed.iter().map(|t| t.latest.position()).collect());

            for (target, reference) in oracle.reference_points() {
                run.references.entry(target).or_default().push(reference);
            }

            if cycle % 20 == 0 {
                debug!(
                    "  t={:.2}s | mcc={} | detections={} | tracks={} | confirmed={}",
                    snapshot.timestamp,
                    snapshot.mcc,
                    stats.target_detections + stats.clutter,
                    snapshot.tracks.len(),
                    confirmed.len()
                );
            }
        }

        run.final_time_secs = oracle.time();
        Ok(run)
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        run: Run,
        oracle: &Oracle,
        failure: Option<String>,
    ) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure.is_none(),
            cycles: self.cycles,
            final_time_secs: run.final_time_secs,
            track_count: run.manager.track_count(),
            confirmed_count: run.manager.confirmed_count(),
            rmse: run.rmse(oracle),
            failure_reason: failure,
            metrics: run.metrics,
        }
    }

    fn check_rmse(run: &Run, oracle: &Oracle, limit: f64) -> Option<String> {
        match run.rmse(oracle) {
            Some(rmse) if rmse <= limit => None,
            Some(rmse) => Some(format!("RMSE {:.2}m exceeds {:.2}m", rmse, limit)),
            None => Some("no confirmed track ever matched the reference".to_string()),
        }
    }

    /// RV-001: one target closing in the ego lane.
    fn run_single_target(&self) -> Result<ScenarioResult, SimError> {
        let mut oracle = self.oracle(RadarConfig::default())?;
        oracle.spawn_target(Vector2::new(30.0, 0.0), Vector2::new(-2.0, 0.0));

        let run = self.drive(&mut oracle)?;
        let failure = if run.manager.confirmed_count() != 1 {
            Some(format!("expected 1 confirmed track, found {}", run.manager.confirmed_count()))
        } else {
            Self::check_rmse(&run, &oracle, 1.0)
        };
        Ok(self.finish(ScenarioId::SingleTarget, run, &oracle, failure))
    }

    /// RV-002: a faster vehicle overtakes in the left lane.
    fn run_overtake(&self) -> Result<ScenarioResult, SimError> {
        let mut oracle = self.oracle(RadarConfig::default())?;
        oracle.spawn_target(Vector2::new(40.0, -3.5), Vector2::new(-8.0, 0.0));

        let run = self.drive(&mut oracle)?;
        let failure = if run.metrics.max_confirmed == 0 {
            Some("overtaking vehicle was never confirmed".to_string())
        } else if run.manager.track_count() != 0 {
            Some(format!("{} tracks survive after the vehicle left", run.manager.track_count()))
        } else {
            Self::check_rmse(&run, &oracle, 1.5)
        };
        Ok(self.finish(ScenarioId::Overtake, run, &oracle, failure))
    }

    /// RV-003: two vehicles side by side in adjacent lanes.
    fn run_parallel_pair(&self) -> Result<ScenarioResult, SimError> {
        let mut oracle = self.oracle(RadarConfig::default())?;
        oracle.spawn_target(Vector2::new(25.0, -3.5), Vector2::new(-1.0, 0.0));
        oracle.spawn_target(Vector2::new(25.0, 3.5), Vector2::new(-1.0, 0.0));

        let run = self.drive(&mut oracle)?;
        let failure = if run.metrics.merges > 0 {
            Some(format!("{} unexpected merges", run.metrics.merges))
        } else if run.manager.confirmed_count() != 2 {
            Some(format!("expected 2 confirmed tracks, found {}", run.manager.confirmed_count()))
        } else {
            Self::check_rmse(&run, &oracle, 1.0)
        };
        Ok(self.finish(ScenarioId::ParallelPair, run, &oracle, failure))
    }

    /// RV-004: one vehicle among clutter.
    fn run_clutter(&self) -> Result<ScenarioResult, SimError> {
        let radar = RadarConfig {
            clutter_per_cycle: 3,
            ..Default::default()
        };
        let mut oracle = self.oracle(radar)?;
        let id = oracle.spawn_target(Vector2::new(35.0, 1.5), Vector2::new(-1.5, 0.0));

        let run = self.drive(&mut oracle)?;
        let truth = oracle.target(id).map_or_else(Vector2::zeros, |t| t.position);
        let failure = if !run.confirmed_near(truth, 2.0) {
            Some("no confirmed track on the vehicle".to_string())
        } else {
            Self::check_rmse(&run, &oracle, 1.5)
        };
        Ok(self.finish(ScenarioId::Clutter, run, &oracle, failure))
    }

    /// RV-005: detections vanish for a few cycles.
    fn run_dropout(&self) -> Result<ScenarioResult, SimError> {
        let radar = RadarConfig {
            detection_probability: 1.0,
            ..Default::default()
        };
        let mut oracle = self.oracle(radar)?;
        let id = oracle.spawn_target(Vector2::new(30.0, -1.0), Vector2::new(-1.0, 0.2));
        oracle.set_blackout(id, 60, 63);

        let run = self.drive(&mut oracle)?;
        let failure = if run.metrics.confirmed_ids.len() != 1 {
            Some(format!(
                "track identity changed: {} distinct confirmed tracks",
                run.metrics.confirmed_ids.len()
            ))
        } else if run.manager.confirmed_count() != 1 {
            Some("track was lost during the dropout".to_string())
        } else {
            Self::check_rmse(&run, &oracle, 1.0)
        };
        Ok(self.finish(ScenarioId::Dropout, run, &oracle, failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_target_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::SingleTarget).unwrap();

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.confirmed_count, 1);
        assert!(result.rmse.unwrap() < 1.0);
    }

    #[test]
    fn test_overtake_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::Overtake).unwrap();

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.track_count, 0);
        assert!(result.metrics.tracks_deleted >= 1);
    }

    #[test]
    fn test_parallel_pair_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::ParallelPair).unwrap();

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.merges, 0);
    }

    #[test]
    fn test_clutter_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::Clutter).unwrap();

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.clutter_detections, 3 * result.cycles);
    }

    #[test]
    fn test_dropout_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::Dropout).unwrap();

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.confirmed_ids.len(), 1);
    }

    #[test]
    fn test_same_seed_same_result() {
        let a = ScenarioRunner::new(7).with_cycles(80).run(ScenarioId::Clutter).unwrap();
        let b = ScenarioRunner::new(7).with_cycles(80).run(ScenarioId::Clutter).unwrap();

        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.rmse, b.rmse);
    }

    #[test]
    fn test_too_short_overtake_fails() {
        // The vehicle is still in view when the run ends
        let result = ScenarioRunner::new(42).with_cycles(40).run(ScenarioId::Overtake).unwrap();

        assert!(!result.passed);
        assert!(result.failure_reason.is_some());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TrackerConfig {
            gate_dx: -1.0,
            ..Default::default()
        };
        let err = ScenarioRunner::new(1).with_config(config).run(ScenarioId::SingleTarget);
        assert!(matches!(err, Err(SimError::Config(_))));
    }
}
