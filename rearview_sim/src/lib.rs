//! RearView Deterministic Simulation Harness
//!
//! Drives the [`rearview_core::TrackManager`] with synthetic rear-radar
//! detections generated from ground truth, then scores the tracks against
//! the reference trajectories.
//!
//! All randomness comes from a single 64-bit seed, so a failing run can be
//! replayed exactly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   ScenarioRunner                     │
//! │                                                      │
//! │  ┌──────────────┐  DetectionList  ┌───────────────┐  │
//! │  │    Oracle    │────────────────►│ TrackManager  │  │
//! │  │ (truth, noise│                 │ (rearview_core│  │
//! │  │  clutter)    │                 │               │  │
//! │  └──────┬───────┘                 └───────┬───────┘  │
//! │         │ ReferencePoint                  │ Snapshot │
//! │         ▼                                 ▼          │
//! │  ┌──────────────────────────────────────────────┐    │
//! │  │          RMSE + pass/fail criteria           │    │
//! │  └──────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use rearview_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Overtake).unwrap();
//! assert!(result.passed);
//! ```

mod error;
pub mod oracle;
pub mod runner;
pub mod scenarios;

pub use error::SimError;
pub use oracle::{CycleStats, GroundTruthTarget, Oracle, RadarConfig};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
