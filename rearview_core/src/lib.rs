//! RearView Core - Multi-Target Tracking for Rear-Looking Automotive Radar
//!
//! Each radar cycle the [`TrackManager`] receives a [`DetectionList`] and:
//! 1. **Predicts** every track with its own recursive filter
//!    (linear, extended or fading-memory Kalman)
//! 2. **Associates** detections by rectangular gating and greedy
//!    Global Nearest Neighbor resolution
//! 3. **Manages life cycles**: Tentative -> Active <-> Coasting -> Deleted,
//!    including merging of tracks that describe the same object
//!
//! ```no_run
//! use rearview_core::{DetectionList, DetectionPoint, TrackManager, TrackerConfig};
//!
//! let mut manager = TrackManager::new(TrackerConfig::default())?;
//! let detections = DetectionList::from_points(0, [DetectionPoint::at_position(0, 12.0, 1.5)?])?;
//! let snapshot = manager.advance(detections, 0.0)?;
//! println!("{} tracks", snapshot.tracks.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod detection;
pub mod error;
pub mod filter_coordinator;
pub mod filters;
pub mod models;
pub mod reference;
pub mod track;
pub mod tracking;

// Re-export key types for convenience
pub use detection::{
    two_point_projection, DetectionList, DetectionPoint, DetectionRecording, Interval, RadarReading,
    RadarSide, Selection,
};
pub use error::{ConfigError, DetectionError, FilterError, TrackingError};
pub use filter_coordinator::{FilterHandle, FilterSpec, FilterType};
pub use filters::{Estimate, ExtendedKalmanFilter, FadingKalmanFilter, KalmanFilter, RecursiveFilter};
pub use models::{MeasurementSpace, MotionKind, MotionModel, ObservationModel};
pub use reference::{ReferenceList, ReferencePoint};
pub use track::{PointKind, Track, TrackId, TrackPoint, TrackSnapshot, TrackState};
pub use tracking::{CycleSnapshot, DistanceMetric, MergeEvent, TrackManager, TrackerConfig};
