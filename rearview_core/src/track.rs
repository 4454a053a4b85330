//! Track model: identity, life-cycle state and append-only history.

use std::fmt;

use nalgebra::{Vector2, Vector4};
use serde::{Deserialize, Serialize};

use crate::detection::{two_point_projection, DetectionPoint};
use crate::error::{FilterError, TrackingError};
use crate::filter_coordinator::{FilterHandle, FilterSpec};
use crate::filters::{Estimate, RecursiveFilter};

/// Sequential track identifier; smaller means older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Life-cycle state of a track.
///
/// ```text
/// Tentative --hits--> Active <--hit-- Coasting
///     |                 |  --miss-->     |
///     +----misses-------+---> Deleted <--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Active,
    Coasting,
    Deleted,
}

impl TrackState {
    /// Active or Coasting.
    pub fn is_confirmed(self) -> bool {
        matches!(self, TrackState::Active | TrackState::Coasting)
    }
}

/// How a history point came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    /// Seeded from a single detection
    Initiated,
    /// Tentative track without a detection this cycle
    Predicted,
    /// Corrected with a matched detection
    Updated,
    /// Confirmed track dead-reckoning without a detection
    Coasted,
    /// Fused with a merged track
    Merged,
}

/// One immutable snapshot of a track's filtered state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub mcc: u64,
    pub timestamp: f64,

    pub x: f64,
    pub vx: f64,
    pub y: f64,
    pub vy: f64,
    pub ax: Option<f64>,
    pub ay: Option<f64>,
    /// atan2(vy, vx)
    pub heading: f64,

    /// Variances of x and y
    pub position_variance: [f64; 2],
    /// Variances of vx and vy
    pub velocity_variance: [f64; 2],

    pub kind: PointKind,

    // Detection provenance (set when a detection fed this point)
    pub beam: Option<u8>,
    pub radial_velocity: Option<f64>,
    pub azimuth: Option<f64>,
}

impl TrackPoint {
    /// Captures the current estimate of `filter`.
    pub fn from_filter(filter: &FilterHandle, mcc: u64, timestamp: f64, kind: PointKind) -> Self {
        let position = filter.position();
        let velocity = filter.velocity();
        let acceleration = filter.acceleration();
        let (position_variance, velocity_variance) = filter.variances();

        Self {
            mcc,
            timestamp,
            x: position.x,
            vx: velocity.x,
            y: position.y,
            vy: velocity.y,
            ax: acceleration.map(|a| a.x),
            ay: acceleration.map(|a| a.y),
            heading: velocity.y.atan2(velocity.x),
            position_variance: [position_variance.x, position_variance.y],
            velocity_variance: [velocity_variance.x, velocity_variance.y],
            kind,
            beam: None,
            radial_velocity: None,
            azimuth: None,
        }
    }

    fn with_detection(mut self, detection: &DetectionPoint) -> Self {
        self.beam = Some(detection.beam());
        self.radial_velocity = Some(detection.velocity());
        self.azimuth = Some(detection.azimuth());
        self
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.vx, self.vy)
    }

    /// `[x, vx, y, vy]`
    pub fn state_vector(&self) -> Vector4<f64> {
        Vector4::new(self.x, self.vx, self.y, self.vy)
    }
}

/// A persistent tracked object.
///
/// The track exclusively owns its filter and its history. Only the track
/// manager mutates tracks, once per cycle.
#[derive(Debug, Clone)]
pub struct Track {
    id: TrackId,
    state: TrackState,
    filter: FilterHandle,

    /// Append-only, ordered by MCC
    history: Vec<TrackPoint>,
    latest: TrackPoint,

    /// Associated detections so far
    hits: u32,
    /// Consecutive cycles without a detection
    misses: u32,

    created_mcc: u64,
    last_detection: DetectionPoint,
    last_detection_mcc: u64,
    last_detection_timestamp: f64,

    /// Identifiers merged into this track
    absorbed: Vec<TrackId>,
}

impl Track {
    /// Seeds a Tentative track from one detection.
    pub(crate) fn new(
        id: TrackId,
        filter: FilterHandle,
        detection: DetectionPoint,
        timestamp: f64,
    ) -> Self {
        let mcc = detection.mcc();
        let latest =
            TrackPoint::from_filter(&filter, mcc, timestamp, PointKind::Initiated).with_detection(&detection);

        Self {
            id,
            state: TrackState::Tentative,
            filter,
            history: vec![latest],
            latest,
            hits: 1,
            misses: 0,
            created_mcc: mcc,
            last_detection: detection,
            last_detection_mcc: mcc,
            last_detection_timestamp: timestamp,
            absorbed: Vec::new(),
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn filter(&self) -> &FilterHandle {
        &self.filter
    }

    pub fn history(&self) -> &[TrackPoint] {
        &self.history
    }

    /// Most recent history point; always reflects the filter's latest step.
    pub fn latest(&self) -> &TrackPoint {
        &self.latest
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn created_mcc(&self) -> u64 {
        self.created_mcc
    }

    pub fn last_detection_mcc(&self) -> u64 {
        self.last_detection_mcc
    }

    pub fn absorbed(&self) -> &[TrackId] {
        &self.absorbed
    }

    /// Predicted position used for gating.
    pub fn position(&self) -> Vector2<f64> {
        self.filter.position()
    }

    fn push_point(&mut self, point: TrackPoint) {
        self.history.push(point);
        self.latest = point;
    }

    pub(crate) fn predict(&mut self, dt: f64) -> Result<Estimate, FilterError> {
        self.filter.predict(dt)
    }

    /// Incorporates a matched detection and returns the new state if it changed.
    ///
    /// The second detection of a track re-initialises the filter from the
    /// two-point projection so the velocity starts out meaningful. On error
    /// nothing about the track changes.
    pub(crate) fn apply_hit(
        &mut self,
        detection: &DetectionPoint,
        timestamp: f64,
        spec: &FilterSpec,
        confirm_hits: u32,
    ) -> Result<Option<TrackState>, TrackingError> {
        if self.state == TrackState::Tentative && self.hits == 1 {
            let dt = timestamp - self.last_detection_timestamp;
            let projection = two_point_projection(&self.last_detection, detection, dt)?;
            let (state, covariance) =
                spec.initial_estimate(projection.position, Some(projection.velocity));
            self.filter.reinitialize(state, covariance)?;
        } else {
            let measurement = self.filter.measurement_of(detection);
            self.filter.update(&measurement)?;
        }

        self.hits += 1;
        self.misses = 0;
        self.last_detection = *detection;
        self.last_detection_mcc = detection.mcc();
        self.last_detection_timestamp = timestamp;

        let next = match self.state {
            TrackState::Tentative if self.hits >= confirm_hits => Some(TrackState::Active),
            TrackState::Coasting => Some(TrackState::Active),
            _ => None,
        };
        if let Some(state) = next {
            self.state = state;
        }

        let point = TrackPoint::from_filter(&self.filter, detection.mcc(), timestamp, PointKind::Updated)
            .with_detection(detection);
        self.push_point(point);

        Ok(next)
    }

    /// Records a cycle without a detection; returns the new state if it changed.
    pub(crate) fn apply_miss(&mut self, mcc: u64, timestamp: f64) -> Option<TrackState> {
        self.misses += 1;

        let (next, kind) = match self.state {
            TrackState::Active => (Some(TrackState::Coasting), PointKind::Coasted),
            TrackState::Coasting => (None, PointKind::Coasted),
            _ => (None, PointKind::Predicted),
        };
        if let Some(state) = next {
            self.state = state;
        }

        let point = TrackPoint::from_filter(&self.filter, mcc, timestamp, kind);
        self.push_point(point);

        next
    }

    /// True once the track has missed too many consecutive cycles.
    pub(crate) fn is_expired(&self, max_misses: u32, max_tentative_gap: u32) -> bool {
        match self.state {
            TrackState::Tentative => self.misses > max_tentative_gap,
            TrackState::Deleted => true,
            _ => self.misses > max_misses,
        }
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.state = TrackState::Deleted;
    }

    /// Takes over a merged track: installs the fused estimate and records a
    /// Merged history point.
    pub(crate) fn absorb(
        &mut self,
        other: &Track,
        fused: Estimate,
        mcc: u64,
        timestamp: f64,
    ) -> Result<(), FilterError> {
        self.filter.reinitialize(fused.state, fused.covariance)?;

        self.absorbed.push(other.id);
        self.absorbed.extend_from_slice(&other.absorbed);
        if other.last_detection_mcc > self.last_detection_mcc {
            self.last_detection = other.last_detection;
            self.last_detection_mcc = other.last_detection_mcc;
            self.last_detection_timestamp = other.last_detection_timestamp;
        }

        let point = TrackPoint::from_filter(&self.filter, mcc, timestamp, PointKind::Merged);
        self.push_point(point);
        Ok(())
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            state: self.state,
            latest: self.latest,
            history: self.history.clone(),
            hits: self.hits,
            misses: self.misses,
            created_mcc: self.created_mcc,
            absorbed: self.absorbed.clone(),
        }
    }
}

/// Serializable view of one track, handed out every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub state: TrackState,
    pub latest: TrackPoint,
    pub history: Vec<TrackPoint>,
    pub hits: u32,
    pub misses: u32,
    pub created_mcc: u64,
    pub absorbed: Vec<TrackId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn spec() -> FilterSpec {
        FilterSpec {
            dt_sample: 1.0,
            ..Default::default()
        }
    }

    fn seeded(x: f64, y: f64) -> Track {
        let detection = DetectionPoint::at_position(0, x, y).unwrap();
        let filter = FilterHandle::initial_from_position(&spec(), detection.position(), None).unwrap();
        Track::new(TrackId(1), filter, detection, 0.0)
    }

    fn hit(track: &mut Track, mcc: u64, x: f64, y: f64) -> Option<TrackState> {
        track.predict(1.0).unwrap();
        let detection = DetectionPoint::at_position(mcc, x, y).unwrap();
        track.apply_hit(&detection, mcc as f64, &spec(), 2).unwrap()
    }

    #[test]
    fn test_track_id_display_and_order() {
        assert_eq!(TrackId(7).to_string(), "T7");
        assert!(TrackId(1) < TrackId(2));
    }

    #[test]
    fn test_new_track_is_tentative() {
        let track = seeded(10.0, 0.5);
        assert_eq!(track.state(), TrackState::Tentative);
        assert_eq!(track.history().len(), 1);
        assert_eq!(track.latest().kind, PointKind::Initiated);
        assert_eq!(track.latest().position(), Vector2::new(10.0, 0.5));
        assert_eq!(track.hits(), 1);
    }

    #[test]
    fn test_second_hit_initialises_velocity_and_confirms() {
        let mut track = seeded(10.0, 0.0);
        let next = hit(&mut track, 1, 9.0, 0.5);

        assert_eq!(next, Some(TrackState::Active));
        assert_eq!(track.state(), TrackState::Active);
        assert_abs_diff_eq!(track.latest().vx, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(track.latest().vy, 0.5, epsilon = 1e-12);
        assert_eq!(track.latest().beam, Some(0));
    }

    #[test]
    fn test_miss_coasts_and_hit_reactivates() {
        let mut track = seeded(10.0, 0.0);
        hit(&mut track, 1, 9.0, 0.0);

        track.predict(1.0).unwrap();
        assert_eq!(track.apply_miss(2, 2.0), Some(TrackState::Coasting));
        assert_eq!(track.latest().kind, PointKind::Coasted);
        assert_abs_diff_eq!(track.latest().x, 8.0, epsilon = 1e-9);
        assert_eq!(track.misses(), 1);

        assert_eq!(hit(&mut track, 3, 7.0, 0.0), Some(TrackState::Active));
        assert_eq!(track.misses(), 0);
    }

    #[test]
    fn test_tentative_miss_does_not_coast() {
        let mut track = seeded(10.0, 0.0);
        track.predict(1.0).unwrap();

        assert_eq!(track.apply_miss(1, 1.0), None);
        assert_eq!(track.state(), TrackState::Tentative);
        assert_eq!(track.latest().kind, PointKind::Predicted);
        assert!(!track.is_expired(3, 1));
        track.apply_miss(2, 2.0);
        assert!(track.is_expired(3, 1));
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let mut track = seeded(10.0, 0.0);
        hit(&mut track, 1, 9.0, 0.0);
        hit(&mut track, 2, 8.0, 0.0);
        track.predict(1.0).unwrap();
        track.apply_miss(3, 3.0);

        let mccs: Vec<u64> = track.history().iter().map(|p| p.mcc).collect();
        assert_eq!(mccs, vec![0, 1, 2, 3]);
        assert_eq!(track.history().last(), Some(track.latest()));
    }

    #[test]
    fn test_snapshot_serializes() {
        let track = seeded(4.0, -1.0);
        let json = serde_json::to_string(&track.snapshot()).unwrap();
        assert!(json.contains("\"state\":\"tentative\""));
        assert!(json.contains("\"kind\":\"initiated\""));
    }
}
