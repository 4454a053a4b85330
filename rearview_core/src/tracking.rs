//! The "TRACKING" Engine - per-cycle multi-target tracking.
//!
//! Every radar cycle runs one pass of the pipeline:
//! 1. Predict all tracks to the cycle timestamp
//! 2. Rectangular gating + greedy Global Nearest Neighbor (GNN) association
//! 3. Update matched tracks (Tentative -> Active, Coasting -> Active)
//! 4. Age unmatched tracks (Active -> Coasting)
//! 5. Delete tracks that missed too often
//! 6. Seed Tentative tracks from unassigned detections
//! 7. Merge Active tracks that stayed together, using Covariance Intersection
//!
//! Per-track work in steps 1 and 3/4 has no cross-track dependency and runs
//! on rayon with the `parallel` feature. Structural changes (5-7) are always
//! applied sequentially after all per-track work is done.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, Vector2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detection::{DetectionList, DetectionPoint, DetectionRecording};
use crate::error::{ConfigError, FilterError, TrackingError};
use crate::filter_coordinator::{FilterHandle, FilterSpec};
use crate::filters::{Estimate, RecursiveFilter};
use crate::track::{Track, TrackId, TrackSnapshot, TrackState};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Distance used to rank in-gate detection/track pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Euclidean distance between detection and predicted position
    Euclidean,
    /// Squared Mahalanobis distance of the innovation
    Mahalanobis,
}

/// Configuration for the TrackManager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Filter created for every new track
    pub filter: FilterSpec,

    /// Gate half-width along x (default: 2.5 m)
    pub gate_dx: f64,

    /// Gate half-width along y (default: 2.0 m)
    pub gate_dy: f64,

    pub distance_metric: DistanceMetric,

    /// Consecutive misses tolerated by a confirmed track (default: 5)
    pub max_misses: u32,

    /// Consecutive misses tolerated by a Tentative track (default: 1)
    pub max_tentative_gap: u32,

    /// Detections needed to confirm a track (default: 2)
    pub confirm_hits: u32,

    /// Predicted positions closer than this are merge candidates (default: 1.0 m)
    pub merge_distance: f64,

    /// Cycles two tracks must stay within `merge_distance` (default: 3)
    pub merge_cycles: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            filter: FilterSpec::default(),
            gate_dx: 2.5,
            gate_dy: 2.0,
            distance_metric: DistanceMetric::Euclidean,
            max_misses: 5,
            max_tentative_gap: 1,
            confirm_hits: 2,
            merge_distance: 1.0,
            merge_cycles: 3,
        }
    }
}

impl TrackerConfig {
    /// Parses a JSON configuration; omitted fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter.validate()?;

        for (name, value) in [("gate_dx", self.gate_dx), ("gate_dy", self.gate_dy)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ConfigError::InvalidGate { name, value });
            }
        }
        if self.max_misses == 0 {
            return Err(ConfigError::ZeroMissLimit);
        }
        if self.confirm_hits < 2 {
            return Err(ConfigError::ConfirmHitsTooLow(self.confirm_hits));
        }
        if !(self.merge_distance >= 0.0 && self.merge_distance.is_finite()) {
            return Err(ConfigError::InvalidMergeDistance(self.merge_distance));
        }
        if self.merge_cycles == 0 {
            return Err(ConfigError::Malformed("merge_cycles must be at least 1".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// MERGE EVENT / CYCLE OUTPUT
// ============================================================================

/// Two tracks collapsed into one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    /// The surviving (older) track
    pub winner_id: TrackId,

    /// The absorbed track, deleted by the merge
    pub loser_id: TrackId,

    /// Loser's last position before deletion
    pub merge_position: [f64; 2],

    pub reason: String,

    pub mcc: u64,
    pub timestamp: f64,
}

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub mcc: u64,
    pub timestamp: f64,

    /// All non-Deleted tracks, ordered by id
    pub tracks: Vec<TrackSnapshot>,

    /// Tracks seeded this cycle
    pub created: Vec<TrackId>,

    /// Tracks deleted this cycle (expired or merged)
    pub deleted: Vec<TrackId>,

    pub merges: Vec<MergeEvent>,

    /// Detection indices not matched to an existing track
    pub unassigned: Vec<usize>,
}

impl CycleSnapshot {
    pub fn track(&self, id: TrackId) -> Option<&TrackSnapshot> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Active and Coasting tracks.
    pub fn confirmed(&self) -> impl Iterator<Item = &TrackSnapshot> {
        self.tracks.iter().filter(|t| t.state.is_confirmed())
    }
}

/// One in-gate detection/track pair.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    track: TrackId,
    detection: usize,
    distance: f64,
}

// ============================================================================
// TRACK MANAGER
// ============================================================================

/// Owns all tracks and runs the per-cycle pipeline.
pub struct TrackManager {
    config: TrackerConfig,

    /// Live tracks; Deleted tracks are removed at the end of each cycle
    tracks: BTreeMap<TrackId, Track>,

    next_id: u64,

    last_timestamp: Option<f64>,

    last_mcc: Option<u64>,

    /// Consecutive cycles each Active pair (older, newer) stayed close
    proximity: BTreeMap<(TrackId, TrackId), u32>,
}

impl TrackManager {
    /// Create a new TrackManager; the configuration is validated once here.
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            last_timestamp: None,
            last_mcc: None,
            proximity: BTreeMap::new(),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(TrackerConfig::default())
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    /// Runs one cycle with the timestamp derived from the detections' MCC.
    pub fn advance_cycle(&mut self, detections: DetectionList) -> Result<CycleSnapshot, TrackingError> {
        let timestamp = detections.mcc() as f64 * self.config.filter.dt_sample;
        self.advance(detections, timestamp)
    }

    /// Runs every cycle of a recording in MCC order.
    pub fn advance_recording(
        &mut self,
        recording: &DetectionRecording,
    ) -> Result<Vec<CycleSnapshot>, TrackingError> {
        recording
            .cycles()
            .into_iter()
            .map(|cycle| self.advance_cycle(cycle))
            .collect()
    }

    /// Processes the detections of one cycle taken at `timestamp` (seconds).
    ///
    /// Timestamps and MCCs must strictly increase from call to call. A
    /// rejected cycle leaves the manager unchanged.
    pub fn advance(
        &mut self,
        mut detections: DetectionList,
        timestamp: f64,
    ) -> Result<CycleSnapshot, TrackingError> {
        if !timestamp.is_finite() {
            return Err(FilterError::InvalidParameter(format!("cycle timestamp {timestamp}")).into());
        }
        if let Some(previous) = self.last_timestamp {
            if timestamp <= previous {
                return Err(TrackingError::NonMonotonicTimestamp {
                    previous,
                    current: timestamp,
                });
            }
        }
        let mcc = detections.mcc();
        if let Some(previous) = self.last_mcc {
            if mcc <= previous {
                return Err(TrackingError::NonMonotonicCycle { previous, current: mcc });
            }
        }
        let dt = self.last_timestamp.map_or(0.0, |previous| timestamp - previous);
        detections.clear_assignments();

        debug!(
            "Cycle mcc={} t={:.3} | detections={} | tracks={}",
            mcc,
            timestamp,
            detections.len(),
            self.tracks.len()
        );

        // Step 1: predict
        self.predict_all(dt)?;
        self.last_timestamp = Some(timestamp);
        self.last_mcc = Some(mcc);
        let predicted: BTreeMap<TrackId, Vector2<f64>> =
            self.tracks.iter().map(|(id, t)| (*id, t.position())).collect();

        // Step 2: gate + associate
        let matches = self.associate(&mut detections);
        let unassigned = detections.unassigned_indices();

        // Steps 3 and 4: update or age
        self.settle_all(&matches, &detections, mcc, timestamp);

        // Step 5: delete expired tracks
        let mut deleted = self.prune_expired();

        // Step 6: seed new tracks
        let created = self.spawn_tracks(&detections, &unassigned, timestamp);

        // Step 7: merge converged tracks
        let merges = self.merge_tracks(&predicted, mcc, timestamp);
        deleted.extend(merges.iter().map(|m| m.loser_id));

        Ok(CycleSnapshot {
            mcc,
            timestamp,
            tracks: self.tracks.values().map(Track::snapshot).collect(),
            created,
            deleted,
            merges,
            unassigned,
        })
    }

    pub fn get_track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn track(&self, id: TrackId) -> Result<&Track, TrackingError> {
        self.tracks.get(&id).ok_or(TrackingError::TrackNotFound(id))
    }

    /// Live tracks ordered by id.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks.values().filter(|t| t.state().is_confirmed()).count()
    }

    // ========================================================================
    // STEP 1: PREDICTION
    // ========================================================================

    fn predict_all(&mut self, dt: f64) -> Result<(), TrackingError> {
        if dt == 0.0 {
            return Ok(());
        }

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.tracks
                .par_iter_mut()
                .try_for_each(|(_, track)| track.predict(dt).map(drop))?;
        }

        #[cfg(not(feature = "parallel"))]
        for track in self.tracks.values_mut() {
            track.predict(dt)?;
        }

        Ok(())
    }

    // ========================================================================
    // STEP 2: GATING & GNN
    // ========================================================================

    /// True if `point` lies inside the rectangular gate around `center`.
    ///
    /// The boundary is inclusive: `|dx| <= gate_dx && |dy| <= gate_dy`.
    pub fn in_gate(&self, center: &Vector2<f64>, point: &DetectionPoint) -> bool {
        (point.x() - center.x).abs() <= self.config.gate_dx
            && (point.y() - center.y).abs() <= self.config.gate_dy
    }

    /// All in-gate detections for one track with their distances.
    fn gate_candidates(&self, track: &Track, detections: &DetectionList) -> Vec<Candidate> {
        let center = track.position();
        detections
            .unassigned()
            .filter(|(_, point)| self.in_gate(&center, point))
            .map(|(index, point)| {
                let distance = match self.config.distance_metric {
                    DistanceMetric::Euclidean => (point.position() - center).norm(),
                    DistanceMetric::Mahalanobis => {
                        let z = track.filter().measurement_of(point);
                        // Singular S: rank last but keep the pair in gate
                        track.filter().mahalanobis_squared(&z).unwrap_or(f64::INFINITY)
                    }
                };
                Candidate {
                    track: track.id(),
                    detection: index,
                    distance,
                }
            })
            .collect()
    }

    /// Greedy global nearest neighbor over all in-gate pairs.
    ///
    /// Pairs are taken in `(distance, track id, detection index)` order; a
    /// pair is accepted if neither side has been taken yet. This is not a
    /// minimum-total-distance assignment.
    fn associate(&self, detections: &mut DetectionList) -> BTreeMap<TrackId, usize> {
        let list: &DetectionList = detections;

        #[cfg(feature = "parallel")]
        let mut candidates: Vec<Candidate> = {
            use rayon::prelude::*;
            self.tracks
                .par_iter()
                .flat_map_iter(|(_, track)| self.gate_candidates(track, list))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let mut candidates: Vec<Candidate> = self
            .tracks
            .values()
            .flat_map(|track| self.gate_candidates(track, list))
            .collect();

        candidates.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.track.cmp(&b.track))
                .then(a.detection.cmp(&b.detection))
        });

        let mut matches = BTreeMap::new();
        for candidate in candidates {
            if matches.contains_key(&candidate.track) {
                continue;
            }
            if detections.mark_assigned(candidate.detection) {
                matches.insert(candidate.track, candidate.detection);
            }
        }

        debug!(
            "Associated {} of {} detections to {} tracks",
            matches.len(),
            detections.len(),
            self.tracks.len()
        );
        matches
    }

    // ========================================================================
    // STEPS 3-4: UPDATE / AGE
    // ========================================================================

    fn settle_all(
        &mut self,
        matches: &BTreeMap<TrackId, usize>,
        detections: &DetectionList,
        mcc: u64,
        timestamp: f64,
    ) {
        let spec = &self.config.filter;
        let confirm_hits = self.config.confirm_hits;
        let settle = |track: &mut Track| {
            let matched = matches.get(&track.id()).and_then(|&i| detections.get(i));
            settle_track(track, matched, mcc, timestamp, spec, confirm_hits);
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.tracks.par_iter_mut().for_each(|(_, track)| settle(track));
        }

        #[cfg(not(feature = "parallel"))]
        for track in self.tracks.values_mut() {
            settle(track);
        }
    }

    // ========================================================================
    // STEPS 5-6: DELETION & CREATION
    // ========================================================================

    fn prune_expired(&mut self) -> Vec<TrackId> {
        let max_misses = self.config.max_misses;
        let max_gap = self.config.max_tentative_gap;

        let expired: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|t| t.is_expired(max_misses, max_gap))
            .map(Track::id)
            .collect();

        for id in &expired {
            if let Some(mut track) = self.tracks.remove(id) {
                track.mark_deleted();
                info!(
                    "Track {} deleted after {} misses ({} hits)",
                    id,
                    track.misses(),
                    track.hits()
                );
            }
        }
        expired
    }

    fn spawn_tracks(
        &mut self,
        detections: &DetectionList,
        unassigned: &[usize],
        timestamp: f64,
    ) -> Vec<TrackId> {
        let mut created = Vec::with_capacity(unassigned.len());

        for point in unassigned.iter().filter_map(|&i| detections.get(i)) {
            let filter = match FilterHandle::initial_from_position(
                &self.config.filter,
                point.position(),
                None,
            ) {
                Ok(filter) => filter,
                Err(e) => {
                    warn!("Track creation aborted for detection at ({:.2}, {:.2}): {}", point.x(), point.y(), e);
                    continue;
                }
            };

            let id = TrackId(self.next_id);
            self.next_id += 1;
            debug!("Track {} born at ({:.2}, {:.2})", id, point.x(), point.y());
            self.tracks.insert(id, Track::new(id, filter, *point, timestamp));
            created.push(id);
        }
        created
    }

    // ========================================================================
    // STEP 7: MERGING (Covariance Intersection)
    // ========================================================================

    /// Merges Active tracks whose predicted positions stayed within
    /// `merge_distance` for `merge_cycles` consecutive cycles.
    fn merge_tracks(
        &mut self,
        predicted: &BTreeMap<TrackId, Vector2<f64>>,
        mcc: u64,
        timestamp: f64,
    ) -> Vec<MergeEvent> {
        let active: Vec<(TrackId, Vector2<f64>)> = self
            .tracks
            .values()
            .filter(|t| t.state() == TrackState::Active)
            .filter_map(|t| predicted.get(&t.id()).map(|p| (t.id(), *p)))
            .collect();

        let mut close = BTreeSet::new();
        for (i, (older, p_older)) in active.iter().enumerate() {
            for (newer, p_newer) in &active[i + 1..] {
                if (p_older - p_newer).norm() <= self.config.merge_distance {
                    close.insert((*older, *newer));
                }
            }
        }

        // Pairs that separated (or whose tracks left Active) start over
        self.proximity.retain(|pair, _| close.contains(pair));
        let mut due = Vec::new();
        for pair in close {
            let count = self.proximity.entry(pair).or_insert(0);
            *count += 1;
            if *count >= self.config.merge_cycles {
                due.push(pair);
            }
        }

        let mut events = Vec::new();
        for (winner_id, loser_id) in due {
            if !self.tracks.contains_key(&winner_id) {
                continue;
            }
            let Some(loser) = self.tracks.remove(&loser_id) else {
                continue;
            };
            self.proximity.retain(|(a, b), _| *a != loser_id && *b != loser_id);

            if let Some(event) = self.absorb(winner_id, loser, mcc, timestamp) {
                events.push(event);
            }
        }
        events
    }

    /// Folds `loser` into the track `winner_id`.
    ///
    /// The winner does not copy the loser's latest point. It takes the
    /// Covariance Intersection of both estimates, which carries the loser's
    /// most recent information without claiming more certainty than either.
    fn absorb(
        &mut self,
        winner_id: TrackId,
        mut loser: Track,
        mcc: u64,
        timestamp: f64,
    ) -> Option<MergeEvent> {
        let winner = self.tracks.get_mut(&winner_id)?;

        let fused = covariance_intersection(
            winner.filter().state(),
            winner.filter().covariance(),
            loser.filter().state(),
            loser.filter().covariance(),
        )
        .map(|(state, covariance)| Estimate { state, covariance })
        .unwrap_or_else(|| {
            warn!(
                "Covariance intersection failed for {} + {}; keeping {}",
                winner_id,
                loser.id(),
                winner_id
            );
            winner.filter().estimate()
        });

        if let Err(e) = winner.absorb(&loser, fused, mcc, timestamp) {
            warn!("Merge of {} into {} failed: {}", loser.id(), winner_id, e);
        }
        loser.mark_deleted();

        let position = loser.latest().position();
        info!("Merged {} into {} at ({:.2}, {:.2})", loser.id(), winner_id, position.x, position.y);

        Some(MergeEvent {
            winner_id,
            loser_id: loser.id(),
            merge_position: [position.x, position.y],
            reason: format!(
                "within {:.2} m for {} cycles",
                self.config.merge_distance, self.config.merge_cycles
            ),
            mcc,
            timestamp,
        })
    }
}

/// Update with the matched detection, or age the track when there is none.
///
/// A rejected update (singular innovation, bad measurement) counts as a miss.
fn settle_track(
    track: &mut Track,
    matched: Option<&DetectionPoint>,
    mcc: u64,
    timestamp: f64,
    spec: &FilterSpec,
    confirm_hits: u32,
) {
    let transition = match matched {
        Some(point) => match track.apply_hit(point, timestamp, spec, confirm_hits) {
            Ok(transition) => transition,
            Err(e) => {
                warn!("Skipping update of track {}: {}", track.id(), e);
                track.apply_miss(mcc, timestamp)
            }
        },
        None => track.apply_miss(mcc, timestamp),
    };

    match transition {
        Some(TrackState::Active) => info!("Track {} active after {} hits", track.id(), track.hits()),
        Some(state) => debug!("Track {} -> {:?}", track.id(), state),
        None => {}
    }
}

/// Covariance Intersection fusion of two estimates.
///
/// Loop-safe: fusing an estimate with itself does not shrink the covariance.
/// Fast-CI weight ω = tr(P_B) / (tr(P_A) + tr(P_B)).
///
/// Returns None if either covariance (or the fused one) is singular.
pub fn covariance_intersection(
    x_a: &DVector<f64>,
    p_a: &DMatrix<f64>,
    x_b: &DVector<f64>,
    p_b: &DMatrix<f64>,
) -> Option<(DVector<f64>, DMatrix<f64>)> {
    let tr_a = p_a.trace();
    let tr_b = p_b.trace();
    let sum_tr = tr_a + tr_b;
    if sum_tr < 1e-12 {
        return None;
    }

    // More weight to the estimate with the smaller trace
    let omega = tr_b / sum_tr;

    let p_a_inv = p_a.clone().try_inverse()?;
    let p_b_inv = p_b.clone().try_inverse()?;

    // P_CI⁻¹ = ω·P_A⁻¹ + (1-ω)·P_B⁻¹
    let p_ci_inv = &p_a_inv * omega + &p_b_inv * (1.0 - omega);
    let p_ci = p_ci_inv.try_inverse()?;

    // x_CI = P_CI·(ω·P_A⁻¹·x_A + (1-ω)·P_B⁻¹·x_B)
    let info = &p_a_inv * x_a * omega + &p_b_inv * x_b * (1.0 - omega);
    let x_ci = &p_ci * info;

    Some((x_ci, crate::filters::symmetrize(p_ci)))
}

// ============================================================================
// TESTS
// ============================================================================
