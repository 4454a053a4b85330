//! Detection Model - raw radar measurements and per-cycle containers.
//!
//! A [`DetectionPoint`] is one reflection reported by the left or right rear
//! radar. Its Cartesian projection lives in the ego frame: x points backwards
//! along the car, y across it, and each radar sits half a car width off the
//! centre line.

use std::collections::BTreeMap;

use nalgebra::{DVector, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::DetectionError;
use crate::models::MeasurementSpace;

/// Which rear radar produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadarSide {
    Left,
    Right,
}

impl RadarSide {
    /// Sign applied to the lateral axis when projecting into the ego frame.
    #[inline]
    pub fn lateral_sign(self) -> f64 {
        match self {
            RadarSide::Left => -1.0,
            RadarSide::Right => 1.0,
        }
    }
}

/// Projects a polar reading into the ego frame.
///
/// `x = r·cos(az)`, `y = s·(r·sin(az) + car_width/2)`, where `s` is the
/// lateral sign of the radar side.
pub fn polar_to_cartesian(range: f64, azimuth: f64, side: RadarSide, car_width: f64) -> (f64, f64) {
    let x = range * azimuth.cos();
    let y = side.lateral_sign() * (range * azimuth.sin() + car_width / 2.0);
    (x, y)
}

/// Inverse of [`polar_to_cartesian`].
pub fn cartesian_to_polar(x: f64, y: f64, side: RadarSide, car_width: f64) -> (f64, f64) {
    let lateral = side.lateral_sign() * y - car_width / 2.0;
    (x.hypot(lateral), lateral.atan2(x))
}

/// A raw reading as delivered by the ingestion collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadarReading {
    /// Measurement cycle count
    pub mcc: u64,
    /// Beam the radar assigned the reflection to
    pub beam: u8,
    /// Number of detections the radar reported for this MCC
    pub detections_in_cycle: u32,
    /// Range in meters
    pub range: f64,
    /// Azimuth in radians
    pub azimuth: f64,
    /// Radial velocity in m/s
    pub velocity: f64,
    pub side: RadarSide,
}

/// One immutable radar detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionPoint {
    mcc: u64,
    beam: u8,
    detections_in_cycle: u32,
    range: f64,
    azimuth: f64,
    velocity: f64,
    side: RadarSide,
    x: f64,
    y: f64,
}

impl DetectionPoint {
    /// Builds a detection from a polar reading, projecting it into the ego frame.
    pub fn from_reading(reading: RadarReading, car_width: f64) -> Result<Self, DetectionError> {
        check_finite("range", reading.range)?;
        check_finite("azimuth", reading.azimuth)?;
        check_finite("velocity", reading.velocity)?;
        check_finite("car_width", car_width)?;

        let (x, y) = polar_to_cartesian(reading.range, reading.azimuth, reading.side, car_width);

        Ok(Self {
            mcc: reading.mcc,
            beam: reading.beam,
            detections_in_cycle: reading.detections_in_cycle,
            range: reading.range,
            azimuth: reading.azimuth,
            velocity: reading.velocity,
            side: reading.side,
            x,
            y,
        })
    }

    /// Builds a detection at an ego-frame position, as seen by a radar at the
    /// ego origin.
    pub fn at_position(mcc: u64, x: f64, y: f64) -> Result<Self, DetectionError> {
        check_finite("x", x)?;
        check_finite("y", y)?;

        let (range, azimuth) = cartesian_to_polar(x, y, RadarSide::Right, 0.0);
        Ok(Self {
            mcc,
            beam: 0,
            detections_in_cycle: 0,
            range,
            azimuth,
            velocity: 0.0,
            side: RadarSide::Right,
            x,
            y,
        })
    }

    /// Returns a copy carrying the given radial velocity.
    pub fn with_velocity(mut self, velocity: f64) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn mcc(&self) -> u64 {
        self.mcc
    }

    pub fn beam(&self) -> u8 {
        self.beam
    }

    pub fn detections_in_cycle(&self) -> u32 {
        self.detections_in_cycle
    }

    pub fn range(&self) -> f64 {
        self.range
    }

    pub fn azimuth(&self) -> f64 {
        self.azimuth
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn side(&self) -> RadarSide {
        self.side
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    /// Ego-frame position.
    #[inline]
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    /// Measurement vector in the requested space.
    ///
    /// Polar spaces are expressed from the ego origin so that detections of
    /// both radars feed the same observation model. The range rate is passed
    /// through as the radar reported it, along the corner radar's own line of
    /// sight. That line is offset by half a car width from the ego origin, so
    /// the range rate carries a bias that vanishes with distance.
    pub fn measurement(&self, space: MeasurementSpace) -> DVector<f64> {
        match space {
            MeasurementSpace::Cartesian => DVector::from_vec(vec![self.x, self.y]),
            MeasurementSpace::Polar => {
                DVector::from_vec(vec![self.x.hypot(self.y), self.y.atan2(self.x)])
            }
            MeasurementSpace::PolarDoppler => DVector::from_vec(vec![
                self.x.hypot(self.y),
                self.y.atan2(self.x),
                self.velocity,
            ]),
        }
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), DetectionError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DetectionError::NonFinite(field))
    }
}

// ============================================================================
// SELECTION
// ============================================================================

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Interval {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// A degenerate interval matching a single value.
    pub fn point(value: f64) -> Self {
        Self::new(value, value)
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Filter over detection attributes. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub beams: Option<Vec<u8>>,
    pub mcc: Option<(u64, u64)>,
    pub x: Option<Interval>,
    pub y: Option<Interval>,
    pub range: Option<Interval>,
    pub velocity: Option<Interval>,
    pub azimuth: Option<Interval>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beams(mut self, beams: &[u8]) -> Self {
        self.beams = Some(beams.to_vec());
        self
    }

    pub fn mcc(mut self, first: u64, last: u64) -> Self {
        self.mcc = Some((first, last));
        self
    }

    pub fn x(mut self, interval: Interval) -> Self {
        self.x = Some(interval);
        self
    }

    pub fn y(mut self, interval: Interval) -> Self {
        self.y = Some(interval);
        self
    }

    pub fn range(mut self, interval: Interval) -> Self {
        self.range = Some(interval);
        self
    }

    pub fn velocity(mut self, interval: Interval) -> Self {
        self.velocity = Some(interval);
        self
    }

    pub fn azimuth(mut self, interval: Interval) -> Self {
        self.azimuth = Some(interval);
        self
    }

    pub fn matches(&self, point: &DetectionPoint) -> bool {
        fn within(interval: &Option<Interval>, value: f64) -> bool {
            interval.map_or(true, |i| i.contains(value))
        }

        self.beams.as_ref().map_or(true, |b| b.contains(&point.beam))
            && self
                .mcc
                .map_or(true, |(lo, hi)| lo <= point.mcc && point.mcc <= hi)
            && within(&self.x, point.x)
            && within(&self.y, point.y)
            && within(&self.range, point.range)
            && within(&self.velocity, point.velocity)
            && within(&self.azimuth, point.azimuth)
    }
}

// ============================================================================
// PER-CYCLE LIST
// ============================================================================

/// The detections of one measurement cycle, with their assignment flags.
///
/// Deserialization goes through [`DetectionList::from_points`], so a list
/// read from JSON obeys the same cycle check as one built in code. The
/// assignment flags are per-cycle working state and are never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDetectionList")]
pub struct DetectionList {
    mcc: u64,
    points: Vec<DetectionPoint>,
    #[serde(skip)]
    assigned: Vec<bool>,
}

/// Wire shape of a [`DetectionList`].
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDetectionList {
    mcc: u64,
    points: Vec<DetectionPoint>,
}

impl TryFrom<RawDetectionList> for DetectionList {
    type Error = DetectionError;

    fn try_from(raw: RawDetectionList) -> Result<Self, Self::Error> {
        Self::from_points(raw.mcc, raw.points)
    }
}

impl DetectionList {
    /// Creates an empty list for cycle `mcc`.
    pub fn new(mcc: u64) -> Self {
        Self {
            mcc,
            points: Vec::new(),
            assigned: Vec::new(),
        }
    }

    /// Builds a list from detections that must all belong to cycle `mcc`.
    pub fn from_points(
        mcc: u64,
        points: impl IntoIterator<Item = DetectionPoint>,
    ) -> Result<Self, DetectionError> {
        let mut list = Self::new(mcc);
        for point in points {
            list.push(point)?;
        }
        Ok(list)
    }

    /// Appends a detection. Detections of another cycle are rejected.
    pub fn push(&mut self, point: DetectionPoint) -> Result<(), DetectionError> {
        if point.mcc != self.mcc {
            return Err(DetectionError::CycleMismatch {
                expected: self.mcc,
                actual: point.mcc,
            });
        }
        self.points.push(point);
        self.assigned.push(false);
        Ok(())
    }

    pub fn mcc(&self) -> u64 {
        self.mcc
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DetectionPoint> {
        self.points.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectionPoint> {
        self.points.iter()
    }

    pub fn points(&self) -> &[DetectionPoint] {
        &self.points
    }

    /// Marks a detection as matched to a track.
    ///
    /// Returns `false` if the index is out of range or already assigned.
    pub(crate) fn mark_assigned(&mut self, index: usize) -> bool {
        match self.assigned.get_mut(index) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Forgets all matches; the unassigned subset is rebuilt every cycle.
    pub(crate) fn clear_assignments(&mut self) {
        self.assigned.clear();
        self.assigned.resize(self.points.len(), false);
    }

    pub fn is_assigned(&self, index: usize) -> bool {
        self.assigned.get(index).copied().unwrap_or(false)
    }

    /// Detections not matched to any track, with their indices.
    pub fn unassigned(&self) -> impl Iterator<Item = (usize, &DetectionPoint)> {
        self.points
            .iter()
            .enumerate()
            .filter(|(i, _)| self.assigned.get(*i) != Some(&true))
    }

    pub fn unassigned_indices(&self) -> Vec<usize> {
        self.unassigned().map(|(i, _)| i).collect()
    }

    pub fn select(&self, selection: &Selection) -> Vec<&DetectionPoint> {
        self.points.iter().filter(|p| selection.matches(p)).collect()
    }
}

// ============================================================================
// MULTI-CYCLE RECORDING
// ============================================================================

/// Detections spanning many cycles, as filled by an ingestion collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecording {
    points: Vec<DetectionPoint>,
}

impl DetectionRecording {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, point: DetectionPoint) {
        self.points.push(point);
    }

    pub fn extend(&mut self, points: impl IntoIterator<Item = DetectionPoint>) {
        self.points.extend(points);
    }

    /// Appends every detection of `other` matching `selection`.
    pub fn extend_with_selection(&mut self, other: &DetectionRecording, selection: &Selection) {
        self.points
            .extend(other.points.iter().filter(|p| selection.matches(p)).copied());
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[DetectionPoint] {
        &self.points
    }

    /// First and last MCC present, or `None` when empty.
    pub fn mcc_interval(&self) -> Option<(u64, u64)> {
        let first = self.points.iter().map(|p| p.mcc).min()?;
        let last = self.points.iter().map(|p| p.mcc).max()?;
        Some((first, last))
    }

    /// The busiest cycle as `(detection count, mcc)`; ties go to the earliest MCC.
    pub fn max_detections_per_mcc(&self) -> Option<(usize, u64)> {
        let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
        for p in &self.points {
            *counts.entry(p.mcc).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .fold(None, |best, (mcc, count)| match best {
                Some((c, _)) if c >= count => best,
                _ => Some((count, mcc)),
            })
    }

    pub fn select(&self, selection: &Selection) -> Vec<&DetectionPoint> {
        self.points.iter().filter(|p| selection.matches(p)).collect()
    }

    /// Splits the recording into per-cycle lists in ascending MCC order.
    pub fn cycles(&self) -> Vec<DetectionList> {
        let mut grouped: BTreeMap<u64, DetectionList> = BTreeMap::new();
        for p in &self.points {
            let list = grouped
                .entry(p.mcc)
                .or_insert_with(|| DetectionList::new(p.mcc));
            // Grouped by MCC, so the push cannot mismatch
            list.points.push(*p);
            list.assigned.push(false);
        }
        grouped.into_values().collect()
    }
}

// ============================================================================
// TWO-POINT PROJECTION
// ============================================================================

/// Kinematics derived from two consecutive detections of the same object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoPointProjection {
    /// Position of the later detection
    pub position: Vector2<f64>,
    /// Finite-difference velocity
    pub velocity: Vector2<f64>,
    /// Extrapolated position one interval after the later detection
    pub projected: Vector2<f64>,
}

/// Derives velocity and a one-step projection from `start` and `end`
/// detections `dt` seconds apart.
pub fn two_point_projection(
    start: &DetectionPoint,
    end: &DetectionPoint,
    dt: f64,
) -> Result<TwoPointProjection, DetectionError> {
    if !(dt > 0.0 && dt.is_finite()) {
        return Err(DetectionError::InvalidSampleInterval(dt));
    }
    let position = end.position();
    let step = position - start.position();

    Ok(TwoPointProjection {
        position,
        velocity: step / dt,
        projected: position + step,
    })
}
