//! Reference trajectories (e.g. from a DGPS rig) used to score tracks offline.
//!
//! The tracking core never mutates these; they exist for analytics consumers
//! and the simulation harness.

use serde::{Deserialize, Serialize};

/// One ground-truth sample of the target and ego vehicle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    /// MCC of the left radar at this sample
    pub mcc_left: u64,
    /// MCC of the right radar at this sample
    pub mcc_right: u64,

    /// Target distance from the ego car
    pub target_distance: f64,
    pub target_x: f64,
    pub target_y: f64,
    /// Target absolute velocity
    pub target_vx: f64,
    pub target_vy: f64,
    pub target_heading: f64,

    pub ego_vx: f64,
    pub ego_vy: f64,
    pub ego_ax: f64,
    pub ego_ay: f64,
    pub ego_heading: f64,
}

/// Chronological list of reference samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceList {
    points: Vec<ReferencePoint>,
}

impl ReferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: ReferencePoint) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferencePoint> {
        self.points.iter()
    }

    pub fn mcc_left_interval(&self) -> Option<(u64, u64)> {
        interval(self.points.iter().map(|p| p.mcc_left))
    }

    pub fn mcc_right_interval(&self) -> Option<(u64, u64)> {
        interval(self.points.iter().map(|p| p.mcc_right))
    }

    /// Interval spanning both radars' MCC ranges.
    pub fn mcc_both_interval(&self) -> Option<(u64, u64)> {
        let (l0, l1) = self.mcc_left_interval()?;
        let (r0, r1) = self.mcc_right_interval()?;
        Some((l0.min(r0), l1.max(r1)))
    }

    /// Samples whose left and right MCCs both fall in the given inclusive ranges.
    pub fn select(&self, left: Option<(u64, u64)>, right: Option<(u64, u64)>) -> Vec<&ReferencePoint> {
        let inside = |bounds: Option<(u64, u64)>, v: u64| bounds.map_or(true, |(lo, hi)| lo <= v && v <= hi);
        self.points
            .iter()
            .filter(|p| inside(left, p.mcc_left) && inside(right, p.mcc_right))
            .collect()
    }

    /// First sample recorded at `mcc` by either radar.
    pub fn at_mcc(&self, mcc: u64) -> Option<&ReferencePoint> {
        self.points
            .iter()
            .find(|p| p.mcc_left == mcc || p.mcc_right == mcc)
    }
}

fn interval(values: impl Iterator<Item = u64> + Clone) -> Option<(u64, u64)> {
    Some((values.clone().min()?, values.max()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(left: u64, right: u64) -> ReferencePoint {
        ReferencePoint {
            mcc_left: left,
            mcc_right: right,
            target_x: left as f64,
            ..Default::default()
        }
    }

    #[test]
    fn test_intervals() {
        let mut refs = ReferenceList::new();
        assert_eq!(refs.mcc_both_interval(), None);

        refs.push(sample(10, 12));
        refs.push(sample(11, 9));
        refs.push(sample(14, 13));

        assert_eq!(refs.mcc_left_interval(), Some((10, 14)));
        assert_eq!(refs.mcc_right_interval(), Some((9, 13)));
        assert_eq!(refs.mcc_both_interval(), Some((9, 14)));
    }

    #[test]
    fn test_select_and_lookup() {
        let mut refs = ReferenceList::new();
        for i in 0..5 {
            refs.push(sample(i, i + 100));
        }

        assert_eq!(refs.select(Some((1, 3)), None).len(), 3);
        assert_eq!(refs.select(Some((1, 3)), Some((100, 101))).len(), 1);
        assert_eq!(refs.at_mcc(102).map(|p| p.target_x), Some(2.0));
        assert!(refs.at_mcc(50).is_none());
    }
}
