//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the true state of every target behind the ego car:
//! - True positions and velocities in the ego frame (x rearwards, y lateral)
//! - Constant-velocity kinematics
//! - Radar detection generation through a left and a right corner radar
//!   (polar noise, detection probability, blackouts and clutter)

use std::collections::BTreeMap;

use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use rearview_core::detection::cartesian_to_polar;
use rearview_core::{
    DetectionError, DetectionList, DetectionPoint, RadarReading, RadarSide, ReferencePoint,
};

use crate::error::SimError;

/// A ground truth target in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthTarget {
    pub id: u64,

    /// Position [x, y] in meters (ego frame)
    pub position: Vector2<f64>,

    /// Velocity relative to the ego car in m/s
    pub velocity: Vector2<f64>,

    /// Target is active (not removed)
    pub active: bool,

    /// Cycles [first, last] in which the target is never detected
    pub blackout: Option<(u64, u64)>,
}

impl GroundTruthTarget {
    fn blacked_out(&self, mcc: u64) -> bool {
        self.blackout
            .map_or(false, |(first, last)| first <= mcc && mcc <= last)
    }
}

/// Rear corner radar parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadarConfig {
    /// Lateral distance between the two radars (default: 1.88 m)
    pub car_width: f64,

    /// Range noise 1σ (default: 0.15 m)
    pub range_noise_std: f64,

    /// Azimuth noise 1σ (default: 0.005 rad)
    pub azimuth_noise_std: f64,

    /// Radial velocity noise 1σ (default: 0.1 m/s)
    pub velocity_noise_std: f64,

    /// Maximum detection range (default: 70 m)
    pub max_range: f64,

    /// Probability that a visible target is detected in a cycle (default: 0.95)
    pub detection_probability: f64,

    /// False detections per cycle (default: 0)
    pub clutter_per_cycle: usize,

    /// Number of receive beams (default: 4)
    pub beams: u8,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            car_width: 1.88,
            range_noise_std: 0.15,
            azimuth_noise_std: 0.005,
            velocity_noise_std: 0.1,
            max_range: 70.0,
            detection_probability: 0.95,
            clutter_per_cycle: 0,
            beams: 4,
        }
    }
}

/// Counts from the last generated cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub target_detections: usize,
    pub clutter: usize,
}

/// The Oracle - maintains ground truth and generates radar detections.
pub struct Oracle {
    physics_rng: ChaCha8Rng,

    /// Ordered for deterministic iteration
    targets: BTreeMap<u64, GroundTruthTarget>,

    next_id: u64,

    current_time: f64,

    /// Measurement cycle count of the current cycle
    mcc: u64,

    /// Ego speed over ground, reported in reference points
    ego_speed: f64,

    radar: RadarConfig,
    range_noise: Normal<f64>,
    azimuth_noise: Normal<f64>,
    velocity_noise: Normal<f64>,

    last_stats: CycleStats,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64, radar: RadarConfig) -> Result<Self, SimError> {
        Ok(Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            targets: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
            mcc: 0,
            ego_speed: 0.0,
            range_noise: Normal::new(0.0, radar.range_noise_std)?,
            azimuth_noise: Normal::new(0.0, radar.azimuth_noise_std)?,
            velocity_noise: Normal::new(0.0, radar.velocity_noise_std)?,
            radar,
            last_stats: CycleStats::default(),
        })
    }

    pub fn with_ego_speed(mut self, speed: f64) -> Self {
        self.ego_speed = speed;
        self
    }

    pub fn radar(&self) -> &RadarConfig {
        &self.radar
    }

    /// Spawns a new target and returns its ID.
    pub fn spawn_target(&mut self, position: Vector2<f64>, velocity: Vector2<f64>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.targets.insert(
            id,
            GroundTruthTarget {
                id,
                position,
                velocity,
                active: true,
                blackout: None,
            },
        );
        id
    }

    /// Suppresses all detections of a target during cycles `first..=last`.
    pub fn set_blackout(&mut self, id: u64, first: u64, last: u64) {
        if let Some(target) = self.targets.get_mut(&id) {
            target.blackout = Some((first, last));
        }
    }

    /// Removes a target from the simulation.
    pub fn remove_target(&mut self, id: u64) {
        if let Some(target) = self.targets.get_mut(&id) {
            target.active = false;
        }
    }

    /// Advances physics by dt seconds and moves to the next cycle.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        self.mcc += 1;

        for target in self.targets.values_mut().filter(|t| t.active) {
            target.position += target.velocity * dt;
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn mcc(&self) -> u64 {
        self.mcc
    }

    pub fn target(&self, id: u64) -> Option<&GroundTruthTarget> {
        self.targets.get(&id)
    }

    pub fn active_targets(&self) -> impl Iterator<Item = &GroundTruthTarget> {
        self.targets.values().filter(|t| t.active)
    }

    pub fn last_stats(&self) -> CycleStats {
        self.last_stats
    }

    /// True if a rear radar can see `position` (behind the car, within range).
    pub fn in_field_of_view(&self, position: &Vector2<f64>) -> bool {
        position.x > 0.5 && position.norm() <= self.radar.max_range
    }

    /// Radar that covers a lateral position.
    pub fn side_for(y: f64) -> RadarSide {
        if y < 0.0 {
            RadarSide::Left
        } else {
            RadarSide::Right
        }
    }

    fn beam_for(&self, azimuth: f64) -> u8 {
        let beams = self.radar.beams.max(1);
        // Beams split [-pi/2, pi/2] evenly
        let fraction = (azimuth + std::f64::consts::FRAC_PI_2) / std::f64::consts::PI;
        ((fraction.clamp(0.0, 0.999_999) * beams as f64) as u8).min(beams - 1)
    }

    fn reading_for(&mut self, target: &GroundTruthTarget) -> RadarReading {
        let side = Self::side_for(target.position.y);
        let width = self.radar.car_width;
        let (range, azimuth) = cartesian_to_polar(target.position.x, target.position.y, side, width);

        // Relative velocity projected on the line of sight from the sensor
        let sensor = Vector2::new(0.0, side.lateral_sign() * width / 2.0);
        let line_of_sight = (target.position - sensor).normalize();
        let radial = target.velocity.dot(&line_of_sight);

        let azimuth = azimuth + self.azimuth_noise.sample(&mut self.physics_rng);
        RadarReading {
            mcc: self.mcc,
            beam: self.beam_for(azimuth),
            detections_in_cycle: 0,
            range: range + self.range_noise.sample(&mut self.physics_rng),
            azimuth,
            velocity: radial + self.velocity_noise.sample(&mut self.physics_rng),
            side,
        }
    }

    fn clutter_reading(&mut self) -> RadarReading {
        let x = self.physics_rng.gen_range(5.0..self.radar.max_range * 0.8);
        let y = self.physics_rng.gen_range(-8.0..8.0);
        let side = Self::side_for(y);
        let (range, azimuth) = cartesian_to_polar(x, y, side, self.radar.car_width);

        RadarReading {
            mcc: self.mcc,
            beam: self.beam_for(azimuth),
            detections_in_cycle: 0,
            range,
            azimuth,
            velocity: self.physics_rng.gen_range(-5.0..5.0),
            side,
        }
    }

    /// Generates the detections of the current cycle.
    pub fn generate_cycle(&mut self) -> Result<DetectionList, DetectionError> {
        let visible: Vec<GroundTruthTarget> = self
            .targets
            .values()
            .filter(|t| t.active && !t.blacked_out(self.mcc) && self.in_field_of_view(&t.position))
            .cloned()
            .collect();

        let mut readings = Vec::with_capacity(visible.len() + self.radar.clutter_per_cycle);
        for target in &visible {
            if self.physics_rng.gen_bool(self.radar.detection_probability.clamp(0.0, 1.0)) {
                readings.push(self.reading_for(target));
            }
        }
        let target_detections = readings.len();
        for _ in 0..self.radar.clutter_per_cycle {
            readings.push(self.clutter_reading());
        }

        self.last_stats = CycleStats {
            target_detections,
            clutter: readings.len() - target_detections,
        };

        let count = readings.len() as u32;
        let width = self.radar.car_width;
        let points = readings
            .into_iter()
            .map(|reading| {
                DetectionPoint::from_reading(
                    RadarReading {
                        detections_in_cycle: count,
                        ..reading
                    },
                    width,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        DetectionList::from_points(self.mcc, points)
    }

    /// Reference (ground truth) samples of all active targets at this cycle.
    pub fn reference_points(&self) -> Vec<(u64, ReferencePoint)> {
        self.active_targets()
            .map(|t| {
                let absolute_vx = t.velocity.x - self.ego_speed;
                (
                    t.id,
                    ReferencePoint {
                        mcc_left: self.mcc,
                        mcc_right: self.mcc,
                        target_distance: t.position.norm(),
                        target_x: t.position.x,
                        target_y: t.position.y,
                        target_vx: absolute_vx,
                        target_vy: t.velocity.y,
                        target_heading: t.velocity.y.atan2(absolute_vx),
                        ego_vx: self.ego_speed,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quiet_radar() -> RadarConfig {
        RadarConfig {
            detection_probability: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_oracle_spawn_target() {
        let mut oracle = Oracle::new(42, quiet_radar()).unwrap();
        let id = oracle.spawn_target(Vector2::new(30.0, -3.5), Vector2::new(-2.0, 0.0));

        let target = oracle.target(id).unwrap();
        assert_eq!(target.position.x, 30.0);
        assert!(target.active);
    }

    #[test]
    fn test_oracle_physics_step() {
        let mut oracle = Oracle::new(42, quiet_radar()).unwrap();
        let id = oracle.spawn_target(Vector2::new(30.0, 0.0), Vector2::new(-4.0, 0.5));

        oracle.step(0.5);

        let target = oracle.target(id).unwrap();
        assert_abs_diff_eq!(target.position.x, 28.0, epsilon = 1e-12);
        assert_abs_diff_eq!(target.position.y, 0.25, epsilon = 1e-12);
        assert_eq!(oracle.mcc(), 1);
    }

    #[test]
    fn test_detections_land_near_truth() {
        let mut oracle = Oracle::new(7, quiet_radar()).unwrap();
        oracle.spawn_target(Vector2::new(25.0, -3.5), Vector2::zeros());
        oracle.spawn_target(Vector2::new(15.0, 3.0), Vector2::zeros());

        let list = oracle.generate_cycle().unwrap();
        assert_eq!(list.len(), 2);

        let left = list.iter().find(|p| p.side() == RadarSide::Left).unwrap();
        assert_abs_diff_eq!(left.x(), 25.0, epsilon = 1.0);
        assert_abs_diff_eq!(left.y(), -3.5, epsilon = 1.0);
        assert!(list.iter().all(|p| p.detections_in_cycle() == 2));
    }

    #[test]
    fn test_blackout_and_field_of_view() {
        let mut oracle = Oracle::new(1, quiet_radar()).unwrap();
        let id = oracle.spawn_target(Vector2::new(20.0, 0.0), Vector2::zeros());
        oracle.spawn_target(Vector2::new(-5.0, 0.0), Vector2::zeros());
        oracle.set_blackout(id, 1, 2);

        assert_eq!(oracle.generate_cycle().unwrap().len(), 1);
        oracle.step(0.05);
        assert!(oracle.generate_cycle().unwrap().is_empty());
        oracle.step(0.05);
        oracle.step(0.05);
        assert_eq!(oracle.generate_cycle().unwrap().len(), 1);
    }

    #[test]
    fn test_clutter_is_counted() {
        let radar = RadarConfig {
            clutter_per_cycle: 3,
            ..quiet_radar()
        };
        let mut oracle = Oracle::new(3, radar).unwrap();
        oracle.spawn_target(Vector2::new(20.0, 0.0), Vector2::zeros());

        let list = oracle.generate_cycle().unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(
            oracle.last_stats(),
            CycleStats {
                target_detections: 1,
                clutter: 3
            }
        );
    }

    #[test]
    fn test_oracle_deterministic_noise() {
        let mut a = Oracle::new(42, quiet_radar()).unwrap();
        let mut b = Oracle::new(42, quiet_radar()).unwrap();
        a.spawn_target(Vector2::new(20.0, 1.0), Vector2::zeros());
        b.spawn_target(Vector2::new(20.0, 1.0), Vector2::zeros());

        // Same seed = same noise
        assert_eq!(a.generate_cycle().unwrap(), b.generate_cycle().unwrap());
    }

    #[test]
    fn test_reference_points() {
        let mut oracle = Oracle::new(42, quiet_radar()).unwrap().with_ego_speed(20.0);
        oracle.spawn_target(Vector2::new(3.0, 4.0), Vector2::new(-2.0, 0.0));

        let refs = oracle.reference_points();
        assert_eq!(refs.len(), 1);
        let (_, point) = refs[0];
        assert_abs_diff_eq!(point.target_distance, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(point.target_vx, -22.0, epsilon = 1e-12);
        assert_eq!(point.ego_vx, 20.0);
    }

    #[test]
    fn test_invalid_noise_rejected() {
        let radar = RadarConfig {
            range_noise_std: -1.0,
            ..Default::default()
        };
        assert!(matches!(Oracle::new(0, radar), Err(SimError::Noise(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn noise_free_detection_lands_on_truth(x in 1.0f64..60.0, y in -10.0f64..10.0) {
                let radar = RadarConfig {
                    range_noise_std: 0.0,
                    azimuth_noise_std: 0.0,
                    velocity_noise_std: 0.0,
                    ..quiet_radar()
                };
                let mut oracle = Oracle::new(11, radar).unwrap();
                oracle.spawn_target(Vector2::new(x, y), Vector2::zeros());

                let list = oracle.generate_cycle().unwrap();
                prop_assert_eq!(list.len(), 1);
                let point = list.iter().next().unwrap();
                prop_assert!((point.x() - x).abs() < 1e-9);
                prop_assert!((point.y() - y).abs() < 1e-9);
                prop_assert_eq!(point.side(), Oracle::side_for(y));
            }
        }
    }
}
