//! Motion and observation models shared by the recursive filters.
//!
//! States are interleaved per axis so that each axis is one contiguous
//! kinematic block:
//!
//! - constant velocity: `[x, vx, y, vy]`
//! - constant acceleration: `[x, vx, ax, y, vy, ay]`
//!
//! The linear filters use the matrices directly; the extended filter goes
//! through the [`MotionModel`] / [`ObservationModel`] traits so callers can
//! plug in their own nonlinear functions together with their Jacobians.

use std::f64::consts::PI;
use std::fmt::Debug;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Number of Cartesian axes tracked (x along the car, y across it).
pub const AXES: usize = 2;

/// Kinematic motion model used to build F and Q.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    ConstantVelocity,
    ConstantAcceleration,
}

impl MotionKind {
    /// Derivative order kept per axis (2 = position + velocity).
    pub fn order(self) -> usize {
        match self {
            MotionKind::ConstantVelocity => 2,
            MotionKind::ConstantAcceleration => 3,
        }
    }

    /// State dimension for the two tracked axes.
    pub fn state_dim(self) -> usize {
        self.order() * AXES
    }

    pub fn name(self) -> &'static str {
        match self {
            MotionKind::ConstantVelocity => "constant_velocity",
            MotionKind::ConstantAcceleration => "constant_acceleration",
        }
    }

    /// Index of the position component of `axis` in the state vector.
    #[inline]
    pub fn position_index(self, axis: usize) -> usize {
        axis * self.order()
    }

    /// Index of the velocity component of `axis` in the state vector.
    #[inline]
    pub fn velocity_index(self, axis: usize) -> usize {
        axis * self.order() + 1
    }

    /// Index of the acceleration component, if the model carries one.
    #[inline]
    pub fn acceleration_index(self, axis: usize) -> Option<usize> {
        match self {
            MotionKind::ConstantVelocity => None,
            MotionKind::ConstantAcceleration => Some(axis * 3 + 2),
        }
    }

    /// State transition matrix F for a step of `dt` seconds.
    pub fn transition_matrix(self, dt: f64) -> DMatrix<f64> {
        let n = self.order();
        let mut f = DMatrix::identity(self.state_dim(), self.state_dim());

        for axis in 0..AXES {
            let o = axis * n;
            f[(o, o + 1)] = dt; // p += v*dt
            if n == 3 {
                f[(o, o + 2)] = 0.5 * dt * dt; // p += a*dt²/2
                f[(o + 1, o + 2)] = dt; // v += a*dt
            }
        }

        f
    }

    /// Discrete white-noise acceleration process noise for a step of `dt`.
    ///
    /// `q_std` is the standard deviation of the driving noise (m/s² for the
    /// constant-velocity model, m/s³ for constant acceleration).
    pub fn process_noise(self, dt: f64, q_std: f64) -> DMatrix<f64> {
        let q = q_std * q_std;
        let n = self.order();
        // Noise gain per axis: how a unit noise impulse spreads over the block
        let gain: Vec<f64> = match self {
            MotionKind::ConstantVelocity => vec![0.5 * dt * dt, dt],
            MotionKind::ConstantAcceleration => vec![0.5 * dt * dt, dt, 1.0],
        };

        let mut qm = DMatrix::zeros(self.state_dim(), self.state_dim());
        for axis in 0..AXES {
            let o = axis * n;
            for i in 0..n {
                for j in 0..n {
                    qm[(o + i, o + j)] = q * gain[i] * gain[j];
                }
            }
        }
        qm
    }

    /// Observation matrix selecting `[x, y]` from the state.
    pub fn position_observation(self) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(AXES, self.state_dim());
        for axis in 0..AXES {
            h[(axis, self.position_index(axis))] = 1.0;
        }
        h
    }
}

/// Coordinates in which detections are presented to a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSpace {
    /// `[x, y]` in the ego frame
    Cartesian,
    /// `[range, azimuth]` seen from the ego origin
    Polar,
    /// `[range, azimuth, range_rate]` seen from the ego origin.
    ///
    /// The range rate is the corner radar's own, measured half a car width
    /// off the centre line, so it is slightly biased at short range.
    PolarDoppler,
}

impl MeasurementSpace {
    pub fn dim(self) -> usize {
        match self {
            MeasurementSpace::Cartesian | MeasurementSpace::Polar => 2,
            MeasurementSpace::PolarDoppler => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MeasurementSpace::Cartesian => "cartesian",
            MeasurementSpace::Polar => "polar",
            MeasurementSpace::PolarDoppler => "polar_doppler",
        }
    }
}

/// Wraps an angle to (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

// ============================================================================
// NONLINEAR MODEL TRAITS (Extended filter)
// ============================================================================

/// Nonlinear state propagation `x' = f(x, dt)` and its Jacobian.
pub trait MotionModel: Debug + Send + Sync {
    fn state_dim(&self) -> usize;

    fn transition(&self, state: &DVector<f64>, dt: f64) -> DVector<f64>;

    /// ∂f/∂x evaluated at `state`.
    fn jacobian(&self, state: &DVector<f64>, dt: f64) -> DMatrix<f64>;

    fn process_noise(&self, state: &DVector<f64>, dt: f64) -> DMatrix<f64>;
}

/// Nonlinear measurement function `z = h(x)` and its Jacobian.
pub trait ObservationModel: Debug + Send + Sync {
    fn state_dim(&self) -> usize;

    fn measurement_dim(&self) -> usize;

    fn observe(&self, state: &DVector<f64>) -> DVector<f64>;

    /// ∂h/∂x evaluated at `state`.
    fn jacobian(&self, state: &DVector<f64>) -> DMatrix<f64>;

    /// Residual `z - ẑ`. Angular components must be wrapped here.
    fn residual(&self, measured: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        measured - predicted
    }
}

/// Linear kinematics behind the [`MotionModel`] interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KinematicMotion {
    pub kind: MotionKind,
    pub process_noise_std: f64,
}

impl KinematicMotion {
    pub fn new(kind: MotionKind, process_noise_std: f64) -> Self {
        Self {
            kind,
            process_noise_std,
        }
    }
}

impl MotionModel for KinematicMotion {
    fn state_dim(&self) -> usize {
        self.kind.state_dim()
    }

    fn transition(&self, state: &DVector<f64>, dt: f64) -> DVector<f64> {
        self.kind.transition_matrix(dt) * state
    }

    fn jacobian(&self, _state: &DVector<f64>, dt: f64) -> DMatrix<f64> {
        self.kind.transition_matrix(dt)
    }

    fn process_noise(&self, _state: &DVector<f64>, dt: f64) -> DMatrix<f64> {
        self.kind.process_noise(dt, self.process_noise_std)
    }
}

/// Linear `[x, y]` observation behind the [`ObservationModel`] interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionObservation {
    pub kind: MotionKind,
}

impl ObservationModel for PositionObservation {
    fn state_dim(&self) -> usize {
        self.kind.state_dim()
    }

    fn measurement_dim(&self) -> usize {
        AXES
    }

    fn observe(&self, state: &DVector<f64>) -> DVector<f64> {
        self.kind.position_observation() * state
    }

    fn jacobian(&self, _state: &DVector<f64>) -> DMatrix<f64> {
        self.kind.position_observation()
    }
}

/// Range/azimuth (and optionally range-rate) seen from a sensor at `origin`.
///
/// Azimuth is measured from the +x axis towards +y.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarObservation {
    pub kind: MotionKind,
    pub origin: [f64; 2],
    pub range_rate: bool,
}

/// Ranges below this are treated as the sensor origin for Jacobian purposes.
const MIN_RANGE: f64 = 1e-6;

impl PolarObservation {
    pub fn new(kind: MotionKind, range_rate: bool) -> Self {
        Self {
            kind,
            origin: [0.0, 0.0],
            range_rate,
        }
    }

    pub fn with_origin(mut self, origin: [f64; 2]) -> Self {
        self.origin = origin;
        self
    }

    fn relative(&self, state: &DVector<f64>) -> (f64, f64, f64, f64) {
        let k = self.kind;
        let dx = state[k.position_index(0)] - self.origin[0];
        let dy = state[k.position_index(1)] - self.origin[1];
        let vx = state[k.velocity_index(0)];
        let vy = state[k.velocity_index(1)];
        (dx, dy, vx, vy)
    }
}

impl ObservationModel for PolarObservation {
    fn state_dim(&self) -> usize {
        self.kind.state_dim()
    }

    fn measurement_dim(&self) -> usize {
        if self.range_rate {
            3
        } else {
            2
        }
    }

    fn observe(&self, state: &DVector<f64>) -> DVector<f64> {
        let (dx, dy, vx, vy) = self.relative(state);
        let range = dx.hypot(dy);
        let azimuth = dy.atan2(dx);

        if self.range_rate {
            let rate = if range > MIN_RANGE {
                (dx * vx + dy * vy) / range
            } else {
                0.0
            };
            DVector::from_vec(vec![range, azimuth, rate])
        } else {
            DVector::from_vec(vec![range, azimuth])
        }
    }

    fn jacobian(&self, state: &DVector<f64>) -> DMatrix<f64> {
        let k = self.kind;
        let (dx, dy, vx, vy) = self.relative(state);
        let r2 = (dx * dx + dy * dy).max(MIN_RANGE * MIN_RANGE);
        let r = r2.sqrt();

        let (px, py) = (k.position_index(0), k.position_index(1));
        let mut h = DMatrix::zeros(self.measurement_dim(), k.state_dim());

        // range
        h[(0, px)] = dx / r;
        h[(0, py)] = dy / r;
        // azimuth
        h[(1, px)] = -dy / r2;
        h[(1, py)] = dx / r2;

        if self.range_rate {
            let (vxi, vyi) = (k.velocity_index(0), k.velocity_index(1));
            let cross = vx * dy - vy * dx;
            let r3 = r2 * r;
            h[(2, px)] = dy * cross / r3;
            h[(2, py)] = -dx * cross / r3;
            h[(2, vxi)] = dx / r;
            h[(2, vyi)] = dy / r;
        }

        h
    }

    fn residual(&self, measured: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        let mut y = measured - predicted;
        y[1] = wrap_angle(y[1]);
        y
    }
}
