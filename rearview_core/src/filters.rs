//! The "FILTER" Engine - recursive Bayesian estimators for one track.
//!
//! Three variants share one contract, [`RecursiveFilter`]:
//!
//! - [`KalmanFilter`]: linear kinematics, fixed observation matrix
//! - [`ExtendedKalmanFilter`]: user-supplied nonlinear models linearised by
//!   their Jacobians at the current estimate
//! - [`FadingKalmanFilter`]: the linear filter with the predicted covariance
//!   inflated by `alpha²`, discounting older information
//!
//! All variants correct with the Joseph form
//! `P = (I - K·H)·P·(I - K·H)ᵀ + K·R·Kᵀ` and re-symmetrise afterwards, so the
//! covariance stays symmetric positive semi-definite over long-lived tracks.
//!
//! Neither `predict` nor `update` is idempotent: predicting twice advances
//! the state twice, and updating twice with the same measurement counts it
//! twice.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::models::{MotionKind, MotionModel, ObservationModel};

/// State estimate and its covariance after a predict or update step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Residual between a measurement and the predicted measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Innovation {
    /// y = z - h(x)
    pub residual: DVector<f64>,
    /// S = H·P·Hᵀ + R
    pub covariance: DMatrix<f64>,
}

impl Innovation {
    /// Squared Mahalanobis distance yᵀ·S⁻¹·y.
    pub fn mahalanobis_squared(&self) -> Result<f64, FilterError> {
        let chol = self
            .covariance
            .clone()
            .cholesky()
            .ok_or(FilterError::SingularInnovationCovariance)?;
        let solved = chol.solve(&self.residual);
        Ok(self.residual.dot(&solved))
    }
}

/// Common predict/update contract of all filter variants.
pub trait RecursiveFilter {
    fn dim_state(&self) -> usize;

    fn dim_measurement(&self) -> usize;

    fn state(&self) -> &DVector<f64>;

    fn covariance(&self) -> &DMatrix<f64>;

    /// Propagates the estimate `dt` seconds forward.
    fn predict(&mut self, dt: f64) -> Result<Estimate, FilterError>;

    /// Corrects the estimate with `measurement`.
    ///
    /// On error the filter is left untouched.
    fn update(&mut self, measurement: &DVector<f64>) -> Result<Estimate, FilterError>;

    /// Innovation of `measurement` against the current estimate, without
    /// modifying the filter.
    fn innovation(&self, measurement: &DVector<f64>) -> Result<Innovation, FilterError>;

    /// Replaces the estimate (track initialisation and merging).
    fn reinitialize(
        &mut self,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(), FilterError>;

    /// `predict(dt)` followed by `update(measurement)`.
    fn predict_update(
        &mut self,
        measurement: &DVector<f64>,
        dt: f64,
    ) -> Result<Estimate, FilterError> {
        self.predict(dt)?;
        self.update(measurement)
    }

    fn estimate(&self) -> Estimate {
        Estimate {
            state: self.state().clone(),
            covariance: self.covariance().clone(),
        }
    }

    fn mahalanobis_squared(&self, measurement: &DVector<f64>) -> Result<f64, FilterError> {
        self.innovation(measurement)?.mahalanobis_squared()
    }
}

// ============================================================================
// SHARED MATH
// ============================================================================

pub(crate) fn check_dt(dt: f64) -> Result<(), FilterError> {
    if dt >= 0.0 && dt.is_finite() {
        Ok(())
    } else {
        Err(FilterError::InvalidParameter(format!(
            "time step must be finite and non-negative, got {dt}"
        )))
    }
}

fn check_measurement(measurement: &DVector<f64>, dim: usize) -> Result<(), FilterError> {
    if measurement.len() != dim {
        return Err(FilterError::dimension("measurement", dim, measurement.len()));
    }
    if measurement.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::InvalidParameter(
            "measurement contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

fn check_square(context: &'static str, m: &DMatrix<f64>, dim: usize) -> Result<(), FilterError> {
    if m.nrows() != dim {
        return Err(FilterError::dimension(context, dim, m.nrows()));
    }
    if m.ncols() != dim {
        return Err(FilterError::dimension(context, dim, m.ncols()));
    }
    Ok(())
}

fn check_estimate(
    state: &DVector<f64>,
    covariance: &DMatrix<f64>,
    dim: usize,
) -> Result<(), FilterError> {
    if state.len() != dim {
        return Err(FilterError::dimension("state", dim, state.len()));
    }
    check_square("state covariance", covariance, dim)
}

/// Averages a matrix with its transpose to remove round-off asymmetry.
pub(crate) fn symmetrize(m: DMatrix<f64>) -> DMatrix<f64> {
    (&m + m.transpose()) * 0.5
}

fn innovation_covariance(p: &DMatrix<f64>, h: &DMatrix<f64>, r: &DMatrix<f64>) -> DMatrix<f64> {
    symmetrize(h * p * h.transpose() + r)
}

/// Joseph-form measurement update given the residual and linearised H.
fn joseph_update(
    x: &DVector<f64>,
    p: &DMatrix<f64>,
    residual: &DVector<f64>,
    h: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>), FilterError> {
    let s = innovation_covariance(p, h, r);
    let chol = s.cholesky().ok_or(FilterError::SingularInnovationCovariance)?;

    // K = P·Hᵀ·S⁻¹ = (S⁻¹·H·P)ᵀ since P and S are symmetric
    let k = chol.solve(&(h * p)).transpose();

    let x_new = x + &k * residual;

    let n = x.len();
    let i_kh = DMatrix::identity(n, n) - &k * h;
    let p_new = &i_kh * p * i_kh.transpose() + &k * r * k.transpose();

    if x_new.iter().any(|v| !v.is_finite()) || p_new.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::SingularInnovationCovariance);
    }

    Ok((x_new, symmetrize(p_new)))
}

// ============================================================================
// LINEAR KALMAN FILTER
// ============================================================================

/// Linear Kalman filter over a kinematic motion model observing `[x, y]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter {
    motion: MotionKind,
    process_noise_std: f64,

    x: DVector<f64>,
    p: DMatrix<f64>,

    /// F and Q are rebuilt only when dt changes
    cached_dt: f64,
    f: DMatrix<f64>,
    q: DMatrix<f64>,

    h: DMatrix<f64>,
    r: DMatrix<f64>,
}

impl KalmanFilter {
    /// Creates a filter.
    ///
    /// # Arguments
    /// * `motion` - Kinematic model (defines F and Q)
    /// * `dt_sample` - Nominal sample interval used to prebuild F and Q
    /// * `process_noise_std` - Driving acceleration noise (1σ)
    /// * `measurement_noise` - R (2×2)
    /// * `state` / `covariance` - Initial estimate
    pub fn new(
        motion: MotionKind,
        dt_sample: f64,
        process_noise_std: f64,
        measurement_noise: DMatrix<f64>,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<Self, FilterError> {
        check_dt(dt_sample)?;
        let h = motion.position_observation();
        check_square("measurement noise", &measurement_noise, h.nrows())?;
        check_estimate(&state, &covariance, motion.state_dim())?;

        Ok(Self {
            motion,
            process_noise_std,
            x: state,
            p: symmetrize(covariance),
            cached_dt: dt_sample,
            f: motion.transition_matrix(dt_sample),
            q: motion.process_noise(dt_sample, process_noise_std),
            h,
            r: measurement_noise,
        })
    }

    pub fn motion(&self) -> MotionKind {
        self.motion
    }

    pub fn observation_matrix(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn measurement_noise(&self) -> &DMatrix<f64> {
        &self.r
    }

    fn refresh_transition(&mut self, dt: f64) {
        if dt != self.cached_dt {
            self.f = self.motion.transition_matrix(dt);
            self.q = self.motion.process_noise(dt, self.process_noise_std);
            self.cached_dt = dt;
        }
    }

    /// Prediction with the propagated covariance scaled by `inflation`
    /// before process noise is added.
    pub(crate) fn predict_inflated(&mut self, dt: f64, inflation: f64) -> Result<Estimate, FilterError> {
        check_dt(dt)?;
        self.refresh_transition(dt);

        self.x = &self.f * &self.x;
        let propagated = &self.f * &self.p * self.f.transpose();
        self.p = symmetrize(propagated * inflation + &self.q);

        Ok(self.estimate())
    }
}

impl RecursiveFilter for KalmanFilter {
    fn dim_state(&self) -> usize {
        self.x.len()
    }

    fn dim_measurement(&self) -> usize {
        self.h.nrows()
    }

    fn state(&self) -> &DVector<f64> {
        &self.x
    }

    fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }

    fn predict(&mut self, dt: f64) -> Result<Estimate, FilterError> {
        self.predict_inflated(dt, 1.0)
    }

    fn update(&mut self, measurement: &DVector<f64>) -> Result<Estimate, FilterError> {
        check_measurement(measurement, self.dim_measurement())?;
        let residual = measurement - &self.h * &self.x;
        let (x, p) = joseph_update(&self.x, &self.p, &residual, &self.h, &self.r)?;
        self.x = x;
        self.p = p;
        Ok(self.estimate())
    }

    fn innovation(&self, measurement: &DVector<f64>) -> Result<Innovation, FilterError> {
        check_measurement(measurement, self.dim_measurement())?;
        Ok(Innovation {
            residual: measurement - &self.h * &self.x,
            covariance: innovation_covariance(&self.p, &self.h, &self.r),
        })
    }

    fn reinitialize(
        &mut self,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        check_estimate(&state, &covariance, self.dim_state())?;
        self.x = state;
        self.p = symmetrize(covariance);
        Ok(())
    }
}

// ============================================================================
// FADING-MEMORY KALMAN FILTER
// ============================================================================

/// Linear Kalman filter with fading memory: `P⁻ = α²·F·P·Fᵀ + Q`.
///
/// With `alpha = 1` it reproduces [`KalmanFilter`] exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct FadingKalmanFilter {
    inner: KalmanFilter,
    alpha: f64,
}

impl FadingKalmanFilter {
    pub fn new(inner: KalmanFilter, alpha: f64) -> Result<Self, FilterError> {
        if !(alpha >= 1.0 && alpha.is_finite()) {
            return Err(FilterError::InvalidParameter(format!(
                "fading factor alpha must be >= 1, got {alpha}"
            )));
        }
        Ok(Self { inner, alpha })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl RecursiveFilter for FadingKalmanFilter {
    fn dim_state(&self) -> usize {
        self.inner.dim_state()
    }

    fn dim_measurement(&self) -> usize {
        self.inner.dim_measurement()
    }

    fn state(&self) -> &DVector<f64> {
        self.inner.state()
    }

    fn covariance(&self) -> &DMatrix<f64> {
        self.inner.covariance()
    }

    fn predict(&mut self, dt: f64) -> Result<Estimate, FilterError> {
        self.inner.predict_inflated(dt, self.alpha * self.alpha)
    }

    fn update(&mut self, measurement: &DVector<f64>) -> Result<Estimate, FilterError> {
        self.inner.update(measurement)
    }

    fn innovation(&self, measurement: &DVector<f64>) -> Result<Innovation, FilterError> {
        self.inner.innovation(measurement)
    }

    fn reinitialize(
        &mut self,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        self.inner.reinitialize(state, covariance)
    }
}

// ============================================================================
// EXTENDED KALMAN FILTER
// ============================================================================

/// Extended Kalman filter over arbitrary motion and observation models.
#[derive(Debug, Clone)]
pub struct ExtendedKalmanFilter {
    motion: Arc<dyn MotionModel>,
    observation: Arc<dyn ObservationModel>,
    x: DVector<f64>,
    p: DMatrix<f64>,
    r: DMatrix<f64>,
}

impl ExtendedKalmanFilter {
    pub fn new(
        motion: Arc<dyn MotionModel>,
        observation: Arc<dyn ObservationModel>,
        measurement_noise: DMatrix<f64>,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<Self, FilterError> {
        let n = motion.state_dim();
        if observation.state_dim() != n {
            return Err(FilterError::dimension(
                "observation model state",
                n,
                observation.state_dim(),
            ));
        }
        check_square("measurement noise", &measurement_noise, observation.measurement_dim())?;
        check_estimate(&state, &covariance, n)?;

        Ok(Self {
            motion,
            observation,
            x: state,
            p: symmetrize(covariance),
            r: measurement_noise,
        })
    }

    /// Evaluates the observation model and its Jacobian at the current state.
    fn linearize(&self) -> Result<(DVector<f64>, DMatrix<f64>), FilterError> {
        let m = self.dim_measurement();
        let predicted = self.observation.observe(&self.x);
        if predicted.len() != m {
            return Err(FilterError::dimension("predicted measurement", m, predicted.len()));
        }
        let h = self.observation.jacobian(&self.x);
        if h.nrows() != m {
            return Err(FilterError::dimension("observation jacobian rows", m, h.nrows()));
        }
        if h.ncols() != self.dim_state() {
            return Err(FilterError::dimension(
                "observation jacobian columns",
                self.dim_state(),
                h.ncols(),
            ));
        }
        Ok((predicted, h))
    }
}

impl RecursiveFilter for ExtendedKalmanFilter {
    fn dim_state(&self) -> usize {
        self.x.len()
    }

    fn dim_measurement(&self) -> usize {
        self.observation.measurement_dim()
    }

    fn state(&self) -> &DVector<f64> {
        &self.x
    }

    fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }

    fn predict(&mut self, dt: f64) -> Result<Estimate, FilterError> {
        check_dt(dt)?;
        let n = self.dim_state();

        // Linearise at the prior estimate
        let f = self.motion.jacobian(&self.x, dt);
        check_square("motion jacobian", &f, n)?;
        let q = self.motion.process_noise(&self.x, dt);
        check_square("process noise", &q, n)?;
        let x = self.motion.transition(&self.x, dt);
        if x.len() != n {
            return Err(FilterError::dimension("propagated state", n, x.len()));
        }

        self.x = x;
        self.p = symmetrize(&f * &self.p * f.transpose() + q);
        Ok(self.estimate())
    }

    fn update(&mut self, measurement: &DVector<f64>) -> Result<Estimate, FilterError> {
        check_measurement(measurement, self.dim_measurement())?;
        let (predicted, h) = self.linearize()?;
        let residual = self.observation.residual(measurement, &predicted);

        let (x, p) = joseph_update(&self.x, &self.p, &residual, &h, &self.r)?;
        self.x = x;
        self.p = p;
        Ok(self.estimate())
    }

    fn innovation(&self, measurement: &DVector<f64>) -> Result<Innovation, FilterError> {
        check_measurement(measurement, self.dim_measurement())?;
        let (predicted, h) = self.linearize()?;
        Ok(Innovation {
            residual: self.observation.residual(measurement, &predicted),
            covariance: innovation_covariance(&self.p, &h, &self.r),
        })
    }

    fn reinitialize(
        &mut self,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        check_estimate(&state, &covariance, self.dim_state())?;
        self.x = state;
        self.p = symmetrize(covariance);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KinematicMotion, PolarObservation};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use proptest::prelude::*;

    const CV: MotionKind = MotionKind::ConstantVelocity;

    fn linear(state: [f64; 4]) -> KalmanFilter {
        KalmanFilter::new(
            CV,
            1.0,
            0.1,
            DMatrix::identity(2, 2) * 0.25,
            DVector::from_row_slice(&state),
            DMatrix::identity(4, 4) * 10.0,
        )
        .unwrap()
    }

    fn extended_polar(state: [f64; 4]) -> ExtendedKalmanFilter {
        ExtendedKalmanFilter::new(
            Arc::new(KinematicMotion::new(CV, 0.1)),
            Arc::new(PolarObservation::new(CV, false)),
            DMatrix::from_diagonal(&DVector::from_vec(vec![0.04, 0.0004])),
            DVector::from_row_slice(&state),
            DMatrix::identity(4, 4) * 10.0,
        )
        .unwrap()
    }

    fn z(values: &[f64]) -> DVector<f64> {
        DVector::from_row_slice(values)
    }

    /// Symmetric and no eigenvalue below -tol·scale.
    fn assert_psd(p: &DMatrix<f64>) {
        let scale = p.abs().max().max(1.0);
        let asym = (p - p.transpose()).abs().max();
        assert!(asym <= 1e-9 * scale, "Covariance asymmetric by {asym}");
        let min_eig = p.clone().symmetric_eigen().eigenvalues.min();
        assert!(min_eig >= -1e-9 * scale, "Covariance has eigenvalue {min_eig}");
    }

    #[test]
    fn test_predict_constant_velocity() {
        let mut kf = linear([10.0, -1.0, 0.0, 0.5]);
        let est = kf.predict(2.0).unwrap();

        assert_relative_eq!(est.state[0], 8.0, epsilon = 1e-12);
        assert_relative_eq!(est.state[2], 1.0, epsilon = 1e-12);
        assert!(est.covariance[(0, 0)] > 10.0, "Prediction should grow uncertainty");
    }

    #[test]
    fn test_update_pulls_towards_measurement() {
        let mut kf = linear([0.0, 0.0, 0.0, 0.0]);
        let before = kf.covariance().trace();

        let est = kf.update(&z(&[4.0, -2.0])).unwrap();

        assert!(est.state[0] > 3.5 && est.state[0] < 4.0);
        assert!(est.state[2] < -1.75 && est.state[2] > -2.0);
        assert!(est.covariance.trace() < before, "Update should reduce uncertainty");
    }

    #[test]
    fn test_update_rejects_wrong_dimension() {
        let mut kf = linear([0.0; 4]);
        let before = kf.estimate();

        let err = kf.update(&z(&[1.0, 2.0, 3.0])).unwrap_err();
        assert_eq!(err, FilterError::dimension("measurement", 2, 3));
        assert_eq!(kf.estimate(), before, "Failed update must not touch the filter");
    }

    #[test]
    fn test_construction_rejects_mismatched_state() {
        let err = KalmanFilter::new(
            CV,
            1.0,
            0.1,
            DMatrix::identity(2, 2),
            DVector::zeros(6),
            DMatrix::identity(6, 6),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::InvalidDimension { expected: 4, actual: 6, .. }));
    }

    #[test]
    fn test_negative_dt_rejected() {
        let mut kf = linear([0.0; 4]);
        assert!(matches!(kf.predict(-0.1), Err(FilterError::InvalidParameter(_))));
    }

    #[test]
    fn test_singular_innovation_leaves_filter_untouched() {
        let mut kf = KalmanFilter::new(
            CV,
            1.0,
            0.0,
            DMatrix::zeros(2, 2),
            DVector::zeros(4),
            DMatrix::zeros(4, 4),
        )
        .unwrap();
        let before = kf.estimate();

        let err = kf.update(&z(&[1.0, 1.0])).unwrap_err();
        assert_eq!(err, FilterError::SingularInnovationCovariance);
        assert_eq!(kf.estimate(), before);
    }

    #[test]
    fn test_predict_update_matches_sequential_calls() {
        let mut a = linear([5.0, 1.0, -1.0, 0.0]);
        let mut b = a.clone();

        let combined = a.predict_update(&z(&[6.2, -0.9]), 1.0).unwrap();
        b.predict(1.0).unwrap();
        let sequential = b.update(&z(&[6.2, -0.9])).unwrap();

        assert_eq!(combined, sequential);
    }

    #[test]
    fn test_operations_are_not_idempotent() {
        let mut kf = linear([0.0, 1.0, 0.0, 0.0]);
        let once = kf.predict(1.0).unwrap();
        let twice = kf.predict(1.0).unwrap();
        assert_ne!(once.state[0], twice.state[0]);

        let first = kf.update(&z(&[5.0, 0.0])).unwrap();
        let second = kf.update(&z(&[5.0, 0.0])).unwrap();
        assert!(second.covariance.trace() < first.covariance.trace());
    }

    #[test]
    fn test_fading_alpha_one_matches_linear() {
        let mut plain = linear([3.0, 0.5, 1.0, -0.2]);
        let mut fading = FadingKalmanFilter::new(plain.clone(), 1.0).unwrap();

        for (k, dt) in [0.1, 0.5, 0.5, 1.0].iter().enumerate() {
            let meas = z(&[3.0 + k as f64, 1.0 - 0.1 * k as f64]);
            let a = plain.predict_update(&meas, *dt).unwrap();
            let b = fading.predict_update(&meas, *dt).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_fading_inflates_prediction() {
        let plain = linear([0.0; 4]);
        let mut fading = FadingKalmanFilter::new(plain.clone(), 1.2).unwrap();
        let mut plain = plain;

        let p_plain = plain.predict(1.0).unwrap().covariance;
        let p_fading = fading.predict(1.0).unwrap().covariance;
        assert!(p_fading.trace() > p_plain.trace());
    }

    #[test]
    fn test_fading_rejects_alpha_below_one() {
        assert!(FadingKalmanFilter::new(linear([0.0; 4]), 0.9).is_err());
    }

    #[test]
    fn test_extended_polar_converges() {
        // Target at (20, 5) standing still
        let mut ekf = extended_polar([18.0, 0.0, 3.0, 0.0]);
        let truth = z(&[20.0f64.hypot(5.0), 5.0f64.atan2(20.0)]);

        for _ in 0..30 {
            ekf.predict_update(&truth, 0.1).unwrap();
            assert_psd(ekf.covariance());
        }

        assert_abs_diff_eq!(ekf.state()[0], 20.0, epsilon = 0.05);
        assert_abs_diff_eq!(ekf.state()[2], 5.0, epsilon = 0.05);
    }

    #[test]
    fn test_extended_with_linear_models_matches_linear() {
        let mut kf = linear([1.0, 0.2, 2.0, -0.1]);
        let mut ekf = ExtendedKalmanFilter::new(
            Arc::new(KinematicMotion::new(CV, 0.1)),
            Arc::new(crate::models::PositionObservation { kind: CV }),
            DMatrix::identity(2, 2) * 0.25,
            DVector::from_row_slice(&[1.0, 0.2, 2.0, -0.1]),
            DMatrix::identity(4, 4) * 10.0,
        )
        .unwrap();

        for meas in [[1.3, 1.8], [1.5, 1.75], [1.6, 1.6]] {
            let a = kf.predict_update(&z(&meas), 1.0).unwrap();
            let b = ekf.predict_update(&z(&meas), 1.0).unwrap();
            assert_relative_eq!(a.state, b.state, epsilon = 1e-9);
            assert_relative_eq!(a.covariance, b.covariance, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_mahalanobis_distance() {
        let kf = linear([0.0; 4]);
        // S = 10 + 0.25 on each axis
        let d2 = kf.mahalanobis_squared(&z(&[10.25f64.sqrt(), 0.0])).unwrap();
        assert_relative_eq!(d2, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reinitialize_checks_dimensions() {
        let mut kf = linear([0.0; 4]);
        assert!(kf.reinitialize(DVector::zeros(3), DMatrix::identity(3, 3)).is_err());

        kf.reinitialize(DVector::from_row_slice(&[1.0, 2.0, 3.0, 4.0]), DMatrix::identity(4, 4))
            .unwrap();
        assert_eq!(kf.state()[3], 4.0);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Predict(f64),
        Update(f64, f64),
    }

    fn steps() -> impl Strategy<Value = Vec<Step>> {
        let step = prop_oneof![
            (0.01f64..2.0).prop_map(Step::Predict),
            (1.0f64..60.0, -20.0f64..20.0).prop_map(|(x, y)| Step::Update(x, y)),
        ];
        prop::collection::vec(step, 1..80)
    }

    fn run(filter: &mut dyn RecursiveFilter, steps: &[Step], polar: bool) {
        for step in steps {
            let est = match *step {
                Step::Predict(dt) => filter.predict(dt).unwrap(),
                Step::Update(x, y) => {
                    let meas = if polar {
                        z(&[x.hypot(y), y.atan2(x)])
                    } else {
                        z(&[x, y])
                    };
                    filter.update(&meas).unwrap()
                }
            };
            assert_psd(&est.covariance);
        }
    }

    proptest! {
        #[test]
        fn prop_linear_covariance_stays_psd(steps in steps()) {
            run(&mut linear([10.0, 0.0, 0.0, 0.0]), &steps, false);
        }

        #[test]
        fn prop_fading_covariance_stays_psd(steps in steps(), alpha in 1.0f64..1.3) {
            let mut f = FadingKalmanFilter::new(linear([10.0, 0.0, 0.0, 0.0]), alpha).unwrap();
            run(&mut f, &steps, false);
        }

        #[test]
        fn prop_extended_covariance_stays_psd(steps in steps()) {
            run(&mut extended_polar([10.0, 0.0, 1.0, 0.0]), &steps, true);
        }

        #[test]
        fn prop_fading_alpha_one_equals_linear(steps in steps()) {
            let mut plain = linear([10.0, 0.0, 0.0, 0.0]);
            let mut fading = FadingKalmanFilter::new(plain.clone(), 1.0).unwrap();
            for step in &steps {
                let (a, b) = match *step {
                    Step::Predict(dt) => (plain.predict(dt).unwrap(), fading.predict(dt).unwrap()),
                    Step::Update(x, y) => (
                        plain.update(&z(&[x, y])).unwrap(),
                        fading.update(&z(&[x, y])).unwrap(),
                    ),
                };
                prop_assert_eq!(a, b);
            }
        }
    }
}
