//! Binds one filter variant to a track behind a uniform contract.
//!
//! The Track Manager only ever sees a [`FilterHandle`]; which variant sits
//! behind it is fixed when the handle is created from a [`FilterSpec`].

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector2};
use serde::{Deserialize, Serialize};

use crate::detection::DetectionPoint;
use crate::error::{ConfigError, FilterError};
use crate::filters::{
    Estimate, ExtendedKalmanFilter, FadingKalmanFilter, Innovation, KalmanFilter, RecursiveFilter,
};
use crate::models::{
    KinematicMotion, MeasurementSpace, MotionKind, ObservationModel, PolarObservation,
    PositionObservation, AXES,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Filter variant bound to a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Linear,
    Extended,
    Fading,
}

impl FilterType {
    pub fn name(self) -> &'static str {
        match self {
            FilterType::Linear => "linear",
            FilterType::Extended => "extended",
            FilterType::Fading => "fading",
        }
    }
}

/// Everything needed to create a filter for a new track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub filter_type: FilterType,

    pub motion_model: MotionKind,

    /// Coordinates detections are presented in (polar needs `extended`)
    pub measurement_space: MeasurementSpace,

    /// Must equal the motion model's state dimension (4 or 6)
    pub dim_state: usize,

    /// Must equal the measurement space dimension (2 or 3)
    pub dim_measurement: usize,

    /// Radar cycle period in seconds (default: 0.05 = 20 Hz)
    pub dt_sample: f64,

    /// Driving acceleration noise, 1σ (default: 2.0 m/s²)
    pub process_noise_std: f64,

    /// Measurement noise, 1σ per measurement component
    pub measurement_noise_std: Vec<f64>,

    /// Fading factor, only used by the `fading` variant (default: 1.0)
    pub alpha: f64,

    /// Initial position uncertainty, 1σ (default: 1.0 m)
    pub initial_position_std: f64,

    /// Initial velocity (and acceleration) uncertainty, 1σ (default: 10.0 m/s)
    pub initial_velocity_std: f64,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            filter_type: FilterType::Linear,
            motion_model: MotionKind::ConstantVelocity,
            measurement_space: MeasurementSpace::Cartesian,
            dim_state: 4,
            dim_measurement: 2,
            dt_sample: 0.05,
            process_noise_std: 2.0,
            measurement_noise_std: vec![0.5, 0.5],
            alpha: 1.0,
            initial_position_std: 1.0,
            initial_velocity_std: 10.0,
        }
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidNoise { name, value })
    }
}

impl FilterSpec {
    /// Rejects inconsistent or out-of-range settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt_sample > 0.0 && self.dt_sample.is_finite()) {
            return Err(ConfigError::NonPositiveSampleInterval(self.dt_sample));
        }

        let expected = self.motion_model.state_dim();
        if self.dim_state != expected {
            return Err(ConfigError::StateDimension {
                model: self.motion_model.name(),
                expected,
                actual: self.dim_state,
            });
        }

        let space = self.measurement_space;
        for actual in [self.dim_measurement, self.measurement_noise_std.len()] {
            if actual != space.dim() {
                return Err(ConfigError::MeasurementDimension {
                    space: space.name(),
                    expected: space.dim(),
                    actual,
                });
            }
        }

        if self.filter_type != FilterType::Extended && space != MeasurementSpace::Cartesian {
            return Err(ConfigError::UnsupportedMeasurementSpace {
                filter: self.filter_type.name(),
                space: space.name(),
            });
        }

        if !(self.alpha >= 1.0 && self.alpha.is_finite()) {
            return Err(ConfigError::InvalidAlpha(self.alpha));
        }

        check_positive("process_noise_std", self.process_noise_std)?;
        for &std in &self.measurement_noise_std {
            check_positive("measurement_noise_std", std)?;
        }
        check_positive("initial_position_std", self.initial_position_std)?;
        check_positive("initial_velocity_std", self.initial_velocity_std)?;

        Ok(())
    }

    /// Diagonal measurement noise R.
    pub fn measurement_noise(&self) -> DMatrix<f64> {
        let variances: Vec<f64> = self.measurement_noise_std.iter().map(|s| s * s).collect();
        DMatrix::from_diagonal(&DVector::from_vec(variances))
    }

    /// Initial state and covariance for an object at `position`.
    ///
    /// Without a velocity the object is assumed static with wide velocity
    /// uncertainty; accelerations always start at zero.
    pub fn initial_estimate(
        &self,
        position: Vector2<f64>,
        velocity: Option<Vector2<f64>>,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let kind = self.motion_model;
        let n = kind.state_dim();
        let velocity = velocity.unwrap_or_else(Vector2::zeros);

        let mut state = DVector::zeros(n);
        let pos_var = self.initial_position_std.powi(2);
        let vel_var = self.initial_velocity_std.powi(2);
        let mut variances = DVector::from_element(n, vel_var);

        for axis in 0..AXES {
            state[kind.position_index(axis)] = position[axis];
            state[kind.velocity_index(axis)] = velocity[axis];
            variances[kind.position_index(axis)] = pos_var;
        }

        (state, DMatrix::from_diagonal(&variances))
    }
}

// ============================================================================
// FILTER HANDLE
// ============================================================================

#[derive(Debug, Clone)]
enum BoundFilter {
    Linear(KalmanFilter),
    Extended(ExtendedKalmanFilter),
    Fading(FadingKalmanFilter),
}

/// A filter instance owned by one track.
#[derive(Debug, Clone)]
pub struct FilterHandle {
    filter_type: FilterType,
    motion: MotionKind,
    space: MeasurementSpace,
    dt_sample: f64,
    filter: BoundFilter,
}

impl FilterHandle {
    /// Creates the filter variant named by `spec` starting at the given estimate.
    pub fn create(
        spec: &FilterSpec,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<Self, FilterError> {
        let motion = spec.motion_model;
        if spec.dim_state != motion.state_dim() {
            return Err(FilterError::dimension("state", motion.state_dim(), spec.dim_state));
        }
        if spec.dim_measurement != spec.measurement_space.dim() {
            return Err(FilterError::dimension(
                "measurement",
                spec.measurement_space.dim(),
                spec.dim_measurement,
            ));
        }

        let r = spec.measurement_noise();
        let linear = || -> Result<KalmanFilter, FilterError> {
            if spec.measurement_space != MeasurementSpace::Cartesian {
                return Err(FilterError::InvalidParameter(format!(
                    "{} filter cannot observe {} measurements",
                    spec.filter_type.name(),
                    spec.measurement_space.name()
                )));
            }
            KalmanFilter::new(
                motion,
                spec.dt_sample,
                spec.process_noise_std,
                r.clone(),
                state.clone(),
                covariance.clone(),
            )
        };

        let filter = match spec.filter_type {
            FilterType::Linear => BoundFilter::Linear(linear()?),
            FilterType::Fading => BoundFilter::Fading(FadingKalmanFilter::new(linear()?, spec.alpha)?),
            FilterType::Extended => {
                let observation: Arc<dyn ObservationModel> = match spec.measurement_space {
                    MeasurementSpace::Cartesian => Arc::new(PositionObservation { kind: motion }),
                    MeasurementSpace::Polar => Arc::new(PolarObservation::new(motion, false)),
                    MeasurementSpace::PolarDoppler => Arc::new(PolarObservation::new(motion, true)),
                };
                BoundFilter::Extended(ExtendedKalmanFilter::new(
                    Arc::new(KinematicMotion::new(motion, spec.process_noise_std)),
                    observation,
                    r.clone(),
                    state.clone(),
                    covariance.clone(),
                )?)
            }
        };

        Ok(Self {
            filter_type: spec.filter_type,
            motion,
            space: spec.measurement_space,
            dt_sample: spec.dt_sample,
            filter,
        })
    }

    /// Creates a filter for an object first seen at `position`.
    pub fn initial_from_position(
        spec: &FilterSpec,
        position: Vector2<f64>,
        velocity: Option<Vector2<f64>>,
    ) -> Result<Self, FilterError> {
        let (state, covariance) = spec.initial_estimate(position, velocity);
        Self::create(spec, state, covariance)
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    pub fn motion_model(&self) -> MotionKind {
        self.motion
    }

    pub fn measurement_space(&self) -> MeasurementSpace {
        self.space
    }

    /// Predicts one nominal sample interval ahead.
    pub fn predict_sample(&mut self) -> Result<Estimate, FilterError> {
        let dt = self.dt_sample;
        self.predict(dt)
    }

    /// Measurement vector of `point` in this filter's measurement space.
    pub fn measurement_of(&self, point: &DetectionPoint) -> DVector<f64> {
        point.measurement(self.space)
    }

    /// Estimated `[x, y]` position.
    pub fn position(&self) -> Vector2<f64> {
        let x = self.state();
        Vector2::new(
            x[self.motion.position_index(0)],
            x[self.motion.position_index(1)],
        )
    }

    /// Estimated `[vx, vy]` velocity.
    pub fn velocity(&self) -> Vector2<f64> {
        let x = self.state();
        Vector2::new(
            x[self.motion.velocity_index(0)],
            x[self.motion.velocity_index(1)],
        )
    }

    /// Estimated `[ax, ay]`, if the motion model carries accelerations.
    pub fn acceleration(&self) -> Option<Vector2<f64>> {
        let x = self.state();
        Some(Vector2::new(
            x[self.motion.acceleration_index(0)?],
            x[self.motion.acceleration_index(1)?],
        ))
    }

    /// `[var(x), var(y)]` and `[var(vx), var(vy)]` from the covariance diagonal.
    pub fn variances(&self) -> (Vector2<f64>, Vector2<f64>) {
        let p = self.covariance();
        let diag = |i: usize| p[(i, i)];
        (
            Vector2::new(
                diag(self.motion.position_index(0)),
                diag(self.motion.position_index(1)),
            ),
            Vector2::new(
                diag(self.motion.velocity_index(0)),
                diag(self.motion.velocity_index(1)),
            ),
        )
    }

    fn inner(&self) -> &dyn RecursiveFilter {
        match &self.filter {
            BoundFilter::Linear(f) => f,
            BoundFilter::Extended(f) => f,
            BoundFilter::Fading(f) => f,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RecursiveFilter {
        match &mut self.filter {
            BoundFilter::Linear(f) => f,
            BoundFilter::Extended(f) => f,
            BoundFilter::Fading(f) => f,
        }
    }
}

impl RecursiveFilter for FilterHandle {
    fn dim_state(&self) -> usize {
        self.inner().dim_state()
    }

    fn dim_measurement(&self) -> usize {
        self.inner().dim_measurement()
    }

    fn state(&self) -> &DVector<f64> {
        self.inner().state()
    }

    fn covariance(&self) -> &DMatrix<f64> {
        self.inner().covariance()
    }

    fn predict(&mut self, dt: f64) -> Result<Estimate, FilterError> {
        self.inner_mut().predict(dt)
    }

    fn update(&mut self, measurement: &DVector<f64>) -> Result<Estimate, FilterError> {
        self.inner_mut().update(measurement)
    }

    fn innovation(&self, measurement: &DVector<f64>) -> Result<Innovation, FilterError> {
        self.inner().innovation(measurement)
    }

    fn reinitialize(
        &mut self,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        self.inner_mut().reinitialize(state, covariance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spec(filter_type: FilterType) -> FilterSpec {
        FilterSpec {
            filter_type,
            dt_sample: 1.0,
            ..Default::default()
        }
    }

    fn polar_spec() -> FilterSpec {
        FilterSpec {
            filter_type: FilterType::Extended,
            measurement_space: MeasurementSpace::Polar,
            measurement_noise_std: vec![0.2, 0.01],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_spec_is_valid() {
        assert_eq!(FilterSpec::default().validate(), Ok(()));
        assert_eq!(polar_spec().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let bad_dt = FilterSpec { dt_sample: 0.0, ..Default::default() };
        assert_eq!(bad_dt.validate(), Err(ConfigError::NonPositiveSampleInterval(0.0)));

        let bad_dim = FilterSpec { dim_state: 6, ..Default::default() };
        assert!(matches!(bad_dim.validate(), Err(ConfigError::StateDimension { expected: 4, actual: 6, .. })));

        let bad_alpha = FilterSpec { alpha: 0.5, ..spec(FilterType::Fading) };
        assert_eq!(bad_alpha.validate(), Err(ConfigError::InvalidAlpha(0.5)));

        let polar_linear = FilterSpec { filter_type: FilterType::Linear, ..polar_spec() };
        assert!(matches!(
            polar_linear.validate(),
            Err(ConfigError::UnsupportedMeasurementSpace { filter: "linear", space: "polar" })
        ));

        let short_noise = FilterSpec { measurement_noise_std: vec![0.5], ..Default::default() };
        assert!(matches!(short_noise.validate(), Err(ConfigError::MeasurementDimension { .. })));
    }

    #[test]
    fn test_create_each_variant() {
        for ty in [FilterType::Linear, FilterType::Extended, FilterType::Fading] {
            let mut handle =
                FilterHandle::initial_from_position(&spec(ty), Vector2::new(10.0, 1.0), None).unwrap();
            assert_eq!(handle.filter_type(), ty);
            assert_eq!(handle.dim_state(), 4);
            assert_eq!(handle.dim_measurement(), 2);

            handle.predict_update(&DVector::from_row_slice(&[9.5, 1.0]), 1.0).unwrap();
            assert!(handle.position().x < 10.0);
        }
    }

    #[test]
    fn test_create_constant_acceleration() {
        let spec = FilterSpec {
            motion_model: MotionKind::ConstantAcceleration,
            dim_state: 6,
            ..Default::default()
        };
        let handle = FilterHandle::initial_from_position(
            &spec,
            Vector2::new(3.0, -2.0),
            Some(Vector2::new(1.0, 0.5)),
        )
        .unwrap();

        assert_eq!(handle.dim_state(), 6);
        assert_eq!(handle.position(), Vector2::new(3.0, -2.0));
        assert_eq!(handle.velocity(), Vector2::new(1.0, 0.5));
        assert_eq!(handle.acceleration(), Some(Vector2::zeros()));
    }

    #[test]
    fn test_create_rejects_dimension_mismatch() {
        let spec = FilterSpec { dim_state: 5, ..Default::default() };
        let err = FilterHandle::initial_from_position(&spec, Vector2::zeros(), None).unwrap_err();
        assert_eq!(err, FilterError::dimension("state", 4, 5));
    }

    #[test]
    fn test_handle_dispatch_matches_direct_filter() {
        let spec = spec(FilterType::Linear);
        let (x0, p0) = spec.initial_estimate(Vector2::new(5.0, 0.0), None);
        let mut handle = FilterHandle::create(&spec, x0.clone(), p0.clone()).unwrap();
        let mut direct = KalmanFilter::new(
            MotionKind::ConstantVelocity,
            1.0,
            spec.process_noise_std,
            spec.measurement_noise(),
            x0,
            p0,
        )
        .unwrap();

        let z = DVector::from_row_slice(&[4.6, 0.1]);
        assert_eq!(handle.predict_update(&z, 1.0).unwrap(), direct.predict_update(&z, 1.0).unwrap());
    }

    #[test]
    fn test_polar_handle_tracks_detection() {
        let spec = polar_spec();
        let point = DetectionPoint::at_position(0, 12.0, 3.0).unwrap();
        let mut handle =
            FilterHandle::initial_from_position(&spec, Vector2::new(11.5, 3.2), None).unwrap();

        let z = handle.measurement_of(&point);
        assert_eq!(z.len(), 2);
        for _ in 0..20 {
            handle.predict_update(&z, spec.dt_sample).unwrap();
        }

        assert_relative_eq!(handle.position().x, 12.0, epsilon = 0.1);
        assert_relative_eq!(handle.position().y, 3.0, epsilon = 0.1);
    }

    #[test]
    fn test_spec_from_json_uses_defaults() {
        let spec: FilterSpec =
            serde_json::from_str(r#"{"filter_type": "fading", "alpha": 1.05}"#).unwrap();
        assert_eq!(spec.filter_type, FilterType::Fading);
        assert_eq!(spec.alpha, 1.05);
        assert_eq!(spec.dim_state, 4);
        assert_eq!(spec.validate(), Ok(()));
    }
}
