mod common;

use approx::assert_relative_eq;
use common::*;
use deepc::{AdamConfig, DeepcError, ParamName, Trainer, TrainerConfig};
use nalgebra::{DMatrix, DVector};

fn trainer(q: f64, r: f64, lr: f64) -> Trainer<f64> {
    let mut config = TrainerConfig::new(4, DVector::from_element(1, 1.0), 1);
    config.adam = AdamConfig {
        lr,
        ..Default::default()
    };
    Trainer::new(controller(1, 3, q, r), first_order(), config).unwrap()
}

fn from_rest() -> DMatrix<f64> {
    DMatrix::zeros(1, 1)
}

#[test]
fn rollout_loss_matches_reference_values() {
    init_logger();
    assert_relative_eq!(trainer(1.0, 1.0, 0.01).evaluate(&from_rest()).unwrap(), 1.245677, epsilon = 1e-5);
    assert_relative_eq!(trainer(1.0, 0.5, 0.01).evaluate(&from_rest()).unwrap(), 1.34890, epsilon = 1e-4);
}

#[test]
fn backpropagation_through_time_matches_finite_differences() {
    for (q, r, dq, dr) in [(1.0, 1.0, 0.107246, -0.107246), (1.0, 0.5, 0.17976, -0.35951)] {
        let mut t = trainer(q, r, 0.01);
        let loss = t.gradients(&from_rest()).unwrap();
        assert_relative_eq!(loss, t.evaluate(&from_rest()).unwrap(), epsilon = 1e-9);

        let params = t.controller.parameters();
        assert_relative_eq!(params.grad(ParamName::Q).unwrap()[0], dq, epsilon = 1e-4);
        assert_relative_eq!(params.grad(ParamName::R).unwrap()[0], dr, epsilon = 1e-4);
    }
}

#[test]
fn batch_loss_is_the_mean_over_initial_outputs() {
    let t = trainer(1.0, 1.0, 0.01);
    let a = t.evaluate(&DMatrix::from_element(1, 1, 0.0)).unwrap();
    let b = t.evaluate(&DMatrix::from_element(1, 1, 0.5)).unwrap();
    let both = t.evaluate(&DMatrix::from_column_slice(2, 1, &[0.0, 0.5])).unwrap();
    assert_relative_eq!(both, 0.5 * (a + b), epsilon = 1e-9);
}

#[test]
fn a_training_step_reduces_the_loss() {
    let mut t = trainer(1.0, 1.0, 0.01);
    let before = t.step(&from_rest()).unwrap();
    assert_relative_eq!(before, 1.245677, epsilon = 1e-5);

    // the first Adam step moves each weight by the learning rate against its gradient
    let params = t.controller.parameters();
    assert_relative_eq!(params.scalar(ParamName::Q).unwrap(), 0.99, epsilon = 1e-6);
    assert_relative_eq!(params.scalar(ParamName::R).unwrap(), 1.01, epsilon = 1e-6);
    assert_eq!(params.grad(ParamName::Q).unwrap()[0], 0.0);

    let after = t.evaluate(&from_rest()).unwrap();
    assert!(after < before);
}

#[test]
fn fit_records_one_loss_per_epoch() {
    let mut t = trainer(1.0, 1.0, 0.02);
    let history = t.fit(&from_rest(), 5).unwrap();
    assert_eq!(history.len(), 5);
    assert!(history[4] < history[0]);
}

#[test]
fn parameters_stay_above_the_floor() {
    let mut t = trainer(1.0, 1.0, 5.0);
    t.config.min_value = 0.05;
    t.step(&from_rest()).unwrap();
    // q moves down by the learning rate and is clamped
    assert_eq!(t.controller.parameters().scalar(ParamName::Q), Some(0.05));
}

#[test]
fn dynamics_must_match_the_controller() {
    let dynamics = deepc::AffineDynamics::new(DMatrix::identity(2, 2), DMatrix::zeros(2, 1), None).unwrap();
    let config = TrainerConfig::new(4, DVector::from_element(1, 1.0), 1);
    assert!(matches!(
        Trainer::new(controller(1, 3, 1.0, 1.0), dynamics, config),
        Err(DeepcError::Configuration(_))
    ));

    let t = trainer(1.0, 1.0, 0.01);
    assert!(matches!(
        t.evaluate(&DMatrix::zeros(1, 2)),
        Err(DeepcError::ShapeMismatch { .. })
    ));
}
