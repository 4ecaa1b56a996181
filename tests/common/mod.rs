#![allow(dead_code)]

use deepc::{AffineDynamics, Bounds, DeePC, DeePCConfig, InitialWeights, TrajectoryLog, Variant};
use nalgebra::{DMatrix, DVector};

/// Twelve samples of `y⁺ = 0.5 y + u` from rest.
pub const RICH_INPUT: [f64; 12] = [0.5, -1.0, 0.8, 0.3, -0.6, 1.0, -0.2, 0.9, -0.8, 0.1, 0.7, -0.4];

pub const SHORT_INPUT: [f64; 8] = [1.0, -0.5, 0.8, 0.2, -1.0, 0.6, 0.3, -0.7];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn first_order() -> AffineDynamics<f64> {
    AffineDynamics::new(DMatrix::from_element(1, 1, 0.5), DMatrix::from_element(1, 1, 1.0), None).unwrap()
}

pub fn first_order_log(u: &[f64]) -> TrajectoryLog<f64> {
    first_order()
        .simulate(&DVector::zeros(1), &DMatrix::from_column_slice(u.len(), 1, u))
        .unwrap()
}

pub fn weights(q: f64, r: f64) -> InitialWeights<f64> {
    InitialWeights::new(DVector::from_element(1, q), DVector::from_element(1, r))
}

pub fn bounds(b: f64) -> Bounds<f64> {
    Bounds::symmetric(DVector::from_element(1, b))
}

/// Deterministic SISO controller on the twelve-sample log with `±100` bounds.
pub fn controller(tini: usize, n: usize, q: f64, r: f64) -> DeePC<f64> {
    controller_with(tini, n, q, r, Variant::deterministic())
}

pub fn controller_with(tini: usize, n: usize, q: f64, r: f64, variant: Variant) -> DeePC<f64> {
    let config = DeePCConfig::new(n, tini, 1, 1)
        .with_variant(variant)
        .with_input_bounds(bounds(100.0))
        .with_output_bounds(bounds(100.0));
    DeePC::new(first_order_log(&RICH_INPUT), config, weights(q, r)).unwrap()
}

pub fn row(v: &[f64]) -> DMatrix<f64> {
    DMatrix::from_row_slice(1, v.len(), v)
}
