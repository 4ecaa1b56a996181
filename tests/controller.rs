mod common;

use approx::assert_relative_eq;
use common::*;
use deepc::{
    DeePC, DeePCConfig, DeepcError, ForwardInput, InitialWeights, ParamName, SolveStatus, TrajectoryLog, Variant,
};
use nalgebra::{DMatrix, DVector};

fn zero_window() -> ForwardInput<f64> {
    ForwardInput::single(&DVector::zeros(1), &DVector::zeros(1))
}

#[test]
fn reaches_terminal_reference_from_rest() {
    init_logger();
    let ctrl = controller(1, 2, 1.0, 1.0);
    let out = ctrl.forward(&zero_window().with_reference(row(&[1.0, 1.0]))).unwrap();

    // y₀ is fixed by the window, the terminal constraint forces u₀ = 1
    assert_relative_eq!(out.u, row(&[1.0, 0.0]), epsilon = 1e-6);
    assert_relative_eq!(out.y, row(&[0.0, 1.0]), epsilon = 1e-6);
    assert!(out.sig_y.is_none() && out.sig_u.is_none());
    assert_eq!(out.outputs().len(), 3);
}

#[test]
fn predictions_are_consistent_with_the_data() {
    let ctrl = controller(1, 3, 1.0, 1.0);
    let input = ForwardInput::single(&DVector::from_element(1, 0.3), &DVector::from_element(1, -0.2))
        .with_reference(row(&[1.0, 1.0, 1.0]));
    let out = ctrl.forward(&input).unwrap();

    let g = out.g.row(0).transpose();
    let data = ctrl.data();
    assert_relative_eq!(&data.uf * &g, out.u.row(0).transpose(), epsilon = 1e-6);
    assert_relative_eq!(&data.yf * &g, out.y.row(0).transpose(), epsilon = 1e-6);
    assert_relative_eq!((&data.up * &g)[0], 0.3, epsilon = 1e-6);
    assert_relative_eq!((&data.yp * &g)[0], -0.2, epsilon = 1e-6);
    assert_relative_eq!(out.y[(0, 2)], 1.0, epsilon = 1e-6);

    // the model is exact: y₀ = 0.5·y_ini + u_ini, y_{k+1} = 0.5·y_k + u_k
    assert_relative_eq!(out.y[(0, 0)], 0.5 * -0.2 + 0.3, epsilon = 1e-6);
    for k in 0..2 {
        assert_relative_eq!(out.y[(0, k + 1)], 0.5 * out.y[(0, k)] + out.u[(0, k)], epsilon = 1e-6);
    }
}

#[test]
fn optimal_input_matches_closed_form() {
    // u₀ = (2q + r) / (2q + 2.5r) with zero windows and a unit reference
    let ctrl = controller(1, 3, 1.0, 1.0);
    let out = ctrl.forward(&zero_window().with_reference(row(&[1.0; 3]))).unwrap();
    assert_relative_eq!(out.u[(0, 0)], 2.0 / 3.0, epsilon = 1e-6);
    assert_relative_eq!(out.u[(0, 1)], 2.0 / 3.0, epsilon = 1e-6);
    assert_relative_eq!(out.u[(0, 2)], 0.0, epsilon = 1e-6);
}

#[test]
fn zero_reference_from_rest_stays_at_rest() {
    let config = DeePCConfig::new(2, 1, 1, 1)
        .with_input_bounds(bounds(10.0))
        .with_output_bounds(bounds(10.0));
    let ctrl = DeePC::new(first_order_log(&SHORT_INPUT), config, weights(1.0, 1.0)).unwrap();
    assert_eq!(ctrl.data().g_dim(), 8 - 1 - 2 + 1);

    let out = ctrl.forward(&zero_window()).unwrap();
    assert_relative_eq!(out.u, DMatrix::zeros(1, 2), epsilon = 1e-6);
    assert_relative_eq!(out.y, DMatrix::zeros(1, 2), epsilon = 1e-6);
}

#[test]
fn repeated_forward_calls_are_identical() {
    let ctrl = controller(1, 3, 1.0, 1.0);
    let input = zero_window().with_reference(row(&[0.5; 3]));
    let a = ctrl.forward(&input).unwrap();
    let b = ctrl.forward(&input).unwrap();
    assert_eq!(a.u, b.u);
    assert_eq!(a.y, b.y);
    assert_eq!(a.g, b.g);
}

#[test]
fn batch_matches_individual_solves() {
    let ctrl = controller(1, 3, 1.0, 1.0);
    let y_inits = [0.0, 0.4, -0.7];
    let batched = ctrl
        .forward(
            &ForwardInput::new(DMatrix::zeros(1, 1), DMatrix::from_column_slice(3, 1, &y_inits))
                .with_reference(row(&[1.0; 3])),
        )
        .unwrap();
    assert_eq!(batched.u.nrows(), 3);

    for (b, y_ini) in y_inits.iter().enumerate() {
        let single = ctrl
            .forward(
                &ForwardInput::single(&DVector::zeros(1), &DVector::from_element(1, *y_ini))
                    .with_reference(row(&[1.0; 3])),
            )
            .unwrap();
        assert_relative_eq!(batched.u.row(b).transpose(), single.u.row(0).transpose(), epsilon = 1e-9);
        assert_relative_eq!(batched.y.row(b).transpose(), single.y.row(0).transpose(), epsilon = 1e-9);
    }
}

#[test]
fn infeasible_reference_fails_the_solve() {
    let config = DeePCConfig::new(2, 1, 1, 1)
        .with_input_bounds(bounds(1.0))
        .with_output_bounds(bounds(100.0));
    let ctrl = DeePC::new(first_order_log(&RICH_INPUT), config, weights(1.0, 1.0)).unwrap();

    let err = ctrl.forward(&zero_window().with_reference(row(&[5.0, 5.0]))).unwrap_err();
    assert_eq!(
        err,
        DeepcError::SolveFailed {
            scenario: 0,
            status: SolveStatus::PrimalInfeasible
        }
    );
    assert!(err.is_solve_failure());
}

#[test]
fn batch_failure_names_the_scenario() {
    let config = DeePCConfig::new(2, 1, 1, 1)
        .with_input_bounds(bounds(1.0))
        .with_output_bounds(bounds(100.0));
    let ctrl = DeePC::new(first_order_log(&RICH_INPUT), config, weights(1.0, 1.0)).unwrap();

    let reference = DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 5.0, 5.0]);
    let err = ctrl.forward(&zero_window().with_reference(reference)).unwrap_err();
    assert!(matches!(err, DeepcError::SolveFailed { scenario: 1, .. }));
}

#[test]
fn alternating_log_is_rejected() {
    let u = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
    let log = first_order_log(&u);
    let err = DeePC::new(log, DeePCConfig::new(2, 1, 1, 1), weights(1.0, 1.0)).unwrap_err();
    assert_eq!(err, DeepcError::NotPersistentlyExciting { rank: 2, required: 4 });
}

#[test]
fn log_dimensions_must_match_configuration() {
    let log = TrajectoryLog::new(DMatrix::zeros(12, 2), DMatrix::zeros(12, 1)).unwrap();
    assert!(matches!(
        DeePC::new(log, DeePCConfig::new(2, 1, 1, 1), weights(1.0, 1.0)),
        Err(DeepcError::Configuration(_))
    ));
}

#[test]
fn wrong_window_length_is_a_shape_error() {
    let ctrl = controller(1, 2, 1.0, 1.0);
    let input = ForwardInput::single(&DVector::zeros(2), &DVector::zeros(1));
    assert!(matches!(
        ctrl.forward(&input),
        Err(DeepcError::ShapeMismatch { name: "u_ini", .. })
    ));

    let input = zero_window().with_reference(row(&[1.0, 1.0, 1.0]));
    assert!(matches!(ctrl.forward(&input), Err(DeepcError::ShapeMismatch { name: "ref", .. })));
}

#[test]
fn negative_weights_are_rejected() {
    let mut ctrl = controller(1, 2, 1.0, 1.0);
    let err = ctrl
        .parameters_mut()
        .set(ParamName::Q, DVector::from_element(1, -1.0))
        .unwrap_err();
    assert!(matches!(err, DeepcError::InvalidParameter { name: "q", .. }));

    let config = DeePCConfig::new(2, 1, 1, 1);
    let negative = InitialWeights::new(DVector::from_element(1, 1.0), DVector::from_element(1, -0.1));
    assert!(matches!(
        DeePC::new(first_order_log(&RICH_INPUT), config, negative),
        Err(DeepcError::InvalidParameter { name: "r", .. })
    ));
}

#[test]
fn stochastic_slacks_vanish_on_noiseless_data() {
    let variant = Variant {
        stochastic_y: true,
        stochastic_u: true,
        nonlinear: false,
    };
    let ctrl = controller_with(1, 3, 1.0, 1.0, variant);
    assert!(ctrl.parameters().contains(ParamName::LamY));
    assert!(ctrl.parameters().contains(ParamName::LamU));

    let input = ForwardInput::single(&DVector::from_element(1, 0.3), &DVector::from_element(1, -0.2))
        .with_reference(row(&[1.0; 3]));
    let out = ctrl.forward(&input).unwrap();
    assert_eq!(out.outputs().len(), 5);
    assert_relative_eq!(out.sig_y.unwrap(), DMatrix::zeros(1, 1), epsilon = 1e-5);
    assert_relative_eq!(out.sig_u.unwrap(), DMatrix::zeros(1, 1), epsilon = 1e-5);
}

#[test]
fn nonlinear_projector_is_an_orthogonal_projection() {
    let variant = Variant {
        nonlinear: true,
        ..Variant::deterministic()
    };
    let ctrl = controller_with(1, 3, 1.0, 1.0, variant);
    let (identity, pi) = ctrl.residual_projector().unwrap();
    let g = ctrl.data().g_dim();

    assert_eq!(identity, DMatrix::identity(g, g));
    assert_relative_eq!(&pi * &pi, pi.clone(), epsilon = 1e-9);
    assert_relative_eq!(pi.transpose(), pi.clone(), epsilon = 1e-12);
    // the stacked data rows are left untouched
    let h = ctrl.data().stacked_past_and_future_inputs();
    assert_relative_eq!(&h * &pi, h, epsilon = 1e-9);
}

#[test]
fn nonlinear_variant_solves_and_keeps_the_window() {
    let variant = Variant {
        nonlinear: true,
        ..Variant::deterministic()
    };
    let mut ctrl = controller_with(1, 3, 1.0, 1.0, variant);
    ctrl.initialise(None, None, Some(1.0), Some(0.01)).unwrap();
    assert_eq!(ctrl.parameters().scalar(ParamName::LamG1), Some(1.0));
    assert_eq!(ctrl.parameters().scalar(ParamName::LamG2), Some(0.01));

    let input = ForwardInput::single(&DVector::from_element(1, 0.3), &DVector::from_element(1, -0.2))
        .with_reference(row(&[1.0; 3]));
    let out = ctrl.forward(&input).unwrap();
    let g = out.g.row(0).transpose();
    assert_relative_eq!((&ctrl.data().up * &g)[0], 0.3, epsilon = 1e-5);
    assert_relative_eq!((&ctrl.data().yp * &g)[0], -0.2, epsilon = 1e-5);
    assert_relative_eq!(out.y[(0, 2)], 1.0, epsilon = 1e-5);
}

#[test]
fn initialise_ignores_inactive_regularisers() {
    let mut ctrl = controller(1, 2, 1.0, 1.0);
    ctrl.initialise(Some(5.0), Some(5.0), Some(5.0), Some(5.0)).unwrap();
    assert_eq!(ctrl.parameters().names(), vec![ParamName::Q, ParamName::R]);
}
