use deepc::{
    AffineDynamics, AffinePlant, Bounds, DeePC, DeePCConfig, InitialWeights, LoopConfig, NeverStop, Variant,
    run_episode,
};
use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng, rngs::StdRng};

const NU: usize = 1;
const NY: usize = 2;
const NH: usize = 20;
const TINI: usize = 2;
const T: usize = 80;

fn main() {
    env_logger::init();
    let a = DMatrix::from_row_slice(NY, NY, &A);
    let b = DMatrix::from_row_slice(NY, NU, &B);
    let dynamics = AffineDynamics::new(a, b, None).expect("valid model");

    // Excite the plant with uniform noise to record the data log
    let mut rng = StdRng::seed_from_u64(42);
    let inputs = DMatrix::from_fn(T, NU, |_, _| rng.random_range(-1.0..1.0));
    let log = dynamics.simulate(&DVector::zeros(NY), &inputs).expect("log");

    // Measurements are noisy, so the initial-output window gets a slack
    let config = DeePCConfig::new(NH, TINI, NY, NU)
        .with_variant(Variant {
            stochastic_y: true,
            ..Variant::deterministic()
        })
        .with_input_bounds(Bounds::symmetric(DVector::from_element(NU, 2.0)))
        .with_output_bounds(Bounds::symmetric(DVector::from_element(NY, 10.0)));
    let weights = InitialWeights::new(DVector::from_vec(Q.to_vec()), DVector::from_vec(R.to_vec()));
    let mut controller = DeePC::new(log, config, weights).expect("controller");
    debug!("g has {} entries", controller.data().g_dim());

    let mut plant = AffinePlant::new(dynamics, DVector::zeros(NY), 60).with_noise(1e-3, 7);
    let reference = DVector::from_column_slice(&[1.0, 0.0]);
    let report = run_episode(&mut plant, &mut controller, &NeverStop, &LoopConfig::new(reference.clone(), NU))
        .expect("episode");

    for (k, u) in report.actions.iter().enumerate() {
        debug!("step {k:3}: u = {:+.4}", u[0]);
    }
    println!(
        "{:?} after {} steps, cost {:.4}, final tracking error {:.5}",
        report.state,
        report.steps,
        report.cost,
        (plant.state() - reference).norm()
    );
}

// Double integrator sampled at 10 Hz
#[rustfmt::skip]
const A: [f64; 4] = [
    1.0, 0.1,
    0.0, 1.0,
];

#[rustfmt::skip]
const B: [f64; 2] = [
    0.005,
    0.1,
];

const Q: [f64; NY] = [10.0, 1.0];

const R: [f64; NU] = [0.1];
