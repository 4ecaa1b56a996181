use deepc::{AdamConfig, AffineDynamics, DeePC, DeePCConfig, InitialWeights, Trainer, TrainerConfig, Variant};
use nalgebra::{DMatrix, DVector};

const EPOCHS: usize = 20;

fn main() {
    env_logger::init();
    let dynamics = AffineDynamics::new(DMatrix::from_element(1, 1, 0.5), DMatrix::from_element(1, 1, 1.0), None)
        .expect("valid model");
    let inputs = DMatrix::from_column_slice(U.len(), 1, &U);
    let log = dynamics.simulate(&DVector::zeros(1), &inputs).expect("log");

    let config = DeePCConfig::new(3, 1, 1, 1).with_variant(Variant {
        stochastic_y: true,
        ..Variant::deterministic()
    });
    let weights = InitialWeights::new(DVector::from_element(1, 1.0), DVector::from_element(1, 1.0)).with_lam_y(50.0);
    let controller = DeePC::new(log, config, weights).expect("controller");

    let mut trainer_config = TrainerConfig::new(10, DVector::from_element(1, 1.0), 1);
    trainer_config.r = DVector::from_element(1, 0.1);
    trainer_config.adam = AdamConfig {
        lr: 0.05,
        ..Default::default()
    };
    let mut trainer = Trainer::new(controller, dynamics, trainer_config).expect("trainer");

    let y0 = DMatrix::from_column_slice(3, 1, &[0.0, 0.5, -0.5]);
    let history = trainer.fit(&y0, EPOCHS).expect("training");

    for (name, param) in trainer.controller.parameters().iter() {
        println!("{name} = {:?}", param.value.as_slice());
    }
    println!(
        "loss {:.5} -> {:.5} over {EPOCHS} epochs",
        history.first().copied().unwrap_or_default(),
        history.last().copied().unwrap_or_default()
    );
}

#[rustfmt::skip]
const U: [f64; 12] = [
    0.5, -1.0, 0.8, 0.3, -0.6, 1.0,
    -0.2, 0.9, -0.8, 0.1, 0.7, -0.4,
];
