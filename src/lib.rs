//! Differentiable data-enabled predictive control.
//!
//! A [`DeePC`] controller predicts from block Hankel matrices of one recorded
//! trajectory, solves the resulting quadratic program with an ADMM backend
//! and differentiates the solution through its KKT conditions.

mod admm;
pub mod control_loop;
pub mod deepc;
pub mod dynamics;
pub mod error;
pub mod hankel;
pub mod layer;
pub mod params;
pub mod program;
pub mod qp;
pub mod rho_adapt;
pub mod sensitivity;
pub mod trainer;

pub use control_loop::{
    EpisodeReport, EpisodeState, LoopConfig, NeverStop, Plant, Policy, SensorFlags, SlidingWindow, Step,
    StopCondition, StopWhen, run_episode,
};
pub use deepc::{
    Cotangents, DeePC, DeePCConfig, ForwardInput, ForwardOutput, ForwardTangent, InputGradients, ParamDirection,
};
pub use dynamics::{AffineDynamics, AffinePlant};
pub use error::{DeepcError, DeepcResult};
pub use hankel::{DataMatrices, TrajectoryLog};
pub use params::{InitialWeights, ParamName, ParameterStore};
pub use program::{Bounds, Dims, Variant};
pub use qp::{QpProblem, QpSettings, QpSolution, QpSolver, SolveStatus};
pub use trainer::{Adam, AdamConfig, Trainer, TrainerConfig};
