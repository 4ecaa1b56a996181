//! Closed-loop training of the controller weights.
//!
//! A batch of episodes is rolled out against known affine dynamics. The
//! tracking loss is backpropagated through the dynamics, the sliding
//! input/output windows and every solve, then Adam updates the parameters.

use std::collections::BTreeMap;

use log::{debug, info};
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};

use crate::deepc::{Cotangents, DeePC, ForwardInput, ForwardOutput, over_horizon, row_matrix};
use crate::dynamics::AffineDynamics;
use crate::error::{DeepcError, DeepcResult};
use crate::params::{ParamName, ParameterStore};

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig<F> {
    pub lr: F,
    pub beta1: F,
    pub beta2: F,
    pub eps: F,
    pub weight_decay: F,
}

impl<F> Default for AdamConfig<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn default() -> Self {
        Self {
            lr: convert(1e-2),
            beta1: convert(0.9),
            beta2: convert(0.999),
            eps: convert(1e-8),
            weight_decay: convert(0.0),
        }
    }
}

#[derive(Debug, Clone)]
struct MomentBuf<F> {
    m: DVector<F>,
    v: DVector<F>,
}

/// Adam over a [`ParameterStore`], one moment buffer per parameter name.
#[derive(Debug, Clone)]
pub struct Adam<F> {
    pub config: AdamConfig<F>,
    t: i32,
    moments: BTreeMap<ParamName, MomentBuf<F>>,
}

impl<F> Adam<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(config: AdamConfig<F>) -> Self {
        Self {
            config,
            t: 0,
            moments: BTreeMap::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Applies the accumulated gradients. Gradients are left untouched.
    pub fn step(&mut self, params: &mut ParameterStore<F>) {
        let c = &self.config;
        let one: F = convert(1.0);
        self.t += 1;
        let bc1_inv = one / (one - c.beta1.powi(self.t));
        let bc2_inv = one / (one - c.beta2.powi(self.t));

        for (name, param) in params.iter_mut() {
            let len = param.value.len();
            let buf = self.moments.entry(name).or_insert_with(|| MomentBuf {
                m: DVector::zeros(len),
                v: DVector::zeros(len),
            });
            for i in 0..len {
                let g = param.grad[i];
                buf.m[i] = c.beta1 * buf.m[i] + (one - c.beta1) * g;
                buf.v[i] = c.beta2 * buf.v[i] + (one - c.beta2) * g * g;
                let m_hat = buf.m[i] * bc1_inv;
                let v_hat = buf.v[i] * bc2_inv;
                let cur = param.value[i];
                param.value[i] = cur - c.lr * (m_hat / (v_hat.sqrt() + c.eps) + c.weight_decay * cur);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig<F> {
    /// Closed-loop steps per episode
    pub time_steps: usize,
    /// Output reference (`p`)
    pub reference: DVector<F>,
    /// Input reference (`m`)
    pub input_reference: DVector<F>,
    /// Diagonal output weight of the training loss
    pub q: DVector<F>,
    /// Diagonal input weight of the training loss
    pub r: DVector<F>,
    pub adam: AdamConfig<F>,
    /// Lower clamp applied to every parameter after an update
    pub min_value: F,
}

impl<F> TrainerConfig<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Unit loss weights, zero input reference.
    pub fn new(time_steps: usize, reference: DVector<F>, m: usize) -> Self {
        let p = reference.len();
        Self {
            time_steps,
            reference,
            input_reference: DVector::zeros(m),
            q: DVector::from_element(p, convert(1.0)),
            r: DVector::from_element(m, convert(1.0)),
            adam: AdamConfig::default(),
            min_value: convert(1e-6),
        }
    }
}

/// Everything the backward pass needs from one step of the rollout.
struct RolloutStep<F> {
    output: ForwardOutput<F>,
    /// Outputs before the step, `batch × p`
    y: DMatrix<F>,
    /// Applied inputs, `batch × m`
    a: DMatrix<F>,
}

struct Rollout<F> {
    steps: Vec<RolloutStep<F>>,
    /// Outputs after the last step
    y_final: DMatrix<F>,
    loss: F,
}

/// Drops the oldest `width`-column block of every row and appends `block`.
fn shift_in<F: Scalar + Copy + SimdRealField + RealField>(window: &DMatrix<F>, block: &DMatrix<F>) -> DMatrix<F> {
    let width = block.ncols();
    let keep = window.ncols() - width;
    let mut out = DMatrix::zeros(window.nrows(), window.ncols());
    out.columns_mut(0, keep).copy_from(&window.columns(width, keep));
    out.columns_mut(keep, width).copy_from(block);
    out
}

/// Adjoint of [`shift_in`]: the window cotangent routed back to the older
/// window, plus the cotangent of the appended block.
fn unshift<F: Scalar + Copy + SimdRealField + RealField>(bar: &DMatrix<F>, width: usize) -> (DMatrix<F>, DMatrix<F>) {
    let keep = bar.ncols() - width;
    let mut older = DMatrix::zeros(bar.nrows(), bar.ncols());
    older.columns_mut(width, keep).copy_from(&bar.columns(0, keep));
    (older, bar.columns(keep, width).into_owned())
}

/// Trains a [`DeePC`] controller against known dynamics.
#[derive(Debug, Clone)]
pub struct Trainer<F> {
    pub controller: DeePC<F>,
    pub dynamics: AffineDynamics<F>,
    pub config: TrainerConfig<F>,
    adam: Adam<F>,
}

impl<F> Trainer<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(controller: DeePC<F>, dynamics: AffineDynamics<F>, config: TrainerConfig<F>) -> DeepcResult<Self> {
        let d = controller.dims();
        if dynamics.state_dim() != d.p || dynamics.input_dim() != d.m {
            return Err(DeepcError::Configuration(format!(
                "dynamics have {} states and {} inputs, controller expects {} outputs and {} inputs",
                dynamics.state_dim(),
                dynamics.input_dim(),
                d.p,
                d.m
            )));
        }
        if config.reference.len() != d.p || config.q.len() != d.p {
            return Err(DeepcError::Configuration(format!(
                "reference and q need {} entries, got {} and {}",
                d.p,
                config.reference.len(),
                config.q.len()
            )));
        }
        if config.input_reference.len() != d.m || config.r.len() != d.m {
            return Err(DeepcError::Configuration(format!(
                "input reference and r need {} entries, got {} and {}",
                d.m,
                config.input_reference.len(),
                config.r.len()
            )));
        }
        if config.time_steps == 0 {
            return Err(DeepcError::Configuration("time_steps must be positive".into()));
        }
        let adam = Adam::new(config.adam.clone());
        Ok(Self {
            controller,
            dynamics,
            config,
            adam,
        })
    }

    /// `Y Aᵀ + U Bᵀ + 1 cᵀ` for row-stacked outputs and inputs.
    fn propagate(&self, y: &DMatrix<F>, a: &DMatrix<F>) -> DMatrix<F> {
        let mut next = y * self.dynamics.a.transpose() + a * self.dynamics.b.transpose();
        if let Some(c) = &self.dynamics.c {
            for mut row in next.row_iter_mut() {
                row += c.transpose();
            }
        }
        next
    }

    fn stage_loss(&self, y_next: &DMatrix<F>, a: &DMatrix<F>) -> F {
        let cfg = &self.config;
        let mut loss: F = convert(0.0);
        for b in 0..y_next.nrows() {
            for (j, (&q, &r)) in cfg.q.iter().zip(cfg.reference.iter()).enumerate() {
                let e = y_next[(b, j)] - r;
                loss += q * e * e;
            }
            for (j, (&r, &u)) in cfg.r.iter().zip(cfg.input_reference.iter()).enumerate() {
                let e = a[(b, j)] - u;
                loss += r * e * e;
            }
        }
        loss / convert(y_next.nrows() as f64)
    }

    fn rollout(&self, y0: &DMatrix<F>) -> DeepcResult<Rollout<F>> {
        let d = self.controller.dims();
        if y0.ncols() != d.p || y0.nrows() == 0 {
            return Err(DeepcError::shape("initial outputs", (y0.nrows().max(1), d.p), y0.shape()));
        }
        let batch = y0.nrows();
        let reference = row_matrix(&over_horizon("ref", &self.config.reference, d.p, d.n)?);
        let input_reference = row_matrix(&over_horizon("u_ref", &self.config.input_reference, d.m, d.n)?);

        let mut u_win = DMatrix::zeros(batch, d.tini * d.m);
        let mut y_win = DMatrix::from_fn(batch, d.tini * d.p, |b, i| y0[(b, i % d.p)]);
        let mut y = y0.clone();
        let mut steps = Vec::with_capacity(self.config.time_steps);
        let mut loss: F = convert(0.0);

        for t in 0..self.config.time_steps {
            let input = ForwardInput::new(u_win.clone(), y_win.clone())
                .with_reference(reference.clone())
                .with_input_reference(input_reference.clone());
            let output = self.controller.forward(&input)?;
            let a = output.u.columns(0, d.m).into_owned();
            let y_next = self.propagate(&y, &a);
            loss += self.stage_loss(&y_next, &a);
            debug!("Rollout step {}: loss so far {}", t, loss);

            u_win = shift_in(&u_win, &a);
            y_win = shift_in(&y_win, &y);
            steps.push(RolloutStep { output, y, a });
            y = y_next;
        }

        Ok(Rollout { steps, y_final: y, loss })
    }

    /// Mean closed-loop loss over the batch of initial outputs (`batch × p`).
    pub fn evaluate(&self, y0: &DMatrix<F>) -> DeepcResult<F> {
        Ok(self.rollout(y0)?.loss)
    }

    /// Accumulates `∂loss/∂θ` into the controller's parameter store and returns the loss.
    pub fn gradients(&mut self, y0: &DMatrix<F>) -> DeepcResult<F> {
        let rollout = self.rollout(y0)?;
        let d = self.controller.dims();
        let cfg = &self.config;
        let batch = y0.nrows();
        let two_over_b: F = convert(2.0 / batch as f64);

        // adjoints of the state after step t and of the windows fed to step t
        let mut y_bar = DMatrix::zeros(batch, d.p);
        let mut u_win_bar = DMatrix::zeros(batch, d.tini * d.m);
        let mut y_win_bar = DMatrix::zeros(batch, d.tini * d.p);
        let mut y_next = rollout.y_final;

        for step in rollout.steps.iter().rev() {
            y_bar += DMatrix::from_fn(batch, d.p, |b, j| {
                two_over_b * cfg.q[j] * (y_next[(b, j)] - cfg.reference[j])
            });

            let (u_older, a_from_window) = unshift(&u_win_bar, d.m);
            let (y_older, y_from_window) = unshift(&y_win_bar, d.p);

            let a_bar = DMatrix::from_fn(batch, d.m, |b, j| {
                two_over_b * cfg.r[j] * (step.a[(b, j)] - cfg.input_reference[j])
            }) + &y_bar * &self.dynamics.b
                + a_from_window;
            let y_prev_bar = &y_bar * &self.dynamics.a + y_from_window;

            let mut u_cot = DMatrix::zeros(batch, d.n * d.m);
            u_cot.columns_mut(0, d.m).copy_from(&a_bar);
            let cotangents = Cotangents {
                u: Some(u_cot),
                ..Default::default()
            };
            let input_grads = self.controller.backward(&step.output, &cotangents)?;

            u_win_bar = u_older + input_grads.u_init;
            y_win_bar = y_older + input_grads.y_init;
            y_bar = y_prev_bar;
            y_next = step.y.clone();
        }

        Ok(rollout.loss)
    }

    /// One optimisation step; returns the loss before the update.
    pub fn step(&mut self, y0: &DMatrix<F>) -> DeepcResult<F> {
        self.controller.zero_grad();
        let loss = self.gradients(y0)?;
        self.adam.step(self.controller.parameters_mut());
        self.controller.parameters_mut().project(self.config.min_value);
        self.controller.zero_grad();
        Ok(loss)
    }

    /// Runs `epochs` steps and returns the loss of each.
    pub fn fit(&mut self, y0: &DMatrix<F>, epochs: usize) -> DeepcResult<Vec<F>> {
        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let loss = self.step(y0)?;
            let params = self.controller.parameters();
            info!(
                "Epoch {}: loss {}, q {:?}, r {:?}",
                epoch,
                loss,
                params.value(ParamName::Q).map(|v| v.as_slice().to_vec()),
                params.value(ParamName::R).map(|v| v.as_slice().to_vec())
            );
            history.push(loss);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::InitialWeights;
    use crate::program::Variant;
    use approx::assert_relative_eq;

    #[test]
    fn adam_minimises_a_quadratic() {
        let weights = InitialWeights::new(DVector::from_element(1, 3.0), DVector::from_element(1, 0.5));
        let mut store = ParameterStore::for_variant(Variant::deterministic(), 1, 1, &weights).unwrap();
        let mut adam = Adam::new(AdamConfig {
            lr: 0.05,
            ..Default::default()
        });

        // (q - 1)² + (r - 2)²
        for _ in 0..2000 {
            store.zero_grad();
            let q = store.scalar(ParamName::Q).unwrap();
            let r = store.scalar(ParamName::R).unwrap();
            store.accumulate(ParamName::Q, &DVector::from_element(1, 2.0 * (q - 1.0)));
            store.accumulate(ParamName::R, &DVector::from_element(1, 2.0 * (r - 2.0)));
            adam.step(&mut store);
        }
        assert_eq!(adam.steps(), 2000);
        assert_relative_eq!(store.scalar(ParamName::Q).unwrap(), 1.0, epsilon = 1e-2);
        assert_relative_eq!(store.scalar(ParamName::R).unwrap(), 2.0, epsilon = 1e-2);
    }

    #[test]
    fn first_adam_step_moves_by_the_learning_rate() {
        let weights = InitialWeights::new(DVector::from_element(1, 1.0), DVector::from_element(1, 1.0));
        let mut store = ParameterStore::for_variant(Variant::deterministic(), 1, 1, &weights).unwrap();
        store.accumulate(ParamName::Q, &DVector::from_element(1, 4.0));
        store.accumulate(ParamName::R, &DVector::from_element(1, -0.1));
        Adam::new(AdamConfig { lr: 0.1, ..Default::default() }).step(&mut store);

        assert_relative_eq!(store.scalar(ParamName::Q).unwrap(), 0.9, epsilon = 1e-6);
        assert_relative_eq!(store.scalar(ParamName::R).unwrap(), 1.1, epsilon = 1e-6);
    }

    #[test]
    fn window_shift_and_its_adjoint_agree() {
        let w = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        let shifted = shift_in(&w, &DMatrix::from_element(1, 1, 4.0));
        assert_eq!(shifted.as_slice(), &[2.0, 3.0, 4.0]);

        // <shift(w, a), v> = <w, older> + <a, appended>
        let v = DMatrix::from_row_slice(1, 3, &[0.5, -1.0, 2.0]);
        let (older, appended) = unshift(&v, 1);
        assert_eq!(older.as_slice(), &[0.0, 0.5, -1.0]);
        assert_eq!(appended.as_slice(), &[2.0]);
        assert_relative_eq!(shifted.dot(&v), w.dot(&older) + 4.0 * appended[0]);
    }
}
