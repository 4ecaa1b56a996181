use log::debug;
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::control_loop::{Plant, Step};
use crate::error::{DeepcError, DeepcResult};
use crate::hankel::TrajectoryLog;

/// `x⁺ = A x + B u + c` with the full state as output.
#[derive(Debug, Clone)]
pub struct AffineDynamics<F> {
    pub a: DMatrix<F>,         // n * n
    pub b: DMatrix<F>,         // n * m
    pub c: Option<DVector<F>>, // n
}

impl<F> AffineDynamics<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(a: DMatrix<F>, b: DMatrix<F>, c: Option<DVector<F>>) -> DeepcResult<Self> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(DeepcError::shape("A", (n, n), a.shape()));
        }
        if b.nrows() != n {
            return Err(DeepcError::shape("B", (n, b.ncols()), b.shape()));
        }
        if let Some(c) = &c {
            if c.len() != n {
                return Err(DeepcError::shape("c", (n, 1), (c.len(), 1)));
            }
        }
        Ok(Self { a, b, c })
    }

    pub fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn input_dim(&self) -> usize {
        self.b.ncols()
    }

    pub fn next(&self, x: &DVector<F>, u: &DVector<F>) -> DVector<F> {
        let mut next = &self.a * x + &self.b * u;
        if let Some(c) = &self.c {
            next += c;
        }
        next
    }

    /// Rolls the model out from `x0` under `inputs` (`T × m`), logging each
    /// input next to the state it was applied in.
    pub fn simulate(&self, x0: &DVector<F>, inputs: &DMatrix<F>) -> DeepcResult<TrajectoryLog<F>> {
        if x0.len() != self.state_dim() {
            return Err(DeepcError::shape("x0", (self.state_dim(), 1), (x0.len(), 1)));
        }
        if inputs.ncols() != self.input_dim() {
            return Err(DeepcError::shape("inputs", (inputs.nrows(), self.input_dim()), inputs.shape()));
        }

        let mut y = DMatrix::zeros(inputs.nrows(), self.state_dim());
        let mut x = x0.clone();
        for (t, u) in inputs.row_iter().enumerate() {
            y.row_mut(t).copy_from(&x.transpose());
            x = self.next(&x, &u.transpose());
        }
        TrajectoryLog::new(inputs.clone(), y)
    }
}

/// [`AffineDynamics`] driven as a plant, with optional zero-mean uniform
/// observation noise of standard deviation `noise_std`.
#[derive(Debug, Clone)]
pub struct AffinePlant<F> {
    pub dynamics: AffineDynamics<F>,
    pub x0: DVector<F>,
    /// Episode length; the plant reports `done` after this many steps
    pub horizon: usize,
    pub noise_std: F,
    state: DVector<F>,
    steps: usize,
    rng: StdRng,
}

impl<F> AffinePlant<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(dynamics: AffineDynamics<F>, x0: DVector<F>, horizon: usize) -> Self {
        Self {
            dynamics,
            state: x0.clone(),
            x0,
            horizon,
            noise_std: convert(0.0),
            steps: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn with_noise(mut self, noise_std: F, seed: u64) -> Self {
        self.noise_std = noise_std;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> &DVector<F> {
        &self.state
    }

    fn observe(&mut self) -> DVector<F> {
        if self.noise_std <= convert(0.0) {
            return self.state.clone();
        }
        // uniform on [-√3σ, √3σ] has standard deviation σ
        let half_width = self.noise_std * convert(3.0f64.sqrt());
        let rng = &mut self.rng;
        self.state
            .map(|x| x + half_width * convert::<f64, F>(rng.random_range(-1.0..1.0)))
    }
}

impl<F> Plant<F> for AffinePlant<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn reset(&mut self) -> DVector<F> {
        self.state = self.x0.clone();
        self.steps = 0;
        self.observe()
    }

    fn step(&mut self, action: &DVector<F>) -> Step<F> {
        self.state = self.dynamics.next(&self.state, action);
        self.steps += 1;
        let done = self.steps >= self.horizon;
        if done {
            debug!("Plant finished after {} steps", self.steps);
        }
        Step {
            observation: self.observe(),
            reward: -self.state.norm_squared(),
            done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn first_order() -> AffineDynamics<f64> {
        AffineDynamics::new(
            DMatrix::from_element(1, 1, 0.5),
            DMatrix::from_element(1, 1, 1.0),
            None,
        )
        .unwrap()
    }

    #[test]
    fn affine_offset_is_applied() {
        let dynamics = AffineDynamics::new(
            DMatrix::identity(2, 2),
            DMatrix::from_column_slice(2, 1, &[1.0, 0.0]),
            Some(DVector::from_column_slice(&[0.0, -1.0])),
        )
        .unwrap();
        let x = dynamics.next(&DVector::from_column_slice(&[1.0, 1.0]), &DVector::from_element(1, 2.0));
        assert_eq!(x.as_slice(), &[3.0, 0.0]);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        assert!(AffineDynamics::new(DMatrix::<f64>::zeros(2, 3), DMatrix::zeros(2, 1), None).is_err());
        assert!(AffineDynamics::new(DMatrix::<f64>::zeros(2, 2), DMatrix::zeros(3, 1), None).is_err());
        assert!(
            AffineDynamics::new(DMatrix::<f64>::zeros(2, 2), DMatrix::zeros(2, 1), Some(DVector::zeros(1))).is_err()
        );
    }

    #[test]
    fn simulate_pairs_inputs_with_pre_step_outputs() {
        let u = DMatrix::from_column_slice(3, 1, &[1.0, 0.0, 2.0]);
        let log = first_order().simulate(&DVector::zeros(1), &u).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.y.as_slice(), &[0.0, 1.0, 0.5]);
    }

    #[test]
    fn plant_reports_done_after_horizon() {
        let mut plant = AffinePlant::new(first_order(), DVector::from_element(1, 2.0), 2);
        assert_eq!(plant.reset()[0], 2.0);
        let step = plant.step(&DVector::zeros(1));
        assert!(!step.done);
        assert_relative_eq!(step.observation[0], 1.0);
        assert!(plant.step(&DVector::zeros(1)).done);

        // reset starts over
        assert_eq!(plant.reset()[0], 2.0);
    }

    #[test]
    fn observation_noise_is_seeded_and_bounded() {
        let noisy = |seed| AffinePlant::new(first_order(), DVector::zeros(1), 10).with_noise(0.1, seed);
        let mut a = noisy(3);
        let mut b = noisy(3);
        let obs_a = a.reset();
        assert_eq!(obs_a, b.reset());
        assert!(obs_a[0].abs() <= 0.1 * 3.0f64.sqrt());
        // the true state stays noise free
        assert_eq!(a.state()[0], 0.0);
    }
}
