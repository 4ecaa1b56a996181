//! Receding-horizon episode runner.
//!
//! Each step either applies a fixed stop action (when the stop condition
//! holds) or solves for a fresh plan and applies its first input. A failed
//! solve aborts the episode without applying anything.

use log::{debug, info, warn};
use nalgebra::{DVector, RealField, Scalar, SimdRealField, convert};

use crate::deepc::{DeePC, ForwardInput, over_horizon, row_matrix};
use crate::error::{DeepcError, DeepcResult};
use crate::params::ParamName;

/// Result of advancing a plant by one action.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<F> {
    pub observation: DVector<F>,
    pub reward: F,
    pub done: bool,
}

/// The system under control. Observations start with the `p` measured
/// outputs; any further entries are free for sensor flags.
pub trait Plant<F> {
    fn reset(&mut self) -> DVector<F>;
    fn step(&mut self, action: &DVector<F>) -> Step<F>;
}

/// Anything that maps the recent input/output windows to the next action.
pub trait Policy<F> {
    fn tini(&self) -> usize;
    fn input_dim(&self) -> usize;
    fn output_dim(&self) -> usize;

    /// Diagonal output and input weights used to score the episode.
    fn stage_weights(&self) -> (DVector<F>, DVector<F>);

    /// First input of the plan for the given windows (`Tini·m` and `Tini·p` entries).
    fn act(
        &mut self,
        u_past: &DVector<F>,
        y_past: &DVector<F>,
        reference: &DVector<F>,
        input_reference: &DVector<F>,
    ) -> DeepcResult<DVector<F>>;
}

impl<F> Policy<F> for DeePC<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn tini(&self) -> usize {
        self.dims().tini
    }

    fn input_dim(&self) -> usize {
        self.dims().m
    }

    fn output_dim(&self) -> usize {
        self.dims().p
    }

    fn stage_weights(&self) -> (DVector<F>, DVector<F>) {
        let d = self.dims();
        let q = self.parameters().value(ParamName::Q).cloned();
        let r = self.parameters().value(ParamName::R).cloned();
        (
            q.unwrap_or_else(|| DVector::from_element(d.p, convert(1.0))),
            r.unwrap_or_else(|| DVector::from_element(d.m, convert(1.0))),
        )
    }

    fn act(
        &mut self,
        u_past: &DVector<F>,
        y_past: &DVector<F>,
        reference: &DVector<F>,
        input_reference: &DVector<F>,
    ) -> DeepcResult<DVector<F>> {
        let d = self.dims();
        let reference = over_horizon("ref", reference, d.p, d.n)?;
        let input_reference = over_horizon("u_ref", input_reference, d.m, d.n)?;
        let input = ForwardInput::single(u_past, y_past)
            .with_reference(row_matrix(&reference))
            .with_input_reference(row_matrix(&input_reference));

        let out = self.forward(&input)?;
        Ok(DVector::from_fn(d.m, |i, _| out.u[(0, i)]))
    }
}

/// Decides from the latest observation whether the stop action is applied instead of a solve.
pub trait StopCondition<F> {
    fn should_stop(&self, observation: &DVector<F>) -> bool;
}

/// Holds when every listed observation entry is non-zero, e.g. ground contact sensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFlags {
    pub indices: Vec<usize>,
}

impl SensorFlags {
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices }
    }
}

impl<F> StopCondition<F> for SensorFlags
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn should_stop(&self, observation: &DVector<F>) -> bool {
        !self.indices.is_empty()
            && self
                .indices
                .iter()
                .all(|&i| observation.get(i).is_some_and(|v| *v != convert(0.0)))
    }
}

/// Wraps a closure as a stop condition.
pub struct StopWhen<C>(pub C);

impl<F, C> StopCondition<F> for StopWhen<C>
where
    C: Fn(&DVector<F>) -> bool,
{
    fn should_stop(&self, observation: &DVector<F>) -> bool {
        (self.0)(observation)
    }
}

/// Never stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl<F> StopCondition<F> for NeverStop {
    fn should_stop(&self, _observation: &DVector<F>) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    Running,
    /// The stop condition held at the last step and the stop action was applied
    Stopped,
    /// A solve failed; nothing was applied for that step
    Aborted,
}

#[derive(Debug, Clone)]
pub struct LoopConfig<F> {
    /// Output reference, per step (`p`) or over the horizon (`N·p`)
    pub reference: DVector<F>,
    /// Input reference, per step (`m`) or over the horizon (`N·m`)
    pub input_reference: DVector<F>,
    pub stop_action: DVector<F>,
    pub max_steps: Option<usize>,
}

impl<F> LoopConfig<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Zero input reference and a zero stop action.
    pub fn new(reference: DVector<F>, m: usize) -> Self {
        Self {
            reference,
            input_reference: DVector::zeros(m),
            stop_action: DVector::zeros(m),
            max_steps: None,
        }
    }

    pub fn with_input_reference(mut self, input_reference: DVector<F>) -> Self {
        self.input_reference = input_reference;
        self
    }

    pub fn with_stop_action(mut self, stop_action: DVector<F>) -> Self {
        self.stop_action = stop_action;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// The last `len / width` blocks of a signal, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindow<F> {
    data: DVector<F>,
    width: usize,
}

impl<F> SlidingWindow<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(data: DVector<F>, width: usize) -> Self {
        Self { data, width }
    }

    /// `blocks` copies of `block`.
    pub fn filled(block: &DVector<F>, blocks: usize) -> Self {
        let width = block.len();
        Self {
            data: DVector::from_fn(width * blocks, |i, _| block[i % width]),
            width,
        }
    }

    /// Drops the oldest block and appends `block`.
    pub fn push(&mut self, block: &DVector<F>) {
        let len = self.data.len();
        if len == 0 {
            return;
        }
        let keep = len - self.width;
        let tail = self.data.rows(self.width, keep).into_owned();
        self.data.rows_mut(0, keep).copy_from(&tail);
        self.data.rows_mut(keep, self.width).copy_from(block);
    }

    pub fn as_vector(&self) -> &DVector<F> {
        &self.data
    }
}

#[derive(Debug, Clone)]
pub struct EpisodeReport<F> {
    pub state: EpisodeState,
    pub steps: usize,
    pub cost: F,
    pub actions: Vec<DVector<F>>,
    pub final_observation: DVector<F>,
    /// Number of times the policy was asked for an action
    pub solves: usize,
    /// Number of steps that applied the stop action
    pub stops: usize,
    /// The solve failure that aborted the episode
    pub error: Option<DeepcError>,
}

/// Runs one episode until the plant is done, a solve fails or the step budget runs out.
///
/// Solve failures end the episode in [`EpisodeState::Aborted`]; any other
/// error from the policy is returned.
pub fn run_episode<F, P, C, S>(plant: &mut P, policy: &mut C, stop: &S, config: &LoopConfig<F>) -> DeepcResult<EpisodeReport<F>>
where
    F: Scalar + Copy + SimdRealField + RealField,
    P: Plant<F>,
    C: Policy<F>,
    S: StopCondition<F>,
{
    let (tini, m, p) = (policy.tini(), policy.input_dim(), policy.output_dim());
    if config.stop_action.len() != m {
        return Err(DeepcError::Configuration(format!(
            "stop action has {} entries for {m} inputs",
            config.stop_action.len()
        )));
    }
    if config.reference.len() < p || config.input_reference.len() < m {
        return Err(DeepcError::Configuration("references are shorter than one step".into()));
    }
    let (q, r) = policy.stage_weights();
    let q_sqrt = q.map(|v| v.sqrt());
    let r_sqrt = r.map(|v| v.sqrt());
    let ref_step = config.reference.rows(0, p).into_owned();
    let uref_step = config.input_reference.rows(0, m).into_owned();

    let mut obs = plant.reset();
    if obs.len() < p {
        return Err(DeepcError::Configuration(format!(
            "observation has {} entries, expected at least {p}",
            obs.len()
        )));
    }

    let mut u_past = SlidingWindow::new(DVector::zeros(tini * m), m);
    let mut y_past = SlidingWindow::filled(&obs.rows(0, p).into_owned(), tini);

    let mut report = EpisodeReport {
        state: EpisodeState::Running,
        steps: 0,
        cost: convert(0.0),
        actions: Vec::new(),
        final_observation: obs.clone(),
        solves: 0,
        stops: 0,
        error: None,
    };

    loop {
        if config.max_steps.is_some_and(|max| report.steps >= max) {
            debug!("Step budget of {} reached", report.steps);
            break;
        }

        // re-checked every step; control resumes once the condition clears
        let action = if stop.should_stop(&obs) {
            report.state = EpisodeState::Stopped;
            report.stops += 1;
            config.stop_action.clone()
        } else {
            report.state = EpisodeState::Running;
            report.solves += 1;
            match policy.act(u_past.as_vector(), y_past.as_vector(), &config.reference, &config.input_reference) {
                Ok(action) => action,
                Err(e) if e.is_solve_failure() => {
                    warn!("Episode aborted at step {}: {}", report.steps, e);
                    report.state = EpisodeState::Aborted;
                    report.error = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        };
        if action.len() != m {
            return Err(DeepcError::shape("action", (m, 1), (action.len(), 1)));
        }

        u_past.push(&action);
        y_past.push(&obs.rows(0, p).into_owned());

        let step = plant.step(&action);
        obs = step.observation;
        let y = obs.rows(0, p).into_owned();
        report.cost += (&y - &ref_step).component_mul(&q_sqrt).norm() + (&action - &uref_step).component_mul(&r_sqrt).norm();
        report.actions.push(action);
        report.steps += 1;

        if step.done {
            break;
        }
    }

    report.final_observation = obs;
    info!(
        "Episode finished: {:?} after {} steps, cost {}",
        report.state, report.steps, report.cost
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_oldest_block() {
        let mut w = SlidingWindow::new(DVector::from_column_slice(&[1.0, 2.0, 3.0, 4.0]), 2);
        w.push(&DVector::from_column_slice(&[5.0, 6.0]));
        assert_eq!(w.as_vector().as_slice(), &[3.0, 4.0, 5.0, 6.0]);

        let mut single = SlidingWindow::filled(&DVector::from_element(1, 7.0), 1);
        single.push(&DVector::from_element(1, 8.0));
        assert_eq!(single.as_vector().as_slice(), &[8.0]);
    }

    #[test]
    fn sensor_flags_need_every_flag() {
        let flags = SensorFlags::new(vec![1, 2]);
        let obs = |v: &[f64]| DVector::from_column_slice(v);
        assert!(flags.should_stop(&obs(&[0.3, 1.0, 1.0])));
        assert!(!flags.should_stop(&obs(&[0.3, 1.0, 0.0])));
        // missing entries never count as set
        assert!(!flags.should_stop(&obs(&[0.3, 1.0])));
        assert!(!SensorFlags::new(vec![]).should_stop(&obs(&[1.0])));
    }

    #[test]
    fn closures_act_as_stop_conditions() {
        let stop = StopWhen(|obs: &DVector<f64>| obs[0] > 1.0);
        assert!(stop.should_stop(&DVector::from_element(1, 2.0)));
        assert!(!stop.should_stop(&DVector::from_element(1, 0.5)));
        assert!(!StopCondition::<f64>::should_stop(&NeverStop, &DVector::from_element(1, 0.5)));
    }
}
