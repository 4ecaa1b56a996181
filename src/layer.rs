use log::{debug, warn};
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField};

use crate::error::{DeepcError, DeepcResult};
use crate::program::{ParamValues, Program, VarKind};
use crate::qp::{QpProblem, QpSettings, QpSolution, QpSolver};
use crate::sensitivity::KktSensitivity;

/// One solved scenario of a batch.
#[derive(Debug, Clone)]
pub struct ScenarioSolution<F> {
    pub problem: QpProblem<F>,
    pub solution: QpSolution<F>,
    pub values: ParamValues<F>,
}

#[derive(Debug, Clone)]
pub struct LayerSolution<F> {
    pub scenarios: Vec<ScenarioSolution<F>>,
}

impl<F> LayerSolution<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn batch_size(&self) -> usize {
        self.scenarios.len()
    }

    /// `batch × len` matrix of one variable across all scenarios.
    pub fn variable(&self, program: &Program<F>, kind: VarKind) -> Option<DMatrix<F>> {
        let slot = program.slot(kind)?;
        let mut out = DMatrix::zeros(self.scenarios.len(), slot.len);
        for (b, s) in self.scenarios.iter().enumerate() {
            out.row_mut(b).copy_from(&s.solution.x.rows(slot.offset, slot.len).transpose());
        }
        Some(out)
    }
}

/// A parametric QP whose solutions can be differentiated with respect to its parameters.
#[derive(Debug, Clone)]
pub struct DiffQpLayer<F> {
    pub program: Program<F>,
    pub settings: QpSettings<F>,
}

impl<F> DiffQpLayer<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(program: Program<F>, settings: QpSettings<F>) -> Self {
        Self { program, settings }
    }

    /// Solves every scenario in order. The first failure aborts the batch.
    pub fn solve(&self, batch: Vec<ParamValues<F>>) -> DeepcResult<LayerSolution<F>> {
        let mut scenarios = Vec::with_capacity(batch.len());
        for (scenario, values) in batch.into_iter().enumerate() {
            let problem = self.program.assemble(&values)?;
            let mut solver = QpSolver::new(problem, self.settings.clone());
            if !solver.solve() {
                let status = solver.status();
                warn!("Scenario {} failed after {} iterations: {}", scenario, solver.get_num_iters(), status);
                return Err(DeepcError::SolveFailed { scenario, status });
            }
            debug!(
                "Scenario {} solved in {} iterations (polished: {})",
                scenario, solver.solution.iter, solver.solution.polished
            );
            scenarios.push(ScenarioSolution {
                problem: solver.problem,
                solution: solver.solution,
                values,
            });
        }
        Ok(LayerSolution { scenarios })
    }

    fn sensitivity(&self, s: &ScenarioSolution<F>) -> DeepcResult<KktSensitivity<F>> {
        KktSensitivity::new(&s.problem, &s.solution, self.settings.delta, self.settings.refine_iter)
    }

    /// Reverse mode: one cotangent on the decision vector per scenario,
    /// gradients on every declared parameter per scenario.
    pub fn backward(&self, solved: &LayerSolution<F>, x_bars: &[DVector<F>]) -> DeepcResult<Vec<ParamValues<F>>> {
        if x_bars.len() != solved.batch_size() {
            return Err(DeepcError::shape("cotangent batch", (solved.batch_size(), 1), (x_bars.len(), 1)));
        }
        solved
            .scenarios
            .iter()
            .zip(x_bars)
            .map(|(s, x_bar)| {
                let adj = self.sensitivity(s)?.adjoint(x_bar)?;
                self.program.pullback(&s.values, &s.solution.x, &adj)
            })
            .collect()
    }

    /// Forward mode: parameter tangents per scenario, derivative of the decision vector per scenario.
    pub fn jvp(&self, solved: &LayerSolution<F>, tangents: &[ParamValues<F>]) -> DeepcResult<Vec<DVector<F>>> {
        if tangents.len() != solved.batch_size() {
            return Err(DeepcError::shape("tangent batch", (solved.batch_size(), 1), (tangents.len(), 1)));
        }
        solved
            .scenarios
            .iter()
            .zip(tangents)
            .map(|(s, t)| {
                let qt = self.program.pushforward(&s.values, &s.solution.x, t)?;
                self.sensitivity(s)?.tangent(&qt.dp_x, &qt.dc, &qt.dl, &qt.du)
            })
            .collect()
    }
}
