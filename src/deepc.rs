use std::collections::BTreeMap;

use log::{debug, info};
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};

use crate::error::{DeepcError, DeepcResult};
use crate::hankel::{DataMatrices, TrajectoryLog, check_persistent_excitation};
use crate::layer::{DiffQpLayer, LayerSolution};
use crate::params::{InitialWeights, ParamName, ParameterStore};
use crate::program::{Bounds, Dims, ParamKind, ParamValues, Program, Variant, VarKind, row_space_projector};
use crate::qp::QpSettings;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct DeePCConfig<F> {
    /// Prediction horizon
    pub n: usize,
    /// Length of the initial-condition window
    pub tini: usize,
    /// Output dimension
    pub p: usize,
    /// Input dimension
    pub m: usize,
    pub variant: Variant,
    pub input_bounds: Bounds<F>,
    pub output_bounds: Bounds<F>,
    pub solver: QpSettings<F>,
}

impl<F> DeePCConfig<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Deterministic controller without input or output bounds.
    pub fn new(n: usize, tini: usize, p: usize, m: usize) -> Self {
        Self {
            n,
            tini,
            p,
            m,
            variant: Variant::default(),
            input_bounds: Bounds::unbounded(m),
            output_bounds: Bounds::unbounded(p),
            solver: QpSettings::default(),
        }
    }

    pub fn with_input_bounds(mut self, bounds: Bounds<F>) -> Self {
        self.input_bounds = bounds;
        self
    }

    pub fn with_output_bounds(mut self, bounds: Bounds<F>) -> Self {
        self.output_bounds = bounds;
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_solver(mut self, solver: QpSettings<F>) -> Self {
        self.solver = solver;
        self
    }
}

/// Batched inputs of one `forward` call, one scenario per row.
///
/// Matrices with a single row are broadcast to the batch size.
#[derive(Debug, Clone)]
pub struct ForwardInput<F> {
    /// `batch × N·p`, zero when omitted
    pub reference: Option<DMatrix<F>>,
    /// `batch × N·m`, zero when omitted
    pub input_reference: Option<DMatrix<F>>,
    /// `batch × Tini·m`
    pub u_init: DMatrix<F>,
    /// `batch × Tini·p`
    pub y_init: DMatrix<F>,
}

impl<F> ForwardInput<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(u_init: DMatrix<F>, y_init: DMatrix<F>) -> Self {
        Self {
            reference: None,
            input_reference: None,
            u_init,
            y_init,
        }
    }

    /// A batch of one.
    pub fn single(u_init: &DVector<F>, y_init: &DVector<F>) -> Self {
        Self::new(row_matrix(u_init), row_matrix(y_init))
    }

    pub fn with_reference(mut self, reference: DMatrix<F>) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_input_reference(mut self, input_reference: DMatrix<F>) -> Self {
        self.input_reference = Some(input_reference);
        self
    }
}

/// Optimal trajectories, `batch × len` each.
#[derive(Debug, Clone)]
pub struct ForwardOutput<F> {
    pub g: DMatrix<F>,
    pub u: DMatrix<F>,
    pub y: DMatrix<F>,
    pub sig_y: Option<DMatrix<F>>,
    pub sig_u: Option<DMatrix<F>>,
    /// Solver state needed by `backward` and `jvp`
    pub solution: LayerSolution<F>,
}

impl<F> ForwardOutput<F> {
    /// `g, u, y` followed by the active slacks.
    pub fn outputs(&self) -> Vec<&DMatrix<F>> {
        let mut out = vec![&self.g, &self.u, &self.y];
        out.extend(self.sig_y.as_ref());
        out.extend(self.sig_u.as_ref());
        out
    }
}

/// Cotangents of a loss on the forward outputs; omitted outputs count as zero.
#[derive(Debug, Clone)]
pub struct Cotangents<F> {
    pub g: Option<DMatrix<F>>,
    pub u: Option<DMatrix<F>>,
    pub y: Option<DMatrix<F>>,
    pub sig_y: Option<DMatrix<F>>,
    pub sig_u: Option<DMatrix<F>>,
}

impl<F> Default for Cotangents<F> {
    fn default() -> Self {
        Self {
            g: None,
            u: None,
            y: None,
            sig_y: None,
            sig_u: None,
        }
    }
}

/// Gradients of the loss with respect to the per-call inputs, `batch × len` each.
#[derive(Debug, Clone)]
pub struct InputGradients<F> {
    pub reference: DMatrix<F>,
    pub input_reference: DMatrix<F>,
    pub u_init: DMatrix<F>,
    pub y_init: DMatrix<F>,
}

/// Directional derivatives of the forward outputs.
#[derive(Debug, Clone)]
pub struct ForwardTangent<F> {
    pub g: DMatrix<F>,
    pub u: DMatrix<F>,
    pub y: DMatrix<F>,
    pub sig_y: Option<DMatrix<F>>,
    pub sig_u: Option<DMatrix<F>>,
}

/// A direction in parameter space; missing names are zero.
pub type ParamDirection<F> = BTreeMap<ParamName, DVector<F>>;

/// `v` repeated `n` times.
pub fn tile<F: Scalar + Copy>(v: &DVector<F>, n: usize) -> DVector<F> {
    DVector::from_fn(v.len() * n, |i, _| v[i % v.len()])
}

/// Per-step vector of `width` entries tiled over `n` steps, or a full-horizon vector as is.
pub fn over_horizon<F: Scalar + Copy>(name: &'static str, v: &DVector<F>, width: usize, n: usize) -> DeepcResult<DVector<F>> {
    if v.len() == width * n {
        Ok(v.clone())
    } else if v.len() == width {
        Ok(tile(v, n))
    } else {
        Err(DeepcError::shape(name, (width * n, 1), (v.len(), 1)))
    }
}

/// `diag(1_N ⊗ √w)`
fn sqrt_weight<F>(w: &DVector<F>, n: usize) -> DMatrix<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    DMatrix::from_diagonal(&tile(&w.map(|v| v.sqrt()), n))
}

/// `∂√w/∂w`, zero where `w = 0`
fn sqrt_derivative<F>(w: F) -> F
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    let s = w.sqrt();
    if s > convert(0.0) { convert::<f64, F>(0.5) / s } else { convert(0.0) }
}

/// `1 × len` matrix holding `v`.
pub fn row_matrix<F: Scalar + Copy>(v: &DVector<F>) -> DMatrix<F> {
    DMatrix::from_row_slice(1, v.len(), v.as_slice())
}

/// Row `b` of a batched input as a column, broadcasting single-row inputs.
fn batch_row<F: Scalar + Copy>(m: &DMatrix<F>, b: usize) -> DMatrix<F> {
    let row = if m.nrows() == 1 { 0 } else { b };
    DMatrix::from_fn(m.ncols(), 1, |i, _| m[(row, i)])
}

fn param_name(kind: ParamKind) -> Option<ParamName> {
    match kind {
        ParamKind::LamG1 => Some(ParamName::LamG1),
        ParamKind::LamG2 => Some(ParamName::LamG2),
        ParamKind::LamY => Some(ParamName::LamY),
        ParamKind::LamU => Some(ParamName::LamU),
        _ => None,
    }
}

/// Data-enabled predictive controller with learnable weights.
#[derive(Debug, Clone)]
pub struct DeePC<F> {
    data: DataMatrices<F>,
    layer: DiffQpLayer<F>,
    params: ParameterStore<F>,
}

impl<F> DeePC<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Validates the log, builds the program and seeds the parameters.
    pub fn new(log: TrajectoryLog<F>, config: DeePCConfig<F>, weights: InitialWeights<F>) -> DeepcResult<Self> {
        if log.input_dim() != config.m || log.output_dim() != config.p {
            return Err(DeepcError::Configuration(format!(
                "log has {} inputs and {} outputs, controller expects {} and {}",
                log.input_dim(),
                log.output_dim(),
                config.m,
                config.p
            )));
        }

        check_persistent_excitation(&log.u, config.tini, config.n, config.p)?;
        let data = DataMatrices::from_log(&log, config.tini, config.n)?;
        let program = Program::build(&data, config.variant, &config.input_bounds, &config.output_bounds)?;
        let params = ParameterStore::for_variant(config.variant, config.p, config.m, &weights)?;

        info!(
            "DeePC ready: T={} Tini={} N={} m={} p={} g={} variant={:?}",
            log.len(),
            config.tini,
            config.n,
            config.m,
            config.p,
            data.g_dim(),
            config.variant
        );

        Ok(Self {
            data,
            layer: DiffQpLayer::new(program, config.solver),
            params,
        })
    }

    pub fn dims(&self) -> Dims {
        self.layer.program.dims
    }

    pub fn variant(&self) -> Variant {
        self.layer.program.variant
    }

    pub fn data(&self) -> &DataMatrices<F> {
        &self.data
    }

    pub fn program(&self) -> &Program<F> {
        &self.layer.program
    }

    pub fn solver_settings(&self) -> &QpSettings<F> {
        &self.layer.settings
    }

    pub fn parameters(&self) -> &ParameterStore<F> {
        &self.params
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterStore<F> {
        &mut self.params
    }

    pub fn zero_grad(&mut self) {
        self.params.zero_grad();
    }

    fn learnable(&self, name: ParamName) -> DeepcResult<&DVector<F>> {
        let value = self.params.value(name).ok_or_else(|| DeepcError::InvalidParameter {
            name: name.as_str(),
            reason: "not active in this controller variant".into(),
        })?;
        if value.iter().any(|v| !(*v >= convert(0.0)) || !v.is_finite()) {
            return Err(DeepcError::InvalidParameter {
                name: name.as_str(),
                reason: "must be finite and non-negative".into(),
            });
        }
        Ok(value)
    }

    /// Batch size implied by the inputs, checking column counts on the way.
    fn batch_size(&self, input: &ForwardInput<F>) -> DeepcResult<usize> {
        let d = self.dims();
        let mut shapes = vec![
            ("u_ini", input.u_init.shape(), d.tini * d.m),
            ("y_ini", input.y_init.shape(), d.tini * d.p),
        ];
        if let Some(r) = &input.reference {
            shapes.push(("ref", r.shape(), d.n * d.p));
        }
        if let Some(r) = &input.input_reference {
            shapes.push(("u_ref", r.shape(), d.n * d.m));
        }

        let batch = shapes.iter().map(|(_, (rows, _), _)| *rows).max().unwrap_or(1);
        for (name, (rows, cols), expected) in shapes {
            if cols != expected || rows == 0 || (rows != 1 && rows != batch) {
                return Err(DeepcError::shape(name, (batch, expected), (rows, cols)));
            }
        }
        Ok(batch)
    }

    /// Parameter values of every scenario, in declaration order.
    fn scenario_values(&self, input: &ForwardInput<F>) -> DeepcResult<Vec<ParamValues<F>>> {
        let d = self.dims();
        let batch = self.batch_size(input)?;
        let q_sqrt = sqrt_weight(self.learnable(ParamName::Q)?, d.n);
        let r_sqrt = sqrt_weight(self.learnable(ParamName::R)?, d.n);

        (0..batch)
            .map(|b| -> DeepcResult<ParamValues<F>> {
                self.program()
                    .params()
                    .iter()
                    .map(|slot| -> DeepcResult<DMatrix<F>> {
                        Ok(match slot.kind {
                            ParamKind::QSqrt => q_sqrt.clone(),
                            ParamKind::RSqrt => r_sqrt.clone(),
                            ParamKind::UIni => batch_row(&input.u_init, b),
                            ParamKind::YIni => batch_row(&input.y_init, b),
                            ParamKind::Reference => input
                                .reference
                                .as_ref()
                                .map_or_else(|| DMatrix::zeros(slot.rows, 1), |r| batch_row(r, b)),
                            ParamKind::InputReference => input
                                .input_reference
                                .as_ref()
                                .map_or_else(|| DMatrix::zeros(slot.rows, 1), |r| batch_row(r, b)),
                            kind => {
                                let name = param_name(kind).ok_or_else(|| {
                                    DeepcError::BuildInvariant(format!("no learnable value for `{}`", kind.name()))
                                })?;
                                DMatrix::from_element(1, 1, self.learnable(name)?[0])
                            }
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Solves the program for every scenario of the batch.
    pub fn forward(&self, input: &ForwardInput<F>) -> DeepcResult<ForwardOutput<F>> {
        let batch = self.scenario_values(input)?;
        let solution = self.layer.solve(batch)?;
        let program = self.program();
        let take = |kind| solution.variable(program, kind);
        let missing = |kind: VarKind| DeepcError::BuildInvariant(format!("program has no {kind:?} variable"));

        Ok(ForwardOutput {
            g: take(VarKind::G).ok_or_else(|| missing(VarKind::G))?,
            u: take(VarKind::U).ok_or_else(|| missing(VarKind::U))?,
            y: take(VarKind::Y).ok_or_else(|| missing(VarKind::Y))?,
            sig_y: take(VarKind::SigY),
            sig_u: take(VarKind::SigU),
            solution,
        })
    }

    /// Backpropagates cotangents on the forward outputs.
    ///
    /// Gradients on the learnable parameters are summed over the batch and
    /// accumulated into the parameter store; gradients on the per-call inputs
    /// are returned per scenario.
    pub fn backward(&mut self, output: &ForwardOutput<F>, cotangents: &Cotangents<F>) -> DeepcResult<InputGradients<F>> {
        let program = &self.layer.program;
        let batch = output.solution.batch_size();
        let nv = program.num_vars();

        let mut x_bars = vec![DVector::zeros(nv); batch];
        for (kind, cot) in [
            (VarKind::G, &cotangents.g),
            (VarKind::U, &cotangents.u),
            (VarKind::Y, &cotangents.y),
            (VarKind::SigY, &cotangents.sig_y),
            (VarKind::SigU, &cotangents.sig_u),
        ] {
            let Some(cot) = cot else { continue };
            let slot = program.slot(kind).ok_or_else(|| {
                DeepcError::InvalidInput(format!("cotangent given for {kind:?}, which this variant does not return"))
            })?;
            if cot.shape() != (batch, slot.len) {
                return Err(DeepcError::shape("cotangent", (batch, slot.len), cot.shape()));
            }
            for (b, x_bar) in x_bars.iter_mut().enumerate() {
                x_bar.rows_mut(slot.offset, slot.len).copy_from(&cot.row(b).transpose());
            }
        }

        let grads = self.layer.backward(&output.solution, &x_bars)?;

        let d = program.dims;
        let index = |kind| program.param_index(kind);
        let mut input_grads = InputGradients {
            reference: DMatrix::zeros(batch, d.n * d.p),
            input_reference: DMatrix::zeros(batch, d.n * d.m),
            u_init: DMatrix::zeros(batch, d.tini * d.m),
            y_init: DMatrix::zeros(batch, d.tini * d.p),
        };
        let mut learnable: BTreeMap<ParamName, DVector<F>> = BTreeMap::new();

        for (b, g) in grads.iter().enumerate() {
            for (kind, target) in [
                (ParamKind::Reference, &mut input_grads.reference),
                (ParamKind::InputReference, &mut input_grads.input_reference),
                (ParamKind::UIni, &mut input_grads.u_init),
                (ParamKind::YIni, &mut input_grads.y_init),
            ] {
                if let Some(i) = index(kind) {
                    target.row_mut(b).copy_from(&g[i].column(0).transpose());
                }
            }

            for (kind, name) in [(ParamKind::QSqrt, ParamName::Q), (ParamKind::RSqrt, ParamName::R)] {
                let (Some(i), Some(w)) = (index(kind), self.params.value(name)) else {
                    continue;
                };
                // W = diag(1_N ⊗ √w), so ∂L/∂w_j = Σ_k ∂L/∂W_ii · ∂√w_j/∂w_j with i = k·width + j
                let width = w.len();
                let dw = DVector::from_fn(width, |j, _| {
                    let diag: F = (0..d.n).fold(convert(0.0), |acc, k| acc + g[i][(k * width + j, k * width + j)]);
                    diag * sqrt_derivative(w[j])
                });
                *learnable.entry(name).or_insert_with(|| DVector::zeros(width)) += dw;
            }

            for slot in program.params() {
                if let (Some(name), Some(i)) = (param_name(slot.kind), index(slot.kind)) {
                    *learnable.entry(name).or_insert_with(|| DVector::zeros(1)) += g[i].column(0);
                }
            }
        }

        for (name, grad) in &learnable {
            self.params.accumulate(*name, grad);
        }
        debug!("Accumulated gradients for {:?}", learnable.keys().collect::<Vec<_>>());
        Ok(input_grads)
    }

    /// Forward-mode derivative of the outputs along `direction` in parameter space.
    pub fn jvp(&self, output: &ForwardOutput<F>, direction: &ParamDirection<F>) -> DeepcResult<ForwardTangent<F>> {
        let program = self.program();
        let d = program.dims;

        for (name, v) in direction {
            let value = self.params.value(*name).ok_or_else(|| DeepcError::InvalidParameter {
                name: name.as_str(),
                reason: "not active in this controller variant".into(),
            })?;
            if v.len() != value.len() {
                return Err(DeepcError::shape(name.as_str(), (value.len(), 1), (v.len(), 1)));
            }
        }

        let weight_tangent = |name: ParamName| -> DeepcResult<DMatrix<F>> {
            let w = self.learnable(name)?;
            let dw = direction.get(&name).cloned().unwrap_or_else(|| DVector::zeros(w.len()));
            let scaled = DVector::from_fn(w.len(), |j, _| dw[j] * sqrt_derivative(w[j]));
            Ok(DMatrix::from_diagonal(&tile(&scaled, d.n)))
        };
        let dq = weight_tangent(ParamName::Q)?;
        let dr = weight_tangent(ParamName::R)?;

        let tangents: ParamValues<F> = program
            .params()
            .iter()
            .map(|slot| match slot.kind {
                ParamKind::QSqrt => dq.clone(),
                ParamKind::RSqrt => dr.clone(),
                kind => match param_name(kind).and_then(|name| direction.get(&name)) {
                    Some(v) => DMatrix::from_element(1, 1, v[0]),
                    None => DMatrix::zeros(slot.rows, slot.cols),
                },
            })
            .collect();

        let batch = output.solution.batch_size();
        let dxs = self.layer.jvp(&output.solution, &vec![tangents; batch])?;

        let stack = |kind: VarKind| -> Option<DMatrix<F>> {
            let slot = program.slot(kind)?;
            let mut out = DMatrix::zeros(batch, slot.len);
            for (b, dx) in dxs.iter().enumerate() {
                out.row_mut(b).copy_from(&dx.rows(slot.offset, slot.len).transpose());
            }
            Some(out)
        };
        let missing = |kind: VarKind| DeepcError::BuildInvariant(format!("program has no {kind:?} variable"));

        Ok(ForwardTangent {
            g: stack(VarKind::G).ok_or_else(|| missing(VarKind::G))?,
            u: stack(VarKind::U).ok_or_else(|| missing(VarKind::U))?,
            y: stack(VarKind::Y).ok_or_else(|| missing(VarKind::Y))?,
            sig_y: stack(VarKind::SigY),
            sig_u: stack(VarKind::SigU),
        })
    }

    /// Overwrites the active regularisation scalars; `None` or inactive ones are left alone.
    pub fn initialise(&mut self, lam_y: Option<F>, lam_u: Option<F>, lam_g1: Option<F>, lam_g2: Option<F>) -> DeepcResult<()> {
        for (name, value) in [
            (ParamName::LamY, lam_y),
            (ParamName::LamU, lam_u),
            (ParamName::LamG1, lam_g1),
            (ParamName::LamG2, lam_g2),
        ] {
            if let Some(v) = value {
                if self.params.contains(name) {
                    self.params.set(name, DVector::from_element(1, v))?;
                }
            }
        }
        Ok(())
    }

    /// `(I, Π)` where `Π` projects onto the row space of `[Up; Yp; Uf]`.
    pub fn residual_projector(&self) -> DeepcResult<(DMatrix<F>, DMatrix<F>)> {
        let g = self.data.g_dim();
        let pi = match self.program().projector() {
            Some(pi) => pi.clone(),
            None => row_space_projector(&self.data.stacked_past_and_future_inputs())?,
        };
        Ok((DMatrix::identity(g, g), pi))
    }
}
