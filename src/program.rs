//! The DeePC quadratic program as a tagged descriptor.
//!
//! [`Program::build`] appends variable, parameter, cost and constraint records
//! according to the variant flags. Everything downstream walks those records:
//! [`Program::assemble`] turns parameter values into the numeric QP,
//! [`Program::pullback`] maps QP sensitivities back onto the parameters and
//! [`Program::pushforward`] maps parameter tangents onto the QP data.
//!
//! Decision vector layout: `[g, e, u, y, sig_y?, sig_u?, |g|?, |sig_y|?, |sig_u|?]`.

use log::debug;
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};

use crate::error::{DeepcError, DeepcResult};
use crate::hankel::DataMatrices;
use crate::qp::{QP_INFTY, QpProblem};
use crate::sensitivity::QpAdjoint;

const SYMMETRY_TOL: f64 = 1e-8;

/// Which optional terms the program carries. Flags combine freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Variant {
    /// Output slack `sig_y` on the initial-condition constraint, penalised by `lam_y·‖sig_y‖₁`
    pub stochastic_y: bool,
    /// Input slack `sig_u` on the initial-condition constraint, penalised by `lam_u·‖sig_u‖₁`
    pub stochastic_u: bool,
    /// `lam_g1·‖(I−Π)g‖² + lam_g2·‖g‖₁` regularisation
    pub nonlinear: bool,
}

impl Variant {
    pub fn deterministic() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    /// Prediction horizon `N`
    pub n: usize,
    /// Initial-condition window `Tini`
    pub tini: usize,
    /// Output dimension
    pub p: usize,
    /// Input dimension
    pub m: usize,
    /// Number of trajectory coefficients
    pub g: usize,
}

/// Element-wise `lower ≤ v ≤ upper` bounds, per step or over the whole horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds<F> {
    pub lower: DVector<F>,
    pub upper: DVector<F>,
}

impl<F> Bounds<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(lower: DVector<F>, upper: DVector<F>) -> Self {
        Self { lower, upper }
    }

    /// `[-b, b]`
    pub fn symmetric(b: DVector<F>) -> Self {
        Self { lower: -&b, upper: b }
    }

    pub fn unbounded(width: usize) -> Self {
        let inf: F = convert(QP_INFTY);
        Self {
            lower: DVector::from_element(width, -inf),
            upper: DVector::from_element(width, inf),
        }
    }

    /// Expands per-step bounds of `width` entries to `n` steps, or checks
    /// that full-horizon bounds have `width·n` entries. Infinite values are
    /// mapped onto the solver's infinity.
    pub fn over_horizon(&self, name: &str, width: usize, n: usize) -> DeepcResult<(DVector<F>, DVector<F>)> {
        if self.lower.len() != self.upper.len() {
            return Err(DeepcError::Configuration(format!(
                "{name} bounds have {} lower and {} upper entries",
                self.lower.len(),
                self.upper.len()
            )));
        }
        let expand = |v: &DVector<F>| -> DeepcResult<DVector<F>> {
            let inf: F = convert(QP_INFTY);
            let full = if v.len() == width {
                DVector::from_fn(width * n, |i, _| v[i % width])
            } else if v.len() == width * n {
                v.clone()
            } else {
                return Err(DeepcError::Configuration(format!(
                    "{name} bounds have {} entries, expected {width} or {}",
                    v.len(),
                    width * n
                )));
            };
            Ok(full.map(|b| b.max(-inf).min(inf)))
        };

        let lower = expand(&self.lower)?;
        let upper = expand(&self.upper)?;
        if let Some(i) = (0..lower.len()).find(|&i| !(lower[i] <= upper[i])) {
            return Err(DeepcError::Configuration(format!(
                "{name} bound {i} has lower {} above upper {}",
                lower[i], upper[i]
            )));
        }
        Ok((lower, upper))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VarKind {
    G,
    E,
    U,
    Y,
    SigY,
    SigU,
    /// Epigraph of `|g|`
    AbsG,
    AbsSigY,
    AbsSigU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlot {
    pub kind: VarKind,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKind {
    QSqrt,
    RSqrt,
    UIni,
    YIni,
    Reference,
    InputReference,
    LamG1,
    LamG2,
    LamY,
    LamU,
}

impl ParamKind {
    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::QSqrt => "Q_sqrt",
            ParamKind::RSqrt => "R_sqrt",
            ParamKind::UIni => "u_ini",
            ParamKind::YIni => "y_ini",
            ParamKind::Reference => "ref",
            ParamKind::InputReference => "u_ref",
            ParamKind::LamG1 => "lam_g1",
            ParamKind::LamG2 => "lam_g2",
            ParamKind::LamY => "lam_y",
            ParamKind::LamU => "lam_u",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSlot {
    pub kind: ParamKind,
    pub rows: usize,
    pub cols: usize,
    pub nonneg: bool,
}

/// Parameter values in declaration order.
pub type ParamValues<F> = Vec<DMatrix<F>>;

#[derive(Debug, Clone)]
pub enum CostTerm<F> {
    /// `‖W·(v − o)‖²` with `W` and the optional offset `o` parameters
    WeightedSquares {
        var: VarKind,
        weight: ParamKind,
        offset: Option<ParamKind>,
    },
    /// `λ·‖M·v‖²` with a constant `M`; `gram = MᵀM`
    ProjectedSquares {
        var: VarKind,
        scale: ParamKind,
        matrix: DMatrix<F>,
        gram: DMatrix<F>,
    },
    /// `λ·Σ t` over the epigraph variable `t ≥ |v|`
    L1 { var: VarKind, abs: VarKind, scale: ParamKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    TrackingError,
    InputPrediction,
    OutputPrediction,
    InputBox,
    OutputBox,
    Terminal,
    InitialInput,
    InitialOutput,
    Epigraph { var: VarKind },
}

/// Where the bound of one constraint row comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundSource<F> {
    Constant(F),
    /// `scale · param[index]`
    Param { kind: ParamKind, index: usize, scale: F },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowBounds<F> {
    pub lower: BoundSource<F>,
    pub upper: BoundSource<F>,
}

impl<F: Scalar + Copy> RowBounds<F> {
    fn equal(source: BoundSource<F>) -> Self {
        Self {
            lower: source,
            upper: source,
        }
    }
}

/// A group of rows of `A` with their bounds.
#[derive(Debug, Clone)]
pub struct ConstraintBlock<F> {
    pub kind: ConstraintKind,
    pub offset: usize,
    pub coeffs: Vec<(VarKind, DMatrix<F>)>,
    pub bounds: Vec<RowBounds<F>>,
}

impl<F> ConstraintBlock<F> {
    pub fn rows(&self) -> usize {
        self.bounds.len()
    }
}

#[derive(Debug, Clone)]
pub struct Program<F> {
    pub dims: Dims,
    pub variant: Variant,
    vars: Vec<VarSlot>,
    params: Vec<ParamSlot>,
    costs: Vec<CostTerm<F>>,
    blocks: Vec<ConstraintBlock<F>>,
    a: DMatrix<F>,
    /// `Π = pinv(H)·H` for `H = [Up; Yp; Uf]`, present for the nonlinear variant
    projector: Option<DMatrix<F>>,
}

/// Parameter tangents mapped onto the QP data (`dP·x`, `dc`, `dl`, `du`).
#[derive(Debug, Clone)]
pub struct QpTangent<F> {
    pub dp_x: DVector<F>,
    pub dc: DVector<F>,
    pub dl: DVector<F>,
    pub du: DVector<F>,
}

/// `Π = pinv(H)·H`, the orthogonal projector onto the row space of `h`.
pub fn row_space_projector<F>(h: &DMatrix<F>) -> DeepcResult<DMatrix<F>>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    let sv_max = h.singular_values().max();
    let eps = sv_max * convert(h.nrows().max(h.ncols()) as f64 * f64::EPSILON);
    let pinv = h
        .clone()
        .pseudo_inverse(eps)
        .map_err(|e| DeepcError::BuildInvariant(format!("pseudo-inverse of the data matrix failed: {e}")))?;
    let pi = pinv * h;
    Ok((&pi + pi.transpose()).scale(convert(0.5)))
}

fn identity_block<F>(n: usize, scale: F) -> DMatrix<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    DMatrix::identity(n, n).scale(scale)
}

impl<F> Program<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Declares the program for one set of data matrices and bounds, then verifies it.
    pub fn build(
        data: &DataMatrices<F>,
        variant: Variant,
        input_bounds: &Bounds<F>,
        output_bounds: &Bounds<F>,
    ) -> DeepcResult<Self> {
        let dims = Dims {
            n: data.n,
            tini: data.tini,
            p: data.p,
            m: data.m,
            g: data.g_dim(),
        };
        if dims.n == 0 || dims.tini == 0 || dims.p == 0 || dims.m == 0 {
            return Err(DeepcError::Configuration(format!(
                "horizons and dimensions must be positive, got N={} Tini={} p={} m={}",
                dims.n, dims.tini, dims.p, dims.m
            )));
        }
        let tini_m = dims.tini * dims.m;
        let tini_p = dims.tini * dims.p;
        let nm = dims.n * dims.m;
        let np = dims.n * dims.p;

        let one: F = convert(1.0);
        let zero: F = convert(0.0);
        let inf: F = convert(QP_INFTY);
        let g = dims.g;

        // Variables
        let mut vars = Vec::new();
        let mut offset = 0;
        let mut push_var = |kind, len| {
            vars.push(VarSlot { kind, offset, len });
            offset += len;
        };
        push_var(VarKind::G, g);
        push_var(VarKind::E, np);
        push_var(VarKind::U, nm);
        push_var(VarKind::Y, np);
        if variant.stochastic_y {
            push_var(VarKind::SigY, tini_p);
        }
        if variant.stochastic_u {
            push_var(VarKind::SigU, tini_m);
        }
        if variant.nonlinear {
            push_var(VarKind::AbsG, g);
        }
        if variant.stochastic_y {
            push_var(VarKind::AbsSigY, tini_p);
        }
        if variant.stochastic_u {
            push_var(VarKind::AbsSigU, tini_m);
        }

        // Parameters
        let mut params = vec![
            ParamSlot { kind: ParamKind::QSqrt, rows: np, cols: np, nonneg: false },
            ParamSlot { kind: ParamKind::RSqrt, rows: nm, cols: nm, nonneg: false },
            ParamSlot { kind: ParamKind::UIni, rows: tini_m, cols: 1, nonneg: false },
            ParamSlot { kind: ParamKind::YIni, rows: tini_p, cols: 1, nonneg: false },
            ParamSlot { kind: ParamKind::Reference, rows: np, cols: 1, nonneg: false },
            ParamSlot { kind: ParamKind::InputReference, rows: nm, cols: 1, nonneg: false },
        ];
        let scalar = |kind| ParamSlot { kind, rows: 1, cols: 1, nonneg: true };
        if variant.nonlinear {
            params.push(scalar(ParamKind::LamG1));
            params.push(scalar(ParamKind::LamG2));
        }
        if variant.stochastic_y {
            params.push(scalar(ParamKind::LamY));
        }
        if variant.stochastic_u {
            params.push(scalar(ParamKind::LamU));
        }

        // Cost
        let mut costs = vec![
            CostTerm::WeightedSquares { var: VarKind::E, weight: ParamKind::QSqrt, offset: None },
            CostTerm::WeightedSquares {
                var: VarKind::U,
                weight: ParamKind::RSqrt,
                offset: Some(ParamKind::InputReference),
            },
        ];
        let mut projector = None;
        if variant.nonlinear {
            let pi = row_space_projector(&data.stacked_past_and_future_inputs())?;
            let matrix = DMatrix::identity(g, g) - &pi;
            let gram = matrix.tr_mul(&matrix);
            costs.push(CostTerm::ProjectedSquares { var: VarKind::G, scale: ParamKind::LamG1, matrix, gram });
            costs.push(CostTerm::L1 { var: VarKind::G, abs: VarKind::AbsG, scale: ParamKind::LamG2 });
            projector = Some(pi);
        }
        if variant.stochastic_y {
            costs.push(CostTerm::L1 { var: VarKind::SigY, abs: VarKind::AbsSigY, scale: ParamKind::LamY });
        }
        if variant.stochastic_u {
            costs.push(CostTerm::L1 { var: VarKind::SigU, abs: VarKind::AbsSigU, scale: ParamKind::LamU });
        }

        // Constraints
        let constant_rows = |rows: usize, value: F| vec![RowBounds::equal(BoundSource::Constant(value)); rows];
        let param_rows = |rows: usize, kind: ParamKind, start: usize, scale: F| {
            (0..rows)
                .map(|i| RowBounds::equal(BoundSource::Param { kind, index: start + i, scale }))
                .collect::<Vec<_>>()
        };
        let box_rows = |(lower, upper): (DVector<F>, DVector<F>)| {
            lower
                .iter()
                .zip(upper.iter())
                .map(|(l, u)| RowBounds { lower: BoundSource::Constant(*l), upper: BoundSource::Constant(*u) })
                .collect::<Vec<_>>()
        };

        let mut blocks = vec![
            ConstraintBlock {
                kind: ConstraintKind::TrackingError,
                offset: 0,
                coeffs: vec![(VarKind::E, identity_block(np, one)), (VarKind::Y, identity_block(np, -one))],
                bounds: param_rows(np, ParamKind::Reference, 0, -one),
            },
            ConstraintBlock {
                kind: ConstraintKind::InputPrediction,
                offset: 0,
                coeffs: vec![(VarKind::G, data.uf.clone()), (VarKind::U, identity_block(nm, -one))],
                bounds: constant_rows(nm, zero),
            },
            ConstraintBlock {
                kind: ConstraintKind::OutputPrediction,
                offset: 0,
                coeffs: vec![(VarKind::G, data.yf.clone()), (VarKind::Y, identity_block(np, -one))],
                bounds: constant_rows(np, zero),
            },
            ConstraintBlock {
                kind: ConstraintKind::InputBox,
                offset: 0,
                coeffs: vec![(VarKind::U, identity_block(nm, one))],
                bounds: box_rows(input_bounds.over_horizon("input", dims.m, dims.n)?),
            },
            ConstraintBlock {
                kind: ConstraintKind::OutputBox,
                offset: 0,
                coeffs: vec![(VarKind::Y, identity_block(np, one))],
                bounds: box_rows(output_bounds.over_horizon("output", dims.p, dims.n)?),
            },
        ];

        let mut terminal = DMatrix::zeros(dims.p, np);
        terminal.view_mut((0, np - dims.p), (dims.p, dims.p)).fill_with_identity();
        blocks.push(ConstraintBlock {
            kind: ConstraintKind::Terminal,
            offset: 0,
            coeffs: vec![(VarKind::Y, terminal)],
            bounds: param_rows(dims.p, ParamKind::Reference, np - dims.p, one),
        });

        let mut initial_input = vec![(VarKind::G, data.up.clone())];
        if variant.stochastic_u {
            initial_input.push((VarKind::SigU, identity_block(tini_m, -one)));
        }
        blocks.push(ConstraintBlock {
            kind: ConstraintKind::InitialInput,
            offset: 0,
            coeffs: initial_input,
            bounds: param_rows(tini_m, ParamKind::UIni, 0, one),
        });

        let mut initial_output = vec![(VarKind::G, data.yp.clone())];
        if variant.stochastic_y {
            initial_output.push((VarKind::SigY, identity_block(tini_p, -one)));
        }
        blocks.push(ConstraintBlock {
            kind: ConstraintKind::InitialOutput,
            offset: 0,
            coeffs: initial_output,
            bounds: param_rows(tini_p, ParamKind::YIni, 0, one),
        });

        // t − v ≥ 0 and t + v ≥ 0 for every ℓ₁ term
        for term in &costs {
            if let CostTerm::L1 { var, abs, .. } = term {
                let len = vars.iter().find(|s| s.kind == *var).map_or(0, |s| s.len);
                let mut t_coeff = DMatrix::zeros(2 * len, len);
                let mut v_coeff = DMatrix::zeros(2 * len, len);
                t_coeff.view_mut((0, 0), (len, len)).fill_with_identity();
                t_coeff.view_mut((len, 0), (len, len)).fill_with_identity();
                v_coeff.view_mut((0, 0), (len, len)).copy_from(&identity_block(len, -one));
                v_coeff.view_mut((len, 0), (len, len)).fill_with_identity();
                blocks.push(ConstraintBlock {
                    kind: ConstraintKind::Epigraph { var: *var },
                    offset: 0,
                    coeffs: vec![(*abs, t_coeff), (*var, v_coeff)],
                    bounds: vec![
                        RowBounds { lower: BoundSource::Constant(zero), upper: BoundSource::Constant(inf) };
                        2 * len
                    ],
                });
            }
        }

        let mut row = 0;
        for block in &mut blocks {
            block.offset = row;
            row += block.rows();
        }

        let mut program = Self {
            dims,
            variant,
            vars,
            params,
            costs,
            blocks,
            a: DMatrix::zeros(row, offset),
            projector,
        };
        program.a = program.constraint_matrix()?;
        program.verify()?;

        debug!(
            "DeePC program: {} variables, {} constraints, {} parameters",
            program.num_vars(),
            program.num_constraints(),
            program.params.len()
        );
        Ok(program)
    }

    pub fn num_vars(&self) -> usize {
        self.vars.iter().map(|s| s.len).sum()
    }

    pub fn num_constraints(&self) -> usize {
        self.a.nrows()
    }

    pub fn params(&self) -> &[ParamSlot] {
        &self.params
    }

    pub fn projector(&self) -> Option<&DMatrix<F>> {
        self.projector.as_ref()
    }

    pub fn slot(&self, kind: VarKind) -> Option<VarSlot> {
        self.vars.iter().copied().find(|s| s.kind == kind)
    }

    pub fn param_index(&self, kind: ParamKind) -> Option<usize> {
        self.params.iter().position(|s| s.kind == kind)
    }

    fn var_slot(&self, kind: VarKind) -> DeepcResult<VarSlot> {
        self.slot(kind)
            .ok_or_else(|| DeepcError::BuildInvariant(format!("variable {kind:?} is referenced but not declared")))
    }

    fn param_slot(&self, kind: ParamKind) -> DeepcResult<(usize, ParamSlot)> {
        self.params
            .iter()
            .copied()
            .enumerate()
            .find(|(_, s)| s.kind == kind)
            .ok_or_else(|| DeepcError::BuildInvariant(format!("parameter `{}` is referenced but not declared", kind.name())))
    }

    fn constraint_matrix(&self) -> DeepcResult<DMatrix<F>> {
        let rows = self.blocks.iter().map(|b| b.rows()).sum();
        let mut a = DMatrix::zeros(rows, self.num_vars());
        for block in &self.blocks {
            for (kind, coeff) in &block.coeffs {
                let slot = self.var_slot(*kind)?;
                if coeff.shape() != (block.rows(), slot.len) {
                    return Err(DeepcError::BuildInvariant(format!(
                        "{:?} block coefficient for {kind:?} is {}x{}, expected {}x{}",
                        block.kind,
                        coeff.nrows(),
                        coeff.ncols(),
                        block.rows(),
                        slot.len
                    )));
                }
                let mut view = a.view_mut((block.offset, slot.offset), (block.rows(), slot.len));
                view += coeff;
            }
        }
        Ok(a)
    }

    /// Structural checks that make every assembled QP convex and affine in its parameters.
    pub fn verify(&self) -> DeepcResult<()> {
        let fail = |msg: String| Err(DeepcError::BuildInvariant(msg));

        // variable slots tile the decision vector
        let mut next = 0;
        for slot in &self.vars {
            if slot.offset != next {
                return fail(format!("variable {:?} starts at {} instead of {next}", slot.kind, slot.offset));
            }
            next += slot.len;
        }
        if next != self.a.ncols() {
            return fail(format!("variables cover {next} entries but A has {} columns", self.a.ncols()));
        }

        for (i, p) in self.params.iter().enumerate() {
            if self.params[..i].iter().any(|q| q.kind == p.kind) {
                return fail(format!("parameter `{}` declared twice", p.kind.name()));
            }
        }

        let mut used = vec![false; self.params.len()];
        let mut mark = |kind: ParamKind| -> DeepcResult<ParamSlot> {
            let (i, slot) = self.param_slot(kind)?;
            used[i] = true;
            Ok(slot)
        };

        for term in &self.costs {
            match term {
                CostTerm::WeightedSquares { var, weight, offset } => {
                    let v = self.var_slot(*var)?;
                    let w = mark(*weight)?;
                    if w.cols != v.len {
                        return fail(format!("weight `{}` has {} columns for {} entries", weight.name(), w.cols, v.len));
                    }
                    if let Some(o) = offset {
                        let o_slot = mark(*o)?;
                        if (o_slot.rows, o_slot.cols) != (v.len, 1) {
                            return fail(format!("offset `{}` does not match {var:?}", o.name()));
                        }
                    }
                }
                CostTerm::ProjectedSquares { var, scale, matrix, .. } => {
                    let v = self.var_slot(*var)?;
                    Self::check_scale(mark(*scale)?)?;
                    if matrix.shape() != (v.len, v.len) {
                        return fail(format!("regularisation matrix does not match {var:?}"));
                    }
                    Self::check_symmetric_psd(matrix)?;
                }
                CostTerm::L1 { var, abs, scale } => {
                    let v = self.var_slot(*var)?;
                    let t = self.var_slot(*abs)?;
                    Self::check_scale(mark(*scale)?)?;
                    if v.len != t.len {
                        return fail(format!("epigraph {abs:?} does not match {var:?}"));
                    }
                    let has_epigraph = self
                        .blocks
                        .iter()
                        .any(|b| b.kind == ConstraintKind::Epigraph { var: *var });
                    if !has_epigraph {
                        return fail(format!("l1 term on {var:?} has no epigraph constraint"));
                    }
                }
            }
        }

        for block in &self.blocks {
            for (i, rb) in block.bounds.iter().enumerate() {
                for source in [rb.lower, rb.upper] {
                    if let BoundSource::Param { kind, index, .. } = source {
                        let slot = mark(kind)?;
                        if index >= slot.rows * slot.cols {
                            return fail(format!("{:?} row {i} reads `{}`[{index}] out of range", block.kind, kind.name()));
                        }
                    }
                }
                if let (BoundSource::Constant(l), BoundSource::Constant(u)) = (rb.lower, rb.upper) {
                    if !(l <= u) {
                        return fail(format!("{:?} row {i} has lower bound above upper bound", block.kind));
                    }
                }
            }
        }

        if let Some(i) = used.iter().position(|u| !u) {
            return fail(format!("parameter `{}` is declared but never used", self.params[i].kind.name()));
        }

        if self.a.iter().any(|v| !v.is_finite()) {
            return fail("constraint matrix has non-finite entries".into());
        }
        Ok(())
    }

    fn check_scale(slot: ParamSlot) -> DeepcResult<()> {
        if !slot.nonneg || (slot.rows, slot.cols) != (1, 1) {
            return Err(DeepcError::BuildInvariant(format!(
                "cost scale `{}` must be a non-negative scalar parameter",
                slot.kind.name()
            )));
        }
        Ok(())
    }

    fn check_symmetric_psd(m: &DMatrix<F>) -> DeepcResult<()> {
        let scale = m.amax().max(convert(1.0));
        let tol = scale * convert(SYMMETRY_TOL);
        if (m - m.transpose()).amax() > tol {
            return Err(DeepcError::BuildInvariant("regularisation matrix is not symmetric".into()));
        }
        let min_eig = m.clone().symmetric_eigen().eigenvalues.min();
        if min_eig < -tol {
            return Err(DeepcError::BuildInvariant(format!(
                "regularisation matrix is not positive semidefinite (eigenvalue {min_eig})"
            )));
        }
        Ok(())
    }

    /// Checks shapes, finiteness and signs of one scenario's parameter values.
    pub fn check_values(&self, values: &[DMatrix<F>]) -> DeepcResult<()> {
        if values.len() != self.params.len() {
            return Err(DeepcError::InvalidInput(format!(
                "expected {} parameter values, got {}",
                self.params.len(),
                values.len()
            )));
        }
        for (slot, value) in self.params.iter().zip(values) {
            if value.shape() != (slot.rows, slot.cols) {
                return Err(DeepcError::shape(slot.kind.name(), (slot.rows, slot.cols), value.shape()));
            }
            if value.iter().any(|v| !v.is_finite()) {
                return Err(DeepcError::InvalidParameter {
                    name: slot.kind.name(),
                    reason: "contains non-finite values".into(),
                });
            }
            if slot.nonneg && value.iter().any(|v| *v < convert(0.0)) {
                return Err(DeepcError::InvalidParameter {
                    name: slot.kind.name(),
                    reason: "must be non-negative".into(),
                });
            }
        }
        Ok(())
    }

    fn value<'a>(&self, values: &'a [DMatrix<F>], kind: ParamKind) -> DeepcResult<&'a DMatrix<F>> {
        let (i, _) = self.param_slot(kind)?;
        Ok(&values[i])
    }

    fn resolve(&self, values: &[DMatrix<F>], source: BoundSource<F>) -> DeepcResult<F> {
        Ok(match source {
            BoundSource::Constant(v) => v,
            BoundSource::Param { kind, index, scale } => self.value(values, kind)?[index] * scale,
        })
    }

    /// Numeric QP for one scenario.
    pub fn assemble(&self, values: &[DMatrix<F>]) -> DeepcResult<QpProblem<F>> {
        self.check_values(values)?;
        let nv = self.num_vars();
        let two: F = convert(2.0);
        let mut p = DMatrix::zeros(nv, nv);
        let mut c = DVector::zeros(nv);

        for term in &self.costs {
            match term {
                CostTerm::WeightedSquares { var, weight, offset } => {
                    let s = self.var_slot(*var)?;
                    let w = self.value(values, *weight)?;
                    let m = w.tr_mul(w);
                    let mut blk = p.view_mut((s.offset, s.offset), (s.len, s.len));
                    blk += m.scale(two);
                    if let Some(o) = offset {
                        let o = self.value(values, *o)?;
                        let mut cv = c.rows_mut(s.offset, s.len);
                        cv -= (&m * o.column(0)).scale(two);
                    }
                }
                CostTerm::ProjectedSquares { var, scale, gram, .. } => {
                    let s = self.var_slot(*var)?;
                    let lam = self.value(values, *scale)?[0];
                    let mut blk = p.view_mut((s.offset, s.offset), (s.len, s.len));
                    blk += gram.scale(two * lam);
                }
                CostTerm::L1 { abs, scale, .. } => {
                    let t = self.var_slot(*abs)?;
                    let lam = self.value(values, *scale)?[0];
                    c.rows_mut(t.offset, t.len).add_scalar_mut(lam);
                }
            }
        }

        let m = self.num_constraints();
        let mut l = DVector::zeros(m);
        let mut u = DVector::zeros(m);
        for block in &self.blocks {
            for (i, rb) in block.bounds.iter().enumerate() {
                l[block.offset + i] = self.resolve(values, rb.lower)?;
                u[block.offset + i] = self.resolve(values, rb.upper)?;
            }
        }

        Ok(QpProblem { p, c, a: self.a.clone(), l, u })
    }

    /// Chain rule from a QP adjoint at the optimum `x` back to every declared parameter.
    ///
    /// Returns `∂L/∂param` in declaration order with the parameters' shapes.
    pub fn pullback(&self, values: &[DMatrix<F>], x: &DVector<F>, adj: &QpAdjoint<F>) -> DeepcResult<ParamValues<F>> {
        let two: F = convert(2.0);
        let mut grads: ParamValues<F> = self.params.iter().map(|s| DMatrix::zeros(s.rows, s.cols)).collect();

        for term in &self.costs {
            match term {
                CostTerm::WeightedSquares { var, weight, offset } => {
                    let s = self.var_slot(*var)?;
                    let w = self.value(values, *weight)?;
                    let a_v = adj.dx.rows(s.offset, s.len).into_owned();
                    let mut r = x.rows(s.offset, s.len).into_owned();
                    if let Some(o) = offset {
                        r -= self.value(values, *o)?.column(0);
                        let (oi, _) = self.param_slot(*o)?;
                        let m = w.tr_mul(w);
                        grads[oi] += (&m * &a_v).scale(two);
                    }
                    // ∂L/∂W = −2 [(W a) rᵀ + (W r) aᵀ]
                    let (wi, _) = self.param_slot(*weight)?;
                    let wa = w * &a_v;
                    let wr = w * &r;
                    grads[wi] -= (&wa * r.transpose() + &wr * a_v.transpose()).scale(two);
                }
                CostTerm::ProjectedSquares { var, scale, gram, .. } => {
                    let s = self.var_slot(*var)?;
                    let a_v = adj.dx.rows(s.offset, s.len);
                    let x_v = x.rows(s.offset, s.len);
                    let (li, _) = self.param_slot(*scale)?;
                    grads[li][0] -= two * a_v.dot(&(gram * x_v));
                }
                CostTerm::L1 { abs, scale, .. } => {
                    let t = self.var_slot(*abs)?;
                    let (li, _) = self.param_slot(*scale)?;
                    grads[li][0] -= adj.dx.rows(t.offset, t.len).sum();
                }
            }
        }

        for block in &self.blocks {
            for (i, rb) in block.bounds.iter().enumerate() {
                let row = block.offset + i;
                for (source, d) in [(rb.lower, adj.dl[row]), (rb.upper, adj.du[row])] {
                    if let BoundSource::Param { kind, index, scale } = source {
                        let (pi, _) = self.param_slot(kind)?;
                        grads[pi][index] += d * scale;
                    }
                }
            }
        }

        Ok(grads)
    }

    /// Maps parameter tangents (declaration order, parameter shapes) onto the QP data at `x`.
    pub fn pushforward(&self, values: &[DMatrix<F>], x: &DVector<F>, tangents: &[DMatrix<F>]) -> DeepcResult<QpTangent<F>> {
        self.check_tangents(tangents)?;
        let nv = self.num_vars();
        let two: F = convert(2.0);
        let mut dp_x = DVector::zeros(nv);
        let mut dc = DVector::zeros(nv);

        for term in &self.costs {
            match term {
                CostTerm::WeightedSquares { var, weight, offset } => {
                    let s = self.var_slot(*var)?;
                    let w = self.value(values, *weight)?;
                    let dw = self.value(tangents, *weight)?;
                    let dm = dw.tr_mul(w) + w.tr_mul(dw);
                    let x_v = x.rows(s.offset, s.len);
                    let mut dpx = dp_x.rows_mut(s.offset, s.len);
                    dpx += (&dm * x_v).scale(two);
                    if let Some(o) = offset {
                        let o_val = self.value(values, *o)?.column(0).into_owned();
                        let d_o = self.value(tangents, *o)?.column(0).into_owned();
                        let m = w.tr_mul(w);
                        let mut dcv = dc.rows_mut(s.offset, s.len);
                        dcv -= (&dm * o_val + &m * d_o).scale(two);
                    }
                }
                CostTerm::ProjectedSquares { var, scale, gram, .. } => {
                    let s = self.var_slot(*var)?;
                    let dlam = self.value(tangents, *scale)?[0];
                    let mut dpx = dp_x.rows_mut(s.offset, s.len);
                    dpx += (gram * x.rows(s.offset, s.len)).scale(two * dlam);
                }
                CostTerm::L1 { abs, scale, .. } => {
                    let t = self.var_slot(*abs)?;
                    let dlam = self.value(tangents, *scale)?[0];
                    dc.rows_mut(t.offset, t.len).add_scalar_mut(dlam);
                }
            }
        }

        let m = self.num_constraints();
        let mut dl = DVector::zeros(m);
        let mut du = DVector::zeros(m);
        let tangent_of = |source: BoundSource<F>| -> DeepcResult<F> {
            Ok(match source {
                BoundSource::Constant(_) => convert(0.0),
                BoundSource::Param { kind, index, scale } => self.value(tangents, kind)?[index] * scale,
            })
        };
        for block in &self.blocks {
            for (i, rb) in block.bounds.iter().enumerate() {
                dl[block.offset + i] = tangent_of(rb.lower)?;
                du[block.offset + i] = tangent_of(rb.upper)?;
            }
        }

        Ok(QpTangent { dp_x, dc, dl, du })
    }

    fn check_tangents(&self, tangents: &[DMatrix<F>]) -> DeepcResult<()> {
        if tangents.len() != self.params.len() {
            return Err(DeepcError::InvalidInput(format!(
                "expected {} parameter tangents, got {}",
                self.params.len(),
                tangents.len()
            )));
        }
        for (slot, t) in self.params.iter().zip(tangents) {
            if t.shape() != (slot.rows, slot.cols) {
                return Err(DeepcError::shape(slot.kind.name(), (slot.rows, slot.cols), t.shape()));
            }
        }
        Ok(())
    }
}
