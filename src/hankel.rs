use log::debug;
use nalgebra::{DMatrix, RealField, Scalar, SimdRealField, convert};

use crate::error::{DeepcError, DeepcResult};

/// Recorded input/output trajectories, one row per sample.
#[derive(Debug, Clone)]
pub struct TrajectoryLog<F> {
    pub u: DMatrix<F>, // T * m
    pub y: DMatrix<F>, // T * p
}

impl<F> TrajectoryLog<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(u: DMatrix<F>, y: DMatrix<F>) -> DeepcResult<Self> {
        if u.nrows() != y.nrows() {
            return Err(DeepcError::Configuration(format!(
                "input log has {} samples but output log has {}",
                u.nrows(),
                y.nrows()
            )));
        }
        Ok(Self { u, y })
    }

    /// Number of samples `T`.
    pub fn len(&self) -> usize {
        self.u.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.u.nrows() == 0
    }

    pub fn input_dim(&self) -> usize {
        self.u.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.y.ncols()
    }
}

/// Rows of `m` laid out back to back, i.e. the time series as one flat signal.
pub(crate) fn flatten<F: Scalar + Copy>(m: &DMatrix<F>) -> Vec<F> {
    m.transpose().as_slice().to_vec()
}

/// Block Hankel matrix of depth `depth` over a flat signal made of blocks of `width` entries.
///
/// Column `i` is the window `w[i*width .. (i+depth)*width]`, so consecutive
/// columns overlap in all but one block.
pub fn block_hankel<F>(w: &[F], depth: usize, width: usize) -> DeepcResult<DMatrix<F>>
where
    F: Scalar + Copy,
{
    if width == 0 || depth == 0 {
        return Err(DeepcError::InvalidInput(format!(
            "depth ({depth}) and block width ({width}) must both be positive"
        )));
    }
    if w.len() % width != 0 {
        return Err(DeepcError::InvalidInput(format!(
            "signal length {} is not a multiple of the block width {width}",
            w.len()
        )));
    }
    let blocks = w.len() / width;
    if blocks < depth {
        return Err(DeepcError::InvalidInput(format!(
            "signal of {blocks} blocks is shorter than the window depth {depth}"
        )));
    }
    let cols = blocks - depth + 1;
    Ok(DMatrix::from_fn(depth * width, cols, |i, j| w[j * width + i]))
}

/// Numerical rank with the usual `σ_max · max(rows, cols) · ε` cut-off.
pub fn numerical_rank<F>(h: &DMatrix<F>) -> usize
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    if h.is_empty() {
        return 0;
    }
    let sv = h.singular_values();
    let scale: F = convert(h.nrows().max(h.ncols()) as f64 * f64::EPSILON);
    let tol = sv.max() * scale;
    sv.iter().filter(|s| **s > tol).count()
}

/// Checks that the input log is persistently exciting of order `tini + n + p`.
pub fn check_persistent_excitation<F>(u: &DMatrix<F>, tini: usize, n: usize, p: usize) -> DeepcResult<()>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    let depth = tini + n + p;
    let h = block_hankel(&flatten(u), depth, u.ncols()).map_err(|e| {
        DeepcError::Configuration(format!(
            "cannot build the depth-{depth} excitation matrix from {} samples: {e}",
            u.nrows()
        ))
    })?;

    let required = h.nrows();
    let rank = numerical_rank(&h);
    debug!("Excitation matrix {}x{} has rank {}", h.nrows(), h.ncols(), rank);

    if rank != required {
        return Err(DeepcError::NotPersistentlyExciting { rank, required });
    }
    Ok(())
}

/// Past and future blocks of the input and output Hankel matrices.
#[derive(Debug, Clone)]
pub struct DataMatrices<F> {
    pub up: DMatrix<F>, // Tini*m * g_dim
    pub yp: DMatrix<F>, // Tini*p * g_dim
    pub uf: DMatrix<F>, // N*m * g_dim
    pub yf: DMatrix<F>, // N*p * g_dim
    pub tini: usize,
    pub n: usize,
    pub m: usize,
    pub p: usize,
}

impl<F> DataMatrices<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn from_log(log: &TrajectoryLog<F>, tini: usize, n: usize) -> DeepcResult<Self> {
        let m = log.input_dim();
        let p = log.output_dim();

        let u = block_hankel(&flatten(&log.u), tini + n, m)?;
        let y = block_hankel(&flatten(&log.y), tini + n, p)?;

        Ok(Self {
            up: u.rows(0, tini * m).into_owned(),
            uf: u.rows(tini * m, n * m).into_owned(),
            yp: y.rows(0, tini * p).into_owned(),
            yf: y.rows(tini * p, n * p).into_owned(),
            tini,
            n,
            m,
            p,
        })
    }

    /// Number of trajectory combination coefficients, `T - Tini - N + 1`.
    pub fn g_dim(&self) -> usize {
        self.uf.ncols()
    }

    /// `[Up; Yp; Uf]`, the matrix whose row space defines the nonlinear regulariser.
    pub fn stacked_past_and_future_inputs(&self) -> DMatrix<F> {
        let rows = self.up.nrows() + self.yp.nrows() + self.uf.nrows();
        let mut h = DMatrix::zeros(rows, self.g_dim());
        let mut at = 0;
        for block in [&self.up, &self.yp, &self.uf] {
            h.rows_mut(at, block.nrows()).copy_from(block);
            at += block.nrows();
        }
        h
    }
}
