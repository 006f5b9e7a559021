use crate::error::FitError;
use ndarray::{Array1, Array2, ArrayView1, s};

/// Preallocated scratch arena for regularized least-squares computations.
///
/// A workspace is sized once for the largest problem shape `(nmax, pmax)`
/// it will ever see and reused across fits; no operation reallocates its
/// buffers. It also carries the thin SVD of the current system between the
/// decomposition step and the solve/L-curve steps, along with the current
/// problem shape `(n, p)`.
///
/// A workspace serves exactly one in-flight computation: every operation
/// that touches scratch takes it by `&mut`, and there is no internal
/// locking. Concurrent fits need separate workspaces.
pub struct FitWorkspace {
    nmax: usize,
    pmax: usize,
    /// Shape of the system whose SVD is currently resident (0 if none).
    n: usize,
    p: usize,
    rcond: f64,

    /// Left singular vectors of the current system, thin (n-by-p).
    pub(crate) u: Array2<f64>,
    /// Right singular vectors (p-by-p).
    pub(crate) v: Array2<f64>,
    /// Singular values, decreasing.
    pub(crate) s: Array1<f64>,
    /// Projection `U^T y` and general length-p scratch.
    pub(crate) xt: Array1<f64>,
    /// Filter-factor scratch, length p.
    pub(crate) workp: Array1<f64>,
    /// Length-n scratch.
    pub(crate) t: Array1<f64>,
    /// Column-scaling factors from balanced decomposition. Held all-ones
    /// between operations; anything that borrows it as scratch must restore
    /// that state before returning.
    pub(crate) col_scale: Array1<f64>,

    // Arena for the rank-deficient general-L transform: the orthogonal
    // factors and intermediates of the two-level QR are drawn from here
    // instead of being allocated per call. `h` doubles as the staging
    // buffer for SVD input.
    pub(crate) k: Array2<f64>,
    pub(crate) h: Array2<f64>,
    pub(crate) m1: Array2<f64>,
    /// Pseudo-inverse `L_inv = K_p R_p^{-T}` (p-by-m), kept resident between
    /// the forward transform and the back-transform. Also used as the L_k
    /// staging buffer by the Sobolev operator builder.
    pub(crate) linv: Array2<f64>,
}

impl FitWorkspace {
    /// Allocate a workspace for problems with at most `nmax` observations
    /// and `pmax` parameters.
    pub fn new(nmax: usize, pmax: usize) -> Result<Self, FitError> {
        if pmax == 0 || nmax < pmax {
            return Err(FitError::DimensionMismatch(format!(
                "workspace bounds require nmax >= pmax >= 1, got nmax={nmax}, pmax={pmax}"
            )));
        }
        Ok(Self {
            nmax,
            pmax,
            n: 0,
            p: 0,
            rcond: 0.0,
            u: Array2::zeros((nmax, pmax)),
            v: Array2::zeros((pmax, pmax)),
            s: Array1::zeros(pmax),
            xt: Array1::zeros(pmax),
            workp: Array1::zeros(pmax),
            t: Array1::zeros(nmax),
            col_scale: Array1::ones(pmax),
            k: Array2::zeros((pmax, pmax)),
            h: Array2::zeros((nmax, nmax)),
            m1: Array2::zeros((pmax, nmax)),
            linv: Array2::zeros((pmax, pmax)),
        })
    }

    pub fn nmax(&self) -> usize {
        self.nmax
    }

    pub fn pmax(&self) -> usize {
        self.pmax
    }

    /// Observation count of the resident decomposition (0 if none).
    pub fn n(&self) -> usize {
        self.n
    }

    /// Parameter count of the resident decomposition (0 if none).
    pub fn p(&self) -> usize {
        self.p
    }

    /// Reciprocal condition number `s_min / s_max` of the resident
    /// decomposition.
    pub fn rcond(&self) -> f64 {
        self.rcond
    }

    /// Singular values of the resident decomposition, decreasing.
    pub fn singular_values(&self) -> ArrayView1<'_, f64> {
        self.s.slice(s![..self.p])
    }

    pub(crate) fn set_decomposition(&mut self, n: usize, p: usize, rcond: f64) {
        self.n = n;
        self.p = p;
        self.rcond = rcond;
    }

    pub(crate) fn reset_col_scale(&mut self) {
        self.col_scale.fill(1.0);
    }

    /// Check a problem shape against the workspace bounds.
    pub(crate) fn check_bounds(&self, n: usize, p: usize) -> Result<(), FitError> {
        if n > self.nmax || p > self.pmax {
            return Err(FitError::DimensionMismatch(format!(
                "problem shape {n}x{p} exceeds workspace bounds {}x{}",
                self.nmax, self.pmax
            )));
        }
        Ok(())
    }
}
