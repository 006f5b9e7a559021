//! SVD residency and the shared regularized/unregularized solve kernel.
//!
//! `svd_standard_form` / `svd_balanced` make the thin SVD of a system
//! resident in the workspace; `solve_regularized` then produces the
//! coefficient vector for any regularization strength without refactoring,
//! which is what makes the L-curve sweep cheap.

use crate::error::FitError;
use crate::faer_ndarray::{fast_atv_into, fast_av_into, norm2, svd_thin_into};
use crate::workspace::FitWorkspace;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, s};

/// Outcome of a solve: the effective rank used, the residual norm
/// `||y - X c||`, and the solution norm `||c||`.
#[derive(Debug, Clone, Copy)]
pub struct SolveOutcome {
    pub rank: usize,
    pub residual_norm: f64,
    pub solution_norm: f64,
}

/// Decompose a standard-form system, leaving its thin SVD resident in the
/// workspace. No column balancing is applied: standard-form systems are
/// already normalized by construction, and the regularization filter must
/// see the raw singular values.
pub fn svd_standard_form(
    xs: ArrayView2<'_, f64>,
    work: &mut FitWorkspace,
) -> Result<(), FitError> {
    decompose(xs, false, work)
}

/// Decompose an observation matrix with column balancing, for the
/// unregularized pipeline: each column of a staged copy is scaled by its
/// norm (recorded in the workspace) so the singular values reflect the
/// conditioning of the normalized system. The solve divides the scaling
/// back out.
pub fn svd_balanced(x: ArrayView2<'_, f64>, work: &mut FitWorkspace) -> Result<(), FitError> {
    decompose(x, true, work)
}

fn decompose(x: ArrayView2<'_, f64>, balance: bool, work: &mut FitWorkspace) -> Result<(), FitError> {
    let (n, p) = x.dim();
    if p == 0 || n < p {
        return Err(FitError::DimensionMismatch(format!(
            "SVD requires n >= p >= 1, got n={n}, p={p}"
        )));
    }
    work.check_bounds(n, p)?;

    // Stage the (optionally scaled) matrix in the arena so the SVD inputs
    // and outputs never alias.
    work.col_scale.fill(1.0);
    {
        let mut a = work.h.slice_mut(s![..n, ..p]);
        a.assign(&x);
        if balance {
            for j in 0..p {
                let mut col = a.column_mut(j);
                let d = norm2(col.view());
                if d != 0.0 {
                    col /= d;
                    work.col_scale[j] = d;
                }
            }
        }
    }

    {
        let a = work.h.slice(s![..n, ..p]);
        let mut u = work.u.slice_mut(s![..n, ..p]);
        let mut sv = work.s.slice_mut(s![..p]);
        let mut v = work.v.slice_mut(s![..p, ..p]);
        svd_thin_into(a, &mut u, &mut sv, &mut v)?;
    }

    let smax = work.s[0];
    let smin = work.s[p - 1];
    let rcond = if smax > 0.0 { smin / smax } else { 0.0 };
    work.set_decomposition(n, p, rcond);
    Ok(())
}

/// Solve the resident system for regularization strength `lambda`.
///
/// For `lambda > 0` this applies the Tikhonov filter factors
/// `f_j = s_j / (s_j^2 + lambda^2)` to the projected right-hand side. For
/// `lambda <= 0` it is the unregularized truncated-SVD solve: components
/// with `s_j <= eps * s_0` are dropped and the effective rank reported in
/// the outcome.
///
/// The residual norm accounts for the part of `ys` outside the range of
/// the thin factor whenever `n > p`.
pub fn solve_regularized(
    lambda: f64,
    ys: ArrayView1<'_, f64>,
    mut cs: ArrayViewMut1<'_, f64>,
    work: &mut FitWorkspace,
) -> Result<SolveOutcome, FitError> {
    let n = work.n();
    let p = work.p();
    if p == 0 {
        return Err(FitError::DimensionMismatch(
            "no decomposition is resident in the workspace".into(),
        ));
    }
    if ys.len() != n {
        return Err(FitError::DimensionMismatch(format!(
            "ys has length {}, expected n={n}",
            ys.len()
        )));
    }
    if cs.len() != p {
        return Err(FitError::DimensionMismatch(format!(
            "cs has length {}, expected p={p}",
            cs.len()
        )));
    }

    // Project onto the left singular vectors; dr is the energy of ys
    // outside their span.
    {
        let u = work.u.slice(s![..n, ..p]);
        let mut xt = work.xt.slice_mut(s![..p]);
        fast_atv_into(u, ys, &mut xt);
    }
    let norm_y = norm2(ys);
    let norm_uty = norm2(work.xt.slice(s![..p]));
    let dr = norm_y * norm_y - norm_uty * norm_uty;

    let (rank, mut rnorm_sq) = if lambda > 0.0 {
        let lambda_sq = lambda * lambda;
        let mut resid_sq = 0.0;
        for j in 0..p {
            let sj = work.s[j];
            let xtj = work.xt[j];
            let f = sj / (sj * sj + lambda_sq);
            work.workp[j] = f * xtj;
            let r = (1.0 - sj * f) * xtj;
            resid_sq += r * r;
        }
        (p, resid_sq)
    } else {
        let tol = f64::EPSILON;
        let s0 = work.s[0];
        let mut rank = 0usize;
        let mut excluded_sq = 0.0;
        for j in 0..p {
            let sj = work.s[j];
            let xtj = work.xt[j];
            if sj > tol * s0 {
                work.workp[j] = xtj / sj;
                rank += 1;
            } else {
                work.workp[j] = 0.0;
                excluded_sq += xtj * xtj;
            }
        }
        if rank < p {
            log::debug!("truncated SVD solve: effective rank {rank} of {p}");
        }
        (rank, excluded_sq + dr.max(0.0))
    };

    {
        let v = work.v.slice(s![..p, ..p]);
        let workp = work.workp.slice(s![..p]);
        fast_av_into(v, workp, &mut cs);
    }
    // Undo column balancing (the scaling vector is all-ones for
    // standard-form decompositions).
    for j in 0..p {
        cs[j] /= work.col_scale[j];
    }

    if lambda > 0.0 && n > p && dr > 0.0 {
        rnorm_sq += dr;
    }

    Ok(SolveOutcome {
        rank,
        residual_norm: rnorm_sq.max(0.0).sqrt(),
        solution_norm: norm2(cs.view()),
    })
}
