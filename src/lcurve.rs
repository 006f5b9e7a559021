//! L-curve analysis: regularization-parameter grids, residual/solution
//! norm sweeps, and corner detection by discrete curvature.

use crate::error::FitError;
use crate::faer_ndarray::{fast_atv_into, norm2};
use crate::workspace::FitWorkspace;
use ndarray::{ArrayView1, ArrayViewMut1, s};

/// Fill `grid` with regularization parameters spanning the singular-value
/// range of the system, log-spaced and strictly decreasing.
///
/// `smin` is floored at `16 * eps * smax` so the smallest parameter stays
/// numerically meaningful; the first entry lands on `smax` up to roundoff
/// and the last equals the floored `smin`. Requires `smax > 0` and at
/// least 3 grid points.
pub fn reg_param_grid(
    smin: f64,
    smax: f64,
    grid: ArrayViewMut1<'_, f64>,
) -> Result<(), FitError> {
    if grid.len() < 3 {
        return Err(FitError::DimensionMismatch(format!(
            "at least 3 grid points are needed, got {}",
            grid.len()
        )));
    }
    fill_reg_param(smin, smax, grid)
}

fn fill_reg_param(
    smin: f64,
    smax: f64,
    mut grid: ArrayViewMut1<'_, f64>,
) -> Result<(), FitError> {
    if smax <= 0.0 {
        return Err(FitError::NonPositiveSingularValue);
    }
    let nt = grid.len();
    debug_assert!(nt >= 2);

    let floored_smin = smin.max(16.0 * f64::EPSILON * smax);
    if floored_smin > smin {
        log::debug!("regularization grid floor raised smin {smin:.3e} -> {floored_smin:.3e}");
    }

    // Fill backward so the last entry is exact and the first lands on smax.
    grid[nt - 1] = floored_smin;
    let ratio = (smax / floored_smin).powf(1.0 / (nt as f64 - 1.0));
    for i in (0..nt - 1).rev() {
        grid[i] = ratio * grid[i + 1];
    }
    Ok(())
}

/// Sweep the L-curve of the resident standard-form system.
///
/// The decomposition must already be resident in the workspace (see
/// [`crate::solver::svd_standard_form`]). Fills `reg_param` with the
/// parameter grid and, for each value, `rho` with the residual norm and
/// `eta` with the solution seminorm. When `n > p`, the residual norms are
/// corrected for the component of `y` outside the thin factor's range.
pub fn lcurve(
    y: ArrayView1<'_, f64>,
    mut reg_param: ArrayViewMut1<'_, f64>,
    mut rho: ArrayViewMut1<'_, f64>,
    mut eta: ArrayViewMut1<'_, f64>,
    work: &mut FitWorkspace,
) -> Result<(), FitError> {
    let n = work.n();
    let p = work.p();
    if p == 0 {
        return Err(FitError::DimensionMismatch(
            "no decomposition is resident in the workspace".into(),
        ));
    }
    if y.len() != n {
        return Err(FitError::DimensionMismatch(format!(
            "y has length {}, expected n={n}",
            y.len()
        )));
    }
    let nt = rho.len();
    if nt < 3 {
        return Err(FitError::DimensionMismatch(format!(
            "at least 3 points are needed for L-curve analysis, got {nt}"
        )));
    }
    if eta.len() != nt || reg_param.len() != nt {
        return Err(FitError::DimensionMismatch(format!(
            "reg_param/rho/eta lengths disagree: {}/{nt}/{}",
            reg_param.len(),
            eta.len()
        )));
    }

    {
        let u = work.u.slice(s![..n, ..p]);
        let mut xt = work.xt.slice_mut(s![..p]);
        fast_atv_into(u, y, &mut xt);
    }
    let norm_y = norm2(y);
    let norm_uty = norm2(work.xt.slice(s![..p]));
    let dr = norm_y * norm_y - norm_uty * norm_uty;

    let smax = work.s[0];
    let smin = work.s[p - 1];
    fill_reg_param(smin, smax, reg_param.view_mut())?;
    let reg_param = reg_param.view();

    for i in 0..nt {
        let lambda = reg_param[i];
        let lambda_sq = lambda * lambda;
        // col_scale doubles as the residual-term scratch here and is
        // restored to all-ones below.
        for j in 0..p {
            let sj = work.s[j];
            let xtj = work.xt[j];
            let f = sj / (sj * sj + lambda_sq);
            work.workp[j] = f * xtj;
            work.col_scale[j] = (1.0 - sj * f) * xtj;
        }
        eta[i] = norm2(work.workp.slice(s![..p]));
        rho[i] = norm2(work.col_scale.slice(s![..p]));
    }

    if n > p && dr > 0.0 {
        for i in 0..nt {
            rho[i] = (rho[i] * rho[i] + dr).sqrt();
        }
    }

    work.reset_col_scale();
    Ok(())
}

/// Sliding-triple circumradius search shared by the two corner variants.
///
/// For each interior index the circle through the previous, current, and
/// next point is fitted; its radius estimates the curvature at the middle
/// point, and the smallest finite radius wins (first occurrence on ties).
/// Nearly colinear triples produce a non-finite radius and are skipped.
fn corner_search<F>(len: usize, point: F) -> Result<usize, FitError>
where
    F: Fn(usize) -> (f64, f64),
{
    let (mut x1, mut y1) = point(0);
    let (mut x2, mut y2) = point(1);
    let mut best: Option<(f64, usize)> = None;

    for i in 1..len - 1 {
        let (x3, y3) = point(i + 1);

        let x21 = x2 - x1;
        let y21 = y2 - y1;
        let x31 = x3 - x1;
        let y31 = y3 - y1;
        let x32 = x3 - x2;
        let y32 = y3 - y2;
        let h21 = x21 * x21 + y21 * y21;
        let h31 = x31 * x31 + y31 * y31;
        let h32 = x32 * x32 + y32 * y32;
        let d = (2.0 * (x21 * y31 - x31 * y21)).abs();
        let r = (h21 * h31 * h32).sqrt() / d;

        if r.is_finite() && best.is_none_or(|(rmin, _)| r < rmin) {
            best = Some((r, i));
        }

        x1 = x2;
        y1 = y2;
        x2 = x3;
        y2 = y3;
    }

    best.map(|(_, i)| i).ok_or(FitError::DegenerateCurve)
}

/// Find the index of maximum curvature on the L-curve, working in
/// `(log rho, log eta)` coordinates.
pub fn lcurve_corner(
    rho: ArrayView1<'_, f64>,
    eta: ArrayView1<'_, f64>,
) -> Result<usize, FitError> {
    if rho.len() < 3 {
        return Err(FitError::DimensionMismatch(format!(
            "at least 3 points are needed for L-curve analysis, got {}",
            rho.len()
        )));
    }
    if rho.len() != eta.len() {
        return Err(FitError::DimensionMismatch(format!(
            "rho and eta lengths disagree: {} vs {}",
            rho.len(),
            eta.len()
        )));
    }
    corner_search(rho.len(), |i| (rho[i].ln(), eta[i].ln()))
}

/// Find the index of maximum curvature on the `(lambda^2, eta^2)` variant
/// of the L-curve.
pub fn lcurve_corner_squared(
    reg_param: ArrayView1<'_, f64>,
    eta: ArrayView1<'_, f64>,
) -> Result<usize, FitError> {
    if reg_param.len() < 3 {
        return Err(FitError::DimensionMismatch(format!(
            "at least 3 points are needed for L-curve analysis, got {}",
            reg_param.len()
        )));
    }
    if reg_param.len() != eta.len() {
        return Err(FitError::DimensionMismatch(format!(
            "reg_param and eta lengths disagree: {} vs {}",
            reg_param.len(),
            eta.len()
        )));
    }
    corner_search(reg_param.len(), |i| {
        (reg_param[i] * reg_param[i], eta[i] * eta[i])
    })
}
