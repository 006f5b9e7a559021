//! Standard-form transformation for Tikhonov regularization.
//!
//! A regularized problem `min ||X c - y||_W^2 + lambda^2 ||L c||^2` is
//! reparameterized so the penalty becomes the plain Euclidean norm of the
//! transformed coefficients, after which the unregularized SVD solver
//! applies. Three regimes:
//!
//! - diagonal `L`: column scaling, invertible elementwise;
//! - dense `L` with at least as many rows as columns: the penalty equals
//!   `||R c||` for the QR factor `R` of `L`;
//! - dense `L` with fewer rows than columns: `L` has a null space, and the
//!   problem splits along an orthogonal basis of it (two-level QR).
//!
//! The back-transform functions invert each regime; the rank-deficient one
//! additionally folds the unregularized residual back into solution space
//! through the reconstruction matrix computed by the forward transform.

use crate::error::FitError;
use crate::faer_ndarray::{
    fast_ab_into, fast_atb_into, fast_atv_into, fast_av_into, qr_into, solve_upper_in_place,
    solve_upper_transpose_in_place, solve_upper_vec_in_place,
};
use crate::workspace::FitWorkspace;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, s};

fn validate_diag(
    l: Option<ArrayView1<'_, f64>>,
    w: Option<ArrayView1<'_, f64>>,
    n: usize,
    p: usize,
    ys_len: usize,
    work: &FitWorkspace,
) -> Result<(), FitError> {
    work.check_bounds(n, p)?;
    if let Some(l) = l
        && l.len() != p
    {
        return Err(FitError::DimensionMismatch(format!(
            "diagonal L has length {}, expected p={p}",
            l.len()
        )));
    }
    if ys_len != n {
        return Err(FitError::DimensionMismatch(format!(
            "ys has length {ys_len}, expected n={n}"
        )));
    }
    if let Some(w) = w
        && w.len() != n
    {
        return Err(FitError::DimensionMismatch(format!(
            "weight vector has length {}, expected n={n}",
            w.len()
        )));
    }
    // Scan L before anything is written so a singular diagonal leaves the
    // outputs untouched.
    if let Some(l) = l
        && l.iter().any(|&lj| lj == 0.0)
    {
        return Err(FitError::SingularRegularizer);
    }
    Ok(())
}

fn apply_diag(
    l: Option<ArrayView1<'_, f64>>,
    w: Option<ArrayView1<'_, f64>>,
    xs: &mut ArrayViewMut2<'_, f64>,
    ys: &mut ArrayViewMut1<'_, f64>,
) {
    let (n, p) = xs.dim();
    if let Some(w) = w {
        for i in 0..n {
            // Negative weights are treated as zero, not an error.
            let swi = w[i].max(0.0).sqrt();
            let mut row = xs.row_mut(i);
            row *= swi;
            ys[i] *= swi;
        }
    }
    if let Some(l) = l {
        for j in 0..p {
            let mut col = xs.column_mut(j);
            col *= 1.0 / l[j];
        }
    }
}

/// Transform a weighted problem with diagonal regularization to standard
/// form, in place: on entry `xs` and `ys` hold `X` and `y`, on exit
/// `sqrt(W) X L^{-1}` and `sqrt(W) y`.
///
/// `l` is the diagonal of the regularization matrix (`None` for the
/// identity); `w` the observation weights (`None` for unweighted).
pub fn to_standard_form_diag_in_place(
    l: Option<ArrayView1<'_, f64>>,
    w: Option<ArrayView1<'_, f64>>,
    mut xs: ArrayViewMut2<'_, f64>,
    mut ys: ArrayViewMut1<'_, f64>,
    work: &FitWorkspace,
) -> Result<(), FitError> {
    let (n, p) = xs.dim();
    validate_diag(l, w, n, p, ys.len(), work)?;
    apply_diag(l, w, &mut xs, &mut ys);
    Ok(())
}

/// Copying variant of [`to_standard_form_diag_in_place`]: reads `X`/`y`
/// and writes the standard-form system into `xs`/`ys`.
pub fn to_standard_form_diag(
    l: Option<ArrayView1<'_, f64>>,
    x: ArrayView2<'_, f64>,
    w: Option<ArrayView1<'_, f64>>,
    y: ArrayView1<'_, f64>,
    mut xs: ArrayViewMut2<'_, f64>,
    mut ys: ArrayViewMut1<'_, f64>,
    work: &FitWorkspace,
) -> Result<(), FitError> {
    let (n, p) = x.dim();
    if xs.dim() != (n, p) {
        return Err(FitError::DimensionMismatch(format!(
            "Xs is {}x{}, expected {n}x{p}",
            xs.nrows(),
            xs.ncols()
        )));
    }
    if y.len() != n {
        return Err(FitError::DimensionMismatch(format!(
            "y has length {}, expected n={n}",
            y.len()
        )));
    }
    validate_diag(l, w, n, p, ys.len(), work)?;
    xs.assign(&x);
    ys.assign(&y);
    apply_diag(l, w, &mut xs, &mut ys);
    Ok(())
}

/// Back-transform a standard-form solution for diagonal regularization:
/// `c = cs / l` elementwise.
pub fn from_standard_form_diag(
    l: ArrayView1<'_, f64>,
    cs: ArrayView1<'_, f64>,
    mut c: ArrayViewMut1<'_, f64>,
    work: &FitWorkspace,
) -> Result<(), FitError> {
    if l.len() > work.pmax() {
        return Err(FitError::DimensionMismatch(format!(
            "diagonal L has length {}, workspace bound is pmax={}",
            l.len(),
            work.pmax()
        )));
    }
    if cs.len() != l.len() || c.len() != l.len() {
        return Err(FitError::DimensionMismatch(format!(
            "cs has length {}, c has length {}, expected {}",
            cs.len(),
            c.len(),
            l.len()
        )));
    }
    for j in 0..l.len() {
        c[j] = cs[j] / l[j];
    }
    Ok(())
}

/// Transform a problem with a general (dense) m-by-p regularization matrix
/// to standard form.
///
/// For `m >= p` the standard-form system keeps the original shape:
/// `xs` is n-by-p, `ys` has length n, and `m_out` (m-by-p) stores the QR
/// factor `R` of `L` in its top p-by-p block for the back-transform.
///
/// For `m < p` the system is reduced: `xs` is (n-p+m)-by-m, `ys` has length
/// n-p+m, and `m_out` (p-by-n) is the reconstruction map that folds the
/// unregularized residual back into solution space. The workspace retains
/// the pseudo-inverse of `L`, so the back-transform must use the same
/// workspace. Weighted fits are not supported in this regime.
pub fn to_standard_form_general(
    l: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    w: Option<ArrayView1<'_, f64>>,
    y: ArrayView1<'_, f64>,
    mut xs: ArrayViewMut2<'_, f64>,
    mut ys: ArrayViewMut1<'_, f64>,
    mut m_out: ArrayViewMut2<'_, f64>,
    work: &mut FitWorkspace,
) -> Result<(), FitError> {
    let (m, lp) = l.dim();
    let (n, p) = x.dim();

    work.check_bounds(n, p)?;
    if lp != p {
        return Err(FitError::DimensionMismatch(format!(
            "L has {lp} columns, X has {p}"
        )));
    }
    if m == 0 {
        return Err(FitError::DimensionMismatch(
            "regularization matrix has no rows".into(),
        ));
    }
    if y.len() != n {
        return Err(FitError::DimensionMismatch(format!(
            "y has length {}, expected n={n}",
            y.len()
        )));
    }
    if let Some(w) = w
        && w.len() != n
    {
        return Err(FitError::DimensionMismatch(format!(
            "weight vector has length {}, expected n={n}",
            w.len()
        )));
    }

    if m >= p {
        if xs.dim() != (n, p) {
            return Err(FitError::DimensionMismatch(format!(
                "Xs is {}x{}, expected {n}x{p}",
                xs.nrows(),
                xs.ncols()
            )));
        }
        if ys.len() != n {
            return Err(FitError::DimensionMismatch(format!(
                "ys has length {}, expected n={n}",
                ys.len()
            )));
        }
        if m_out.dim() != (m, p) {
            return Err(FitError::DimensionMismatch(format!(
                "M is {}x{}, expected {m}x{p}",
                m_out.nrows(),
                m_out.ncols()
            )));
        }

        // ||L c|| = ||R c|| for the square/tall case, so the transform is
        // a triangular solve against R^T applied to each row of X.
        m_out.fill(0.0);
        {
            let mut r = m_out.slice_mut(s![..p, ..p]);
            qr_into(l, None, &mut r);
        }

        xs.assign(&x);
        ys.assign(&y);
        apply_diag(None, w, &mut xs, &mut ys);

        let r = m_out.slice(s![..p, ..p]);
        let mut xs_t = xs.view_mut().reversed_axes();
        solve_upper_transpose_in_place(r, &mut xs_t);

        Ok(())
    } else {
        let pm = p - m;

        if w.is_some() {
            return Err(FitError::UnsupportedWeights);
        }
        if n < p {
            return Err(FitError::DimensionMismatch(format!(
                "rank-deficient transform requires n >= p, got n={n}, p={p}"
            )));
        }
        let npm = n - pm;
        if xs.dim() != (npm, m) {
            return Err(FitError::DimensionMismatch(format!(
                "Xs is {}x{}, expected {npm}x{m}",
                xs.nrows(),
                xs.ncols()
            )));
        }
        if ys.len() != npm {
            return Err(FitError::DimensionMismatch(format!(
                "ys has length {}, expected {npm}",
                ys.len()
            )));
        }
        if m_out.dim() != (p, n) {
            return Err(FitError::DimensionMismatch(format!(
                "M is {}x{}, expected {p}x{n}",
                m_out.nrows(),
                m_out.ncols()
            )));
        }

        // [K, R] = qr(L^T); the trailing p-m columns of K span null(L).
        {
            let mut kq = work.k.slice_mut(s![..p, ..p]);
            let mut rp = work.v.slice_mut(s![..m, ..m]);
            qr_into(l.reversed_axes(), Some(&mut kq), &mut rp);
        }

        // L_inv = K_p R_p^{-T}, solved row by row: R_p L_inv^T = K_p^T.
        {
            let kp = work.k.slice(s![..p, ..m]);
            let mut linv = work.linv.slice_mut(s![..p, ..m]);
            linv.assign(&kp);
            let rp = work.v.slice(s![..m, ..m]);
            let mut linv_t = linv.reversed_axes();
            solve_upper_in_place(rp, &mut linv_t);
        }

        // [H, T] = qr(X K_o).
        {
            let ko = work.k.slice(s![..p, m..p]);
            let mut b = work.u.slice_mut(s![..n, ..pm]);
            fast_ab_into(x, ko, &mut b);
        }
        {
            let b = work.u.slice(s![..n, ..pm]);
            let mut hq = work.h.slice_mut(s![..n, ..n]);
            let mut to = work.v.slice_mut(s![..pm, ..pm]);
            qr_into(b, Some(&mut hq), &mut to);
        }

        // ys = H_q^T y, the reduced right-hand side.
        {
            let h_q = work.h.slice(s![..n, pm..n]);
            fast_atv_into(h_q, y, &mut ys);
        }

        // Reconstruction map M = K_o (T_o^{-1} H_o^T).
        {
            let h_o = work.h.slice(s![..n, ..pm]);
            let mut m1 = work.m1.slice_mut(s![..pm, ..n]);
            m1.assign(&h_o.reversed_axes());
            let to = work.v.slice(s![..pm, ..pm]);
            solve_upper_in_place(to, &mut m1);
        }
        {
            let ko = work.k.slice(s![..p, m..p]);
            let m1 = work.m1.slice(s![..pm, ..n]);
            fast_ab_into(ko, m1, &mut m_out);
        }

        // Xs = (H_q^T X) L_inv, the reduced system matrix.
        {
            let h_q = work.h.slice(s![..n, pm..n]);
            let mut c = work.u.slice_mut(s![..npm, ..p]);
            fast_atb_into(h_q, x, &mut c);
        }
        {
            let c = work.u.slice(s![..npm, ..p]);
            let linv = work.linv.slice(s![..p, ..m]);
            fast_ab_into(c, linv, &mut xs);
        }

        Ok(())
    }
}

/// Back-transform a standard-form solution for a general regularization
/// matrix, using the reconstruction matrix `m_in` produced by
/// [`to_standard_form_general`].
///
/// For `m < p` the workspace must be the one that performed the forward
/// transform (it holds the resident pseudo-inverse of `L`), and the
/// original `x` and `y` enter through the residual correction
/// `c = L_inv cs + M (y - X L_inv cs)`.
pub fn from_standard_form_general(
    l: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    cs: ArrayView1<'_, f64>,
    m_in: ArrayView2<'_, f64>,
    mut c: ArrayViewMut1<'_, f64>,
    work: &mut FitWorkspace,
) -> Result<(), FitError> {
    let (m, lp) = l.dim();
    let (n, p) = x.dim();

    work.check_bounds(n, p)?;
    if lp != p {
        return Err(FitError::DimensionMismatch(format!(
            "L has {lp} columns, X has {p}"
        )));
    }
    if c.len() != p {
        return Err(FitError::DimensionMismatch(format!(
            "c has length {}, expected p={p}",
            c.len()
        )));
    }
    if y.len() != n {
        return Err(FitError::DimensionMismatch(format!(
            "y has length {}, expected n={n}",
            y.len()
        )));
    }

    if m >= p {
        if cs.len() != p {
            return Err(FitError::DimensionMismatch(format!(
                "cs has length {}, expected p={p}",
                cs.len()
            )));
        }
        if m_in.dim() != (m, p) {
            return Err(FitError::DimensionMismatch(format!(
                "M is {}x{}, expected {m}x{p}",
                m_in.nrows(),
                m_in.ncols()
            )));
        }

        // Solve R c = cs with the R factor stored by the forward transform.
        c.assign(&cs);
        let r = m_in.slice(s![..p, ..p]);
        solve_upper_vec_in_place(r, &mut c);
        Ok(())
    } else {
        if cs.len() != m {
            return Err(FitError::DimensionMismatch(format!(
                "cs has length {}, expected m={m}",
                cs.len()
            )));
        }
        if m_in.dim() != (p, n) {
            return Err(FitError::DimensionMismatch(format!(
                "M is {}x{}, expected {p}x{n}",
                m_in.nrows(),
                m_in.ncols()
            )));
        }

        // lc = L_inv cs, the minimum-seminorm particular solution.
        {
            let linv = work.linv.slice(s![..p, ..m]);
            let mut lc = work.xt.slice_mut(s![..p]);
            fast_av_into(linv, cs, &mut lc);
        }

        // resid = y - X lc.
        {
            let lc = work.xt.slice(s![..p]);
            let mut resid = work.t.slice_mut(s![..n]);
            fast_av_into(x, lc, &mut resid);
            for i in 0..n {
                resid[i] = y[i] - resid[i];
            }
        }

        // c = lc + M resid.
        {
            let resid = work.t.slice(s![..n]);
            fast_av_into(m_in, resid, &mut c);
        }
        let lc = work.xt.slice(s![..p]);
        c += &lc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::FitWorkspace;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn diag_transform_scales_columns_and_rows() {
        let work = FitWorkspace::new(4, 2).unwrap();
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let y = array![1.0, 2.0, 3.0];
        let l = array![2.0, 4.0];
        let w = array![4.0, 1.0, -1.0];

        let mut xs = Array2::<f64>::zeros((3, 2));
        let mut ys = Array1::<f64>::zeros(3);
        to_standard_form_diag(
            Some(l.view()),
            x.view(),
            Some(w.view()),
            y.view(),
            xs.view_mut(),
            ys.view_mut(),
            &work,
        )
        .unwrap();

        // Row 0 scaled by 2, row 1 by 1, row 2 clamped to weight zero.
        assert_abs_diff_eq!(xs[[0, 0]], 2.0 * 1.0 / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(xs[[0, 1]], 2.0 * 2.0 / 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(xs[[1, 0]], 3.0 / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(xs[[2, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ys[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ys[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn diag_transform_rejects_zero_entry_before_writing() {
        let work = FitWorkspace::new(4, 2).unwrap();
        let l = array![1.0, 0.0];
        let mut xs = array![[1.0, 2.0], [3.0, 4.0]];
        let mut ys = array![5.0, 6.0];
        let err = to_standard_form_diag_in_place(
            Some(l.view()),
            None,
            xs.view_mut(),
            ys.view_mut(),
            &work,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::SingularRegularizer));
        // Fail fast: nothing was mutated.
        assert_eq!(xs, array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(ys, array![5.0, 6.0]);
    }

    #[test]
    fn diag_back_transform_divides() {
        let work = FitWorkspace::new(4, 3).unwrap();
        let l = array![2.0, 4.0, 8.0];
        let cs = array![2.0, 4.0, 8.0];
        let mut c = Array1::<f64>::zeros(3);
        from_standard_form_diag(l.view(), cs.view(), c.view_mut(), &work).unwrap();
        assert_eq!(c, array![1.0, 1.0, 1.0]);
    }

    #[test]
    fn general_tall_matches_diagonal_transform() {
        // A diagonal matrix fed through the dense m >= p path must agree
        // with the dedicated diagonal path.
        let mut work = FitWorkspace::new(6, 3).unwrap();
        let x = array![
            [1.0, 0.5, -0.2],
            [0.3, 2.0, 0.7],
            [-1.0, 0.4, 1.1],
            [0.6, -0.8, 0.9]
        ];
        let y = array![1.0, -0.5, 2.0, 0.25];
        let diag = array![2.0, 3.0, 0.5];
        let mut l = Array2::<f64>::zeros((3, 3));
        for j in 0..3 {
            l[[j, j]] = diag[j];
        }

        let mut xs_dense = Array2::<f64>::zeros((4, 3));
        let mut ys_dense = Array1::<f64>::zeros(4);
        let mut m_out = Array2::<f64>::zeros((3, 3));
        to_standard_form_general(
            l.view(),
            x.view(),
            None,
            y.view(),
            xs_dense.view_mut(),
            ys_dense.view_mut(),
            m_out.view_mut(),
            &mut work,
        )
        .unwrap();

        let mut xs_diag = Array2::<f64>::zeros((4, 3));
        let mut ys_diag = Array1::<f64>::zeros(4);
        to_standard_form_diag(
            Some(diag.view()),
            x.view(),
            None,
            y.view(),
            xs_diag.view_mut(),
            ys_diag.view_mut(),
            &work,
        )
        .unwrap();

        // QR of a diagonal matrix is sign-ambiguous per column, so compare
        // column norms rather than entries.
        for j in 0..3 {
            let dense_norm: f64 = xs_dense.column(j).iter().map(|v| v * v).sum();
            let diag_norm: f64 = xs_diag.column(j).iter().map(|v| v * v).sum();
            assert_abs_diff_eq!(dense_norm, diag_norm, epsilon = 1e-10);
        }
        for i in 0..4 {
            assert_abs_diff_eq!(ys_dense[i], ys_diag[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn rank_deficient_rejects_weights() {
        let mut work = FitWorkspace::new(6, 3).unwrap();
        let l = array![[1.0, -1.0, 0.0], [0.0, 1.0, -1.0]];
        let x = Array2::<f64>::eye(3);
        let y = array![1.0, 2.0, 3.0];
        let w = array![1.0, 1.0, 1.0];
        let mut xs = Array2::<f64>::zeros((2, 2));
        let mut ys = Array1::<f64>::zeros(2);
        let mut m_out = Array2::<f64>::zeros((3, 3));
        let err = to_standard_form_general(
            l.view(),
            x.view(),
            Some(w.view()),
            y.view(),
            xs.view_mut(),
            ys.view_mut(),
            m_out.view_mut(),
            &mut work,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::UnsupportedWeights));
    }
}
