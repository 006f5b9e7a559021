use dyn_stack::{MemBuffer, MemStack};
use faer::diag::Diag;
use faer::linalg::matmul::matmul;
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::linalg::{solvers, triangular_solve};
use faer::{Accum, MatMut, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Small, centralized dispatch policy:
    // - stay on ndarray for tiny products to avoid setup overhead,
    // - switch to faer GEMM/GEMV for moderate+ sizes.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
fn matmul_par(m: usize, n: usize, k: usize) -> Par {
    if m < 128 || n < 128 || k < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    }
}

#[inline]
pub fn view2_to_mat_mut<'a>(array: &'a mut ArrayViewMut2<'_, f64>) -> MatMut<'a, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];

    // SAFETY: the pointer, shape, and strides come directly from a live,
    // uniquely borrowed ndarray view.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn view1_to_col_mat_mut<'a>(array: &'a mut ArrayViewMut1<'_, f64>) -> MatMut<'a, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: as above; the column stride is irrelevant for one column.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

/// Read-only faer view over an ndarray matrix view.
///
/// Layouts that could alias or reverse memory traversal (negative or zero
/// strides) are materialized into a compact owned copy instead of being
/// handed to faer kernels directly.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new(array: ArrayView2<'a, f64>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come from a live ndarray view
        // with positive strides, or from the owned compact copy stored inside
        // this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

/// Read-only faer column view over an ndarray vector view.
pub struct FaerColView<'a> {
    ptr: *const f64,
    len: usize,
    stride: isize,
    owned: Option<Array1<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerColView<'a> {
    pub fn new(array: ArrayView1<'a, f64>) -> Self {
        let len = array.len();
        let stride = array.strides()[0];
        if stride <= 0 {
            let owned = array.to_owned();
            return Self {
                ptr: owned.as_ptr(),
                len,
                stride: 1,
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            len,
            stride,
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, len, stride) = if let Some(owned) = &self.owned {
            (owned.as_ptr(), owned.len(), 1)
        } else {
            (self.ptr, self.len, self.stride)
        };
        // SAFETY: analogous to FaerArrayView::as_ref.
        unsafe { MatRef::from_raw_parts(ptr, len, 1, stride, 0) }
    }
}

/// Euclidean norm of a vector view.
#[inline]
pub fn norm2(v: ArrayView1<'_, f64>) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Compute `out = A * B`.
pub fn fast_ab_into(
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    out: &mut ArrayViewMut2<'_, f64>,
) {
    let (m, k) = a.dim();
    let (k_b, n) = b.dim();
    debug_assert_eq!(k, k_b, "A and B must have compatible inner dimensions");
    debug_assert_eq!(out.dim(), (m, n), "output shape must be m-by-n");

    if !should_use_faer_matmul(m, n, k) {
        out.assign(&a.dot(&b));
        return;
    }

    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    let par = matmul_par(m, n, k);
    matmul(
        view2_to_mat_mut(out),
        Accum::Replace,
        a_view.as_ref(),
        b_view.as_ref(),
        1.0,
        par,
    );
}

/// Compute `out = A^T * B` for A of shape (k, m) and B of shape (k, n).
pub fn fast_atb_into(
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    out: &mut ArrayViewMut2<'_, f64>,
) {
    let (k, m) = a.dim();
    let (k_b, n) = b.dim();
    debug_assert_eq!(k, k_b, "A and B must have the same number of rows");
    debug_assert_eq!(out.dim(), (m, n), "output shape must be m-by-n");

    if !should_use_faer_matmul(m, n, k) {
        out.assign(&a.t().dot(&b));
        return;
    }

    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    let par = matmul_par(m, n, k);
    matmul(
        view2_to_mat_mut(out),
        Accum::Replace,
        a_view.as_ref().transpose(),
        b_view.as_ref(),
        1.0,
        par,
    );
}

/// Compute `out = A * v`.
pub fn fast_av_into(
    a: ArrayView2<'_, f64>,
    v: ArrayView1<'_, f64>,
    out: &mut ArrayViewMut1<'_, f64>,
) {
    let (m, k) = a.dim();
    debug_assert_eq!(v.len(), k, "vector length must match A columns");
    debug_assert_eq!(out.len(), m, "output length must match A rows");

    if !should_use_faer_matmul(m, 1, k) {
        out.assign(&a.dot(&v));
        return;
    }

    let a_view = FaerArrayView::new(a);
    let v_view = FaerColView::new(v);
    let par = matmul_par(m, 1, k);
    matmul(
        view1_to_col_mat_mut(out),
        Accum::Replace,
        a_view.as_ref(),
        v_view.as_ref(),
        1.0,
        par,
    );
}

/// Compute `out = A^T * v` for A of shape (k, m) and v of length k.
pub fn fast_atv_into(
    a: ArrayView2<'_, f64>,
    v: ArrayView1<'_, f64>,
    out: &mut ArrayViewMut1<'_, f64>,
) {
    let (k, m) = a.dim();
    debug_assert_eq!(v.len(), k, "vector length must match A rows");
    debug_assert_eq!(out.len(), m, "output length must match A columns");

    if !should_use_faer_matmul(m, 1, k) {
        out.assign(&a.t().dot(&v));
        return;
    }

    let a_view = FaerArrayView::new(a);
    let v_view = FaerColView::new(v);
    let par = matmul_par(m, 1, k);
    matmul(
        view1_to_col_mat_mut(out),
        Accum::Replace,
        a_view.as_ref().transpose(),
        v_view.as_ref(),
        1.0,
        par,
    );
}

/// Accumulate `out += A^T * A` for A of shape (k, m).
pub fn fast_ata_acc_into(a: ArrayView2<'_, f64>, out: &mut ArrayViewMut2<'_, f64>) {
    let (k, m) = a.dim();
    debug_assert_eq!(out.dim(), (m, m), "output must be m-by-m");

    if !should_use_faer_matmul(m, m, k) {
        *out += &a.t().dot(&a);
        return;
    }

    let a_view = FaerArrayView::new(a);
    let a_ref = a_view.as_ref();
    let par = matmul_par(m, m, k);
    matmul(
        view2_to_mat_mut(out),
        Accum::Add,
        a_ref.transpose(),
        a_ref,
        1.0,
        par,
    );
}

/// Thin SVD `A = U S V^T` of a tall matrix, written into caller buffers.
///
/// `u` must be (rows, cols), `s` length cols, `v` (cols, cols); requires
/// `rows >= cols`. Singular values come back in decreasing order.
pub fn svd_thin_into(
    a: ArrayView2<'_, f64>,
    u: &mut ArrayViewMut2<'_, f64>,
    s: &mut ArrayViewMut1<'_, f64>,
    v: &mut ArrayViewMut2<'_, f64>,
) -> Result<(), FaerLinalgError> {
    let (rows, cols) = a.dim();
    debug_assert!(rows >= cols, "thin SVD expects a tall matrix");
    debug_assert_eq!(u.dim(), (rows, cols));
    debug_assert_eq!(s.len(), cols);
    debug_assert_eq!(v.dim(), (cols, cols));

    let a_view = FaerArrayView::new(a);
    let par = get_global_parallelism();
    let mut singular = Diag::<f64>::zeros(cols);
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::Thin,
        ComputeSvdVectors::Thin,
        par,
        Default::default(),
    ));
    let stack = MemStack::new(&mut mem);

    svd::svd(
        a_view.as_ref(),
        singular.as_mut(),
        Some(view2_to_mat_mut(u)),
        Some(view2_to_mat_mut(v)),
        par,
        stack,
        Default::default(),
    )
    .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

    let sing_mat = singular.as_ref().column_vector().as_mat();
    for i in 0..cols {
        s[i] = sing_mat[(i, 0)];
    }
    Ok(())
}

/// QR decomposition of a tall matrix.
///
/// Writes the upper-triangular factor (cols-by-cols, strict lower triangle
/// zeroed) into `r`, and the full rows-by-rows orthogonal factor into `q`
/// when requested.
pub fn qr_into(
    a: ArrayView2<'_, f64>,
    q: Option<&mut ArrayViewMut2<'_, f64>>,
    r: &mut ArrayViewMut2<'_, f64>,
) {
    let (rows, cols) = a.dim();
    debug_assert!(rows >= cols, "QR helper expects a tall matrix");
    debug_assert_eq!(r.dim(), (cols, cols));

    let a_view = FaerArrayView::new(a);
    let qr = a_view.as_ref().qr();

    let r_factor = qr.R();
    for j in 0..cols {
        for i in 0..cols {
            r[[i, j]] = if i <= j { r_factor[(i, j)] } else { 0.0 };
        }
    }

    if let Some(q_out) = q {
        debug_assert_eq!(q_out.dim(), (rows, rows));
        let q_full = qr.compute_Q();
        for j in 0..rows {
            for i in 0..rows {
                q_out[[i, j]] = q_full[(i, j)];
            }
        }
    }
}

/// Replace a symmetric positive-definite matrix with the upper-triangular
/// Cholesky factor `R` such that `A = R^T R`; the strict lower triangle is
/// zeroed.
pub fn cholesky_upper_in_place(a: &mut ArrayViewMut2<'_, f64>) -> Result<(), FaerLinalgError> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols(), "Cholesky expects a square matrix");

    let factor = {
        let view = FaerArrayView::new(a.view());
        solvers::Llt::new(view.as_ref(), Side::Lower).map_err(FaerLinalgError::Cholesky)?
    };
    let l = factor.L();
    for i in 0..n {
        for j in 0..n {
            a[[i, j]] = if i <= j { l[(j, i)] } else { 0.0 };
        }
    }
    Ok(())
}

/// Solve `R * Z = RHS` in place for upper-triangular `R`; `rhs` holds the
/// right-hand-side columns on entry and the solution on exit.
pub fn solve_upper_in_place(r: ArrayView2<'_, f64>, rhs: &mut ArrayViewMut2<'_, f64>) {
    debug_assert_eq!(r.nrows(), r.ncols());
    debug_assert_eq!(r.ncols(), rhs.nrows());
    let r_view = FaerArrayView::new(r);
    triangular_solve::solve_upper_triangular_in_place(
        r_view.as_ref(),
        view2_to_mat_mut(rhs),
        get_global_parallelism(),
    );
}

/// Solve `R^T * Z = RHS` in place for upper-triangular `R`.
pub fn solve_upper_transpose_in_place(r: ArrayView2<'_, f64>, rhs: &mut ArrayViewMut2<'_, f64>) {
    debug_assert_eq!(r.nrows(), r.ncols());
    debug_assert_eq!(r.ncols(), rhs.nrows());
    let r_view = FaerArrayView::new(r);
    triangular_solve::solve_lower_triangular_in_place(
        r_view.as_ref().transpose(),
        view2_to_mat_mut(rhs),
        get_global_parallelism(),
    );
}

/// Solve `R * z = rhs` in place for a single right-hand-side vector.
pub fn solve_upper_vec_in_place(r: ArrayView2<'_, f64>, rhs: &mut ArrayViewMut1<'_, f64>) {
    debug_assert_eq!(r.nrows(), r.ncols());
    debug_assert_eq!(r.ncols(), rhs.len());
    let r_view = FaerArrayView::new(r);
    triangular_solve::solve_upper_triangular_in_place(
        r_view.as_ref(),
        view1_to_col_mat_mut(rhs),
        get_global_parallelism(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn fast_ab_matches_ndarray_dot() {
        let a = array![[1.0, 2.0, -1.0], [0.5, -3.0, 4.0]];
        let b = array![[2.0, 0.0], [1.0, -1.0], [0.5, 3.0]];
        let mut out = Array2::<f64>::zeros((2, 2));
        fast_ab_into(a.view(), b.view(), &mut out.view_mut());
        let expected = a.dot(&b);
        for i in 0..2 {
            for j in 0..2 {
                assert!((out[[i, j]] - expected[[i, j]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn fast_atv_matches_ndarray_dot() {
        let a = array![[1.0, 2.0], [0.5, -3.0], [2.0, 1.5]];
        let v = array![0.25, -1.0, 2.0];
        let mut out = Array1::<f64>::zeros(2);
        fast_atv_into(a.view(), v.view(), &mut out.view_mut());
        let expected = a.t().dot(&v);
        for j in 0..2 {
            assert!((out[j] - expected[j]).abs() < 1e-12);
        }
    }

    #[test]
    fn qr_reconstructs_input() {
        let a = array![
            [2.0, -1.0],
            [1.0, 3.0],
            [0.5, 0.5],
            [-1.0, 2.0]
        ];
        let mut q = Array2::<f64>::zeros((4, 4));
        let mut r = Array2::<f64>::zeros((2, 2));
        qr_into(a.view(), Some(&mut q.view_mut()), &mut r.view_mut());

        // Q must be orthogonal.
        let qtq = q.t().dot(&q);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((qtq[[i, j]] - expected).abs() < 1e-10);
            }
        }

        // A = Q[:, :2] * R.
        let rec = q.slice(ndarray::s![.., ..2]).dot(&r);
        for i in 0..4 {
            for j in 0..2 {
                assert!((rec[[i, j]] - a[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn svd_thin_reconstructs_input() {
        let a = array![
            [1.0, 0.5],
            [0.5, 2.0],
            [0.0, 1.0],
        ];
        let mut u = Array2::<f64>::zeros((3, 2));
        let mut s = Array1::<f64>::zeros(2);
        let mut v = Array2::<f64>::zeros((2, 2));
        svd_thin_into(
            a.view(),
            &mut u.view_mut(),
            &mut s.view_mut(),
            &mut v.view_mut(),
        )
        .expect("svd should converge");

        assert!(s[0] >= s[1] && s[1] >= 0.0);

        let mut rec = Array2::<f64>::zeros((3, 2));
        for i in 0..3 {
            for j in 0..2 {
                for k in 0..2 {
                    rec[[i, j]] += u[[i, k]] * s[k] * v[[j, k]];
                }
            }
        }
        for i in 0..3 {
            for j in 0..2 {
                assert!((rec[[i, j]] - a[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn upper_solve_and_transpose_solve() {
        let r = array![[2.0, 1.0], [0.0, 3.0]];
        let mut z = array![[4.0], [9.0]];
        solve_upper_in_place(r.view(), &mut z.view_mut());
        // 3 z1 = 9 -> z1 = 3; 2 z0 + 3 = 4 -> z0 = 0.5
        assert!((z[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((z[[1, 0]] - 3.0).abs() < 1e-12);

        let mut zt = array![[4.0], [9.0]];
        solve_upper_transpose_in_place(r.view(), &mut zt.view_mut());
        // R^T lower: 2 z0 = 4 -> 2; 1*2 + 3 z1 = 9 -> z1 = 7/3
        assert!((zt[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((zt[[1, 0]] - 7.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn cholesky_upper_factor_squares_back() {
        let a = array![[4.0, 2.0], [2.0, 5.0]];
        let mut f = a.clone();
        cholesky_upper_in_place(&mut f.view_mut()).expect("SPD input");
        assert_eq!(f[[1, 0]], 0.0);
        let rec = f.t().dot(&f);
        for i in 0..2 {
            for j in 0..2 {
                assert!((rec[[i, j]] - a[[i, j]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_input() {
        let a = array![[1.0, 4.0], [4.0, 1.0]];
        let mut f = a.clone();
        assert!(cholesky_upper_in_place(&mut f.view_mut()).is_err());
    }
}
