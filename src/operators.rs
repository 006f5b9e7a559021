use crate::error::FitError;
use crate::faer_ndarray::{cholesky_upper_in_place, fast_ata_acc_into};
use crate::workspace::FitWorkspace;
use ndarray::{ArrayView1, ArrayViewMut2, s};

/// Hard cap on the finite-difference derivative order.
pub const MAX_DIFF_ORDER: usize = 100;

/// Build the k-th order finite-difference operator on a regular grid of
/// `p` points into `l`, which must be `(p - k)`-by-`p`.
///
/// The zeroth-order operator is the identity. For `k >= 1` the stencil
/// coefficients are the alternating-sign binomial weights, placed on the
/// leading superdiagonals, so each row r reads
/// `[0 ... 0 c_0 c_1 ... c_k 0 ... 0]` starting at column r.
pub fn difference_operator(
    p: usize,
    k: usize,
    mut l: ArrayViewMut2<'_, f64>,
) -> Result<(), FitError> {
    if p <= k {
        return Err(FitError::DimensionMismatch(format!(
            "p must be larger than the derivative order, got p={p}, k={k}"
        )));
    }
    if k >= MAX_DIFF_ORDER - 1 {
        return Err(FitError::DimensionMismatch(format!(
            "derivative order k={k} too large"
        )));
    }
    if l.dim() != (p - k, p) {
        return Err(FitError::DimensionMismatch(format!(
            "difference operator must be {}x{}, got {}x{}",
            p - k,
            p,
            l.nrows(),
            l.ncols()
        )));
    }

    l.fill(0.0);

    if k == 0 {
        for i in 0..p {
            l[[i, i]] = 1.0;
        }
        return Ok(());
    }

    let mut coeff = [0.0_f64; MAX_DIFF_ORDER];
    coeff[0] = -1.0;
    coeff[1] = 1.0;
    for _ in 1..k {
        let mut prev = 0.0;
        for c in coeff.iter_mut().take(k + 1) {
            let cur = *c;
            *c = prev - cur;
            prev = cur;
        }
    }

    for (i, &ci) in coeff.iter().take(k + 1).enumerate() {
        for r in 0..(p - k) {
            l[[r, r + i]] = ci;
        }
    }

    Ok(())
}

/// Build a Sobolev smoothing operator into the square matrix `l`.
///
/// The result is the upper-triangular Cholesky factor `R` (strict lower
/// triangle zeroed) of
///
/// `alpha_0^2 I + sum_{k=1..kmax} (alpha_k L_k)^T (alpha_k L_k)`
///
/// so that `||R c||^2` equals the weighted sum of squared finite-difference
/// seminorms of `c`. The intermediate `L_k` matrices are staged in the
/// workspace arena.
pub fn sobolev_operator(
    p: usize,
    kmax: usize,
    alpha: ArrayView1<'_, f64>,
    mut l: ArrayViewMut2<'_, f64>,
    work: &mut FitWorkspace,
) -> Result<(), FitError> {
    if p > work.pmax() {
        return Err(FitError::DimensionMismatch(format!(
            "p={p} exceeds workspace bound pmax={}",
            work.pmax()
        )));
    }
    if p <= kmax {
        return Err(FitError::DimensionMismatch(format!(
            "p must be larger than the maximum derivative order, got p={p}, kmax={kmax}"
        )));
    }
    if alpha.len() != kmax + 1 {
        return Err(FitError::DimensionMismatch(format!(
            "alpha must have length kmax + 1 = {}, got {}",
            kmax + 1,
            alpha.len()
        )));
    }
    if l.nrows() != l.ncols() {
        return Err(FitError::NotSquare(format!(
            "Sobolev operator output is {}x{}",
            l.nrows(),
            l.ncols()
        )));
    }
    if l.nrows() != p {
        return Err(FitError::DimensionMismatch(format!(
            "Sobolev operator must be {p}x{p}, got {}x{}",
            l.nrows(),
            l.ncols()
        )));
    }

    // Gram accumulation: alpha_0^2 I plus one rank-(p-k) update per order.
    l.fill(0.0);
    let alpha0 = alpha[0];
    for i in 0..p {
        l[[i, i]] = alpha0 * alpha0;
    }

    for k in 1..=kmax {
        let mut lk = work.linv.slice_mut(s![..p - k, ..p]);
        difference_operator(p, k, lk.view_mut())?;
        lk *= alpha[k];
        fast_ata_acc_into(lk.view(), &mut l);
    }

    cholesky_upper_in_place(&mut l).map_err(|_| FitError::NotPositiveDefinite)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::FitWorkspace;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    #[test]
    fn zeroth_order_is_identity() {
        let p = 4;
        let mut l = Array2::<f64>::from_elem((p, p), 7.0);
        difference_operator(p, 0, l.view_mut()).unwrap();
        for i in 0..p {
            for j in 0..p {
                assert_eq!(l[[i, j]], if i == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn first_order_rows_are_shifted_stencils() {
        let p = 5;
        let mut l = Array2::<f64>::zeros((p - 1, p));
        difference_operator(p, 1, l.view_mut()).unwrap();
        for r in 0..p - 1 {
            for j in 0..p {
                let expected = if j == r {
                    -1.0
                } else if j == r + 1 {
                    1.0
                } else {
                    0.0
                };
                assert_eq!(l[[r, j]], expected);
            }
        }
    }

    #[test]
    fn second_order_stencil_is_one_minus_two_one() {
        let p = 6;
        let mut l = Array2::<f64>::zeros((p - 2, p));
        difference_operator(p, 2, l.view_mut()).unwrap();
        for r in 0..p - 2 {
            assert_eq!(l[[r, r]], 1.0);
            assert_eq!(l[[r, r + 1]], -2.0);
            assert_eq!(l[[r, r + 2]], 1.0);
        }
    }

    #[test]
    fn rejects_order_not_below_p() {
        let mut l = Array2::<f64>::zeros((1, 3));
        assert!(matches!(
            difference_operator(3, 3, l.view_mut()),
            Err(FitError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn sobolev_order_zero_scales_identity() {
        let p = 4;
        let mut work = FitWorkspace::new(8, p).unwrap();
        let alpha = Array1::from_vec(vec![2.0]);
        let mut l = Array2::<f64>::zeros((p, p));
        sobolev_operator(p, 0, alpha.view(), l.view_mut(), &mut work).unwrap();
        for i in 0..p {
            for j in 0..p {
                assert_abs_diff_eq!(l[[i, j]], if i == j { 2.0 } else { 0.0 }, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn sobolev_factor_squares_back_to_gram() {
        let p = 5;
        let mut work = FitWorkspace::new(10, p).unwrap();
        let alpha = Array1::from_vec(vec![1.0, 0.5]);
        let mut r = Array2::<f64>::zeros((p, p));
        sobolev_operator(p, 1, alpha.view(), r.view_mut(), &mut work).unwrap();

        // Recompute the Gram matrix directly.
        let mut l1 = Array2::<f64>::zeros((p - 1, p));
        difference_operator(p, 1, l1.view_mut()).unwrap();
        let gram = Array2::<f64>::eye(p) + 0.25 * l1.t().dot(&l1);

        let back = r.t().dot(&r);
        for i in 0..p {
            for j in 0..p {
                assert_abs_diff_eq!(back[[i, j]], gram[[i, j]], epsilon = 1e-10);
            }
            for j in 0..i {
                assert_eq!(r[[i, j]], 0.0);
            }
        }
    }

    #[test]
    fn sobolev_rejects_alpha_length_mismatch() {
        let mut work = FitWorkspace::new(8, 4).unwrap();
        let alpha = Array1::from_vec(vec![1.0, 1.0]);
        let mut l = Array2::<f64>::zeros((4, 4));
        assert!(matches!(
            sobolev_operator(4, 0, alpha.view(), l.view_mut(), &mut work),
            Err(FitError::DimensionMismatch(_))
        ));
    }
}
