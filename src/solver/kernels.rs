//! Orthogonalization, QR and Arnoldi kernels shared by the Krylov methods.
//!
//! All kernels work on local slices and reduce through a [`DistributedInnerProduct`].
//! A block of `mu` vectors of local length `n` is stored column after column, and a
//! basis is a sequence of such blocks. On an excluded rank `n` is 0: the local work is
//! empty but every reduction is still issued.

use crate::config::{Orthogonalization, QrMethod};
use crate::core::traits::{Scalar, cast};
use crate::core::wrappers::DistributedInnerProduct;
use crate::error::KError;
use crate::matrix::dense::{self, ColMat};
use crate::parallel::Comm;
use crate::solver::workspace::{BlockHessenberg, Hessenberg};

/// Fraction of its norm below which a Gram-Schmidt column is considered lost.
pub fn breakdown_threshold<T: Scalar>() -> T {
    cast::<T>(1.0e-12).max(cast::<T>(4.0) * T::epsilon())
}

/// Projects the `mu` columns of `v` against the first `k` blocks of `basis`, column
/// `nu` against column `nu` of every block. The coefficients are written to
/// `coeffs[i * mu + nu]`.
///
/// `Cgs` gathers all `k * mu` inner products into a single reduction; `Mgs` reduces
/// once per basis block and subtracts before computing the next coefficients.
#[allow(clippy::too_many_arguments)]
pub fn orthogonalization<T: Scalar, C: Comm>(
    mode: Orthogonalization,
    n: usize,
    k: usize,
    mu: usize,
    basis: &[T],
    v: &mut [T],
    coeffs: &mut [T],
    ip: &DistributedInnerProduct<'_, T, C>,
) {
    let blk = n * mu;
    let column = |i: usize, nu: usize| &basis[i * blk + nu * n..i * blk + (nu + 1) * n];
    match mode {
        Orthogonalization::Cgs => {
            for i in 0..k {
                for nu in 0..mu {
                    coeffs[i * mu + nu] = ip.local(column(i, nu), &v[nu * n..(nu + 1) * n]);
                }
            }
            ip.reduce(&mut coeffs[..k * mu]);
            for i in 0..k {
                for nu in 0..mu {
                    dense::axpy(-coeffs[i * mu + nu], column(i, nu), &mut v[nu * n..(nu + 1) * n]);
                }
            }
        }
        Orthogonalization::Mgs => {
            for i in 0..k {
                for nu in 0..mu {
                    coeffs[i * mu + nu] = ip.local(column(i, nu), &v[nu * n..(nu + 1) * n]);
                }
                ip.reduce(&mut coeffs[i * mu..(i + 1) * mu]);
                for nu in 0..mu {
                    dense::axpy(-coeffs[i * mu + nu], column(i, nu), &mut v[nu * n..(nu + 1) * n]);
                }
            }
        }
    }
}

/// Projects the `ncols` columns of `v` against the first `k` blocks of `basis`, each
/// an `n x width` block, every column against every basis column. The
/// `k width x ncols` coefficients are written to `h` with leading dimension `ldh`.
#[allow(clippy::too_many_arguments)]
pub fn block_orthogonalization<T: Scalar, C: Comm>(
    mode: Orthogonalization,
    n: usize,
    k: usize,
    width: usize,
    ncols: usize,
    basis: &[T],
    v: &mut [T],
    h: &mut [T],
    ldh: usize,
    ip: &DistributedInnerProduct<'_, T, C>,
) {
    let blocks: Vec<usize> = match mode {
        Orthogonalization::Cgs => vec![k],
        Orthogonalization::Mgs => vec![1; k],
    };
    let mut first = 0;
    for count in blocks {
        let rows = count * width;
        let b = &basis[first * n * width..(first + count) * n * width];
        let mut work = ColMat::zeros(rows, ncols);
        for c in 0..ncols {
            for r in 0..rows {
                work[(r, c)] = ip.local(&b[r * n..(r + 1) * n], &v[c * n..(c + 1) * n]);
            }
        }
        ip.reduce(work.as_mut_slice());
        dense::gemm(n, ncols, rows, -T::one(), b, work.as_slice(), T::one(), v);
        for c in 0..ncols {
            for r in 0..rows {
                h[first * width + r + c * ldh] = work[(r, c)];
            }
        }
        first += count;
    }
}

/// QR factorization of the `n x k` distributed block `q`; `R` goes to the upper
/// triangle of `r` (leading dimension `ldr`).
///
/// `CholQr` forms the Gram matrix in one reduction, factors it locally and, when
/// `update` is set, overwrites `q` with `q R^-1`. The Gram-Schmidt modes orthonormalize
/// column by column and always update `q`. A non-positive pivot or a lost column
/// returns `KError::Breakdown(j)` with the 1-based column position; a column is lost
/// when it keeps less than a tiny fraction of its norm after projection.
#[allow(clippy::too_many_arguments)]
pub fn qr<T: Scalar, C: Comm>(
    mode: QrMethod,
    n: usize,
    k: usize,
    q: &mut [T],
    r: &mut [T],
    ldr: usize,
    ip: &DistributedInnerProduct<'_, T, C>,
    update: bool,
) -> Result<(), KError> {
    match mode {
        QrMethod::CholQr => {
            let mut packed = Vec::with_capacity(k * (k + 1) / 2);
            for j in 0..k {
                for i in 0..=j {
                    packed.push(ip.local(&q[i * n..(i + 1) * n], &q[j * n..(j + 1) * n]));
                }
            }
            ip.reduce(&mut packed);
            let mut p = 0;
            for j in 0..k {
                for i in 0..k {
                    r[i + j * ldr] = if i <= j {
                        p += 1;
                        packed[p - 1]
                    } else {
                        T::zero()
                    };
                }
            }
            let diag: Vec<T> = (0..k).map(|j| r[j + j * ldr]).collect();
            dense::cholesky(k, r, ldr)?;
            let floor = cast::<T>(4.0) * T::epsilon();
            if let Some(j) = (0..k).find(|&j| r[j + j * ldr] * r[j + j * ldr] <= floor * diag[j]) {
                return Err(KError::Breakdown(j + 1));
            }
            if update {
                dense::trsm_right_upper(n, k, r, ldr, q);
            }
        }
        QrMethod::Cgs | QrMethod::Mgs => {
            let inner = if mode == QrMethod::Cgs { Orthogonalization::Cgs } else { Orthogonalization::Mgs };
            let mut coeffs = vec![T::zero(); k];
            let eps = breakdown_threshold::<T>();
            for j in 0..k {
                let (prev, rest) = q.split_at_mut(j * n);
                let col = &mut rest[..n];
                if j > 0 {
                    orthogonalization(inner, n, j, 1, prev, col, &mut coeffs[..j], ip);
                }
                let mut norm = [ip.local(col, col)];
                ip.reduce(&mut norm);
                let norm = norm[0].max(T::zero()).sqrt();
                // norm of the column before projection
                let before = (norm * norm + coeffs[..j].iter().map(|&c| c * c).sum::<T>()).sqrt();
                if norm == T::zero() || norm <= eps * before {
                    return Err(KError::Breakdown(j + 1));
                }
                dense::scal(T::one() / norm, col);
                for i in 0..k {
                    r[i + j * ldr] = if i < j {
                        coeffs[i]
                    } else if i == j {
                        norm
                    } else {
                        T::zero()
                    };
                }
            }
        }
    }
    Ok(())
}

/// One step of scalar Arnoldi over `mu` independent Krylov spaces.
///
/// Block `i + 1` of `basis` must hold the new direction (the operator applied to
/// block `i`). It is orthogonalized against blocks `0..=i`, normalized (a zero norm,
/// i.e. a happy breakdown, leaves it at zero), the unrotated column is copied to `save`
/// when present, the previous Givens rotations are applied to the new Hessenberg
/// column and a new rotation updates the residual recursion in `hess.s`.
#[allow(clippy::too_many_arguments)]
pub fn arnoldi<T: Scalar, C: Comm>(
    mode: Orthogonalization,
    n: usize,
    i: usize,
    basis: &mut [T],
    hess: &mut Hessenberg<T>,
    save: Option<&mut [ColMat<T>]>,
    ip: &DistributedInnerProduct<'_, T, C>,
) {
    let mu = hess.mu;
    let blk = n * mu;
    let (head, tail) = basis.split_at_mut((i + 1) * blk);
    let w = &mut tail[..blk];
    let mut coeffs = vec![T::zero(); (i + 1) * mu];
    orthogonalization(mode, n, i + 1, mu, head, w, &mut coeffs, ip);
    let mut norms = vec![T::zero(); mu];
    ip.norms(n, w, &mut norms);
    for nu in 0..mu {
        let h = &mut hess.h[nu];
        for r in 0..=i {
            h[(r, i)] = coeffs[r * mu + nu];
        }
        h[(i + 1, i)] = norms[nu];
        if norms[nu] > T::zero() {
            dense::scal(T::one() / norms[nu], &mut w[nu * n..(nu + 1) * n]);
        }
    }
    if let Some(save) = save {
        for nu in 0..mu {
            for r in 0..=i + 1 {
                save[nu][(r, i)] = hess.h[nu][(r, i)];
            }
        }
    }
    for nu in 0..mu {
        let h = &mut hess.h[nu];
        for k in 0..i {
            let (c, s) = (hess.cs[k * mu + nu], hess.sn[k * mu + nu]);
            let gamma = c * h[(k, i)] + s * h[(k + 1, i)];
            h[(k + 1, i)] = -s * h[(k, i)] + c * h[(k + 1, i)];
            h[(k, i)] = gamma;
        }
        let delta = h[(i, i)].hypot(h[(i + 1, i)]);
        let (c, s) = if delta == T::zero() {
            (T::one(), T::zero())
        } else {
            (h[(i, i)] / delta, h[(i + 1, i)] / delta)
        };
        hess.cs[i * mu + nu] = c;
        hess.sn[i * mu + nu] = s;
        h[(i, i)] = delta;
        h[(i + 1, i)] = T::zero();
        hess.s[(i + 1) * mu + nu] = -s * hess.s[i * mu + nu];
        hess.s[i * mu + nu] = c * hess.s[i * mu + nu];
    }
}

/// One step of block Arnoldi of width `d = hess.d`.
///
/// Block `i + 1` of `basis` holds the new directions. They are block-orthogonalized
/// against blocks `0..=i` and orthonormalized with `qr_mode`; the `2d x d` trailing
/// part of the new block column is then reduced by Householder QR after applying the
/// reflectors of the previous steps, and the same reflectors update `hess.s`.
///
/// Returns `Ok(true)` when the QR of the new block breaks down: the basis cannot be
/// extended, the new block is treated as zero and the caller must close the cycle
/// after this step.
#[allow(clippy::too_many_arguments)]
pub fn block_arnoldi<T: Scalar, C: Comm>(
    mode: Orthogonalization,
    qr_mode: QrMethod,
    n: usize,
    i: usize,
    basis: &mut [T],
    hess: &mut BlockHessenberg<T>,
    save: Option<&mut ColMat<T>>,
    ip: &DistributedInnerProduct<'_, T, C>,
) -> Result<bool, KError> {
    let d = hess.d;
    let ldh = hess.ldh();
    let blk = n * d;
    let (head, tail) = basis.split_at_mut((i + 1) * blk);
    let w = &mut tail[..blk];
    let col0 = i * d * ldh;
    {
        let hcol = &mut hess.h.as_mut_slice()[col0..];
        block_orthogonalization(mode, n, i + 1, d, d, head, w, hcol, ldh, ip);
    }
    let mut r = vec![T::zero(); d * d];
    let breakdown = match qr(qr_mode, n, d, w, &mut r, d, ip, true) {
        Ok(()) => false,
        Err(KError::Breakdown(col)) => {
            log::warn!("block Arnoldi breakdown at step {i} (column {col}), closing the cycle");
            r.iter_mut().for_each(|v| *v = T::zero());
            w.iter_mut().for_each(|v| *v = T::zero());
            true
        }
        Err(e) => return Err(e),
    };
    for c in 0..d {
        for rr in 0..d {
            hess.h[((i + 1) * d + rr, i * d + c)] = if rr <= c { r[rr + c * d] } else { T::zero() };
        }
    }
    if let Some(save) = save {
        for c in 0..d {
            for rr in 0..(i + 2) * d {
                save[(rr, i * d + c)] = hess.h[(rr, i * d + c)];
            }
        }
    }
    let (left, right) = hess.h.as_mut_slice().split_at_mut(col0);
    for l in 0..i {
        let a = &left[l * d * ldh + l * d..];
        reflect(2 * d, d, a, ldh, &hess.tau[l * d..(l + 1) * d], right, ldh, l * d, d);
    }
    householder(2 * d, d, &mut right[i * d..], ldh, &mut hess.tau[i * d..(i + 1) * d]);
    let rhs = hess.rhs;
    reflect(
        2 * d,
        d,
        &right[i * d..],
        ldh,
        &hess.tau[i * d..(i + 1) * d],
        hess.s.as_mut_slice(),
        ldh,
        i * d,
        rhs,
    );
    Ok(breakdown)
}


/// Householder QR of the `m x n` block at `a` (leading dimension `lda`), `m >= n`,
/// in place inside the block Hessenberg matrix. The upper triangle receives `R`, the
/// essential parts of the reflectors stay below the diagonal and `tau[j]` holds their
/// scalar factors, so later columns can be rotated by the same reflectors.
fn householder<T: Scalar>(m: usize, n: usize, a: &mut [T], lda: usize, tau: &mut [T]) {
    for j in 0..n.min(m) {
        let col = &mut a[j * lda + j..j * lda + m];
        let alpha = col[0];
        let sigma: T = col[1..].iter().map(|&v| v * v).sum();
        if sigma == T::zero() {
            tau[j] = T::zero();
            continue;
        }
        let norm = (alpha * alpha + sigma).sqrt();
        let beta = if alpha > T::zero() { -norm } else { norm };
        tau[j] = (beta - alpha) / beta;
        let inv = T::one() / (alpha - beta);
        col[1..].iter_mut().for_each(|v| *v = *v * inv);
        col[0] = beta;
        let v = reflector(a, lda, j, m);
        for c in j + 1..n {
            apply_reflector(&v, tau[j], &mut a[c * lda + j..c * lda + m]);
        }
    }
}

fn reflector<T: Scalar>(a: &[T], lda: usize, j: usize, m: usize) -> Vec<T> {
    let mut v = a[j * lda + j..j * lda + m].to_vec();
    v[0] = T::one();
    v
}

// seg <- (I - tau v v^T) seg
fn apply_reflector<T: Scalar>(v: &[T], tau: T, seg: &mut [T]) {
    if tau == T::zero() {
        return;
    }
    let w = tau * dense::dot(v, seg);
    dense::axpy(-w, v, seg);
}

/// `C <- Q^T C` for the reflectors stored by [`householder`] in the `m x n` block `a`;
/// `C` has `ncols` columns of leading dimension `ldc`, starting at row `row0`.
#[allow(clippy::too_many_arguments)]
fn reflect<T: Scalar>(m: usize, n: usize, a: &[T], lda: usize, tau: &[T], c: &mut [T], ldc: usize, row0: usize, ncols: usize) {
    for j in 0..n.min(m) {
        let v = reflector(a, lda, j, m);
        for q in 0..ncols {
            let off = q * ldc + row0 + j;
            apply_reflector(&v, tau[j], &mut c[off..off + m - j]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SelfComm;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn random(len: usize, rng: &mut StdRng) -> Vec<f64> {
        (0..len).map(|_| rng.r#gen::<f64>() - 0.5).collect()
    }

    #[test]
    fn projection_coefficients_match_between_modes() {
        let mut rng = StdRng::seed_from_u64(7);
        let comm = SelfComm;
        let ip = DistributedInnerProduct::new(&comm, None);
        let n = 12;
        let mut basis = random(3 * n, &mut rng);
        let mut r = vec![0.0; 9];
        qr(QrMethod::Mgs, n, 3, &mut basis, &mut r, 3, &ip, true).unwrap();
        let v0 = random(n, &mut rng);
        let (mut a, mut b) = (v0.clone(), v0.clone());
        let (mut ca, mut cb) = (vec![0.0; 3], vec![0.0; 3]);
        orthogonalization(Orthogonalization::Cgs, n, 3, 1, &basis, &mut a, &mut ca, &ip);
        orthogonalization(Orthogonalization::Mgs, n, 3, 1, &basis, &mut b, &mut cb, &ip);
        for j in 0..3 {
            assert_abs_diff_eq!(ca[j], cb[j], epsilon = 1e-12);
        }
        for i in 0..n {
            assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn arnoldi_happy_breakdown_does_not_divide_by_zero() {
        // A = I: the second Krylov vector vanishes after orthogonalization
        let comm = SelfComm;
        let ip = DistributedInnerProduct::new(&comm, None);
        let n = 4;
        let mut hess = Hessenberg::new(3, 1);
        hess.reset(&[2.0]);
        let mut basis = vec![0.0f64; 4 * n];
        basis[..n].copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        let v0 = basis[..n].to_vec();
        basis[n..2 * n].copy_from_slice(&v0);
        arnoldi(Orthogonalization::Cgs, n, 0, &mut basis, &mut hess, None, &ip);
        assert!(basis[n..2 * n].iter().all(|v| v.is_finite() && *v == 0.0));
        assert_abs_diff_eq!(hess.residual(0, 0), 0.0);
        assert_eq!(hess.solve(1, 0), vec![2.0]);
    }
}
