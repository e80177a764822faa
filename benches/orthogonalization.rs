use criterion::{black_box, Criterion, criterion_group, criterion_main};
use ddkrylov::coarse::{CoarseOperator, DenseLu, Distribution, GalerkinContribution, Topology};
use ddkrylov::config::{Orthogonalization, QrMethod};
use ddkrylov::core::wrappers::DistributedInnerProduct;
use ddkrylov::parallel::SelfComm;
use ddkrylov::solver::kernels::{orthogonalization, qr};

fn block(len: usize, shift: f64) -> Vec<f64> {
    (0..len).map(|i| (i as f64 * 0.37 + shift).sin()).collect()
}

fn bench_projection(c: &mut Criterion) {
    let (n, k, mu) = (2000, 30, 4);
    let ip = DistributedInnerProduct::new(&SelfComm, None);
    let mut basis = block(n * k * mu, 0.0);
    let mut r = vec![0.0; (k * mu) * (k * mu)];
    qr(QrMethod::Mgs, n, k * mu, &mut basis, &mut r, k * mu, &ip, true).unwrap();
    let v0 = block(n * mu, 1.3);
    let mut coeffs = vec![0.0; k * mu];

    for (name, mode) in [("classical Gram-Schmidt", Orthogonalization::Cgs), ("modified Gram-Schmidt", Orthogonalization::Mgs)] {
        c.bench_function(name, |ben| {
            ben.iter(|| {
                let mut v = v0.clone();
                orthogonalization(mode, n, k, mu, black_box(&basis), &mut v, &mut coeffs, &ip);
                v
            })
        });
    }
}

fn bench_qr(c: &mut Criterion) {
    let (n, k) = (5000, 16);
    let ip = DistributedInnerProduct::new(&SelfComm, None);
    let a = block(n * k, 0.5);
    let mut r = vec![0.0; k * k];

    for (name, method) in [("Cholesky QR", QrMethod::CholQr), ("Gram-Schmidt QR", QrMethod::Mgs)] {
        c.bench_function(name, |ben| {
            ben.iter(|| {
                let mut q = a.clone();
                qr(method, n, k, black_box(&mut q), &mut r, k, &ip, true).unwrap();
                q
            })
        });
    }
}

struct Dense(usize);

impl GalerkinContribution<f64> for Dense {
    fn local_coarse_dofs(&self) -> usize {
        self.0
    }

    fn block_row(&self) -> Vec<(usize, Vec<f64>)> {
        let n = self.0;
        let values = (0..n * n)
            .map(|k| if k % n == k / n { n as f64 } else { ((k as f64) * 0.1).cos() })
            .collect();
        vec![(0, values)]
    }

    fn distribution(&self) -> Distribution {
        Distribution::Uniform { nu: self.0 }
    }
}

fn bench_coarse_solve(c: &mut Criterion) {
    let op = Dense(200);
    let (mut coarse, pending) =
        CoarseOperator::construction(&op, &SelfComm, Topology::Centralized, false, DenseLu::new()).unwrap();
    coarse.finish_assembly(pending).unwrap();
    let rhs = block(200, 0.2);

    c.bench_function("coarse dense LU solve", |ben| {
        ben.iter(|| {
            let mut x = rhs.clone();
            coarse.call_solver(black_box(&mut x), 1).unwrap();
            x
        })
    });
}

criterion_group!(benches, bench_projection, bench_qr, bench_coarse_solve);
criterion_main!(benches);
