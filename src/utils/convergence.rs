//! Convergence tracking & tolerance checks for iterative solvers.
//!
//! A right-hand side is converged at the first iteration its residual estimate passes
//! the test `‖r‖ / ‖b‖ <= tol` (`tol > 0`) or `‖r‖ <= -tol` (`tol < 0`). The iteration
//! is recorded in [`ConvergenceMarks`] and never rewritten afterwards.

use crate::core::traits::Scalar;

/// Stopping criterion.
#[derive(Clone, Copy, Debug)]
pub struct Convergence<T> {
    pub tol: T,
    pub max_iters: usize,
}

impl<T: Scalar> Convergence<T> {
    pub fn new(tol: T, max_iters: usize) -> Self {
        Self { tol, max_iters }
    }

    /// Relative test when `tol > 0`, absolute when `tol < 0`.
    pub fn passes(&self, residual: T, norm: T) -> bool {
        (self.tol > T::zero() && residual / norm <= self.tol) || (self.tol < T::zero() && residual <= -self.tol)
    }
}

/// Per right-hand side convergence iteration; `None` while still active.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvergenceMarks {
    marks: Vec<Option<usize>>,
}

impl ConvergenceMarks {
    pub fn new(mu: usize) -> Self {
        Self { marks: vec![None; mu] }
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn is_active(&self, nu: usize) -> bool {
        self.marks[nu].is_none()
    }

    pub fn get(&self, nu: usize) -> Option<usize> {
        self.marks[nu]
    }

    /// Freezes `nu` at `iteration`; returns false if it was already marked.
    pub fn mark(&mut self, nu: usize, iteration: usize) -> bool {
        match self.marks[nu] {
            Some(_) => false,
            None => {
                self.marks[nu] = Some(iteration);
                true
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.marks.iter().filter(|m| m.is_none()).count()
    }

    pub fn converged_count(&self) -> usize {
        self.len() - self.active_count()
    }

    pub fn all_converged(&self) -> bool {
        self.marks.iter().all(Option::is_some)
    }

    pub fn as_slice(&self) -> &[Option<usize>] {
        &self.marks
    }
}

/// One row of the per-iteration residual history.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationRecord<T> {
    pub method: &'static str,
    pub iteration: usize,
    /// Largest residual estimate among the right-hand sides still active.
    pub max_residual: T,
    pub reference_norm: T,
    pub ratio: T,
    pub threshold: T,
    pub converged: usize,
    pub deflated: usize,
}

#[derive(Clone, Debug)]
pub struct SolveStats<T> {
    /// Converged iteration count, `max_it + 1` on failure.
    pub iterations: usize,
    pub final_residual: T,
    pub converged: bool,
    pub history: Vec<IterationRecord<T>>,
    pub per_rhs: Vec<Option<usize>>,
}

/// Collects the iteration history of one solve and emits the diagnostic lines.
#[derive(Debug)]
pub struct Monitor<T> {
    method: &'static str,
    verbosity: u8,
    criterion: Convergence<T>,
    history: Vec<IterationRecord<T>>,
}

impl<T: Scalar> Monitor<T> {
    pub fn new(method: &'static str, verbosity: u8, tol: T, max_it: usize) -> Self {
        Self {
            method,
            verbosity,
            criterion: Convergence::new(tol, max_it),
            history: Vec::new(),
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn tol(&self) -> T {
        self.criterion.tol
    }

    pub fn max_it(&self) -> usize {
        self.criterion.max_iters
    }

    pub fn passes(&self, residual: T, norm: T) -> bool {
        self.criterion.passes(residual, norm)
    }

    pub fn history(&self) -> &[IterationRecord<T>] {
        &self.history
    }

    pub fn last_residual(&self) -> Option<T> {
        self.history.last().map(|r| r.max_residual)
    }

    fn record(&mut self, iteration: usize, worst: Option<(usize, T, T)>, converged: usize, deflated: usize, rhs: usize) {
        let tol = self.criterion.tol;
        let (idx, max_residual, reference_norm) = worst.unwrap_or((0, T::zero(), T::one()));
        let (ratio, threshold) = if tol > T::zero() {
            (max_residual / reference_norm, tol)
        } else {
            (max_residual, -tol)
        };
        if self.verbosity > 2 {
            let mut line = if tol > T::zero() {
                format!(
                    "{}: {:>3} {:e} {:e} {:e} < {:e}",
                    self.method, iteration, max_residual, reference_norm, ratio, threshold
                )
            } else {
                format!("{}: {:>3} {:e} < {:e}", self.method, iteration, max_residual, threshold)
            };
            if rhs > 1 {
                line.push_str(&format!(" (rhs #{}", idx + 1));
                if converged > 0 {
                    line.push_str(&format!(", {converged} converged rhs"));
                }
                if deflated > 0 {
                    line.push_str(&format!(", {deflated} deflated rhs"));
                }
                line.push(')');
            }
            log::info!("{line}");
        }
        self.history.push(IterationRecord {
            method: self.method,
            iteration,
            max_residual,
            reference_norm,
            ratio,
            threshold,
            converged,
            deflated,
        });
    }

    /// Final statistics; logs the summary line when verbosity is nonzero.
    pub fn finish(self, marks: &ConvergenceMarks, iteration: usize) -> SolveStats<T> {
        let max_it = self.criterion.max_iters;
        let converged = marks.all_converged();
        let iterations = if converged { iteration } else { max_it + 1 };
        if self.verbosity > 0 {
            if converged {
                log::info!(
                    "{} converges after {} iteration{}",
                    self.method,
                    iterations,
                    if iterations > 1 { "s" } else { "" }
                );
            } else {
                log::info!(
                    "{} does not converge after {} iteration{}",
                    self.method,
                    max_it,
                    if max_it > 1 { "s" } else { "" }
                );
            }
        }
        SolveStats {
            iterations,
            final_residual: self.last_residual().unwrap_or_else(T::zero),
            converged,
            history: self.history,
            per_rhs: marks.as_slice().to_vec(),
        }
    }
}

/// Marks every still-active right-hand side whose residual estimate passes at
/// `iteration`. Returns the number of newly converged right-hand sides.
pub fn check_convergence<T: Scalar>(
    monitor: &mut Monitor<T>,
    iteration: usize,
    norms: &[T],
    residuals: &[T],
    marks: &mut ConvergenceMarks,
) -> usize {
    let mu = residuals.len();
    let mut worst: Option<(usize, T, T)> = None;
    for nu in 0..mu {
        if marks.is_active(nu) {
            let r = residuals[nu].abs();
            if worst.is_none_or(|(_, w, _)| r > w) {
                worst = Some((nu, r, norms[nu]));
            }
        }
    }
    let mut fresh = 0;
    for nu in 0..mu {
        if marks.is_active(nu) && monitor.passes(residuals[nu].abs(), norms[nu]) {
            marks.mark(nu, iteration);
            fresh += 1;
        }
    }
    monitor.record(iteration, worst, marks.converged_count(), 0, mu);
    fresh
}

/// Group test over already reduced residual norms. `residuals[g]` is the norm of the
/// sum of the `t` columns of active group `g`, whose original indices are
/// `active[g * t..(g + 1) * t]`; `norms` is indexed by original column.
pub fn check_group_convergence<T: Scalar>(
    monitor: &mut Monitor<T>,
    iteration: usize,
    t: usize,
    norms: &[T],
    residuals: &[T],
    active: &[usize],
    marks: &mut ConvergenceMarks,
) -> usize {
    let t = t.max(1);
    let mut fresh = 0;
    let mut worst: Option<(usize, T, T)> = None;
    for (g, &r) in residuals.iter().enumerate() {
        let lead = active[g * t];
        if worst.is_none_or(|(_, w, _)| r > w) {
            worst = Some((lead, r, norms[lead]));
        }
        if monitor.passes(r, norms[lead]) {
            for &nu in &active[g * t..(g + 1) * t] {
                if marks.mark(nu, iteration) {
                    fresh += 1;
                }
            }
        }
    }
    let deflated = marks.len() - active.len();
    let converged = marks.converged_count() - deflated;
    monitor.record(iteration, worst, converged, deflated, marks.len());
    fresh
}

/// Block test on the projected residual of a block method: `rows x active.len()`
/// entries of `columns` with leading dimension `ld`, one column per active right-hand
/// side. With `t <= 1` each column is tested alone; otherwise each group of `t`
/// consecutive columns is summed and tested as one.
#[allow(clippy::too_many_arguments)]
pub fn check_block_convergence<T: Scalar>(
    monitor: &mut Monitor<T>,
    iteration: usize,
    t: usize,
    norms: &[T],
    columns: &[T],
    rows: usize,
    ld: usize,
    active: &[usize],
    marks: &mut ConvergenceMarks,
) -> usize {
    let d = active.len();
    let t = t.max(1);
    let residuals: Vec<T> = (0..d / t)
        .map(|g| {
            let mut sum = vec![T::zero(); rows];
            for j in g * t..(g + 1) * t {
                for (i, s) in sum.iter_mut().enumerate() {
                    *s = *s + columns[i + j * ld];
                }
            }
            sum.iter().map(|&v| v * v).sum::<T>().sqrt()
        })
        .collect();
    check_group_convergence(monitor, iteration, t, norms, &residuals, active, marks)
}
