//! Options for the Krylov methods.
//!
//! [`KrylovOptions`] is built once per solve, either programmatically through the
//! `with_*` builders, deserialized with serde, or read from a key-prefixed string store
//! with [`KrylovOptions::from_pairs`]. After [`KrylovOptions::validated`] it is treated as
//! immutable and passed explicitly through the call graph.

use crate::core::traits::{Scalar, cast};
use crate::error::KError;
use serde::Deserialize;

/// The seven iterative methods, in the classic numbering used by the
/// `krylov_method` key (GMRES = 0 ... PCG = 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KrylovMethod {
    #[default]
    Gmres,
    Bgmres,
    Cg,
    Bcg,
    Gcrodr,
    Bgcrodr,
    Pcg,
}

impl KrylovMethod {
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => KrylovMethod::Gmres,
            1 => KrylovMethod::Bgmres,
            2 => KrylovMethod::Cg,
            3 => KrylovMethod::Bcg,
            4 => KrylovMethod::Gcrodr,
            5 => KrylovMethod::Bgcrodr,
            6 => KrylovMethod::Pcg,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            KrylovMethod::Gmres => "GMRES",
            KrylovMethod::Bgmres => "BGMRES",
            KrylovMethod::Cg => "CG",
            KrylovMethod::Bcg => "BCG",
            KrylovMethod::Gcrodr => "GCRODR",
            KrylovMethod::Bgcrodr => "BGCRODR",
            KrylovMethod::Pcg => "PCG",
        }
    }

    /// Methods that share one search space across right-hand sides.
    pub fn is_block(self) -> bool {
        matches!(self, KrylovMethod::Bgmres | KrylovMethod::Bcg | KrylovMethod::Bgcrodr)
    }
}

/// Side on which the preconditioner is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Left,
    #[default]
    Right,
    /// Right preconditioning with a preconditioner allowed to change at every step.
    Flexible,
}

/// Gram-Schmidt flavour used against the Krylov basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orthogonalization {
    /// Classical: all inner products in one reduction.
    #[default]
    Cgs,
    /// Modified: one reduction per basis column.
    Mgs,
}

/// Orthonormalization of a block of vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrMethod {
    /// Cholesky-QR: one Gram reduction, local Cholesky, triangular solve.
    #[default]
    CholQr,
    /// Column-by-column Gram-Schmidt with classical inner projections.
    Cgs,
    /// Column-by-column modified Gram-Schmidt.
    Mgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecycleTarget {
    /// Keep the directions of smallest magnitude.
    #[default]
    Smallest,
    Largest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecycleStrategy {
    /// Symmetric eigenproblem of the normal matrix `G^T G`.
    #[default]
    A,
    /// Singular value decomposition of `G` itself.
    B,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KrylovOptions {
    /// Relative tolerance when positive, absolute when negative.
    pub tol: f64,
    pub max_it: usize,
    pub verbosity: u8,
    pub variant: Variant,
    pub orthogonalization: Orthogonalization,
    pub qr: QrMethod,
    pub gmres_restart: usize,
    pub enlarge_krylov_subspace: usize,
    /// Negative disables the initial deflation of linearly dependent right-hand sides.
    pub initial_deflation_tol: f64,
    pub recycle: usize,
    pub recycle_target: RecycleTarget,
    pub recycle_strategy: RecycleStrategy,
    pub recycle_same_system: bool,
    pub krylov_method: KrylovMethod,
}

impl Default for KrylovOptions {
    fn default() -> Self {
        Self {
            tol: 1.0e-6,
            max_it: 100,
            verbosity: 0,
            variant: Variant::Right,
            orthogonalization: Orthogonalization::Cgs,
            qr: QrMethod::CholQr,
            gmres_restart: 40,
            enlarge_krylov_subspace: 1,
            initial_deflation_tol: -1.0,
            recycle: 0,
            recycle_target: RecycleTarget::Smallest,
            recycle_strategy: RecycleStrategy::A,
            recycle_same_system: false,
            krylov_method: KrylovMethod::Gmres,
        }
    }
}

fn parse<V: std::str::FromStr>(key: &str, value: &str) -> Result<V, KError> {
    value
        .trim()
        .parse()
        .map_err(|_| KError::Config(format!("invalid value '{value}' for '{key}'")))
}

fn parse_choice<V: Copy>(key: &str, value: &str, choices: &[(&str, V)]) -> Result<V, KError> {
    let value = value.trim().to_ascii_lowercase();
    if let Ok(id) = value.parse::<usize>() {
        if let Some(&(_, v)) = choices.get(id) {
            return Ok(v);
        }
    }
    choices
        .iter()
        .find(|(name, _)| *name == value)
        .map(|&(_, v)| v)
        .ok_or_else(|| KError::Config(format!("invalid value '{value}' for '{key}'")))
}

impl KrylovOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every `prefix + key` entry of a string store. Keys without the prefix, or
    /// unknown after it, belong to other components and are skipped.
    pub fn from_pairs<I, K, V>(prefix: &str, pairs: I) -> Result<Self, KError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(prefix) else { continue };
            match name {
                "tol" => opts.tol = parse(key, value)?,
                "max_it" => opts.max_it = parse(key, value)?,
                "verbosity" => opts.verbosity = parse(key, value)?,
                "gmres_restart" => opts.gmres_restart = parse(key, value)?,
                "enlarge_krylov_subspace" => opts.enlarge_krylov_subspace = parse(key, value)?,
                "initial_deflation_tol" => opts.initial_deflation_tol = parse(key, value)?,
                "recycle" => opts.recycle = parse(key, value)?,
                "recycle_same_system" => {
                    opts.recycle_same_system = match value.trim() {
                        "1" | "true" => true,
                        "0" | "false" => false,
                        _ => return Err(KError::Config(format!("invalid value '{value}' for '{key}'"))),
                    }
                }
                "variant" => {
                    opts.variant = parse_choice(
                        key,
                        value,
                        &[("left", Variant::Left), ("right", Variant::Right), ("flexible", Variant::Flexible)],
                    )?
                }
                "orthogonalization" => {
                    opts.orthogonalization = parse_choice(
                        key,
                        value,
                        &[("cgs", Orthogonalization::Cgs), ("mgs", Orthogonalization::Mgs)],
                    )?
                }
                "qr" => {
                    opts.qr = parse_choice(
                        key,
                        value,
                        &[("cholqr", QrMethod::CholQr), ("cgs", QrMethod::Cgs), ("mgs", QrMethod::Mgs)],
                    )?
                }
                "recycle_target" => {
                    opts.recycle_target = parse_choice(
                        key,
                        value,
                        &[("smallest", RecycleTarget::Smallest), ("largest", RecycleTarget::Largest)],
                    )?
                }
                "recycle_strategy" => {
                    opts.recycle_strategy =
                        parse_choice(key, value, &[("a", RecycleStrategy::A), ("b", RecycleStrategy::B)])?
                }
                "krylov_method" => {
                    let v = value.trim().to_ascii_lowercase();
                    opts.krylov_method = match v.parse::<u8>() {
                        Ok(id) => KrylovMethod::from_id(id),
                        Err(_) => [
                            KrylovMethod::Gmres,
                            KrylovMethod::Bgmres,
                            KrylovMethod::Cg,
                            KrylovMethod::Bcg,
                            KrylovMethod::Gcrodr,
                            KrylovMethod::Bgcrodr,
                            KrylovMethod::Pcg,
                        ]
                        .into_iter()
                        .find(|m| m.name().eq_ignore_ascii_case(&v)),
                    }
                    .ok_or_else(|| KError::Config(format!("unknown Krylov method '{value}'")))?;
                }
                other => log::debug!("ignoring option '{prefix}{other}'"),
            }
        }
        Ok(opts.validated())
    }

    /// Applies the clamping rules: `max_it` to `i16::MAX`, the restart length to
    /// `max_it`, the recycled dimension below the restart length, and at least one
    /// copy per right-hand side for the enlargement factor.
    pub fn validated(mut self) -> Self {
        let cap = i16::MAX as usize;
        self.max_it = self.max_it.min(cap);
        self.gmres_restart = self.gmres_restart.min(self.max_it).min(cap).max(1);
        if self.recycle >= self.gmres_restart {
            self.recycle = self.gmres_restart - 1;
        }
        self.enlarge_krylov_subspace = self.enlarge_krylov_subspace.max(1);
        self
    }

    /// Tolerance in the working precision. A magnitude below machine epsilon is raised
    /// to `4 * epsilon`, keeping the relative/absolute sign.
    pub fn effective_tol<T: Scalar>(&self) -> T {
        let tol: T = cast(self.tol);
        let eps = T::epsilon();
        if tol.abs() < eps {
            let raised = cast::<T>(4.0) * eps;
            log::warn!(
                "{}: tolerance {:e} is below machine epsilon, raised to {:e}",
                self.krylov_method.name(),
                self.tol,
                raised
            );
            if tol < T::zero() { -raised } else { raised }
        } else {
            tol
        }
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_max_it(mut self, max_it: usize) -> Self {
        self.max_it = max_it;
        self.validated()
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_orthogonalization(mut self, orthogonalization: Orthogonalization) -> Self {
        self.orthogonalization = orthogonalization;
        self
    }

    pub fn with_qr(mut self, qr: QrMethod) -> Self {
        self.qr = qr;
        self
    }

    pub fn with_restart(mut self, restart: usize) -> Self {
        self.gmres_restart = restart;
        self.validated()
    }

    pub fn with_enlargement(mut self, k: usize) -> Self {
        self.enlarge_krylov_subspace = k;
        self.validated()
    }

    pub fn with_initial_deflation_tol(mut self, tol: f64) -> Self {
        self.initial_deflation_tol = tol;
        self
    }

    pub fn with_recycle(mut self, k: usize) -> Self {
        self.recycle = k;
        self.validated()
    }

    pub fn with_recycle_target(mut self, target: RecycleTarget) -> Self {
        self.recycle_target = target;
        self
    }

    pub fn with_recycle_strategy(mut self, strategy: RecycleStrategy) -> Self {
        self.recycle_strategy = strategy;
        self
    }

    pub fn with_recycle_same_system(mut self, same: bool) -> Self {
        self.recycle_same_system = same;
        self
    }

    pub fn with_method(mut self, method: KrylovMethod) -> Self {
        self.krylov_method = method;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let o = KrylovOptions::default();
        assert_eq!(o.tol, 1.0e-6);
        assert_eq!(o.max_it, 100);
        assert_eq!(o.gmres_restart, 40);
        assert_eq!(o.variant, Variant::Right);
        assert_eq!(o.initial_deflation_tol, -1.0);
        assert_eq!(o.krylov_method, KrylovMethod::Gmres);
    }

    #[test]
    fn prefixed_pairs_and_clamping() {
        let pairs = vec![
            ("ksp_max_it", "20"),
            ("ksp_gmres_restart", "50"),
            ("ksp_recycle", "30"),
            ("ksp_krylov_method", "4"),
            ("ksp_variant", "flexible"),
            ("other_tol", "1e-3"),
            ("ksp_unrelated", "x"),
        ];
        let o = KrylovOptions::from_pairs("ksp_", pairs).unwrap();
        assert_eq!(o.max_it, 20);
        assert_eq!(o.gmres_restart, 20);
        assert_eq!(o.recycle, 19);
        assert_eq!(o.krylov_method, KrylovMethod::Gcrodr);
        assert_eq!(o.variant, Variant::Flexible);
        assert_eq!(o.tol, 1.0e-6);
    }

    #[test]
    fn max_it_clamped_to_short_range() {
        let o = KrylovOptions::new().with_max_it(1_000_000);
        assert_eq!(o.max_it, i16::MAX as usize);
    }

    #[test]
    fn method_by_name_and_bad_values() {
        let o = KrylovOptions::from_pairs("", [("krylov_method", "bgcrodr")]).unwrap();
        assert_eq!(o.krylov_method, KrylovMethod::Bgcrodr);
        assert!(KrylovOptions::from_pairs("", [("krylov_method", "9")]).is_err());
        assert!(KrylovOptions::from_pairs("", [("tol", "abc")]).is_err());
    }

    #[test]
    fn tolerance_below_epsilon_is_raised() {
        let o = KrylovOptions::new().with_tol(1e-20);
        let t: f64 = o.effective_tol();
        assert_eq!(t, 4.0 * f64::EPSILON);
        let o = KrylovOptions::new().with_tol(-1e-30);
        let t: f32 = o.effective_tol();
        assert_eq!(t, -4.0 * f32::EPSILON);
    }

    #[test]
    fn deserializes_from_json() {
        let o: KrylovOptions =
            serde_json::from_str(r#"{"krylov_method":"bgmres","tol":1e-8,"qr":"mgs"}"#).unwrap();
        assert_eq!(o.krylov_method, KrylovMethod::Bgmres);
        assert_eq!(o.qr, QrMethod::Mgs);
        assert_eq!(o.gmres_restart, 40);
    }
}
