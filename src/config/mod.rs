pub mod options;

pub use options::{
    KrylovMethod, KrylovOptions, Orthogonalization, QrMethod, RecycleStrategy, RecycleTarget, Variant,
};
