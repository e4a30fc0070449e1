//! Estimation of modified Kneser-Ney back-off n-gram language models from
//! integer count streams, gradient-based optimization of their
//! metaparameters against a dev set, and entropy-based pruning down to a
//! threshold or a target size.
//!
//! The model is a set of float counts over history states with per-order
//! discount constants and per-source count scales; see [`pipeline`] for
//! the estimation entry points, [`optimize`] for the metaparameter
//! optimizer, and [`prune`] for the pruning driver.

pub mod bfgs;
pub mod count;
pub mod discount;
pub mod error;
pub mod evaluate;
pub mod merge;
pub mod metaparams;
pub mod model;
pub mod optimize;
pub mod pipeline;
pub mod prune;
pub mod size_model;
pub mod sort;
pub mod stats;

pub use error::{Error, Result};
