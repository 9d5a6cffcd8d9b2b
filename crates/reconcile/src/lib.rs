//! Keel reconcile: the convergence pipeline for installation records.
//!
//! `Reconciler::reconcile` is the single entry point. It is re-entrant and
//! safe to call repeatedly for the same key, including after a failed pass.

#![forbid(unsafe_code)]

pub mod availability;
pub mod controller;
pub mod platform;
pub mod sweep;

pub use controller::{Reconciler, REASON_INSTALL_SUCCEEDED, REASON_INTERNAL_ERROR, REASON_UPDATE_FAILED};
pub use platform::{Extension, Platforms};
