//! Controller for MicroApplication
//!
//! The reconcile loop drives one application through the sync pipeline:
//! workspace sync, manifest discovery, authorization, apply and status.

mod application;

pub use application::{error_policy, reconcile, Context, ContextBuilder, ReconcileStage};
