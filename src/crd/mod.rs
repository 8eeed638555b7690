//! Custom Resource Definitions for the MicroApplication operator

mod micro_application;

pub use micro_application::{
    MicroApplication, MicroApplicationSpec, MicroApplicationStatus, SyncPhase,
};
