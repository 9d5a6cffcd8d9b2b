//! Keel kubehub: the reconciler's seams implemented over `kube::Client`,
//! and the controller loop that drives it.

#![forbid(unsafe_code)]

mod cluster;
mod events;
mod records;
mod runner;

pub use cluster::{KubeCluster, FIELD_MANAGER};
pub use events::{KubeEventSink, REPORTER};
pub use records::KubeRecordStore;
pub use runner::{run_controller, RunnerConfig};
