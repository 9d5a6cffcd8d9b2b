//! Keel core types: the installation record, its status model, and the
//! narrow client seams the reconciler talks through.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod key;
pub mod record;
pub mod status;

pub use client::{ClusterClient, EventSink, RecordStore};
pub use error::{ClientError, Error, Result};
pub use key::{ObjectKey, ResourceRef};
pub use record::{Installation, InstallationSpec, InstallationStatus, Registry};
pub use status::{Condition, ConditionStatus, Phase};

pub mod prelude {
    pub use super::{
        ClientError, ClusterClient, Condition, ConditionStatus, Error, EventSink, Installation,
        InstallationSpec, InstallationStatus, ObjectKey, Phase, RecordStore, ResourceRef,
    };
}
