//! Status model of an installation record: conditions and the derived phase.
//!
//! Everything here is pure in-memory mutation. Callers decide when to persist.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::record::InstallationStatus;

/// Set when the manifest has been applied.
pub const INSTALL_SUCCEEDED: &str = "InstallSucceeded";
/// Set when every workload in the manifest reports `Available`.
pub const DEPLOYMENTS_AVAILABLE: &str = "DeploymentsAvailable";
/// Aggregate of the two conditions above.
pub const READY: &str = "Ready";

const DEPENDENTS: [&str; 2] = [DEPLOYMENTS_AVAILABLE, INSTALL_SUCCEEDED];

/// Tri-state truth value of a condition.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style status condition.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Moves only when `status` changes.
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }
}

/// Phase derived from the conditions; never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Installing,
    InstallSucceeded,
    InstallFailed,
    DeploymentsNotReady,
    DeploymentsAvailable,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Installing => "Installing",
            Phase::InstallSucceeded => "InstallSucceeded",
            Phase::InstallFailed => "InstallFailed",
            Phase::DeploymentsNotReady => "DeploymentsNotReady",
            Phase::DeploymentsAvailable => "DeploymentsAvailable",
        };
        f.write_str(s)
    }
}

impl InstallationStatus {
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    fn status_of(&self, type_: &str) -> ConditionStatus {
        self.get_condition(type_).map(|c| c.status).unwrap_or_default()
    }

    /// Adds every known condition that is missing, at `Unknown`.
    pub fn initialize_conditions(&mut self) {
        for type_ in DEPENDENTS.iter().chain(std::iter::once(&READY)) {
            if self.get_condition(type_).is_none() {
                self.conditions.push(Condition::new(*type_, ConditionStatus::Unknown, "", ""));
            }
        }
    }

    pub fn mark_install_succeeded(&mut self) {
        self.set_condition(INSTALL_SUCCEEDED, ConditionStatus::True, "Installed", "");
    }

    pub fn mark_install_failed(&mut self, message: &str) {
        self.set_condition(
            INSTALL_SUCCEEDED,
            ConditionStatus::False,
            "Error",
            &format!("Install failed with message: {}", message),
        );
    }

    pub fn mark_deployments_available(&mut self) {
        self.set_condition(DEPLOYMENTS_AVAILABLE, ConditionStatus::True, "Available", "");
    }

    pub fn mark_deployments_not_ready(&mut self) {
        self.set_condition(
            DEPLOYMENTS_AVAILABLE,
            ConditionStatus::False,
            "NotReady",
            "Waiting on deployments",
        );
    }

    /// Re-arms the install stage for the next pass.
    pub fn begin_install(&mut self, message: &str) {
        self.set_condition(INSTALL_SUCCEEDED, ConditionStatus::Unknown, "Reinstalling", message);
    }

    /// An install is outstanding: the install condition is neither True nor False.
    pub fn is_deploying(&self) -> bool {
        self.status_of(INSTALL_SUCCEEDED) == ConditionStatus::Unknown
    }

    /// The last install attempt failed. The install stage retries it
    /// without moving the condition, so repeated failures write nothing new.
    pub fn install_failed(&self) -> bool {
        self.status_of(INSTALL_SUCCEEDED) == ConditionStatus::False
    }

    /// Why a succeeded install has to be redone, if it does: the operator
    /// version, the record's generation or the manifest moved on.
    pub fn needs_install(&self, generation: Option<i64>, version: &str, digest: &str) -> Option<String> {
        if self.status_of(INSTALL_SUCCEEDED) != ConditionStatus::True {
            return None;
        }
        if self.version.as_deref() != Some(version) {
            Some(format!(
                "installed version {} differs from {}",
                self.version.as_deref().unwrap_or("<none>"),
                version
            ))
        } else if self.observed_generation != generation {
            Some(format!(
                "generation {} not yet installed",
                generation.map(|g| g.to_string()).unwrap_or_else(|| "<none>".into())
            ))
        } else if self.manifest_digest.as_deref() != Some(digest) {
            Some(format!("manifest {} not yet installed", digest))
        } else {
            None
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status_of(READY) == ConditionStatus::True
    }

    pub fn phase(&self) -> Phase {
        match (self.status_of(INSTALL_SUCCEEDED), self.status_of(DEPLOYMENTS_AVAILABLE)) {
            (ConditionStatus::Unknown, _) => Phase::Installing,
            (ConditionStatus::False, _) => Phase::InstallFailed,
            (ConditionStatus::True, ConditionStatus::True) => Phase::DeploymentsAvailable,
            (ConditionStatus::True, ConditionStatus::False) => Phase::DeploymentsNotReady,
            (ConditionStatus::True, ConditionStatus::Unknown) => Phase::InstallSucceeded,
        }
    }

    fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = Utc::now();
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.conditions.push(Condition::new(type_, status, reason, message)),
        }
        if type_ != READY {
            self.recompute_ready();
        }
    }

    fn recompute_ready(&mut self) {
        if let Some(failed) = DEPENDENTS
            .iter()
            .filter_map(|t| self.get_condition(t))
            .find(|c| c.is_false())
            .cloned()
        {
            self.set_condition(READY, ConditionStatus::False, &failed.reason, &failed.message);
        } else if DEPENDENTS.iter().all(|t| self.status_of(t) == ConditionStatus::True) {
            self.set_condition(READY, ConditionStatus::True, "", "");
        } else {
            self.set_condition(READY, ConditionStatus::Unknown, "", "");
        }
    }
}
