//! The `Installation` custom resource.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::Condition;

/// Prefix shared by the ConfigMaps that `spec.config` overrides.
pub const CONFIG_PREFIX: &str = "config-";

/// Desired state of an installation.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.keel.dev",
    version = "v1alpha1",
    kind = "Installation",
    namespaced,
    status = "InstallationStatus",
    shortname = "inst",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// ConfigMap data overrides keyed by ConfigMap name, with or without the
    /// `config-` prefix.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, BTreeMap<String, String>>,

    /// Image overrides for the installed workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
}

/// Container image rewriting for installed workloads.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Image template; `${NAME}` is replaced by the container name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Per-container image, keyed by container name or `deployment/container`.
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

/// Observed state of an installation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Version of the last successful install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// `metadata.generation` of the last successful install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Digest of the manifest the last successful install applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
}

impl InstallationSpec {
    /// Normalizes `config` keys to the unprefixed form. When both spellings
    /// exist, entries under the unprefixed key win.
    pub fn set_defaults(&mut self) {
        if !self.config.keys().any(|k| k.starts_with(CONFIG_PREFIX)) {
            return;
        }
        let mut normalized: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let (prefixed, plain): (Vec<_>, Vec<_>) = std::mem::take(&mut self.config)
            .into_iter()
            .partition(|(k, _)| k.starts_with(CONFIG_PREFIX));
        for (key, data) in prefixed.into_iter().chain(plain) {
            let short = key.strip_prefix(CONFIG_PREFIX).unwrap_or(&key).to_string();
            normalized.entry(short).or_default().extend(data);
        }
        self.config = normalized;
    }
}

impl Installation {
    pub fn status_or_default(&self) -> InstallationStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn status_entry(&mut self) -> &mut InstallationStatus {
        self.status.get_or_insert_with(InstallationStatus::default)
    }
}
