//! Object identities: work-queue keys and subordinate resource references.

use std::fmt;
use std::str::FromStr;

use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// `namespace/name` key identifying a record in the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self { namespace: obj.namespace(), name: obj.name_any() }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    /// Accepts `name` or `namespace/name`; anything else is rejected.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self { namespace: None, name: (*name).to_string() }),
            [ns, name] if !name.is_empty() => Ok(Self {
                namespace: if ns.is_empty() { None } else { Some((*ns).to_string()) },
                name: (*name).to_string(),
            }),
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Identity of a subordinate resource: apiVersion, kind, namespace, name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Reference to an object from a manifest. Fails when `apiVersion`, `kind`
    /// or `metadata.name` are missing.
    pub fn of(obj: &DynamicObject) -> Result<Self, Error> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| Error::Manifest("object missing apiVersion/kind".into()))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Manifest(format!("{} missing metadata.name", types.kind)))?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = self.group_version();
        GroupVersionKind::gvk(group, version, &self.kind)
    }

    /// Empty object carrying only this identity; used for deletes.
    pub fn to_object(&self) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: self.api_version.clone(), kind: self.kind.clone() }),
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: self.namespace.clone(),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_and_bare_keys() {
        let k: ObjectKey = "knative-serving/ks".parse().unwrap();
        assert_eq!(k.namespace.as_deref(), Some("knative-serving"));
        assert_eq!(k.name, "ks");
        assert_eq!(k.to_string(), "knative-serving/ks");

        let bare: ObjectKey = "ks".parse().unwrap();
        assert_eq!(bare.namespace, None);
        assert_eq!(bare.name, "ks");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("ns/".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn resource_ref_splits_group_version() {
        let r = ResourceRef::new("apps/v1", "Deployment", Some("ns"), "d1");
        let gvk = r.gvk();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
        assert_eq!(r.to_string(), "apps/v1/Deployment ns/d1");

        let core = ResourceRef::new("v1", "ConfigMap", None, "c");
        assert_eq!(core.group_version(), ("", "v1"));
    }

    #[test]
    fn resource_ref_roundtrips_through_object() {
        let r = ResourceRef::new("v1", "Service", Some("istio-system"), "gw");
        let obj = r.to_object();
        assert_eq!(ResourceRef::of(&obj).unwrap(), r);
    }

    #[test]
    fn resource_ref_requires_name() {
        let mut obj = ResourceRef::new("v1", "Service", None, "x").to_object();
        obj.metadata.name = None;
        assert!(ResourceRef::of(&obj).is_err());
    }
}
