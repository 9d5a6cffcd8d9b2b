//! Keel manifest overlay: an ordered set of resources that is transformed per
//! record, applied in order, and diffed against live state.

#![forbid(unsafe_code)]

use std::hash::Hasher;
use std::path::Path;
use std::sync::Arc;

use keel_core::{ClusterClient, Error, ResourceRef};
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::{debug, info};

mod template;
pub mod transform;

pub use template::{FileTemplate, StaticTemplate, TemplateSource};

/// Rewrites one resource in place. The error message is wrapped into
/// `Error::Transform` together with the resource identity.
pub type Transformer = Arc<dyn Fn(&mut DynamicObject) -> Result<(), String> + Send + Sync>;

/// Transformer chain for one pass; most chains are short.
pub type Transformers = SmallVec<[Transformer; 8]>;

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Ordered resource set. Apply order is sequence order.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    resources: Vec<DynamicObject>,
}

impl Manifest {
    pub fn new(resources: Vec<DynamicObject>) -> Result<Self, Error> {
        for r in &resources {
            ResourceRef::of(r)?;
        }
        Ok(Self { resources })
    }

    /// Parse a multi-document YAML stream. Empty documents are skipped.
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        if yaml.len() > max_yaml_bytes() {
            return Err(Error::Manifest(format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
        }
        let mut resources = Vec::new();
        let mut nodes_left = max_yaml_nodes();
        for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
            let val = serde_yaml::Value::deserialize(doc)
                .map_err(|e| Error::Manifest(format!("document {}: {}", idx, e)))?;
            if val.is_null() {
                continue;
            }
            let json = serde_json::to_value(val)
                .map_err(|e| Error::Manifest(format!("document {}: {}", idx, e)))?;
            if json_node_budget_exceeded(&json, nodes_left) {
                return Err(Error::Manifest(format!("YAML document too complex (>{} nodes)", max_yaml_nodes())));
            }
            nodes_left = nodes_left.saturating_sub(count_nodes(&json));
            resources.push(object_from_json(json, idx)?);
        }
        Ok(Self { resources })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Manifest(format!("reading {}: {}", path.display(), e)))?;
        let m = Self::parse(&yaml)?;
        info!(path = %path.display(), resources = m.len(), "manifest loaded");
        Ok(m)
    }

    pub fn resources(&self) -> &[DynamicObject] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources of the given kind, in order.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a DynamicObject> + 'a {
        self.resources
            .iter()
            .filter(move |r| r.types.as_ref().map(|t| t.kind == kind).unwrap_or(false))
    }

    /// New manifest with every transformer applied to every resource, in
    /// order. The first failure discards the whole result; `self` is untouched.
    pub fn transform(&self, fns: &[Transformer]) -> Result<Manifest, Error> {
        let mut resources = Vec::with_capacity(self.resources.len());
        for res in &self.resources {
            let mut obj = res.clone();
            for f in fns {
                f(&mut obj).map_err(|message| Error::transform(describe(res), message))?;
            }
            ResourceRef::of(&obj)?;
            resources.push(obj);
        }
        Ok(Manifest { resources })
    }

    /// Apply every resource in order, stopping at the first failure. Resources
    /// applied before the failure stay applied.
    pub async fn apply_all(&self, cluster: &dyn ClusterClient) -> Result<(), Error> {
        for obj in &self.resources {
            apply(cluster, obj).await?;
        }
        Ok(())
    }

    /// Content fingerprint of the resource set, stable across processes.
    /// Installations record it so a changed manifest triggers a new install.
    pub fn digest(&self) -> String {
        let mut hasher = FxHasher::default();
        for r in &self.resources {
            let doc = serde_json::to_string(r).unwrap_or_default();
            hasher.write(doc.as_bytes());
            hasher.write_u8(0);
        }
        format!("{:016x}", hasher.finish())
    }

    /// Multi-document YAML rendering of the resources.
    pub fn to_yaml(&self) -> Result<String, Error> {
        let mut out = String::new();
        for r in &self.resources {
            let doc = serde_yaml::to_string(r).map_err(|e| Error::Manifest(e.to_string()))?;
            out.push_str("---\n");
            out.push_str(&doc);
        }
        Ok(out)
    }
}

/// Apply one resource unless its live counterpart already matches.
pub async fn apply(cluster: &dyn ClusterClient, obj: &DynamicObject) -> Result<(), Error> {
    let r = ResourceRef::of(obj)?;
    match cluster.get(&r).await {
        Ok(live) => {
            let target = strip_noisy(serde_json::to_value(obj).map_err(|e| Error::Manifest(e.to_string()))?);
            let current = strip_noisy(serde_json::to_value(&live).map_err(|e| Error::Manifest(e.to_string()))?);
            let drift = diff_summary(&target, &current);
            if drift.adds == 0 && drift.updates == 0 {
                counter!("manifest_apply_skipped_total", 1u64);
                debug!(resource = %r, "live state matches manifest; skipping apply");
                return Ok(());
            }
            debug!(resource = %r, adds = drift.adds, updates = drift.updates, "applying drifted resource");
        }
        Err(e) if e.is_not_found() => debug!(resource = %r, "creating resource"),
        Err(source) => {
            counter!("manifest_apply_errors_total", 1u64);
            return Err(Error::Apply { resource: r.to_string(), source });
        }
    }
    match cluster.apply(obj).await {
        Ok(_) => {
            counter!("manifest_apply_total", 1u64);
            Ok(())
        }
        Err(source) => {
            counter!("manifest_apply_errors_total", 1u64);
            Err(Error::Apply { resource: r.to_string(), source })
        }
    }
}

/// Delete one resource. An absent resource is not an error.
pub async fn delete(cluster: &dyn ClusterClient, resource: &ResourceRef) -> Result<(), Error> {
    match cluster.delete(resource).await {
        Ok(()) => {
            info!(resource = %resource, "deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(source) => Err(Error::Delete { resource: resource.to_string(), source }),
    }
}

fn count_nodes(v: &Json) -> usize {
    match v {
        Json::Object(map) => 1 + map.values().map(count_nodes).sum::<usize>(),
        Json::Array(arr) => 1 + arr.iter().map(count_nodes).sum::<usize>(),
        _ => 1,
    }
}

fn object_from_json(json: Json, idx: usize) -> Result<DynamicObject, Error> {
    if json.get("apiVersion").and_then(|v| v.as_str()).is_none() {
        return Err(Error::Manifest(format!("document {}: missing apiVersion", idx)));
    }
    if json.get("kind").and_then(|v| v.as_str()).is_none() {
        return Err(Error::Manifest(format!("document {}: missing kind", idx)));
    }
    if json.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).is_none() {
        return Err(Error::Manifest(format!("document {}: missing metadata.name", idx)));
    }
    serde_json::from_value(json).map_err(|e| Error::Manifest(format!("document {}: {}", idx, e)))
}

fn describe(obj: &DynamicObject) -> String {
    ResourceRef::of(obj).map(|r| r.to_string()).unwrap_or_else(|_| "<unnamed>".to_string())
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Field-level drift of `target` relative to `base`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Counts fields `target` adds or changes relative to `base`, and fields only
/// `base` has. Arrays of equal length are compared element by element so
/// server-defaulted fields inside list items count as removes, not updates.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (V::Array(aa), V::Array(bb)) => {
                for (av, bv) in aa.iter().zip(bb.iter()) {
                    if av != bv { walk(av, bv, s); }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
