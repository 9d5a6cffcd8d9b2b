//! Built-in transformers applied to every manifest before install.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::record::CONFIG_PREFIX;
use keel_core::{Installation, Registry};
use kube::core::DynamicObject;
use kube::Resource;
use serde_json::{json, Value as Json};

use crate::Transformer;

/// Kinds that are never namespaced.
const CLUSTER_SCOPED: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// Workload kinds whose pod template is rewritten by `registry_overrides`.
const POD_TEMPLATE_KINDS: &[&str] = &["DaemonSet", "Deployment", "StatefulSet"];

fn kind(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

/// Moves namespaced resources into `namespace` and points namespaced
/// references (binding subjects, webhook and API services) at it.
pub fn inject_namespace(namespace: &str) -> Transformer {
    let ns = namespace.to_string();
    Arc::new(move |obj: &mut DynamicObject| {
        let k = kind(obj).to_string();
        match k.as_str() {
            "ClusterRoleBinding" | "RoleBinding" => {
                if let Some(subjects) = obj.data.get_mut("subjects").and_then(|s| s.as_array_mut()) {
                    for s in subjects.iter_mut() {
                        if s.get("kind").and_then(|k| k.as_str()) == Some("ServiceAccount") {
                            s["namespace"] = Json::String(ns.clone());
                        }
                    }
                }
            }
            "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => {
                if let Some(hooks) = obj.data.get_mut("webhooks").and_then(|w| w.as_array_mut()) {
                    for h in hooks.iter_mut() {
                        if let Some(svc) = h.pointer_mut("/clientConfig/service").and_then(|s| s.as_object_mut()) {
                            svc.insert("namespace".into(), Json::String(ns.clone()));
                        }
                    }
                }
            }
            "APIService" => {
                if let Some(svc) = obj.data.pointer_mut("/spec/service").and_then(|s| s.as_object_mut()) {
                    svc.insert("namespace".into(), Json::String(ns.clone()));
                }
            }
            _ => {}
        }
        if !is_cluster_scoped(&k) {
            obj.metadata.namespace = Some(ns.clone());
        }
        Ok(())
    })
}

/// Marks `owner` as the controlling owner of every resource in its namespace.
pub fn inject_owner(owner: &Installation) -> Transformer {
    let owner_ref = owner.controller_owner_ref(&());
    let owner_ns = owner.metadata.namespace.clone();
    Arc::new(move |obj: &mut DynamicObject| {
        if is_cluster_scoped(kind(obj)) || obj.metadata.namespace != owner_ns {
            return Ok(());
        }
        let owner_ref = owner_ref.clone().ok_or_else(|| "owner has no uid".to_string())?;
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.uid != owner_ref.uid);
        refs.push(owner_ref);
        Ok(())
    })
}

/// Merges `config[key]` into the data of ConfigMap `config-<key>`.
pub fn configmap_overrides(config: &BTreeMap<String, BTreeMap<String, String>>) -> Transformer {
    let config = config.clone();
    Arc::new(move |obj: &mut DynamicObject| {
        if kind(obj) != "ConfigMap" {
            return Ok(());
        }
        let name = obj.metadata.name.clone().unwrap_or_default();
        let short = name.strip_prefix(CONFIG_PREFIX).unwrap_or(&name);
        let overrides = match config.get(short).or_else(|| config.get(&name)) {
            Some(o) if !o.is_empty() => o,
            _ => return Ok(()),
        };
        let data = obj
            .data
            .as_object_mut()
            .ok_or_else(|| "ConfigMap body is not an object".to_string())?
            .entry("data")
            .or_insert_with(|| json!({}));
        let data = data.as_object_mut().ok_or_else(|| "ConfigMap data is not a map".to_string())?;
        for (k, v) in overrides {
            data.insert(k.clone(), Json::String(v.clone()));
        }
        Ok(())
    })
}

/// Rewrites container images and adds image pull secrets on pod templates.
///
/// Image lookup order: `override["<workload>/<container>"]`,
/// `override["<container>"]`, then `default` with `${NAME}` replaced by the
/// container name. Containers with no match keep their image.
pub fn registry_overrides(registry: &Registry) -> Transformer {
    let registry = registry.clone();
    Arc::new(move |obj: &mut DynamicObject| {
        if !POD_TEMPLATE_KINDS.contains(&kind(obj)) {
            return Ok(());
        }
        let workload = obj.metadata.name.clone().unwrap_or_default();
        let pod_spec = match obj.data.pointer_mut("/spec/template/spec").and_then(|s| s.as_object_mut()) {
            Some(s) => s,
            None => return Ok(()),
        };
        for field in ["initContainers", "containers"] {
            if let Some(containers) = pod_spec.get_mut(field).and_then(|c| c.as_array_mut()) {
                for c in containers.iter_mut() {
                    let name = c.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
                    if let Some(image) = image_for(&registry, &workload, &name) {
                        c["image"] = Json::String(image);
                    }
                }
            }
        }
        if !registry.image_pull_secrets.is_empty() {
            let secrets = pod_spec
                .entry("imagePullSecrets")
                .or_insert_with(|| json!([]))
                .as_array_mut()
                .ok_or_else(|| format!("{}: imagePullSecrets is not a list", workload))?;
            for s in &registry.image_pull_secrets {
                if !secrets.iter().any(|e| e.get("name").and_then(|n| n.as_str()) == Some(s.as_str())) {
                    secrets.push(json!({ "name": s }));
                }
            }
        }
        Ok(())
    })
}

fn image_for(registry: &Registry, workload: &str, container: &str) -> Option<String> {
    registry
        .overrides
        .get(&format!("{}/{}", workload, container))
        .or_else(|| registry.overrides.get(container))
        .cloned()
        .or_else(|| registry.default.as_ref().map(|d| d.replace("${NAME}", container)))
}
