//! Per-environment customization around the install step.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{Error, Installation};
use keel_manifest::transform::{configmap_overrides, inject_namespace, inject_owner, registry_overrides};
use keel_manifest::{Transformer, Transformers};
use kube::ResourceExt;
use tracing::debug;

/// Behaviour one platform contributes to every install.
#[allow(unused_variables)]
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Extra transformers, run after the built-in ones.
    fn transformers(&self, record: &Installation) -> Result<Vec<Transformer>, Error> {
        Ok(Vec::new())
    }

    async fn pre_install(&self, record: &Installation) -> Result<(), Error> {
        Ok(())
    }

    async fn post_install(&self, record: &Installation) -> Result<(), Error> {
        Ok(())
    }
}

/// The set of extensions the reconciler was built with.
#[derive(Clone, Default)]
pub struct Platforms {
    extensions: Vec<Arc<dyn Extension>>,
}

impl Platforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Built-in chain for `record` followed by every extension's transformers.
    ///
    /// Namespace injection runs first so owner stamping sees final namespaces.
    pub fn transformers(&self, record: &Installation) -> Result<Transformers, Error> {
        let mut chain = Transformers::new();
        if let Some(ns) = record.namespace() {
            chain.push(inject_namespace(&ns));
        }
        chain.push(inject_owner(record));
        chain.push(configmap_overrides(&record.spec.config));
        if let Some(registry) = &record.spec.registry {
            chain.push(registry_overrides(registry));
        }
        for ext in &self.extensions {
            let extra = ext.transformers(record)?;
            debug!(platform = ext.name(), transformers = extra.len(), "platform transformers");
            chain.extend(extra);
        }
        Ok(chain)
    }

    pub async fn pre_install(&self, record: &Installation) -> Result<(), Error> {
        for ext in &self.extensions {
            ext.pre_install(record).await?;
        }
        Ok(())
    }

    pub async fn post_install(&self, record: &Installation) -> Result<(), Error> {
        for ext in &self.extensions {
            ext.post_install(record).await?;
        }
        Ok(())
    }
}
