//! The convergence pass: a fixed list of stages run against a working copy
//! of the record, with status deltas persisted at stage boundaries.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use keel_core::{
    ClientError, ClusterClient, Error, EventSink, Installation, InstallationStatus, ObjectKey,
    RecordStore,
};
use keel_manifest::{Manifest, TemplateSource};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, warn};

use crate::availability::check_deployments;
use crate::platform::Platforms;
use crate::sweep::delete_obsolete;

pub const REASON_INSTALL_SUCCEEDED: &str = "InstallSucceeded";
pub const REASON_UPDATE_FAILED: &str = "UpdateFailed";
pub const REASON_INTERNAL_ERROR: &str = "InternalError";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    InitStatus,
    Install,
    CheckDeployments,
    DeleteObsoleteResources,
}

const PIPELINE: [Stage; 4] = [
    Stage::InitStatus,
    Stage::Install,
    Stage::CheckDeployments,
    Stage::DeleteObsoleteResources,
];

impl Stage {
    /// Whether the stage can change status and is followed by a persist.
    fn persists(self) -> bool {
        !matches!(self, Stage::DeleteObsoleteResources)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::InitStatus => "init_status",
            Stage::Install => "install",
            Stage::CheckDeployments => "check_deployments",
            Stage::DeleteObsoleteResources => "delete_obsolete_resources",
        };
        f.write_str(s)
    }
}

/// Working state of one pass.
struct Pass {
    record: Installation,
    /// Status as last written (or as read, before any write).
    persisted: Option<InstallationStatus>,
    /// Template snapshot; a reload mid-pass takes effect on the next pass.
    template: Arc<Manifest>,
    digest: String,
    /// Transformed overlay, built at most once per pass.
    overlay: Option<Arc<Manifest>>,
}

impl Pass {
    fn new(record: Installation, template: Arc<Manifest>) -> Self {
        let persisted = record.status.clone();
        let digest = template.digest();
        Self { record, persisted, template, digest, overlay: None }
    }

    fn status_changed(&self) -> bool {
        self.record.status != self.persisted
    }

    fn key(&self) -> String {
        ObjectKey::from_resource(&self.record).to_string()
    }
}

/// Drives installation records toward their desired state.
pub struct Reconciler {
    records: Arc<dyn RecordStore>,
    cluster: Arc<dyn ClusterClient>,
    events: Arc<dyn EventSink>,
    template: Arc<dyn TemplateSource>,
    platforms: Platforms,
    version: String,
}

impl Reconciler {
    pub fn new(
        records: Arc<dyn RecordStore>,
        cluster: Arc<dyn ClusterClient>,
        template: Arc<dyn TemplateSource>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            records,
            cluster,
            events: Arc::new(keel_core::client::NoopEventSink),
            template,
            platforms: Platforms::default(),
            version: version.into(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_platforms(mut self, platforms: Platforms) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Transformed overlay for `record`, without touching the cluster.
    pub fn render(&self, record: &Installation) -> Result<Manifest, Error> {
        self.render_from(&self.template.manifest(), record)
    }

    fn render_from(&self, template: &Manifest, record: &Installation) -> Result<Manifest, Error> {
        let chain = self.platforms.transformers(record)?;
        template.transform(&chain)
    }

    /// One convergence pass for the record named by `key` (`namespace/name`).
    ///
    /// Returns `Ok` when the pass converged or there is nothing to do; any
    /// error means the key should be retried.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &str) -> Result<(), Error> {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let result = self.reconcile_key(key).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &result {
            counter!("reconcile_errors_total", 1u64, "kind" => e.kind());
        }
        result
    }

    async fn reconcile_key(&self, key: &str) -> Result<(), Error> {
        let key = match key.parse::<ObjectKey>() {
            Ok(ObjectKey { namespace: Some(ns), name }) => ObjectKey::new(ns, name),
            Ok(_) => {
                error!("installation keys must be namespaced");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "dropping invalid key");
                return Ok(());
            }
        };
        let namespace = key.namespace.as_deref().unwrap_or_default();
        let original = match self.records.get(namespace, &key.name).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("installation no longer exists");
                return Ok(());
            }
            Err(source) => return Err(Error::Lookup { record: key.to_string(), source }),
        };

        let mut pass = Pass::new(original.clone(), self.template.manifest());
        let outcome = self.run_pipeline(&mut pass).await;

        if pass.status_changed() {
            if let Err(source) = self.persist(&mut pass).await {
                self.events
                    .publish(
                        &pass.record,
                        EventType::Warning,
                        REASON_UPDATE_FAILED,
                        format!("Failed to update status: {}", source),
                    )
                    .await;
                return Err(Error::StatusPersist { record: key.to_string(), source });
            }
        }

        if let Err(e) = outcome {
            warn!(error = %e, "convergence pass failed");
            self.events
                .publish(&pass.record, EventType::Warning, REASON_INTERNAL_ERROR, e.to_string())
                .await;
            return Err(e);
        }

        if pass.record.spec != original.spec {
            info!("spec defaults changed; signalling upgrade");
            self.records
                .upgrade(&pass.record)
                .await
                .map_err(|source| Error::Upgrade { record: key.to_string(), source })?;
        }
        Ok(())
    }

    async fn run_pipeline(&self, pass: &mut Pass) -> Result<(), Error> {
        for stage in PIPELINE {
            let result = match stage {
                Stage::InitStatus => self.init_status(pass),
                Stage::Install => self.install(pass).await,
                Stage::CheckDeployments => self.check(pass).await,
                Stage::DeleteObsoleteResources => {
                    let ns = pass.record.namespace().unwrap_or_default();
                    delete_obsolete(self.cluster.as_ref(), &ns).await
                }
            };
            let persisted = if stage.persists() { self.persist(pass).await } else { Ok(()) };
            match (result, persisted) {
                (Ok(()), Ok(())) => debug!(%stage, "stage complete"),
                (Ok(()), Err(source)) => {
                    return Err(Error::StatusPersist { record: pass.key(), source });
                }
                (Err(e), Ok(())) => return Err(e),
                (Err(e), Err(persist)) => {
                    warn!(%stage, error = %persist, "status not persisted after failed stage");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn init_status(&self, pass: &mut Pass) -> Result<(), Error> {
        let generation = pass.record.metadata.generation;
        pass.record.spec.set_defaults();
        let status = pass.record.status_entry();
        status.initialize_conditions();
        if let Some(reason) = status.needs_install(generation, &self.version, &pass.digest) {
            info!(%reason, "starting install cycle");
            status.begin_install(&reason);
        }
        Ok(())
    }

    async fn install(&self, pass: &mut Pass) -> Result<(), Error> {
        let status = pass.record.status_or_default();
        if !status.is_deploying() && !status.install_failed() {
            debug!("install already concluded; skipping");
            return Ok(());
        }
        match self.install_overlay(pass).await {
            Ok(()) => {
                let generation = pass.record.metadata.generation;
                let status = pass.record.status_entry();
                status.version = Some(self.version.clone());
                status.observed_generation = generation;
                status.manifest_digest = Some(pass.digest.clone());
                status.mark_install_succeeded();
                info!(version = %self.version, "install succeeded");
                self.events
                    .publish(
                        &pass.record,
                        EventType::Normal,
                        REASON_INSTALL_SUCCEEDED,
                        format!("Installed version {}", self.version),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                pass.record.status_entry().mark_install_failed(&e.to_string());
                Err(e)
            }
        }
    }

    async fn install_overlay(&self, pass: &mut Pass) -> Result<(), Error> {
        let overlay = self.overlay(pass)?;
        self.platforms.pre_install(&pass.record).await?;
        overlay.apply_all(self.cluster.as_ref()).await?;
        self.platforms.post_install(&pass.record).await
    }

    async fn check(&self, pass: &mut Pass) -> Result<(), Error> {
        let overlay = self.overlay(pass)?;
        check_deployments(self.cluster.as_ref(), &overlay, pass.record.status_entry()).await
    }

    fn overlay(&self, pass: &mut Pass) -> Result<Arc<Manifest>, Error> {
        if let Some(overlay) = &pass.overlay {
            return Ok(Arc::clone(overlay));
        }
        let overlay = Arc::new(self.render_from(&pass.template, &pass.record)?);
        pass.overlay = Some(Arc::clone(&overlay));
        Ok(overlay)
    }

    /// Writes the status if it moved since the last write and carries the
    /// new resourceVersion into the working copy.
    async fn persist(&self, pass: &mut Pass) -> Result<(), ClientError> {
        if !pass.status_changed() {
            return Ok(());
        }
        let updated = self.records.update_status(&pass.record).await?;
        counter!("status_updates_total", 1u64);
        pass.record.metadata.resource_version = updated.metadata.resource_version;
        pass.persisted = pass.record.status.clone();
        Ok(())
    }
}
