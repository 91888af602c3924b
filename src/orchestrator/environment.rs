//! Lifecycle of a user's environment bundle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::auth::ResourceQuota;
use crate::cluster::{
    self, ClusterClient, ResourceKind, ResourceObject, ResourceSpec,
};
use crate::config::EnvironmentConfig;
use crate::error::{ClusterError, OrchestratorError, PortError, StoreError};
use crate::lock::{LockGuard, LockService};
use crate::naming::{self, ResourceNames};
use crate::orchestrator::descriptor::{
    AccessInfo, EnvStatus, EnvironmentDescriptor, EnvironmentSummary, StatusDetail,
};
use crate::orchestrator::manifests;
use crate::ports::{PortAllocator, PortNamespace};
use crate::store::{self, SharedStore};

/// Lines of compute-unit output returned when the caller gives no tail.
pub const DEFAULT_LOG_LINES: u32 = 50;

/// What to provision beyond the base bundle.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub quota: ResourceQuota,
    /// Map an SSH proxy port to the environment.
    pub ssh: bool,
    /// Serve raw VNC on a NodePort from the direct range.
    pub direct_port: bool,
}

impl ProvisionOptions {
    pub fn with_quota(quota: ResourceQuota) -> Self {
        Self {
            quota,
            ..Self::default()
        }
    }
}

/// Result of [`EnvironmentOrchestrator::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The environment was already running; nothing was mutated.
    Existing(EnvironmentDescriptor),
    /// This call provisioned (or finished provisioning) the environment.
    Provisioned(EnvironmentDescriptor),
}

impl CreateOutcome {
    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        match self {
            CreateOutcome::Existing(d) | CreateOutcome::Provisioned(d) => d,
        }
    }

    pub fn into_descriptor(self) -> EnvironmentDescriptor {
        match self {
            CreateOutcome::Existing(d) | CreateOutcome::Provisioned(d) => d,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self, CreateOutcome::Provisioned(_))
    }
}

fn cache_key(user_id: &str) -> String {
    format!("environment:{user_id}")
}

fn lock_name(user_id: &str) -> String {
    format!("env:{user_id}")
}

fn step_failed(user_id: &str, step: &str, e: ClusterError) -> OrchestratorError {
    OrchestratorError::PartialProvisioningFailure {
        user_id: user_id.to_string(),
        step: step.to_string(),
        reason: e.to_string(),
    }
}

fn teardown_failed(user_id: &str, step: &str, e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::PartialTeardownFailure {
        user_id: user_id.to_string(),
        step: step.to_string(),
        reason: e.to_string(),
    }
}

fn read_failed(e: ClusterError) -> OrchestratorError {
    OrchestratorError::BackingServiceUnavailable(e.to_string())
}

/// Fail with `LockLost` unless `guard` still holds the per-user lock.
fn hold(guard: &LockGuard, user_id: &str, step: &str) -> Result<(), OrchestratorError> {
    if guard.is_held() {
        return Ok(());
    }
    Err(OrchestratorError::LockLost {
        user_id: user_id.to_string(),
        key: guard.key().unwrap_or_default().to_string(),
        step: step.to_string(),
    })
}

/// Drives create, delete and query of per-user environments.
///
/// Mutations run under the per-user lock `env:{user_id}`; reads never lock
/// and may observe a partially provisioned bundle. The cluster is the source
/// of truth: the descriptor cache can be dropped at any time and is rebuilt
/// on the next read.
pub struct EnvironmentOrchestrator {
    cluster: Arc<dyn ClusterClient>,
    ports: Arc<PortAllocator>,
    locks: LockService,
    store: SharedStore,
    namespace: String,
    config: EnvironmentConfig,
}

impl EnvironmentOrchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        ports: Arc<PortAllocator>,
        store: SharedStore,
        namespace: impl Into<String>,
        config: EnvironmentConfig,
    ) -> Self {
        let locks = LockService::new(
            Arc::clone(&store),
            config.lock_ttl,
            config.lock_wait,
            config.lock_retry_interval,
        );
        Self {
            cluster,
            ports,
            locks,
            store,
            namespace: namespace.into(),
            config,
        }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    // ── create ───────────────────────────────────────────────────────

    /// Provision the full bundle for `user_id`, or return it if already running.
    ///
    /// Every step tolerates resources that already exist, so a failed call can
    /// simply be retried. A failure leaves what was created in place and the
    /// environment `Degraded`.
    pub async fn create(
        &self,
        user_id: &str,
        credentials: &SecretString,
        options: &ProvisionOptions,
    ) -> Result<CreateOutcome, OrchestratorError> {
        if let Some(existing) = self.get(user_id).await?
            && self.satisfies(&existing, options)
        {
            tracing::debug!(user_id = %user_id, "Environment already running");
            return Ok(CreateOutcome::Existing(existing));
        }

        let guard = self.locks.lock(&lock_name(user_id)).await?;
        let result = self.create_locked(user_id, credentials, options, &guard).await;
        guard.release().await;
        result
    }

    async fn create_locked(
        &self,
        user_id: &str,
        credentials: &SecretString,
        options: &ProvisionOptions,
        guard: &LockGuard,
    ) -> Result<CreateOutcome, OrchestratorError> {
        // Another caller may have finished while we waited for the lock. A
        // cached non-running entry can be stale, so confirm against the cluster.
        // A complete bundle whose compute unit is still starting counts as
        // done: provisioning again would hand out a password it never got.
        let current = match self.cached(user_id).await? {
            Some(d) if d.is_running() => Some(d),
            _ => self.rebuild(user_id).await?,
        };
        if let Some(existing) = current
            && (existing.is_running() || existing.status == EnvStatus::Provisioning)
            && self.has_extras(&existing, options)
        {
            tracing::debug!(user_id = %user_id, "Environment became ready while waiting for lock");
            return Ok(CreateOutcome::Existing(existing));
        }

        let names = ResourceNames::for_user(user_id);
        let provisioning = EnvironmentDescriptor::new(
            &names,
            EnvStatus::Provisioning,
            chrono::Utc::now(),
            AccessInfo::for_user(user_id, &self.config.domain),
        );
        self.cache(&provisioning, self.config.lock_ttl).await?;

        tracing::info!(
            user_id = %user_id,
            ssh = options.ssh,
            direct_port = options.direct_port,
            "Provisioning environment"
        );
        match self.provision(&names, credentials, options, guard).await {
            Ok(descriptor) if descriptor.is_running() => {
                self.cache(&descriptor, self.config.descriptor_ttl).await?;
                tracing::info!(
                    user_id = %user_id,
                    compute_unit = %descriptor.compute_unit,
                    "Environment running"
                );
                Ok(CreateOutcome::Provisioned(descriptor))
            }
            Ok(descriptor) => {
                // Reads rebuild from the cluster until the compute unit is up.
                self.store.delete(&cache_key(user_id)).await?;
                tracing::info!(
                    user_id = %user_id,
                    compute_unit = %descriptor.compute_unit,
                    status = %descriptor.status,
                    "Environment provisioned, compute unit starting"
                );
                Ok(CreateOutcome::Provisioned(descriptor))
            }
            Err(e @ OrchestratorError::LockLost { .. }) => {
                tracing::error!(user_id = %user_id, error = %e, "Provisioning abandoned");
                Err(e)
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Provisioning failed, environment degraded");
                self.mark_degraded(provisioning).await;
                Err(e)
            }
        }
    }

    fn satisfies(&self, descriptor: &EnvironmentDescriptor, options: &ProvisionOptions) -> bool {
        descriptor.is_running() && self.has_extras(descriptor, options)
    }

    fn has_extras(&self, descriptor: &EnvironmentDescriptor, options: &ProvisionOptions) -> bool {
        (!options.ssh || descriptor.access_info.ssh.is_some())
            && (!options.direct_port || descriptor.access_info.direct_port.is_some())
    }

    async fn provision(
        &self,
        names: &ResourceNames,
        credentials: &SecretString,
        options: &ProvisionOptions,
        guard: &LockGuard,
    ) -> Result<EnvironmentDescriptor, OrchestratorError> {
        let user_id = names.user_id.as_str();
        let ns = self.namespace.as_str();

        // The endpoint manifest needs the NodePort, so reserve it first.
        let direct_port = if options.direct_port {
            hold(guard, user_id, "direct_port")?;
            Some(self.ports.allocate(PortNamespace::Direct, user_id).await?)
        } else {
            self.existing_port(PortNamespace::Direct, user_id).await?
        };

        hold(guard, user_id, "storage_claim")?;
        self.ensure(
            user_id,
            "storage_claim",
            manifests::storage_claim(names, ns, &self.config, &options.quota),
        )
        .await?;
        hold(guard, user_id, "compute_unit")?;
        let unit = self
            .ensure(
                user_id,
                "compute_unit",
                manifests::compute_unit(
                    names,
                    ns,
                    &self.config,
                    &options.quota,
                    credentials.expose_secret(),
                ),
            )
            .await?;
        hold(guard, user_id, "endpoint")?;
        self.ensure(user_id, "endpoint", manifests::endpoint(names, ns, direct_port))
            .await?;
        hold(guard, user_id, "ingress")?;
        self.ensure(user_id, "ingress", manifests::ingress(names, ns, &self.config))
            .await?;

        let ssh_port = if options.ssh {
            hold(guard, user_id, "ssh_port")?;
            let port = self.ports.allocate(PortNamespace::SshProxy, user_id).await?;
            self.ports.expose(port).await?;
            Some(port)
        } else {
            self.existing_port(PortNamespace::SshProxy, user_id).await?
        };
        hold(guard, user_id, "descriptor")?;

        let mut access = AccessInfo::for_user(user_id, &self.config.domain);
        access.direct_port = direct_port;
        access.ssh = ssh_port.map(|p| self.ports.ssh_access(p, &self.config.domain));

        Ok(EnvironmentDescriptor::new(
            names,
            EnvStatus::from_phase(unit.phase.as_deref()),
            unit.created_at,
            access,
        ))
    }

    async fn ensure(
        &self,
        user_id: &str,
        step: &str,
        spec: ResourceSpec,
    ) -> Result<ResourceObject, OrchestratorError> {
        cluster::ensure_created(self.cluster.as_ref(), &spec)
            .await
            .map_err(|e| step_failed(user_id, step, e))
    }

    /// Mapped port of `ns`, treating a disabled namespace as unmapped.
    async fn existing_port(
        &self,
        ns: PortNamespace,
        user_id: &str,
    ) -> Result<Option<u16>, OrchestratorError> {
        match self.ports.get_existing(ns, user_id).await {
            Ok(port) => Ok(port),
            Err(PortError::NamespaceDisabled(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── delete ───────────────────────────────────────────────────────

    /// Tear down the environment. Returns whether anything existed.
    ///
    /// Inbound routing goes first, then the compute unit, which is awaited
    /// until fully terminated so a following create does not collide with
    /// it. Port mappings survive; see [`Self::release_ports`].
    pub async fn delete(&self, user_id: &str, keep_storage: bool) -> Result<bool, OrchestratorError> {
        let guard = self.locks.lock(&lock_name(user_id)).await?;
        let result = self.delete_locked(user_id, keep_storage, &guard).await;
        guard.release().await;
        result
    }

    async fn delete_locked(
        &self,
        user_id: &str,
        keep_storage: bool,
        guard: &LockGuard,
    ) -> Result<bool, OrchestratorError> {
        let names = ResourceNames::for_user(user_id);
        let previous = self.cached(user_id).await?;
        if let Some(d) = &previous {
            self.cache(&d.clone().with_status(EnvStatus::Deleting), self.config.lock_ttl)
                .await?;
        }

        match self.teardown(&names, keep_storage, guard).await {
            Ok(removed) => {
                self.store.delete(&cache_key(user_id)).await?;
                if removed {
                    tracing::info!(user_id = %user_id, keep_storage, "Environment deleted");
                } else {
                    tracing::debug!(user_id = %user_id, "No environment to delete");
                }
                Ok(removed)
            }
            Err(e @ OrchestratorError::LockLost { .. }) => {
                tracing::error!(user_id = %user_id, error = %e, "Teardown abandoned");
                Err(e)
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Teardown failed, environment degraded");
                let degraded = previous.unwrap_or_else(|| {
                    EnvironmentDescriptor::new(
                        &names,
                        EnvStatus::Degraded,
                        chrono::Utc::now(),
                        AccessInfo::for_user(user_id, &self.config.domain),
                    )
                });
                self.mark_degraded(degraded).await;
                Err(e)
            }
        }
    }

    async fn teardown(
        &self,
        names: &ResourceNames,
        keep_storage: bool,
        guard: &LockGuard,
    ) -> Result<bool, OrchestratorError> {
        let user_id = names.user_id.as_str();
        let mut removed = false;

        for (kind, name) in [
            (ResourceKind::Ingress, &names.ingress),
            (ResourceKind::Endpoint, &names.endpoint),
            (ResourceKind::ComputeUnit, &names.compute_unit),
        ] {
            hold(guard, user_id, &kind.to_string())?;
            removed |= cluster::delete_if_present(self.cluster.as_ref(), kind, name)
                .await
                .map_err(|e| teardown_failed(user_id, &kind.to_string(), e))?;
        }

        self.await_termination(names, guard).await?;

        if !keep_storage {
            hold(guard, user_id, "storage_claim")?;
            removed |= cluster::delete_if_present(
                self.cluster.as_ref(),
                ResourceKind::StorageClaim,
                &names.storage_claim,
            )
            .await
            .map_err(|e| teardown_failed(user_id, "storage_claim", e))?;
        }
        Ok(removed)
    }

    /// Poll until the compute unit is gone. Polling, not watch-based: the
    /// worst-case extra latency is one poll interval.
    async fn await_termination(
        &self,
        names: &ResourceNames,
        guard: &LockGuard,
    ) -> Result<(), OrchestratorError> {
        let user_id = names.user_id.as_str();
        for attempt in 0..self.config.delete_poll_attempts {
            hold(guard, user_id, "compute_unit_termination")?;
            let unit = self
                .cluster
                .get(ResourceKind::ComputeUnit, &names.compute_unit)
                .await
                .map_err(|e| teardown_failed(user_id, "compute_unit_termination", e))?;
            if unit.is_none() {
                return Ok(());
            }
            tracing::debug!(user_id = %user_id, attempt, "Waiting for compute unit to terminate");
            tokio::time::sleep(self.config.delete_poll_interval).await;
        }
        Err(teardown_failed(
            user_id,
            "compute_unit_termination",
            format!(
                "{} still present after {} checks",
                names.compute_unit, self.config.delete_poll_attempts
            ),
        ))
    }

    // ── queries ──────────────────────────────────────────────────────

    /// Descriptor for `user_id`, from cache or rebuilt from the cluster.
    pub async fn get(&self, user_id: &str) -> Result<Option<EnvironmentDescriptor>, OrchestratorError> {
        if let Some(descriptor) = self.cached(user_id).await? {
            return Ok(Some(descriptor));
        }
        self.rebuild(user_id).await
    }

    async fn cached(&self, user_id: &str) -> Result<Option<EnvironmentDescriptor>, OrchestratorError> {
        match store::get_json(self.store.as_ref(), &cache_key(user_id)).await {
            Ok(d) => Ok(d),
            Err(StoreError::Serialization(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Discarding undecodable descriptor");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cache(&self, descriptor: &EnvironmentDescriptor, ttl: Duration) -> Result<(), OrchestratorError> {
        store::set_json(
            self.store.as_ref(),
            &cache_key(&descriptor.user_id),
            descriptor,
            Some(ttl),
        )
        .await?;
        Ok(())
    }

    async fn mark_degraded(&self, descriptor: EnvironmentDescriptor) {
        let degraded = descriptor.with_status(EnvStatus::Degraded);
        if let Err(e) = self.cache(&degraded, self.config.rebuilt_descriptor_ttl).await {
            tracing::warn!(user_id = %degraded.user_id, error = %e, "Failed to record degraded state");
        }
    }

    /// Reconstruct the descriptor from cluster state. Only running
    /// environments are cached, so a transient state is never pinned.
    async fn rebuild(&self, user_id: &str) -> Result<Option<EnvironmentDescriptor>, OrchestratorError> {
        let names = ResourceNames::for_user(user_id);
        let Some(unit) = self
            .cluster
            .get(ResourceKind::ComputeUnit, &names.compute_unit)
            .await
            .map_err(read_failed)?
        else {
            return Ok(None);
        };

        let mut status = if unit.terminating {
            EnvStatus::Deleting
        } else {
            EnvStatus::from_phase(unit.phase.as_deref())
        };
        if matches!(status, EnvStatus::Running | EnvStatus::Provisioning)
            && !self.routing_present(&names).await?
        {
            status = EnvStatus::Degraded;
        }

        let mut access = AccessInfo::for_user(user_id, &self.config.domain);
        access.direct_port = self.lookup_port(PortNamespace::Direct, user_id).await;
        access.ssh = self
            .lookup_port(PortNamespace::SshProxy, user_id)
            .await
            .map(|p| self.ports.ssh_access(p, &self.config.domain));

        let descriptor = EnvironmentDescriptor::new(&names, status, unit.created_at, access);
        if descriptor.is_running() {
            self.cache(&descriptor, self.config.rebuilt_descriptor_ttl).await?;
        }
        tracing::debug!(user_id = %user_id, status = %status, "Rebuilt descriptor from cluster");
        Ok(Some(descriptor))
    }

    async fn routing_present(&self, names: &ResourceNames) -> Result<bool, OrchestratorError> {
        for (kind, name) in [
            (ResourceKind::Endpoint, &names.endpoint),
            (ResourceKind::Ingress, &names.ingress),
        ] {
            if self.cluster.get(kind, name).await.map_err(read_failed)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn lookup_port(&self, ns: PortNamespace, user_id: &str) -> Option<u16> {
        match self.existing_port(ns, user_id).await {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(user_id = %user_id, namespace = %ns, error = %e, "Port lookup failed");
                None
            }
        }
    }

    /// Every managed environment, straight from the cluster.
    pub async fn list(&self) -> Result<Vec<EnvironmentSummary>, OrchestratorError> {
        let selector = BTreeMap::from([("managed-by".to_string(), naming::MANAGED_BY.to_string())]);
        let units = self
            .cluster
            .list(ResourceKind::ComputeUnit, &selector)
            .await
            .map_err(read_failed)?;

        Ok(units
            .into_iter()
            .filter_map(|unit| {
                let user_id = unit.user_id()?.to_string();
                let status = if unit.terminating {
                    EnvStatus::Deleting
                } else {
                    EnvStatus::from_phase(unit.phase.as_deref())
                };
                Some(EnvironmentSummary {
                    user_id,
                    compute_unit: unit.name,
                    status,
                    created_at: unit.created_at,
                    pod_ip: unit.pod_ip,
                    host_ip: unit.host_ip,
                })
            })
            .collect())
    }

    /// Delete every environment older than `max_age`, keeping storage.
    /// Returns how many were removed; individual failures are logged and skipped.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<usize, OrchestratorError> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = chrono::Utc::now();
        let mut removed = 0;

        for env in self.list().await? {
            let age = now - env.created_at;
            if age <= max_age || env.status == EnvStatus::Deleting {
                continue;
            }
            tracing::info!(user_id = %env.user_id, age_secs = age.num_seconds(), "Cleaning up stale environment");
            match self.delete(&env.user_id, true).await {
                Ok(true) => removed += 1,
                Ok(false) => {
                    tracing::debug!(user_id = %env.user_id, "Stale environment already gone");
                }
                Err(e) => {
                    tracing::warn!(user_id = %env.user_id, error = %e, "Stale environment cleanup failed");
                }
            }
        }

        tracing::info!(removed, "Stale environment sweep finished");
        Ok(removed)
    }

    pub async fn status_detail(&self, user_id: &str) -> Result<StatusDetail, OrchestratorError> {
        let names = ResourceNames::for_user(user_id);
        self.cluster
            .get(ResourceKind::ComputeUnit, &names.compute_unit)
            .await
            .map_err(read_failed)?
            .map(StatusDetail::from_object)
            .ok_or_else(|| OrchestratorError::NotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Recent compute-unit output, [`DEFAULT_LOG_LINES`] lines unless given.
    pub async fn logs(&self, user_id: &str, tail_lines: Option<u32>) -> Result<String, OrchestratorError> {
        let names = ResourceNames::for_user(user_id);
        self.cluster
            .logs(&names.compute_unit, Some(tail_lines.unwrap_or(DEFAULT_LOG_LINES)))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    OrchestratorError::NotFound {
                        user_id: user_id.to_string(),
                    }
                } else {
                    read_failed(e)
                }
            })
    }

    // ── restart / ports ──────────────────────────────────────────────

    /// Replace the compute unit, leaving storage, endpoint, ingress and
    /// port mappings untouched.
    pub async fn restart(
        &self,
        user_id: &str,
        credentials: &SecretString,
        quota: &ResourceQuota,
    ) -> Result<EnvironmentDescriptor, OrchestratorError> {
        let guard = self.locks.lock(&lock_name(user_id)).await?;
        let result = self.restart_locked(user_id, credentials, quota, &guard).await;
        guard.release().await;
        result
    }

    async fn restart_locked(
        &self,
        user_id: &str,
        credentials: &SecretString,
        quota: &ResourceQuota,
        guard: &LockGuard,
    ) -> Result<EnvironmentDescriptor, OrchestratorError> {
        let names = ResourceNames::for_user(user_id);
        hold(guard, user_id, "compute_unit")?;
        if !cluster::delete_if_present(
            self.cluster.as_ref(),
            ResourceKind::ComputeUnit,
            &names.compute_unit,
        )
        .await
        .map_err(|e| teardown_failed(user_id, "compute_unit", e))?
        {
            return Err(OrchestratorError::NotFound {
                user_id: user_id.to_string(),
            });
        }
        self.store.delete(&cache_key(user_id)).await?;
        self.await_termination(&names, guard).await?;

        let spec = manifests::compute_unit(
            &names,
            &self.namespace,
            &self.config,
            quota,
            credentials.expose_secret(),
        );
        hold(guard, user_id, "compute_unit")?;
        self.ensure(user_id, "compute_unit", spec).await?;
        tracing::info!(user_id = %user_id, "Compute unit restarted");

        self.rebuild(user_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Return the user's port mappings to their pools.
    pub async fn release_ports(&self, user_id: &str) -> Result<Vec<(PortNamespace, u16)>, OrchestratorError> {
        let guard = self.locks.lock(&lock_name(user_id)).await?;
        let result = self.release_ports_locked(user_id).await;
        guard.release().await;
        result
    }

    async fn release_ports_locked(&self, user_id: &str) -> Result<Vec<(PortNamespace, u16)>, OrchestratorError> {
        // The endpoint holds the direct port as its NodePort; freeing the
        // mapping first would let another user's endpoint collide with it.
        let names = ResourceNames::for_user(user_id);
        let endpoint_live = self
            .cluster
            .get(ResourceKind::Endpoint, &names.endpoint)
            .await
            .map_err(read_failed)?
            .is_some();

        let mut released = Vec::new();
        for ns in [PortNamespace::SshProxy, PortNamespace::Direct] {
            if ns == PortNamespace::Direct && endpoint_live {
                if let Some(port) = self.existing_port(ns, user_id).await? {
                    tracing::warn!(user_id = %user_id, port, "Direct port kept while its endpoint exists");
                }
                continue;
            }
            match self.ports.release(ns, user_id).await {
                Ok(Some(port)) => released.push((ns, port)),
                Ok(None) | Err(PortError::NamespaceDisabled(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !released.is_empty() {
            // Cached access info still lists the released ports.
            self.store.delete(&cache_key(user_id)).await?;
        }
        Ok(released)
    }
}
