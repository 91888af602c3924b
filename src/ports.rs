//! Scarce external port pools.
//!
//! Two namespaces are managed:
//! - [`PortNamespace::SshProxy`]: entries of the routing layer's TCP mapping
//!   table (`port → namespace/service:22`), each also exposed on the external
//!   listener set.
//! - [`PortNamespace::Direct`]: NodePort numbers handed to per-user endpoints,
//!   tracked in a mapping table kept in the backing store.
//!
//! A port is reserved by a conditional insert on the table itself. Allocators
//! racing for the same port see exactly one insert succeed; the losers
//! recompute the free set and pick again.
//!
//! Allocation for a given user is expected to run under that user's
//! environment lock, so one user never races itself.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::cluster::{ListenerControl, ListenerPort, MappingTable};
use crate::config::PortsConfig;
use crate::error::{ClusterError, PortError};
use crate::naming::ResourceNames;
use crate::store::SharedStore;

const DIRECT_TABLE_KEY: &str = "ports:direct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortNamespace {
    Direct,
    SshProxy,
}

impl std::fmt::Display for PortNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortNamespace::Direct => write!(f, "direct"),
            PortNamespace::SshProxy => write!(f, "ssh_proxy"),
        }
    }
}

/// How to reach a user's environment over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshAccess {
    /// Public port clients connect to.
    pub port: u16,
    /// Port held in the mapping table.
    pub internal_port: u16,
    pub host: String,
    pub command: String,
    pub url: String,
}

/// [`MappingTable`] stored as a hash in the backing store.
pub struct StoreMappingTable {
    store: SharedStore,
    key: String,
}

impl StoreMappingTable {
    pub fn new(store: SharedStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn direct(store: SharedStore) -> Self {
        Self::new(store, DIRECT_TABLE_KEY)
    }
}

fn store_err(e: crate::error::StoreError) -> ClusterError {
    ClusterError::Transport(e.to_string())
}

#[async_trait]
impl MappingTable for StoreMappingTable {
    async fn entries(&self) -> Result<BTreeMap<u16, String>, ClusterError> {
        let raw = self.store.map_entries(&self.key).await.map_err(store_err)?;
        Ok(raw
            .into_iter()
            .filter_map(|(port, locator)| port.parse().ok().map(|p: u16| (p, locator)))
            .collect())
    }

    async fn insert_if_absent(&self, port: u16, locator: &str) -> Result<bool, ClusterError> {
        self.store
            .map_insert_if_absent(&self.key, &port.to_string(), locator)
            .await
            .map_err(store_err)
    }

    async fn remove(&self, port: u16) -> Result<bool, ClusterError> {
        self.store
            .map_remove(&self.key, &port.to_string())
            .await
            .map_err(store_err)
    }
}

/// Allocator over both port namespaces.
pub struct PortAllocator {
    ssh_table: Arc<dyn MappingTable>,
    direct_table: Arc<dyn MappingTable>,
    listener: Arc<dyn ListenerControl>,
    /// Cluster namespace used in target locators.
    namespace: String,
    config: PortsConfig,
}

impl PortAllocator {
    pub fn new(
        ssh_table: Arc<dyn MappingTable>,
        direct_table: Arc<dyn MappingTable>,
        listener: Arc<dyn ListenerControl>,
        namespace: impl Into<String>,
        config: PortsConfig,
    ) -> Self {
        Self {
            ssh_table,
            direct_table,
            listener,
            namespace: namespace.into(),
            config,
        }
    }

    fn table(&self, ns: PortNamespace) -> Result<&Arc<dyn MappingTable>, PortError> {
        match ns {
            PortNamespace::SshProxy => Ok(&self.ssh_table),
            PortNamespace::Direct if self.config.direct_enabled => Ok(&self.direct_table),
            PortNamespace::Direct => Err(PortError::NamespaceDisabled(ns.to_string())),
        }
    }

    pub fn range(&self, ns: PortNamespace) -> (u16, u16) {
        match ns {
            PortNamespace::SshProxy => self.config.ssh_range,
            PortNamespace::Direct => self.config.direct_range,
        }
    }

    fn locator(&self, ns: PortNamespace, user_id: &str) -> String {
        let names = ResourceNames::for_user(user_id);
        match ns {
            PortNamespace::SshProxy => names.ssh_locator(&self.namespace),
            PortNamespace::Direct => names.direct_locator(&self.namespace),
        }
    }

    /// Allocate a port for `user_id` from the namespace's configured range.
    pub async fn allocate(&self, ns: PortNamespace, user_id: &str) -> Result<u16, PortError> {
        self.allocate_in_range(ns, user_id, self.range(ns)).await
    }

    /// Allocate from an explicit inclusive range.
    ///
    /// Returns the user's existing port if one is already mapped. Otherwise a
    /// free port is chosen uniformly at random and reserved by conditional
    /// insert; on a lost race the free set is recomputed.
    pub async fn allocate_in_range(
        &self,
        ns: PortNamespace,
        user_id: &str,
        (start, end): (u16, u16),
    ) -> Result<u16, PortError> {
        if let Some(port) = self.get_existing(ns, user_id).await? {
            tracing::debug!(user_id = %user_id, namespace = %ns, port, "Reusing allocated port");
            return Ok(port);
        }

        let table = self.table(ns)?;
        let locator = self.locator(ns, user_id);
        let exhausted = || PortError::PoolExhausted {
            namespace: ns.to_string(),
            start,
            end,
        };

        // Each lost race means some other allocation took a port, so the
        // number of attempts is bounded by the pool size.
        let pool_size = usize::from(end - start) + 1;
        for attempt in 0..pool_size {
            let used: HashSet<u16> = table.entries().await?.into_keys().collect();
            let free: Vec<u16> = (start..=end).filter(|p| !used.contains(p)).collect();
            let pick = *free.choose(&mut rand::thread_rng()).ok_or_else(exhausted)?;

            if table.insert_if_absent(pick, &locator).await? {
                tracing::info!(
                    user_id = %user_id,
                    namespace = %ns,
                    port = pick,
                    free = free.len() - 1,
                    "Allocated port"
                );
                return Ok(pick);
            }
            tracing::debug!(namespace = %ns, port = pick, attempt, "Port taken concurrently, retrying");
        }

        tracing::warn!(user_id = %user_id, namespace = %ns, "Port pool contention exhausted retries");
        Err(exhausted())
    }

    /// The port currently mapped to `user_id`, if any.
    pub async fn get_existing(
        &self,
        ns: PortNamespace,
        user_id: &str,
    ) -> Result<Option<u16>, PortError> {
        let table = self.table(ns)?;
        let locator = self.locator(ns, user_id);
        Ok(table
            .entries()
            .await?
            .into_iter()
            .find(|(_, target)| *target == locator)
            .map(|(port, _)| port))
    }

    /// All live mappings of a namespace.
    pub async fn allocations(&self, ns: PortNamespace) -> Result<BTreeMap<u16, String>, PortError> {
        Ok(self.table(ns)?.entries().await?)
    }

    /// Drop the user's mapping. For SSH ports the listener entry is removed
    /// as well and the routing layer is asked to reload in the background.
    pub async fn release(&self, ns: PortNamespace, user_id: &str) -> Result<Option<u16>, PortError> {
        let Some(port) = self.get_existing(ns, user_id).await? else {
            return Ok(None);
        };
        self.table(ns)?.remove(port).await?;
        tracing::info!(user_id = %user_id, namespace = %ns, port, "Released port");

        if ns == PortNamespace::SshProxy {
            match self.listener.unexpose_port(port).await {
                Ok(true) => self.spawn_reload(),
                Ok(false) => {
                    tracing::debug!(port, "Port was not on the listener set");
                }
                Err(e) => {
                    tracing::warn!(port, error = %e, "Failed to remove port from listener set");
                }
            }
        }
        Ok(Some(port))
    }

    /// Make an SSH proxy port reachable from outside.
    ///
    /// Adds it to the listener set with a stable node port and triggers a
    /// reload when the set changed. The reload is not awaited.
    pub async fn expose(&self, port: u16) -> Result<(), PortError> {
        let listener_port = ListenerPort {
            name: format!("ssh-{port}"),
            port,
            target_port: port,
            node_port: Some(self.node_port(port)),
        };
        if self.listener.expose_port(&listener_port).await? {
            tracing::info!(port, node_port = ?listener_port.node_port, "Exposed port on listener");
            self.spawn_reload();
        }
        Ok(())
    }

    fn spawn_reload(&self) {
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            if let Err(e) = listener.reload().await {
                tracing::warn!(error = %e, "Routing layer reload failed");
            }
        });
    }

    /// Listener node port paired with an SSH proxy port.
    pub fn node_port(&self, port: u16) -> u16 {
        let (start, _) = self.config.ssh_range;
        self.config.ssh_node_port_base + port.saturating_sub(start)
    }

    pub fn ssh_access(&self, port: u16, domain: &str) -> SshAccess {
        let public = port + self.config.ssh_public_offset;
        SshAccess {
            port: public,
            internal_port: port,
            host: domain.to_string(),
            command: format!("ssh -p {public} void@{domain}"),
            url: format!("ssh://void@{domain}:{public}"),
        }
    }
}
