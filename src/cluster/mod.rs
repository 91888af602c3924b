//! Cluster-resource collaborator.
//!
//! Three narrow capabilities:
//! - [`ClusterClient`]: create/read/list/delete of per-user resources with
//!   optimistic create (conflict on exists).
//! - [`MappingTable`]: the shared port → target-locator table of the routing
//!   layer, with a conditional insert.
//! - [`ListenerControl`]: the externally exposed listener port set and the
//!   routing-layer reload trigger.

mod kube;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

pub use kube::KubeCluster;
pub use memory::InMemoryCluster;

/// Kinds of per-user resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    StorageClaim,
    ComputeUnit,
    Endpoint,
    Ingress,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::StorageClaim => write!(f, "storage_claim"),
            ResourceKind::ComputeUnit => write!(f, "compute_unit"),
            ResourceKind::Endpoint => write!(f, "endpoint"),
            ResourceKind::Ingress => write!(f, "ingress"),
        }
    }
}

/// Desired resource: identity plus the backend manifest.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub manifest: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed state of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub kind: ResourceKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Lifecycle phase as reported by the cluster (compute units only).
    pub phase: Option<String>,
    /// Deletion requested but not yet complete.
    pub terminating: bool,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub conditions: Vec<ResourceCondition>,
}

impl ResourceObject {
    pub fn user_id(&self) -> Option<&str> {
        self.labels.get("user").map(String::as_str)
    }
}

/// A port on the external listener set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerPort {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    pub node_port: Option<u16>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a resource. Fails with [`ClusterError::AlreadyExists`] if the name is taken.
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceObject, ClusterError>;

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ResourceObject>, ClusterError>;

    /// List resources of `kind` whose labels include every pair in `selector`.
    async fn list(
        &self,
        kind: ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceObject>, ClusterError>;

    /// Request deletion. Fails with [`ClusterError::NotFound`] if absent.
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>;

    /// Recent output of a compute unit.
    async fn logs(&self, name: &str, tail_lines: Option<u32>) -> Result<String, ClusterError>;
}

#[async_trait]
pub trait MappingTable: Send + Sync {
    async fn entries(&self) -> Result<BTreeMap<u16, String>, ClusterError>;

    /// Insert `port → locator` only if `port` has no entry. Returns whether it was inserted.
    async fn insert_if_absent(&self, port: u16, locator: &str) -> Result<bool, ClusterError>;

    async fn remove(&self, port: u16) -> Result<bool, ClusterError>;
}

#[async_trait]
pub trait ListenerControl: Send + Sync {
    async fn exposed_ports(&self) -> Result<Vec<ListenerPort>, ClusterError>;

    /// Add `port` to the listener set. Returns false if it was already present.
    async fn expose_port(&self, port: &ListenerPort) -> Result<bool, ClusterError>;

    /// Remove `port` from the listener set. Returns false if it was not present.
    async fn unexpose_port(&self, port: u16) -> Result<bool, ClusterError>;

    /// Ask the routing layer to pick up configuration changes. Completion is
    /// not awaited.
    async fn reload(&self) -> Result<(), ClusterError>;
}

/// Create `spec`, or return the existing object if the name is already taken.
pub async fn ensure_created(
    client: &dyn ClusterClient,
    spec: &ResourceSpec,
) -> Result<ResourceObject, ClusterError> {
    match client.create(spec).await {
        Ok(obj) => {
            tracing::info!(kind = %spec.kind, name = %spec.name, "Created resource");
            Ok(obj)
        }
        Err(e) if e.is_already_exists() => {
            tracing::debug!(kind = %spec.kind, name = %spec.name, "Resource already exists");
            client
                .get(spec.kind, &spec.name)
                .await?
                .ok_or_else(|| ClusterError::Conflict {
                    kind: spec.kind.to_string(),
                    name: spec.name.clone(),
                })
        }
        Err(e) => Err(e),
    }
}

/// Delete a resource, treating "already gone" as success. Returns whether it existed.
pub async fn delete_if_present(
    client: &dyn ClusterClient,
    kind: ResourceKind,
    name: &str,
) -> Result<bool, ClusterError> {
    match client.delete(kind, name).await {
        Ok(()) => {
            tracing::info!(kind = %kind, name = %name, "Deleted resource");
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(kind = %kind, name = %name, "Resource already gone");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec {
            kind: ResourceKind::Endpoint,
            name: name.to_string(),
            labels: BTreeMap::from([("user".to_string(), "1".to_string())]),
            manifest: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_ensure_created_returns_existing() {
        let cluster = InMemoryCluster::new();
        let first = ensure_created(&cluster, &spec("svc")).await.unwrap();
        let second = ensure_created(&cluster, &spec("svc")).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(cluster.create_calls(ResourceKind::Endpoint), 2);
        assert_eq!(cluster.live_count(ResourceKind::Endpoint), 1);
    }

    #[tokio::test]
    async fn test_delete_if_present_tolerates_absence() {
        let cluster = InMemoryCluster::new();
        assert!(
            !delete_if_present(&cluster, ResourceKind::Ingress, "nope")
                .await
                .unwrap()
        );
        ensure_created(&cluster, &spec("svc")).await.unwrap();
        assert!(
            delete_if_present(&cluster, ResourceKind::Endpoint, "svc")
                .await
                .unwrap()
        );
    }
}
