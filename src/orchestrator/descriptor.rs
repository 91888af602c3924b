use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{ResourceCondition, ResourceObject};
use crate::naming::ResourceNames;
use crate::ports::SshAccess;

/// Lifecycle state of a user's environment.
///
/// `Absent → Provisioning → Running → Deleting → Absent`. A partial failure
/// while provisioning or deleting leaves the environment `Degraded` until a
/// retry or an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Absent,
    Provisioning,
    Running,
    Deleting,
    Degraded,
}

impl EnvStatus {
    /// Map a compute-unit phase onto the environment lifecycle.
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => EnvStatus::Running,
            Some("Pending") | None => EnvStatus::Provisioning,
            Some(_) => EnvStatus::Degraded,
        }
    }
}

impl std::fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvStatus::Absent => write!(f, "absent"),
            EnvStatus::Provisioning => write!(f, "provisioning"),
            EnvStatus::Running => write!(f, "running"),
            EnvStatus::Deleting => write!(f, "deleting"),
            EnvStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Where the user connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInfo {
    /// Browser client URL.
    pub display_url: String,
    pub websocket_url: String,
    pub vnc_direct_url: String,
    /// NodePort serving raw VNC, when one was allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshAccess>,
}

impl AccessInfo {
    pub fn for_user(user_id: &str, domain: &str) -> Self {
        Self {
            display_url: format!(
                "http://{domain}/user/{user_id}/vnc.html?path=user/{user_id}/websockify"
            ),
            websocket_url: format!("ws://{domain}/user/{user_id}/websockify"),
            vnc_direct_url: format!("http://{domain}/user/{user_id}/vnc"),
            direct_port: None,
            ssh: None,
        }
    }

    pub fn ssh_command(&self) -> Option<&str> {
        self.ssh.as_ref().map(|s| s.command.as_str())
    }
}

/// Cached summary of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub user_id: String,
    pub compute_unit: String,
    pub endpoint: String,
    pub storage_claim: String,
    pub ingress: String,
    pub status: EnvStatus,
    /// Creation time of the compute unit.
    pub created_at: DateTime<Utc>,
    pub access_info: AccessInfo,
}

impl EnvironmentDescriptor {
    pub fn new(
        names: &ResourceNames,
        status: EnvStatus,
        created_at: DateTime<Utc>,
        access_info: AccessInfo,
    ) -> Self {
        Self {
            user_id: names.user_id.clone(),
            compute_unit: names.compute_unit.clone(),
            endpoint: names.endpoint.clone(),
            storage_claim: names.storage_claim.clone(),
            ingress: names.ingress.clone(),
            status,
            created_at,
            access_info,
        }
    }

    pub fn with_status(mut self, status: EnvStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == EnvStatus::Running
    }
}

/// One row of [`EnvironmentOrchestrator::list`](super::EnvironmentOrchestrator::list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    pub user_id: String,
    pub compute_unit: String,
    pub status: EnvStatus,
    pub created_at: DateTime<Utc>,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
}

/// Live compute-unit state for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    pub compute_unit: String,
    pub status: EnvStatus,
    pub phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub conditions: Vec<ResourceCondition>,
}

impl StatusDetail {
    pub(crate) fn from_object(object: ResourceObject) -> Self {
        let status = if object.terminating {
            EnvStatus::Deleting
        } else {
            EnvStatus::from_phase(object.phase.as_deref())
        };
        Self {
            compute_unit: object.name,
            status,
            phase: object.phase,
            created_at: object.created_at,
            pod_ip: object.pod_ip,
            host_ip: object.host_ip,
            conditions: object.conditions,
        }
    }
}
