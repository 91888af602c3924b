use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_secs_env, parse_string_env};
use crate::error::ConfigError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Which cluster collaborator to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterBackend {
    /// Kubernetes API server over HTTPS.
    #[default]
    Kube,
    /// In-process fake, for local runs and tests.
    Memory,
}

impl std::str::FromStr for ClusterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kube" | "kubernetes" | "k8s" => Ok(Self::Kube),
            "memory" | "in_memory" | "fake" => Ok(Self::Memory),
            _ => Err(format!(
                "invalid cluster backend '{}', expected one of: kube, memory",
                s
            )),
        }
    }
}

impl std::fmt::Display for ClusterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kube => write!(f, "kube"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Cluster API and routing-layer object names.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub backend: ClusterBackend,
    pub api_url: String,
    /// Bearer token. When unset, read from `token_path` at connect time.
    pub token: Option<SecretString>,
    pub token_path: PathBuf,
    pub ca_cert_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
    /// Namespace holding every per-user resource.
    pub namespace: String,
    /// Namespace of the ingress controller and its TCP mapping table.
    pub ingress_namespace: String,
    pub mapping_table: String,
    pub listener_service: String,
    pub controller_deployment: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Kube,
            api_url: "https://kubernetes.default.svc".to_string(),
            token: None,
            token_path: PathBuf::from(SERVICE_ACCOUNT_DIR).join("token"),
            ca_cert_path: Some(PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt")),
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(30),
            namespace: "vnc-pods".to_string(),
            ingress_namespace: "ingress-nginx".to_string(),
            mapping_table: "tcp-services".to_string(),
            listener_service: "ingress-nginx-controller-nginx-tcp".to_string(),
            controller_deployment: "ingress-nginx-controller-nginx".to_string(),
        }
    }
}

impl ClusterConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match optional_env("CLUSTER_BACKEND")? {
            Some(b) => b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "CLUSTER_BACKEND".to_string(),
                message: e,
            })?,
            None => defaults.backend,
        };

        let ca_cert_path = match optional_env("KUBE_CA_CERT")? {
            Some(p) => Some(PathBuf::from(p)),
            None => defaults.ca_cert_path.filter(|p| p.exists()),
        };

        Ok(Self {
            backend,
            api_url: parse_string_env("KUBE_API_URL", defaults.api_url)?,
            token: optional_env("KUBE_TOKEN")?.map(SecretString::from),
            token_path: optional_env("KUBE_TOKEN_PATH")?
                .map(PathBuf::from)
                .unwrap_or(defaults.token_path),
            ca_cert_path,
            accept_invalid_certs: parse_bool_env("KUBE_INSECURE", false)?,
            request_timeout: parse_secs_env("KUBE_TIMEOUT_SECS", defaults.request_timeout)?,
            namespace: parse_string_env("DESK_NAMESPACE", defaults.namespace)?,
            ingress_namespace: parse_string_env(
                "INGRESS_NAMESPACE",
                defaults.ingress_namespace,
            )?,
            mapping_table: parse_string_env("INGRESS_TCP_CONFIGMAP", defaults.mapping_table)?,
            listener_service: parse_string_env(
                "INGRESS_TCP_SERVICE",
                defaults.listener_service,
            )?,
            controller_deployment: parse_string_env(
                "INGRESS_CONTROLLER_DEPLOYMENT",
                defaults.controller_deployment,
            )?,
        })
    }
}
