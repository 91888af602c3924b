//! Kubernetes API backend over HTTPS.
//!
//! Per-user resources map to PersistentVolumeClaims, Pods, Services and
//! Ingresses in one namespace. The SSH mapping table is the ingress
//! controller's `tcp-services` ConfigMap, the listener set is the ports list of
//! the controller's TCP Service, and reload is a rollout restart of the
//! controller Deployment.
//!
//! Shared objects are mutated with read-modify-replace carrying the read
//! `resourceVersion`; the API server rejects a stale replace with 409 and the
//! operation re-reads and retries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::cluster::{
    ClusterClient, ListenerControl, ListenerPort, MappingTable, ResourceCondition, ResourceKind,
    ResourceObject, ResourceSpec,
};
use crate::config::ClusterConfig;
use crate::error::ClusterError;

const CONFLICT_RETRIES: usize = 8;
const MERGE_PATCH: &str = "application/strategic-merge-patch+json";

#[derive(Debug, Deserialize)]
struct RawMeta {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "creationTimestamp")]
    creation_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "deletionTimestamp")]
    deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    phase: Option<String>,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(rename = "hostIP")]
    host_ip: Option<String>,
    #[serde(default)]
    conditions: Vec<ResourceCondition>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    metadata: RawMeta,
    #[serde(default)]
    status: Option<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawList {
    #[serde(default)]
    items: Vec<RawObject>,
}

fn to_object(kind: ResourceKind, raw: RawObject) -> ResourceObject {
    let status = raw.status.unwrap_or_default();
    ResourceObject {
        kind,
        name: raw.metadata.name,
        labels: raw.metadata.labels,
        created_at: raw.metadata.creation_timestamp.unwrap_or_else(Utc::now),
        phase: status.phase,
        terminating: raw.metadata.deletion_timestamp.is_some(),
        pod_ip: status.pod_ip,
        host_ip: status.host_ip,
        conditions: status.conditions,
    }
}

fn truncate(body: &str) -> String {
    let mut end = body.len().min(512);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Kubernetes-backed implementation of the cluster traits.
pub struct KubeCluster {
    client: Client,
    api_url: String,
    token: SecretString,
    config: ClusterConfig,
}

impl KubeCluster {
    /// Build a client from config, reading the service-account token and CA
    /// bundle from disk when not given explicitly.
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let token = match &config.token {
            Some(t) => t.clone(),
            None => std::fs::read_to_string(&config.token_path)
                .map(|t| SecretString::from(t.trim().to_string()))
                .map_err(|e| {
                    ClusterError::Transport(format!(
                        "Failed to read token from {}: {}",
                        config.token_path.display(),
                        e
                    ))
                })?,
        };

        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                ClusterError::Transport(format!("Failed to read CA from {}: {}", path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClusterError::Transport(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| ClusterError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            config: config.clone(),
        })
    }

    fn collection_path(&self, kind: ResourceKind) -> String {
        let ns = &self.config.namespace;
        match kind {
            ResourceKind::StorageClaim => format!("/api/v1/namespaces/{ns}/persistentvolumeclaims"),
            ResourceKind::ComputeUnit => format!("/api/v1/namespaces/{ns}/pods"),
            ResourceKind::Endpoint => format!("/api/v1/namespaces/{ns}/services"),
            ResourceKind::Ingress => {
                format!("/apis/networking.k8s.io/v1/namespaces/{ns}/ingresses")
            }
        }
    }

    fn configmap_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/configmaps/{}",
            self.config.ingress_namespace, self.config.mapping_table
        )
    }

    fn listener_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}",
            self.config.ingress_namespace, self.config.listener_service
        )
    }

    /// Send a request and return the status code with the raw body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<(&Value, &str)>,
    ) -> Result<(u16, String), ClusterError> {
        let url = format!("{}{}", self.api_url, path);
        tracing::debug!(method = %method, url = %url, "Cluster API request");

        let mut request = self
            .client
            .request(method, &url)
            .header(
                "Authorization",
                format!("Bearer {}", self.token.expose_secret()),
            )
            .query(query);
        if let Some((body, content_type)) = body {
            request = request
                .header("Content-Type", content_type)
                .body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ClusterError::Transport(format!("Failed to read response body: {}", e)))?;
        Ok((status, text))
    }

    fn api_error(status: u16, body: &str) -> ClusterError {
        ClusterError::Api {
            status,
            reason: truncate(body),
        }
    }

    fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, ClusterError> {
        serde_json::from_str(body).map_err(|e| {
            ClusterError::InvalidResponse(format!("JSON parse error: {}. Raw: {}", e, truncate(body)))
        })
    }

    /// Read a shared object; `None` if it does not exist.
    async fn read_shared(&self, path: &str) -> Result<Option<Value>, ClusterError> {
        let (status, body) = self.send(Method::GET, path, &[], None).await?;
        match status {
            200 => Ok(Some(Self::parse(&body)?)),
            404 => Ok(None),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    /// Replace a shared object. `Ok(false)` signals a stale `resourceVersion`.
    async fn replace_shared(&self, path: &str, object: &Value) -> Result<bool, ClusterError> {
        let (status, body) = self
            .send(Method::PUT, path, &[], Some((object, "application/json")))
            .await?;
        match status {
            200 | 201 => Ok(true),
            409 => Ok(false),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    fn conflict(name: &str) -> ClusterError {
        ClusterError::Conflict {
            kind: "shared object".to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceObject, ClusterError> {
        let path = self.collection_path(spec.kind);
        let (status, body) = self
            .send(
                Method::POST,
                &path,
                &[],
                Some((&spec.manifest, "application/json")),
            )
            .await?;
        match status {
            200 | 201 | 202 => Ok(to_object(spec.kind, Self::parse(&body)?)),
            409 => Err(ClusterError::AlreadyExists {
                kind: spec.kind.to_string(),
                name: spec.name.clone(),
            }),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ResourceObject>, ClusterError> {
        let path = format!("{}/{}", self.collection_path(kind), name);
        let (status, body) = self.send(Method::GET, &path, &[], None).await?;
        match status {
            200 => Ok(Some(to_object(kind, Self::parse(&body)?))),
            404 => Ok(None),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceObject>, ClusterError> {
        let selector = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let path = self.collection_path(kind);
        let (status, body) = self
            .send(Method::GET, &path, &[("labelSelector", selector)], None)
            .await?;
        if status != 200 {
            return Err(Self::api_error(status, &body));
        }
        let list: RawList = Self::parse(&body)?;
        Ok(list
            .items
            .into_iter()
            .map(|raw| to_object(kind, raw))
            .collect())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        let path = format!("{}/{}", self.collection_path(kind), name);
        let (status, body) = self.send(Method::DELETE, &path, &[], None).await?;
        match status {
            200 | 202 => Ok(()),
            404 => Err(ClusterError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn logs(&self, name: &str, tail_lines: Option<u32>) -> Result<String, ClusterError> {
        let path = format!(
            "{}/{}/log",
            self.collection_path(ResourceKind::ComputeUnit),
            name
        );
        let query: Vec<(&str, String)> = tail_lines
            .map(|n| vec![("tailLines", n.to_string())])
            .unwrap_or_default();
        let (status, body) = self.send(Method::GET, &path, &query, None).await?;
        match status {
            200 => Ok(body),
            404 => Err(ClusterError::NotFound {
                kind: ResourceKind::ComputeUnit.to_string(),
                name: name.to_string(),
            }),
            _ => Err(Self::api_error(status, &body)),
        }
    }
}

#[async_trait]
impl MappingTable for KubeCluster {
    async fn entries(&self) -> Result<BTreeMap<u16, String>, ClusterError> {
        let Some(cm) = self.read_shared(&self.configmap_path()).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(parse_mapping(&cm))
    }

    async fn insert_if_absent(&self, port: u16, locator: &str) -> Result<bool, ClusterError> {
        let path = self.configmap_path();
        let field = port.to_string();
        for _ in 0..CONFLICT_RETRIES {
            let Some(mut cm) = self.read_shared(&path).await? else {
                // No table yet: create it holding just this entry.
                let collection = format!(
                    "/api/v1/namespaces/{}/configmaps",
                    self.config.ingress_namespace
                );
                let manifest = json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {
                        "name": self.config.mapping_table,
                        "namespace": self.config.ingress_namespace,
                    },
                    "data": { field.clone(): locator },
                });
                let (status, body) = self
                    .send(
                        Method::POST,
                        &collection,
                        &[],
                        Some((&manifest, "application/json")),
                    )
                    .await?;
                match status {
                    200 | 201 => return Ok(true),
                    409 => continue,
                    _ => return Err(Self::api_error(status, &body)),
                }
            };

            if cm["data"].get(&field).is_some() {
                return Ok(false);
            }
            if !cm["data"].is_object() {
                cm["data"] = json!({});
            }
            cm["data"][&field] = Value::String(locator.to_string());
            if self.replace_shared(&path, &cm).await? {
                return Ok(true);
            }
            tracing::debug!(port, "Mapping table changed underneath insert, retrying");
        }
        Err(Self::conflict(&self.config.mapping_table))
    }

    async fn remove(&self, port: u16) -> Result<bool, ClusterError> {
        let path = self.configmap_path();
        let field = port.to_string();
        for _ in 0..CONFLICT_RETRIES {
            let Some(mut cm) = self.read_shared(&path).await? else {
                return Ok(false);
            };
            let removed = cm["data"]
                .as_object_mut()
                .and_then(|data| data.remove(&field))
                .is_some();
            if !removed {
                return Ok(false);
            }
            if self.replace_shared(&path, &cm).await? {
                return Ok(true);
            }
        }
        Err(Self::conflict(&self.config.mapping_table))
    }
}

fn parse_mapping(cm: &Value) -> BTreeMap<u16, String> {
    let Some(data) = cm["data"].as_object() else {
        return BTreeMap::new();
    };
    data.iter()
        .filter_map(|(k, v)| match (k.parse::<u16>(), v.as_str()) {
            (Ok(port), Some(locator)) => Some((port, locator.to_string())),
            _ => {
                tracing::warn!(key = %k, "Ignoring malformed mapping table entry");
                None
            }
        })
        .collect()
}

fn parse_listener_ports(svc: &Value) -> Vec<ListenerPort> {
    svc["spec"]["ports"]
        .as_array()
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let port = u16::try_from(p["port"].as_u64()?).ok()?;
                    Some(ListenerPort {
                        name: p["name"].as_str().unwrap_or_default().to_string(),
                        port,
                        target_port: p["targetPort"]
                            .as_u64()
                            .and_then(|t| u16::try_from(t).ok())
                            .unwrap_or(port),
                        node_port: p["nodePort"].as_u64().and_then(|n| u16::try_from(n).ok()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ListenerControl for KubeCluster {
    async fn exposed_ports(&self) -> Result<Vec<ListenerPort>, ClusterError> {
        match self.read_shared(&self.listener_path()).await? {
            Some(svc) => Ok(parse_listener_ports(&svc)),
            None => Err(ClusterError::NotFound {
                kind: "listener service".to_string(),
                name: self.config.listener_service.clone(),
            }),
        }
    }

    async fn expose_port(&self, port: &ListenerPort) -> Result<bool, ClusterError> {
        let path = self.listener_path();
        for _ in 0..CONFLICT_RETRIES {
            let Some(mut svc) = self.read_shared(&path).await? else {
                return Err(ClusterError::NotFound {
                    kind: "listener service".to_string(),
                    name: self.config.listener_service.clone(),
                });
            };
            if parse_listener_ports(&svc).iter().any(|p| p.port == port.port) {
                return Ok(false);
            }
            let mut entry = json!({
                "name": port.name,
                "port": port.port,
                "targetPort": port.target_port,
                "protocol": "TCP",
            });
            if let Some(node_port) = port.node_port {
                entry["nodePort"] = json!(node_port);
            }
            match svc["spec"]["ports"].as_array_mut() {
                Some(ports) => ports.push(entry),
                None => svc["spec"]["ports"] = json!([entry]),
            }
            if self.replace_shared(&path, &svc).await? {
                return Ok(true);
            }
        }
        Err(Self::conflict(&self.config.listener_service))
    }

    async fn unexpose_port(&self, port: u16) -> Result<bool, ClusterError> {
        let path = self.listener_path();
        for _ in 0..CONFLICT_RETRIES {
            let Some(mut svc) = self.read_shared(&path).await? else {
                return Ok(false);
            };
            let Some(ports) = svc["spec"]["ports"].as_array_mut() else {
                return Ok(false);
            };
            let before = ports.len();
            ports.retain(|p| p["port"].as_u64() != Some(u64::from(port)));
            if ports.len() == before {
                return Ok(false);
            }
            if self.replace_shared(&path, &svc).await? {
                return Ok(true);
            }
        }
        Err(Self::conflict(&self.config.listener_service))
    }

    async fn reload(&self) -> Result<(), ClusterError> {
        let path = format!(
            "/apis/apps/v1/namespaces/{}/deployments/{}",
            self.config.ingress_namespace, self.config.controller_deployment
        );
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                "kubectl.kubernetes.io/restartedAt": Utc::now().to_rfc3339(),
            }}}}
        });
        let (status, body) = self
            .send(Method::PATCH, &path, &[], Some((&patch, MERGE_PATCH)))
            .await?;
        if !(200..300).contains(&status) {
            return Err(Self::api_error(status, &body));
        }
        tracing::info!(deployment = %self.config.controller_deployment, "Requested routing layer restart");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_json_maps_to_resource_object() {
        let raw: RawObject = serde_json::from_value(json!({
            "metadata": {
                "name": "vnc-42",
                "labels": {"user": "42", "managed-by": "vnc-manager"},
                "creationTimestamp": "2026-01-02T03:04:05Z",
                "deletionTimestamp": "2026-01-02T04:00:00Z"
            },
            "status": {
                "phase": "Running",
                "podIP": "10.42.1.7",
                "hostIP": "192.168.10.21",
                "conditions": [{"type": "Ready", "status": "True", "lastProbeTime": null}]
            }
        }))
        .unwrap();
        let obj = to_object(ResourceKind::ComputeUnit, raw);
        assert_eq!(obj.user_id(), Some("42"));
        assert!(obj.terminating);
        assert_eq!(obj.phase.as_deref(), Some("Running"));
        assert_eq!(obj.conditions[0].kind, "Ready");
    }

    #[test]
    fn test_mapping_skips_malformed_entries() {
        let cm = json!({"data": {
            "22001": "vnc-pods/vnc-service-1:22",
            "ssh": "vnc-pods/vnc-service-2:22",
        }});
        let mapping = parse_mapping(&cm);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[&22001], "vnc-pods/vnc-service-1:22");
    }

    #[test]
    fn test_listener_ports_parsed() {
        let svc = json!({"spec": {"ports": [
            {"name": "ssh-22001", "port": 22001, "targetPort": 22001, "nodePort": 32001},
            {"name": "http", "port": 80, "targetPort": "http"},
        ]}});
        let ports = parse_listener_ports(&svc);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].node_port, Some(32001));
        assert_eq!(ports[1].target_port, 80);
    }

    #[test]
    fn test_new_with_explicit_token_skips_files() {
        let config = ClusterConfig {
            token: Some(SecretString::from("t0ken".to_string())),
            ca_cert_path: None,
            ..ClusterConfig::default()
        };
        let cluster = KubeCluster::new(&config).unwrap();
        assert_eq!(
            cluster.collection_path(ResourceKind::Ingress),
            "/apis/networking.k8s.io/v1/namespaces/vnc-pods/ingresses"
        );
    }
}
