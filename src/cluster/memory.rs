//! In-process cluster for local runs and tests.
//!
//! Behaves like the real API where the orchestrator depends on it: create
//! conflicts on existing names, compute units linger in a terminating state
//! for a configurable number of reads after deletion, and every mutation is
//! counted so tests can assert on duplicate calls. Faults can be injected
//! per resource kind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::cluster::{
    ClusterClient, ListenerControl, ListenerPort, MappingTable, ResourceCondition, ResourceKind,
    ResourceObject, ResourceSpec,
};
use crate::error::ClusterError;

#[derive(Debug)]
struct Stored {
    object: ResourceObject,
    manifest: serde_json::Value,
    /// Reads remaining before a terminating object disappears.
    terminating_reads: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<(ResourceKind, String), Stored>,
    mapping: BTreeMap<u16, String>,
    listener: BTreeMap<u16, ListenerPort>,
    logs: HashMap<String, String>,
    create_calls: HashMap<ResourceKind, usize>,
    delete_calls: HashMap<ResourceKind, usize>,
    deletions: Vec<(ResourceKind, String)>,
    initial_phase: Option<String>,
    reloads: usize,
    failing_creates: HashSet<ResourceKind>,
    failing_deletes: HashSet<ResourceKind>,
    fail_reload: bool,
    termination_lag: u32,
    create_delay: Duration,
    next_ip: u8,
}

/// Fake cluster implementing all three collaborator traits.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deleted compute units stay visible (terminating) for this many reads.
    pub fn with_termination_lag(self, reads: u32) -> Self {
        self.state().termination_lag = reads;
        self
    }

    /// Phase reported for new compute units. Defaults to `Running`; a real
    /// cluster answers a pod create with `Pending`.
    pub fn with_initial_phase(self, phase: &str) -> Self {
        self.state().initial_phase = Some(phase.to_string());
        self
    }

    /// Sleep inside every create call, widening race windows in tests.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        self.state().create_delay = delay;
        self
    }

    pub fn fail_creates(&self, kind: ResourceKind, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_creates.insert(kind);
        } else {
            state.failing_creates.remove(&kind);
        }
    }

    pub fn fail_deletes(&self, kind: ResourceKind, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_deletes.insert(kind);
        } else {
            state.failing_deletes.remove(&kind);
        }
    }

    pub fn fail_reload(&self, fail: bool) {
        self.state().fail_reload = fail;
    }

    pub fn create_calls(&self, kind: ResourceKind) -> usize {
        self.state().create_calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn delete_calls(&self, kind: ResourceKind) -> usize {
        self.state().delete_calls.get(&kind).copied().unwrap_or(0)
    }

    /// Successful delete calls, in the order they were issued.
    pub fn deletions(&self) -> Vec<(ResourceKind, String)> {
        self.state().deletions.clone()
    }

    pub fn reload_calls(&self) -> usize {
        self.state().reloads
    }

    /// Objects of `kind` currently present, terminating included.
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.state()
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn manifest(&self, kind: ResourceKind, name: &str) -> Option<serde_json::Value> {
        self.state()
            .objects
            .get(&(kind, name.to_string()))
            .map(|s| s.manifest.clone())
    }

    /// Shift a resource's creation time into the past.
    pub fn backdate(&self, kind: ResourceKind, name: &str, age: chrono::Duration) {
        if let Some(stored) = self.state().objects.get_mut(&(kind, name.to_string())) {
            stored.object.created_at = stored.object.created_at - age;
        }
    }

    pub fn set_phase(&self, name: &str, phase: &str) {
        if let Some(stored) = self
            .state()
            .objects
            .get_mut(&(ResourceKind::ComputeUnit, name.to_string()))
        {
            stored.object.phase = Some(phase.to_string());
        }
    }

    pub fn push_log(&self, name: &str, line: &str) {
        let mut state = self.state();
        let log = state.logs.entry(name.to_string()).or_default();
        log.push_str(line);
        log.push('\n');
    }
}

fn not_found(kind: ResourceKind, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn injected(op: &str, kind: ResourceKind) -> ClusterError {
    ClusterError::Api {
        status: 500,
        reason: format!("injected {op} failure for {kind}"),
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceObject, ClusterError> {
        let delay = {
            let mut state = self.state();
            *state.create_calls.entry(spec.kind).or_default() += 1;
            state.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.failing_creates.contains(&spec.kind) {
            return Err(injected("create", spec.kind));
        }
        let key = (spec.kind, spec.name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: spec.kind.to_string(),
                name: spec.name.clone(),
            });
        }

        let (phase, pod_ip, host_ip, conditions) = if spec.kind == ResourceKind::ComputeUnit {
            state.next_ip = state.next_ip.wrapping_add(1);
            (
                Some(
                    state
                        .initial_phase
                        .clone()
                        .unwrap_or_else(|| "Running".to_string()),
                ),
                Some(format!("10.42.0.{}", state.next_ip)),
                Some("192.168.10.21".to_string()),
                vec![ResourceCondition {
                    kind: "Ready".to_string(),
                    status: "True".to_string(),
                    reason: None,
                    message: None,
                }],
            )
        } else {
            (None, None, None, Vec::new())
        };

        let object = ResourceObject {
            kind: spec.kind,
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            created_at: Utc::now(),
            phase,
            terminating: false,
            pod_ip,
            host_ip,
            conditions,
        };
        state.objects.insert(
            key,
            Stored {
                object: object.clone(),
                manifest: spec.manifest.clone(),
                terminating_reads: None,
            },
        );
        Ok(object)
    }

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ResourceObject>, ClusterError> {
        let mut state = self.state();
        let key = (kind, name.to_string());
        let Some(stored) = state.objects.get_mut(&key) else {
            return Ok(None);
        };
        let reads = stored.terminating_reads;
        match reads {
            Some(0) => {
                state.objects.remove(&key);
                Ok(None)
            }
            Some(n) => {
                stored.terminating_reads = Some(n - 1);
                Ok(Some(stored.object.clone()))
            }
            None => Ok(Some(stored.object.clone())),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceObject>, ClusterError> {
        let state = self.state();
        let mut objects: Vec<ResourceObject> = state
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, s)| &s.object)
            .filter(|o| selector.iter().all(|(k, v)| o.labels.get(k) == Some(v)))
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        *state.delete_calls.entry(kind).or_default() += 1;
        if state.failing_deletes.contains(&kind) {
            return Err(injected("delete", kind));
        }
        let lag = state.termination_lag;
        let key = (kind, name.to_string());
        match state.objects.get(&key) {
            None => return Err(not_found(kind, name)),
            Some(stored) if stored.terminating_reads.is_some() => return Ok(()),
            Some(_) => {}
        }
        state.deletions.push(key.clone());
        if kind == ResourceKind::ComputeUnit
            && lag > 0
            && let Some(stored) = state.objects.get_mut(&key)
        {
            stored.object.terminating = true;
            stored.terminating_reads = Some(lag);
        } else {
            state.objects.remove(&key);
            state.logs.remove(name);
        }
        Ok(())
    }

    async fn logs(&self, name: &str, tail_lines: Option<u32>) -> Result<String, ClusterError> {
        let state = self.state();
        if !state
            .objects
            .contains_key(&(ResourceKind::ComputeUnit, name.to_string()))
        {
            return Err(not_found(ResourceKind::ComputeUnit, name));
        }
        let log = state.logs.get(name).cloned().unwrap_or_default();
        Ok(match tail_lines {
            Some(n) => {
                let lines: Vec<&str> = log.lines().collect();
                let start = lines.len().saturating_sub(n as usize);
                lines[start..].join("\n")
            }
            None => log,
        })
    }
}

#[async_trait]
impl MappingTable for InMemoryCluster {
    async fn entries(&self) -> Result<BTreeMap<u16, String>, ClusterError> {
        Ok(self.state().mapping.clone())
    }

    async fn insert_if_absent(&self, port: u16, locator: &str) -> Result<bool, ClusterError> {
        let mut state = self.state();
        if state.mapping.contains_key(&port) {
            return Ok(false);
        }
        state.mapping.insert(port, locator.to_string());
        Ok(true)
    }

    async fn remove(&self, port: u16) -> Result<bool, ClusterError> {
        Ok(self.state().mapping.remove(&port).is_some())
    }
}

#[async_trait]
impl ListenerControl for InMemoryCluster {
    async fn exposed_ports(&self) -> Result<Vec<ListenerPort>, ClusterError> {
        Ok(self.state().listener.values().cloned().collect())
    }

    async fn expose_port(&self, port: &ListenerPort) -> Result<bool, ClusterError> {
        let mut state = self.state();
        if state.listener.contains_key(&port.port) {
            return Ok(false);
        }
        state.listener.insert(port.port, port.clone());
        Ok(true)
    }

    async fn unexpose_port(&self, port: u16) -> Result<bool, ClusterError> {
        Ok(self.state().listener.remove(&port).is_some())
    }

    async fn reload(&self) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.reloads += 1;
        if state.fail_reload {
            return Err(ClusterError::Api {
                status: 503,
                reason: "injected reload failure".to_string(),
            });
        }
        Ok(())
    }
}
