//! End-to-end behaviour of the control plane against in-process backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use deskpool::auth::{AuthTokenGateway, IdentityRecord, InMemoryIdentityStore, Permission};
use deskpool::cluster::{InMemoryCluster, ResourceKind};
use deskpool::config::{AuthConfig, EnvironmentConfig, PortsConfig, RateLimitConfig};
use deskpool::error::{AuthError, ErrorKind, PortError};
use deskpool::lock::DistributedLock;
use deskpool::orchestrator::{EnvStatus, EnvironmentOrchestrator, ProvisionOptions};
use deskpool::ports::{PortAllocator, PortNamespace, StoreMappingTable};
use deskpool::rate_limit::RateLimiter;
use deskpool::store::{InMemoryStore, SharedStore};
use deskpool::{ControlPlane, CreateRequest};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: SharedStore,
    cluster: Arc<InMemoryCluster>,
    ports: Arc<PortAllocator>,
    orchestrator: Arc<EnvironmentOrchestrator>,
}

fn harness(cluster: InMemoryCluster, ports: PortsConfig) -> Harness {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let cluster = Arc::new(cluster);
    let allocator = Arc::new(PortAllocator::new(
        cluster.clone(),
        Arc::new(StoreMappingTable::direct(store.clone())),
        cluster.clone(),
        "vnc-pods",
        ports,
    ));
    let config = EnvironmentConfig {
        delete_poll_interval: Duration::from_millis(5),
        ..EnvironmentConfig::default()
    };
    let orchestrator = Arc::new(EnvironmentOrchestrator::new(
        cluster.clone(),
        allocator.clone(),
        store.clone(),
        "vnc-pods",
        config,
    ));
    Harness {
        store,
        cluster,
        ports: allocator,
        orchestrator,
    }
}

fn password() -> SecretString {
    SecretString::from("s3ssion!")
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_converge_on_one_environment() {
    let h = harness(
        InMemoryCluster::new().with_create_delay(Duration::from_millis(20)),
        PortsConfig::default(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .create("42", &password(), &ProvisionOptions::default())
                .await
        }));
    }

    let mut descriptors = Vec::new();
    for handle in handles {
        descriptors.push(handle.await.unwrap().unwrap().into_descriptor());
    }

    assert_eq!(h.cluster.create_calls(ResourceKind::ComputeUnit), 1);
    assert_eq!(h.cluster.create_calls(ResourceKind::Ingress), 1);
    assert!(descriptors.iter().all(|d| *d == descriptors[0]));
    assert_eq!(descriptors[0].status, EnvStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_simultaneous_creates_issue_no_duplicate_mutations() {
    let h = harness(
        InMemoryCluster::new().with_create_delay(Duration::from_millis(10)),
        PortsConfig::default(),
    );
    let opts = ProvisionOptions::default();

    let (pw_a, pw_b) = (password(), password());
    let (a, b) = tokio::join!(
        h.orchestrator.create("42", &pw_a, &opts),
        h.orchestrator.create("42", &pw_b, &opts),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.is_provisioned(), b.is_provisioned());
    assert_eq!(a.descriptor(), b.descriptor());
    for kind in [
        ResourceKind::StorageClaim,
        ResourceKind::ComputeUnit,
        ResourceKind::Endpoint,
        ResourceKind::Ingress,
    ] {
        assert_eq!(h.cluster.create_calls(kind), 1, "{kind}");
    }
}

#[tokio::test]
async fn delete_without_storage_leaves_nothing() {
    let h = harness(InMemoryCluster::new().with_termination_lag(2), PortsConfig::default());
    h.orchestrator
        .create("42", &password(), &ProvisionOptions::default())
        .await
        .unwrap();

    assert!(h.orchestrator.delete("42", false).await.unwrap());
    for kind in [
        ResourceKind::StorageClaim,
        ResourceKind::ComputeUnit,
        ResourceKind::Endpoint,
        ResourceKind::Ingress,
    ] {
        assert_eq!(h.cluster.live_count(kind), 0, "{kind}");
    }
    assert!(h.orchestrator.get("42").await.unwrap().is_none());
}

#[tokio::test]
async fn environments_of_different_users_are_independent() {
    let h = harness(InMemoryCluster::new(), PortsConfig::default());
    let opts = ProvisionOptions::default();
    let (pw_a, pw_b) = (password(), password());
    let (a, b) = tokio::join!(
        h.orchestrator.create("1", &pw_a, &opts),
        h.orchestrator.create("2", &pw_b, &opts),
    );
    assert_eq!(a.unwrap().descriptor().compute_unit, "vnc-1");
    assert_eq!(b.unwrap().descriptor().compute_unit, "vnc-2");

    h.orchestrator.delete("1", true).await.unwrap();
    assert_eq!(
        h.orchestrator.get("2").await.unwrap().unwrap().status,
        EnvStatus::Running
    );
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_of_five_serves_exactly_five_of_six_users() {
    let h = harness(
        InMemoryCluster::new(),
        PortsConfig {
            ssh_range: (22000, 22004),
            ..PortsConfig::default()
        },
    );

    let mut handles = Vec::new();
    for i in 0..6 {
        let ports = h.ports.clone();
        handles.push(tokio::spawn(async move {
            ports
                .allocate(PortNamespace::SshProxy, &format!("user-{i}"))
                .await
        }));
    }

    let mut granted = Vec::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(port) => granted.push(port),
            Err(PortError::PoolExhausted { start, end, .. }) => {
                assert_eq!((start, end), (22000, 22004));
                exhausted += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(granted.len(), 5);
    assert_eq!(exhausted, 1);
    let distinct: HashSet<u16> = granted.iter().copied().collect();
    assert_eq!(distinct.len(), 5);
}

#[tokio::test]
async fn existing_allocation_is_stable() {
    let h = harness(InMemoryCluster::new(), PortsConfig::default());
    let port = h.ports.allocate(PortNamespace::SshProxy, "42").await.unwrap();
    for _ in 0..3 {
        assert_eq!(
            h.ports
                .get_existing(PortNamespace::SshProxy, "42")
                .await
                .unwrap(),
            Some(port)
        );
        assert_eq!(
            h.ports.allocate(PortNamespace::SshProxy, "42").await.unwrap(),
            port
        );
    }
    assert_eq!(
        h.ports.allocations(PortNamespace::SshProxy).await.unwrap().len(),
        1
    );
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn expired_holder_cannot_release_new_holders_lock() {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let first = DistributedLock::new(store.clone(), "env:42", Duration::from_secs(1));
    let second = DistributedLock::new(store.clone(), "env:42", Duration::from_secs(1));

    assert!(first.acquire(false, Duration::ZERO).await.unwrap());
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(second.acquire(false, Duration::ZERO).await.unwrap());

    assert!(!first.release().await);
    assert!(!first.extend(Duration::from_secs(5)).await);
    assert!(second.release().await);
}

// ---------------------------------------------------------------------------
// Auth and admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revoke_is_visible_despite_cached_identity() {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let identities = Arc::new(InMemoryIdentityStore::new());
    let gateway = AuthTokenGateway::new(store, identities.clone(), AuthConfig::default());
    let token = identities.issue(IdentityRecord::new("42", "Ada"), "sk-").await;

    assert_eq!(gateway.validate(&token).await.unwrap().user_id, "42");
    gateway.revoke(&token).await.unwrap();
    assert!(matches!(
        gateway.validate(&token).await,
        Err(AuthError::Revoked)
    ));
}

#[tokio::test]
async fn retry_after_decreases_while_window_ages() {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let limiter = RateLimiter::new(
        store,
        RateLimitConfig {
            requests_per_minute: 3,
            ..RateLimitConfig::default()
        },
    );
    let t0 = 1_750_000_000_000_i64;
    for i in 0..3 {
        limiter.record_at("42", t0 + i * 1_000).await;
    }

    let mut previous = None;
    for offset in [3_000, 10_000, 40_000, 59_000] {
        let result = limiter.admit_at("42", t0 + offset).await;
        assert!(!result.is_allowed(), "denied at ceiling");
        let retry = result.retry_after().unwrap();
        if let Some(prev) = previous {
            assert!(retry < prev);
        }
        previous = Some(retry);
    }
    // The oldest entry has left the window; one slot is free again.
    assert!(limiter.admit_at("42", t0 + 60_000).await.is_allowed());
}

#[tokio::test]
async fn control_plane_round_trip() {
    let h = harness(InMemoryCluster::new(), PortsConfig::default());
    let identities = Arc::new(InMemoryIdentityStore::new());
    let token = identities
        .issue(
            IdentityRecord::new("42", "Ada").with_permissions(vec![Permission::Vnc, Permission::Ssh]),
            "sk-",
        )
        .await;
    let auth = AuthTokenGateway::new(h.store.clone(), identities, AuthConfig::default());
    let limiter = Arc::new(RateLimiter::new(h.store.clone(), RateLimitConfig::default()));
    let orchestrator = Arc::into_inner(h.orchestrator).expect("sole owner");
    let plane = ControlPlane::new(auth, limiter, orchestrator);

    let created = plane
        .create_environment(
            &format!("Bearer {token}"),
            &CreateRequest {
                ssh: true,
                ..CreateRequest::default()
            },
        )
        .await
        .unwrap();
    assert!(created.session_password.is_some());
    let ssh = created.descriptor.access_info.ssh.clone().expect("ssh");
    assert!(ssh.command.starts_with("ssh -p "));

    let status = plane.environment_status(&token).await.unwrap();
    assert_eq!(status, created.descriptor);

    plane
        .delete_environment(&token, Some("vnc-42"), false)
        .await
        .unwrap();
    let err = plane.environment_status(&token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_api_error().code, "not_found");
}
