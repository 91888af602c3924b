//! Entry point for the outer request layer.
//!
//! Every call runs the same pipeline before touching any environment:
//!
//! ```text
//! token ──► AuthTokenGateway ──► RateLimiter ──► permission ──► orchestrator
//!              │ Unauthorized       │ RateLimited    │ Forbidden
//! ```
//!
//! Callers get back domain values or a [`ControlError`], which renders to the
//! `{code, message}` contract via [`ControlError::to_api_error`].

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::auth::{
    AuthTokenGateway, Identity, Permission, QuotaOverride, fingerprint,
    generate_session_password,
};
use crate::error::{ControlError, OrchestratorError};
use crate::naming;
use crate::orchestrator::{
    CreateOutcome, EnvironmentDescriptor, EnvironmentOrchestrator, EnvironmentSummary,
    ProvisionOptions, StatusDetail,
};
use crate::rate_limit::{RateLimitResult, RateLimitUsage, RateLimiter};

/// Body of an environment-creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub ssh: bool,
    #[serde(default)]
    pub direct_port: bool,
    /// Takes precedence over the identity's own quota.
    #[serde(default)]
    pub quota: QuotaOverride,
}

/// A descriptor plus the session password, when this call set one.
///
/// The password is only known to the call that (re)created the compute
/// unit; it is never cached.
#[derive(Debug)]
pub struct ProvisionedEnvironment {
    pub descriptor: EnvironmentDescriptor,
    pub session_password: Option<SecretString>,
}

pub struct ControlPlane {
    auth: AuthTokenGateway,
    limiter: Arc<RateLimiter>,
    orchestrator: EnvironmentOrchestrator,
    limiter_gc: Option<JoinHandle<()>>,
}

impl ControlPlane {
    /// Must be called inside a tokio runtime to get the rate limiter's
    /// background sweep; outside one the sweep is skipped with a warning.
    pub fn new(
        auth: AuthTokenGateway,
        limiter: Arc<RateLimiter>,
        orchestrator: EnvironmentOrchestrator,
    ) -> Self {
        let limiter_gc = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(limiter.spawn_gc()),
            Err(_) => {
                tracing::warn!("No runtime, rate-limit fallback windows will not be swept");
                None
            }
        };
        Self {
            auth,
            limiter,
            orchestrator,
            limiter_gc,
        }
    }

    pub fn orchestrator(&self) -> &EnvironmentOrchestrator {
        &self.orchestrator
    }

    pub fn auth(&self) -> &AuthTokenGateway {
        &self.auth
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Validate the token and admit the request.
    async fn authorize(&self, token: &str) -> Result<Identity, ControlError> {
        let identity = self.auth.validate(token).await?;
        if !naming::is_valid_user_id(&identity.user_id) {
            tracing::warn!(user_id = %identity.user_id, "Identity cannot name cluster resources");
            return Err(ControlError::Forbidden(
                "user id is not usable as a resource name".to_string(),
            ));
        }

        match self.limiter.admit(&identity.user_id).await {
            RateLimitResult::Allowed { .. } => {}
            RateLimitResult::Limited {
                retry_after,
                limit_type,
            } => {
                tracing::info!(
                    user_id = %identity.user_id,
                    limit = %limit_type,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request rate limited"
                );
                return Err(ControlError::RateLimited { retry_after });
            }
        }
        self.limiter.record(&identity.user_id).await;
        Ok(identity)
    }

    fn require(identity: &Identity, permission: Permission) -> Result<(), ControlError> {
        if identity.has_permission(permission) {
            Ok(())
        } else {
            Err(ControlError::Forbidden(format!(
                "missing permission: {permission}"
            )))
        }
    }

    fn not_found(identity: &Identity) -> ControlError {
        OrchestratorError::NotFound {
            user_id: identity.user_id.clone(),
        }
        .into()
    }

    pub async fn create_environment(
        &self,
        token: &str,
        request: &CreateRequest,
    ) -> Result<ProvisionedEnvironment, ControlError> {
        let identity = self.authorize(token).await?;
        Self::require(&identity, Permission::Vnc)?;
        if request.ssh {
            Self::require(&identity, Permission::Ssh)?;
        }

        let options = ProvisionOptions {
            quota: request.quota.apply_to(&identity.quota),
            ssh: request.ssh,
            direct_port: request.direct_port,
        };
        let password = SecretString::from(generate_session_password());

        let outcome = self
            .orchestrator
            .create(&identity.user_id, &password, &options)
            .await?;
        Ok(match outcome {
            CreateOutcome::Provisioned(descriptor) => ProvisionedEnvironment {
                descriptor,
                session_password: Some(password),
            },
            CreateOutcome::Existing(descriptor) => ProvisionedEnvironment {
                descriptor,
                session_password: None,
            },
        })
    }

    /// Delete the caller's environment. `compute_unit`, when given, must name
    /// the caller's own compute unit.
    pub async fn delete_environment(
        &self,
        token: &str,
        compute_unit: Option<&str>,
        keep_storage: bool,
    ) -> Result<(), ControlError> {
        let identity = self.authorize(token).await?;
        if let Some(name) = compute_unit
            && !naming::owned_by(name, &identity.user_id)
        {
            tracing::warn!(user_id = %identity.user_id, target = %name, "Rejected delete of foreign environment");
            return Err(ControlError::Forbidden(format!(
                "{name} does not belong to the caller"
            )));
        }

        if self
            .orchestrator
            .delete(&identity.user_id, keep_storage)
            .await?
        {
            Ok(())
        } else {
            Err(Self::not_found(&identity))
        }
    }

    pub async fn environment_status(
        &self,
        token: &str,
    ) -> Result<EnvironmentDescriptor, ControlError> {
        let identity = self.authorize(token).await?;
        self.orchestrator
            .get(&identity.user_id)
            .await?
            .ok_or_else(|| Self::not_found(&identity))
    }

    pub async fn environment_detail(&self, token: &str) -> Result<StatusDetail, ControlError> {
        let identity = self.authorize(token).await?;
        Ok(self.orchestrator.status_detail(&identity.user_id).await?)
    }

    pub async fn environment_logs(
        &self,
        token: &str,
        tail_lines: Option<u32>,
    ) -> Result<String, ControlError> {
        let identity = self.authorize(token).await?;
        Ok(self
            .orchestrator
            .logs(&identity.user_id, tail_lines)
            .await?)
    }

    /// Recreate the compute unit with a fresh session password.
    pub async fn restart_environment(
        &self,
        token: &str,
    ) -> Result<ProvisionedEnvironment, ControlError> {
        let identity = self.authorize(token).await?;
        Self::require(&identity, Permission::Vnc)?;
        let password = SecretString::from(generate_session_password());
        let descriptor = self
            .orchestrator
            .restart(&identity.user_id, &password, &identity.quota)
            .await?;
        Ok(ProvisionedEnvironment {
            descriptor,
            session_password: Some(password),
        })
    }

    pub async fn list_environments(
        &self,
        token: &str,
    ) -> Result<Vec<EnvironmentSummary>, ControlError> {
        let identity = self.authorize(token).await?;
        Self::require(&identity, Permission::Admin)?;
        Ok(self.orchestrator.list().await?)
    }

    /// Sweep old environments; `max_age` defaults to the configured
    /// `stale_after`.
    pub async fn cleanup_stale(
        &self,
        token: &str,
        max_age: Option<Duration>,
    ) -> Result<usize, ControlError> {
        let identity = self.authorize(token).await?;
        Self::require(&identity, Permission::Admin)?;
        let max_age = max_age.unwrap_or(self.orchestrator.config().stale_after);
        Ok(self.orchestrator.cleanup_stale(max_age).await?)
    }

    /// Revoke `target`. Callers may revoke their own token; revoking any
    /// other token needs `admin`.
    pub async fn revoke(&self, token: &str, target: &str) -> Result<(), ControlError> {
        let identity = self.authorize(token).await?;
        if fingerprint(target.strip_prefix("Bearer ").unwrap_or(target)) != identity.fingerprint {
            Self::require(&identity, Permission::Admin)?;
        }
        self.auth.revoke(target).await?;
        Ok(())
    }

    /// Remaining request budget, for rate-limit response headers. Does not
    /// count as a request itself.
    pub async fn rate_limit_usage(&self, token: &str) -> Result<RateLimitUsage, ControlError> {
        let identity = self.auth.validate(token).await?;
        Ok(self.limiter.usage(&identity.user_id).await)
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        if let Some(gc) = self.limiter_gc.take() {
            gc.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{IdentityRecord, InMemoryIdentityStore};
    use crate::cluster::{InMemoryCluster, ResourceKind};
    use crate::config::{AuthConfig, EnvironmentConfig, PortsConfig, RateLimitConfig};
    use crate::error::ErrorKind;
    use crate::ports::{PortAllocator, StoreMappingTable};
    use crate::store::{InMemoryStore, SharedStore};

    struct Fixture {
        store: Arc<InMemoryStore>,
        cluster: Arc<InMemoryCluster>,
        identities: Arc<InMemoryIdentityStore>,
        plane: ControlPlane,
    }

    fn fixture(limits: RateLimitConfig) -> Fixture {
        let mem = Arc::new(InMemoryStore::new());
        let store: SharedStore = mem.clone();
        let cluster = Arc::new(InMemoryCluster::new());
        let identities = Arc::new(InMemoryIdentityStore::new());
        let ports = Arc::new(PortAllocator::new(
            cluster.clone(),
            Arc::new(StoreMappingTable::direct(store.clone())),
            cluster.clone(),
            "vnc-pods",
            PortsConfig::default(),
        ));
        let orchestrator = EnvironmentOrchestrator::new(
            cluster.clone(),
            ports,
            store.clone(),
            "vnc-pods",
            EnvironmentConfig::default(),
        );
        let auth = AuthTokenGateway::new(store.clone(), identities.clone(), AuthConfig::default());
        let limiter = Arc::new(RateLimiter::new(store, limits));
        Fixture {
            store: mem,
            cluster,
            identities,
            plane: ControlPlane::new(auth, limiter, orchestrator),
        }
    }

    async fn user(f: &Fixture, id: &str, permissions: Option<Vec<Permission>>) -> String {
        let mut record = IdentityRecord::new(id, format!("user {id}"));
        if let Some(p) = permissions {
            record = record.with_permissions(p);
        }
        f.identities.issue(record, "sk-").await
    }

    #[tokio::test]
    async fn test_create_returns_password_once() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;

        let first = f
            .plane
            .create_environment(&token, &CreateRequest::default())
            .await
            .unwrap();
        assert!(first.session_password.is_some());

        let again = f
            .plane
            .create_environment(&token, &CreateRequest::default())
            .await
            .unwrap();
        assert!(again.session_password.is_none());
        assert_eq!(again.descriptor, first.descriptor);
    }

    #[tokio::test]
    async fn test_request_quota_overrides_identity_quota() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;
        let request = CreateRequest {
            quota: QuotaOverride {
                cpu_limit: Some("4".to_string()),
                ..QuotaOverride::default()
            },
            ..CreateRequest::default()
        };
        f.plane.create_environment(&token, &request).await.unwrap();

        let pod = f.cluster.manifest(ResourceKind::ComputeUnit, "vnc-42").unwrap();
        let resources = &pod["spec"]["containers"][0]["resources"];
        assert_eq!(resources["limits"]["cpu"], "4");
        assert_eq!(resources["limits"]["memory"], "4Gi");
    }

    #[tokio::test]
    async fn test_ssh_requires_permission() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", Some(vec![Permission::Vnc, Permission::NoVnc])).await;
        let request = CreateRequest {
            ssh: true,
            ..CreateRequest::default()
        };
        let err = f.plane.create_environment(&token, &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(f.cluster.create_calls(ResourceKind::ComputeUnit), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_before_any_mutation() {
        let f = fixture(RateLimitConfig {
            requests_per_minute: 1,
            ..RateLimitConfig::default()
        });
        let token = user(&f, "42", None).await;
        f.plane.environment_status(&token).await.unwrap_err();

        let err = f
            .plane
            .create_environment(&token, &CreateRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RateLimited { retry_after } if retry_after > Duration::ZERO));
        assert_eq!(err.to_api_error().code, "rate_limited");
        assert_eq!(f.cluster.create_calls(ResourceKind::ComputeUnit), 0);
    }

    #[tokio::test]
    async fn test_delete_foreign_compute_unit_forbidden() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;
        let err = f
            .plane
            .delete_environment(&token, Some("vnc-7"), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_delete_missing_environment_not_found() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;
        let err = f
            .plane
            .delete_environment(&token, Some("vnc-42"), true)
            .await
            .unwrap_err();
        assert_eq!(err.to_api_error().code, "not_found");
    }

    #[tokio::test]
    async fn test_list_requires_admin() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;
        let admin = user(&f, "1", Some(vec![Permission::Admin])).await;
        f.plane
            .create_environment(&token, &CreateRequest::default())
            .await
            .unwrap();

        assert_eq!(
            f.plane.list_environments(&token).await.unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(f.plane.list_environments(&admin).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_own_token_then_rejected() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;
        let other = user(&f, "43", None).await;

        assert_eq!(
            f.plane.revoke(&token, &other).await.unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        f.plane.revoke(&token, &token).await.unwrap();
        assert_eq!(
            f.plane.environment_status(&token).await.unwrap_err().kind(),
            ErrorKind::Revoked
        );
    }

    #[tokio::test]
    async fn test_usage_does_not_consume_budget() {
        let f = fixture(RateLimitConfig {
            requests_per_minute: 3,
            ..RateLimitConfig::default()
        });
        let token = user(&f, "42", None).await;
        f.plane.environment_status(&token).await.unwrap_err();

        let usage = f.plane.rate_limit_usage(&token).await.unwrap();
        assert_eq!(usage.remaining, 2);
        assert_eq!(f.plane.rate_limit_usage(&token).await.unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_cleanup_defaults_to_stale_after() {
        let f = fixture(RateLimitConfig::default());
        let token = user(&f, "42", None).await;
        let admin = user(&f, "1", Some(vec![Permission::Admin])).await;
        f.plane
            .create_environment(&token, &CreateRequest::default())
            .await
            .unwrap();

        assert_eq!(f.plane.cleanup_stale(&admin, None).await.unwrap(), 0);
        f.cluster
            .backdate(ResourceKind::ComputeUnit, "vnc-42", chrono::Duration::hours(25));
        assert_eq!(f.plane.cleanup_stale(&admin, None).await.unwrap(), 1);
        assert_eq!(f.cluster.live_count(ResourceKind::ComputeUnit), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_fallback_windows_are_swept() {
        let f = fixture(RateLimitConfig::default());
        f.store.set_unavailable(true);
        let limiter = f.plane.limiter();
        let two_hours_ago = crate::rate_limit::now_ms() - 2 * 3_600_000;
        limiter.record_at("42", two_hours_ago).await;
        assert_eq!(limiter.local_identities().await, 1);

        tokio::time::sleep(limiter.config().gc_interval + Duration::from_secs(1)).await;
        assert_eq!(limiter.local_identities().await, 0);
    }
}
