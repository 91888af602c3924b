//! Bearer-token authentication with a TTL identity cache and a revocation
//! blacklist.
//!
//! ```text
//! token ──► shape check ──► blacklist? ──► cache hit? ──► identity
//!                              │ yes           │ miss
//!                              ▼               ▼
//!                           Revoked     identity store ──► cache (TTL)
//! ```
//!
//! The blacklist is consulted on every validation, cache hit or not, so a
//! revocation takes effect immediately even while a cached identity is still
//! within its TTL. Revocation only touches this layer: the authoritative
//! identity store is left as is, and a revoked token becomes valid again once
//! its blacklist entry expires if the store still lists it.

mod identity;
mod token;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{AuthError, StoreError};
use crate::store::{self, SharedStore};

pub use identity::{IdentityRecord, IdentityStore, InMemoryIdentityStore, PostgresIdentityStore};
pub use token::{BearerToken, fingerprint, generate_api_token, generate_session_password};

/// Capabilities an identity can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Vnc,
    Ssh,
    NoVnc,
    Admin,
}

impl Permission {
    /// Granted when the identity store has no explicit permission set.
    pub const DEFAULTS: [Permission; 3] = [Permission::Vnc, Permission::Ssh, Permission::NoVnc];
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Vnc => write!(f, "vnc"),
            Permission::Ssh => write!(f, "ssh"),
            Permission::NoVnc => write!(f, "novnc"),
            Permission::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vnc" => Ok(Permission::Vnc),
            "ssh" => Ok(Permission::Ssh),
            "novnc" => Ok(Permission::NoVnc),
            "admin" => Ok(Permission::Admin),
            _ => Err(format!("Unknown permission: {}", s)),
        }
    }
}

/// Compute and storage limits for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub storage: String,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            cpu_request: "500m".to_string(),
            cpu_limit: "2".to_string(),
            memory_request: "1Gi".to_string(),
            memory_limit: "4Gi".to_string(),
            storage: "10Gi".to_string(),
        }
    }
}

/// Partial quota; unset fields fall through to a base quota.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl QuotaOverride {
    pub fn apply_to(&self, base: &ResourceQuota) -> ResourceQuota {
        let pick = |o: &Option<String>, b: &String| o.clone().unwrap_or_else(|| b.clone());
        ResourceQuota {
            cpu_request: pick(&self.cpu_request, &base.cpu_request),
            cpu_limit: pick(&self.cpu_limit, &base.cpu_limit),
            memory_request: pick(&self.memory_request, &base.memory_request),
            memory_limit: pick(&self.memory_limit, &base.memory_limit),
            storage: pick(&self.storage, &base.storage),
        }
    }
}

/// Resolved principal behind a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub permissions: BTreeSet<Permission>,
    pub quota: ResourceQuota,
    /// SHA-256 of the token this identity was resolved from.
    pub fingerprint: String,
}

impl Identity {
    /// `Admin` implies every other permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission) || self.permissions.contains(&Permission::Admin)
    }
}

fn cache_key(fingerprint: &str) -> String {
    format!("token:{fingerprint}")
}

fn blacklist_key(fingerprint: &str) -> String {
    format!("blacklist:{fingerprint}")
}

fn unavailable(e: StoreError) -> AuthError {
    AuthError::Unavailable(e.to_string())
}

/// Validates bearer tokens against the cache, blacklist and identity store.
pub struct AuthTokenGateway {
    store: SharedStore,
    identities: Arc<dyn IdentityStore>,
    config: AuthConfig,
}

impl AuthTokenGateway {
    pub fn new(store: SharedStore, identities: Arc<dyn IdentityStore>, config: AuthConfig) -> Self {
        Self {
            store,
            identities,
            config,
        }
    }

    fn parse(&self, raw: &str) -> Result<BearerToken, AuthError> {
        BearerToken::parse(raw, &self.config.token_prefix, self.config.min_token_len)
    }

    /// Resolve `raw` to an identity.
    pub async fn validate(&self, raw: &str) -> Result<Identity, AuthError> {
        let token = self.parse(raw)?;
        let fp = token.fingerprint();

        if self
            .store
            .exists(&blacklist_key(&fp))
            .await
            .map_err(unavailable)?
        {
            tracing::info!(fingerprint = %token::short(&fp), "Rejected revoked token");
            return Err(AuthError::Revoked);
        }

        match store::get_json::<Identity>(self.store.as_ref(), &cache_key(&fp)).await {
            Ok(Some(identity)) => {
                self.spawn_touch(&identity.user_id);
                return Ok(identity);
            }
            Ok(None) => {}
            Err(StoreError::Serialization(e)) => {
                tracing::warn!(error = %e, "Discarding undecodable cached identity");
            }
            Err(e) => return Err(unavailable(e)),
        }

        let Some(record) = self.identities.lookup_by_token(&token).await? else {
            tracing::debug!(fingerprint = %token::short(&fp), "Unknown token");
            return Err(AuthError::NotFound);
        };
        let identity = self.build_identity(record, fp);

        if let Err(e) = store::set_json(
            self.store.as_ref(),
            &cache_key(&identity.fingerprint),
            &identity,
            Some(self.config.cache_ttl),
        )
        .await
        {
            tracing::warn!(user_id = %identity.user_id, error = %e, "Failed to cache identity");
        }
        self.spawn_touch(&identity.user_id);

        tracing::debug!(user_id = %identity.user_id, "Token validated from identity store");
        Ok(identity)
    }

    fn build_identity(&self, record: IdentityRecord, fingerprint: String) -> Identity {
        let permissions = record
            .permissions
            .unwrap_or_else(|| Permission::DEFAULTS.to_vec())
            .into_iter()
            .collect();
        Identity {
            quota: record.quota.apply_to(&self.config.default_quota),
            user_id: record.user_id,
            display_name: record.display_name,
            permissions,
            fingerprint,
        }
    }

    fn spawn_touch(&self, user_id: &str) {
        let identities = Arc::clone(&self.identities);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = identities.touch_last_seen(&user_id).await {
                tracing::debug!(user_id = %user_id, error = %e, "Failed to update last seen");
            }
        });
    }

    /// Blacklist `raw` and evict its cached identity.
    pub async fn revoke(&self, raw: &str) -> Result<(), AuthError> {
        let token = self.parse(raw)?;
        let fp = token.fingerprint();
        self.store
            .set(&blacklist_key(&fp), "1", Some(self.config.blacklist_ttl))
            .await
            .map_err(unavailable)?;
        self.store
            .delete(&cache_key(&fp))
            .await
            .map_err(unavailable)?;
        tracing::info!(fingerprint = %token::short(&fp), "Token revoked");
        Ok(())
    }

    pub async fn has_permission(&self, raw: &str, permission: Permission) -> Result<bool, AuthError> {
        Ok(self.validate(raw).await?.has_permission(permission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AtomicStore, InMemoryStore};

    struct Fixture {
        store: Arc<InMemoryStore>,
        identities: Arc<InMemoryIdentityStore>,
        gateway: AuthTokenGateway,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let identities = Arc::new(InMemoryIdentityStore::new());
        let gateway = AuthTokenGateway::new(store.clone(), identities.clone(), AuthConfig::default());
        Fixture {
            store,
            identities,
            gateway,
        }
    }

    // ── validate ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_malformed_token_never_reaches_store() {
        let f = fixture();
        f.store.set_unavailable(true);
        assert!(matches!(
            f.gateway.validate("not-a-token").await,
            Err(AuthError::Malformed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let f = fixture();
        let err = f
            .gateway
            .validate("sk-0000000000000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
    }

    #[tokio::test]
    async fn test_miss_populates_cache_with_defaults() {
        let f = fixture();
        let token = f.identities.issue(IdentityRecord::new("42", "Ada"), "sk-").await;

        let identity = f.gateway.validate(&token).await.unwrap();
        assert_eq!(identity.user_id, "42");
        assert!(identity.has_permission(Permission::Ssh));
        assert!(!identity.has_permission(Permission::Admin));
        assert_eq!(identity.quota, ResourceQuota::default());
        assert!(
            f.store
                .exists(&format!("token:{}", fingerprint(&token)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_cache_hit_survives_store_deactivation() {
        let f = fixture();
        let token = f.identities.issue(IdentityRecord::new("42", "Ada"), "sk-").await;
        f.gateway.validate(&token).await.unwrap();

        // Soft revocation semantics: the cache keeps serving until TTL.
        f.identities.deactivate(&token).await;
        assert_eq!(f.gateway.validate(&token).await.unwrap().user_id, "42");
    }

    #[tokio::test]
    async fn test_quota_override_merges_with_default() {
        let f = fixture();
        let record = IdentityRecord::new("7", "Bo").with_quota(QuotaOverride {
            memory_limit: Some("8Gi".to_string()),
            ..QuotaOverride::default()
        });
        let token = f.identities.issue(record, "sk-").await;
        let identity = f.gateway.validate(&token).await.unwrap();
        assert_eq!(identity.quota.memory_limit, "8Gi");
        assert_eq!(identity.quota.cpu_request, "500m");
    }

    // ── revoke ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_revoke_beats_warm_cache() {
        let f = fixture();
        let token = f.identities.issue(IdentityRecord::new("42", "Ada"), "sk-").await;
        f.gateway.validate(&token).await.unwrap();

        f.gateway.revoke(&token).await.unwrap();
        assert!(matches!(
            f.gateway.validate(&token).await,
            Err(AuthError::Revoked)
        ));
        assert!(
            !f.store
                .exists(&format!("token:{}", fingerprint(&token)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_blacklist_checked_even_if_cache_reappears() {
        let f = fixture();
        let token = f.identities.issue(IdentityRecord::new("42", "Ada"), "sk-").await;
        let identity = f.gateway.validate(&token).await.unwrap();
        f.gateway.revoke(&token).await.unwrap();

        // A stale writer puts the identity back into the cache.
        store::set_json(
            f.store.as_ref(),
            &format!("token:{}", identity.fingerprint),
            &identity,
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            f.gateway.validate(&token).await,
            Err(AuthError::Revoked)
        ));
    }

    #[tokio::test]
    async fn test_has_permission_admin_implies_all() {
        let f = fixture();
        let record = IdentityRecord::new("1", "Root").with_permissions(vec![Permission::Admin]);
        let token = f.identities.issue(record, "sk-").await;
        assert!(f.gateway.has_permission(&token, Permission::Ssh).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let f = fixture();
        let token = f.identities.issue(IdentityRecord::new("42", "Ada"), "sk-").await;
        f.store.set_unavailable(true);
        assert!(matches!(
            f.gateway.validate(&token).await,
            Err(AuthError::Unavailable(_))
        ));
    }

    #[test]
    fn test_permission_round_trip_names() {
        for p in [Permission::Vnc, Permission::Ssh, Permission::NoVnc, Permission::Admin] {
            assert_eq!(p.to_string().parse::<Permission>().unwrap(), p);
        }
        assert!("root".parse::<Permission>().is_err());
    }
}
