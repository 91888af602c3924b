//! Deterministic per-user resource names.
//!
//! Every resource of an environment is named from the user id alone, so the
//! cluster can be queried for a user's bundle without any index.

pub const MANAGED_BY: &str = "vnc-manager";
pub const APP_LABEL: &str = "vnc";

pub const VNC_PORT: u16 = 5901;
pub const NOVNC_PORT: u16 = 6080;
pub const SSH_PORT: u16 = 22;

/// Names of every resource belonging to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub user_id: String,
    pub compute_unit: String,
    pub endpoint: String,
    pub ingress: String,
    pub storage_claim: String,
}

impl ResourceNames {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            compute_unit: format!("vnc-{user_id}"),
            endpoint: format!("vnc-service-{user_id}"),
            ingress: format!("vnc-ingress-{user_id}"),
            storage_claim: format!("pvc-{user_id}"),
        }
    }

    /// Target locator for the SSH mapping table: `{namespace}/{service}:22`.
    pub fn ssh_locator(&self, namespace: &str) -> String {
        format!("{namespace}/{}:{SSH_PORT}", self.endpoint)
    }

    /// Target locator recorded for a direct NodePort allocation.
    pub fn direct_locator(&self, namespace: &str) -> String {
        format!("{namespace}/{}:{VNC_PORT}", self.endpoint)
    }

    /// Session-affinity cookie name on the ingress.
    pub fn affinity_cookie(&self) -> String {
        format!("vnc-session-{}", self.user_id)
    }

    /// Label set stamped on every resource.
    pub fn labels(&self) -> std::collections::BTreeMap<String, String> {
        [
            ("app", APP_LABEL),
            ("user", self.user_id.as_str()),
            ("managed-by", MANAGED_BY),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

/// Whether `compute_unit` is the compute-unit name of `user_id`.
pub fn owned_by(compute_unit: &str, user_id: &str) -> bool {
    compute_unit == ResourceNames::for_user(user_id).compute_unit
}

/// Cluster label names are limited to DNS-1123 label characters.
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= 40
        && user_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !user_id.starts_with('-')
        && !user_id.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_for_user() {
        let names = ResourceNames::for_user("42");
        assert_eq!(names.compute_unit, "vnc-42");
        assert_eq!(names.endpoint, "vnc-service-42");
        assert_eq!(names.ingress, "vnc-ingress-42");
        assert_eq!(names.storage_claim, "pvc-42");
        assert_eq!(names.ssh_locator("vnc-pods"), "vnc-pods/vnc-service-42:22");
    }

    #[test]
    fn test_ownership_is_exact() {
        assert!(owned_by("vnc-42", "42"));
        assert!(!owned_by("vnc-142", "42"));
        assert!(!owned_by("vnc-42", "4"));
    }

    #[test]
    fn test_user_id_validation() {
        assert!(is_valid_user_id("42"));
        assert!(is_valid_user_id("alice-dev"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("Alice"));
        assert!(!is_valid_user_id("a/b"));
        assert!(!is_valid_user_id("-a"));
    }
}
