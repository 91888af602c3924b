use crate::config::helpers::{parse_bool_env, parse_optional_env, parse_range_env};
use crate::error::ConfigError;

/// Port pool settings for both namespaces.
#[derive(Debug, Clone)]
pub struct PortsConfig {
    /// Inclusive SSH proxy range on the routing layer.
    pub ssh_range: (u16, u16),
    /// Listener node port for proxy port `p` is `ssh_node_port_base + (p - ssh_range.0)`.
    pub ssh_node_port_base: u16,
    /// Public SSH port is the proxy port plus this offset.
    pub ssh_public_offset: u16,
    pub direct_enabled: bool,
    /// Inclusive direct NodePort range.
    pub direct_range: (u16, u16),
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            ssh_range: (22000, 22399),
            ssh_node_port_base: 32000,
            ssh_public_offset: 10000,
            direct_enabled: true,
            direct_range: (30000, 31000),
        }
    }
}

impl PortsConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            ssh_range: parse_range_env("SSH_PORT_RANGE", defaults.ssh_range)?,
            ssh_node_port_base: parse_optional_env(
                "SSH_NODE_PORT_BASE",
                defaults.ssh_node_port_base,
            )?,
            ssh_public_offset: parse_optional_env(
                "SSH_PUBLIC_OFFSET",
                defaults.ssh_public_offset,
            )?,
            direct_enabled: parse_bool_env("DIRECT_PORTS_ENABLED", defaults.direct_enabled)?,
            direct_range: parse_range_env("DIRECT_PORT_RANGE", defaults.direct_range)?,
        };

        let (start, end) = cfg.ssh_range;
        let span = u32::from(end - start);
        if u32::from(cfg.ssh_node_port_base) + span > u32::from(u16::MAX) {
            return Err(ConfigError::InvalidValue {
                key: "SSH_NODE_PORT_BASE".to_string(),
                message: format!("node ports overflow for range {start}-{end}"),
            });
        }
        if u32::from(end) + u32::from(cfg.ssh_public_offset) > u32::from(u16::MAX) {
            return Err(ConfigError::InvalidValue {
                key: "SSH_PUBLIC_OFFSET".to_string(),
                message: format!("public ports overflow for range {start}-{end}"),
            });
        }
        Ok(cfg)
    }
}
