use std::time::Duration;

use serde::{Deserialize, Serialize};
use vnet_sim::{IpBackend, IpOptions};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of every namespace the engine creates: node `h1` lives in `{prefix}-h1`.
    pub namespace_prefix: String,
    /// Timeout applied to commands run without an explicit one.
    pub command_timeout: Duration,
    /// Run kernel commands through `sudo`. `None` picks `sudo` unless running as root.
    pub sudo: Option<bool>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "vnet".to_string(),
            command_timeout: Duration::from_secs(10),
            sudo: None,
        }
    }
}

impl EngineConfig {
    pub fn with_namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = Some(sudo);
        self
    }

    /// The namespace name of node `node`.
    pub fn namespace_name(&self, node: &str) -> String {
        format!("{}-{node}", self.namespace_prefix)
    }

    /// A kernel backend honouring the `sudo` setting.
    pub fn ip_backend(&self) -> IpBackend {
        let mut options = IpOptions::default();
        if let Some(sudo) = self.sudo {
            options.sudo = sudo;
        }
        IpBackend::new(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "namespace_prefix": "lab" }"#).unwrap();
        assert_eq!(config.namespace_prefix, "lab");
        assert_eq!(config.command_timeout, EngineConfig::default().command_timeout);
        assert_eq!(config.namespace_name("h1"), "lab-h1");
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfig::default()
            .with_namespace_prefix("t")
            .with_command_timeout(Duration::from_millis(250))
            .with_sudo(false);

        assert_eq!(config.namespace_name("r1"), "t-r1");
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.sudo, Some(false));
    }
}
