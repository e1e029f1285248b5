//! Daemon configuration and workspace identity.

use std::path::PathBuf;
use wsnet_common::{
    HeartbeatConfig, NetError, PortForwardConfig, PresenceConfig, ProxyConfig, Result, SshConfig,
    TopologyConfig,
};
use wsnet_observability::LogFormat;

/// Configuration for the daemon [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Workspace access key, used to join the overlay and as bearer token
    pub access_key: String,

    /// Control-plane host (without scheme)
    pub platform_host: String,

    /// Scheme used to reach the control plane
    pub platform_scheme: String,

    /// Overlay hostname, `<node>.<workspace>.<project>.<domain...>`
    pub workspace_host: String,

    /// Directory holding the rendezvous socket, the topology snapshot and node state
    pub root_dir: PathBuf,

    /// Log output format
    pub log_format: LogFormat,

    /// HTTP client for the relay probe; a default client is built when unset
    pub client: Option<reqwest::Client>,

    /// Probe the relay service before joining
    pub relay_check: bool,

    pub ssh: SshConfig,
    pub port_forward: PortForwardConfig,
    pub proxy: ProxyConfig,
    pub presence: PresenceConfig,

    /// Staleness policy of the connection monitor
    pub heartbeat: HeartbeatConfig,
    pub topology: TopologyConfig,
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.access_key.is_empty() {
            return Err(NetError::Config("access_key is required".into()));
        }
        if self.platform_host.is_empty() {
            return Err(NetError::Config("platform_host is required".into()));
        }
        if self.workspace_host.is_empty() {
            return Err(NetError::Config("workspace_host is required".into()));
        }
        if self.platform_scheme.is_empty() {
            return Err(NetError::Config("platform_scheme is required".into()));
        }
        self.heartbeat.validate()?;
        Ok(())
    }

    /// Coordination server URL handed to the overlay join
    pub fn control_url(&self) -> String {
        format!("{}://{}/coordinator/", self.platform_scheme, self.platform_host)
    }

    /// Relay endpoint probed before joining
    pub fn relay_probe_url(&self) -> String {
        format!("{}://{}/derp/probe", self.platform_scheme, self.platform_host)
    }

    /// Proxy settings rooted at [`root_dir`](Self::root_dir)
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            root_dir: self.root_dir.clone(),
            ..self.proxy.clone()
        }
    }

    /// Directory for overlay node state
    pub fn state_dir(&self) -> PathBuf {
        self.root_dir.join("state")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            platform_host: String::new(),
            platform_scheme: "https".to_string(),
            workspace_host: String::new(),
            root_dir: PathBuf::from("/var/run/devpod"),
            proxy: ProxyConfig::default(),
            log_format: LogFormat::default(),
            client: None,
            relay_check: true,
            ssh: SshConfig::default(),
            port_forward: PortForwardConfig::default(),
            presence: PresenceConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

/// Workspace and project encoded in the overlay hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceIdentity {
    /// Per-node prefix
    pub node: String,
    pub workspace: String,
    pub project: String,
}

impl WorkspaceIdentity {
    /// Split `host` on `.`; segment 1 is the workspace and segment 2 the project.
    ///
    /// At least four segments are required.
    pub fn parse(host: &str) -> Result<Self> {
        let segments: Vec<&str> = host.split('.').collect();
        if segments.len() < 4 {
            return Err(NetError::Config(format!(
                "workspace host '{host}' must have at least 4 segments"
            )));
        }
        Ok(Self {
            node: segments[0].to_string(),
            workspace: segments[1].to_string(),
            project: segments[2].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        ServerConfig {
            access_key: "key".into(),
            platform_host: "platform.example.com".into(),
            workspace_host: "node.ws.proj.ts.loft".into(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_required_fields() {
        assert!(valid().validate().is_ok());

        for (config, field) in [
            (ServerConfig { access_key: String::new(), ..valid() }, "access_key"),
            (ServerConfig { platform_host: String::new(), ..valid() }, "platform_host"),
            (ServerConfig { workspace_host: String::new(), ..valid() }, "workspace_host"),
        ] {
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{err}");
        }
    }

    #[test]
    fn test_derived_urls() {
        let config = valid();
        assert_eq!(config.control_url(), "https://platform.example.com/coordinator/");
        assert_eq!(config.relay_probe_url(), "https://platform.example.com/derp/probe");

        let config = ServerConfig {
            platform_scheme: "http".into(),
            ..valid()
        };
        assert_eq!(config.control_url(), "http://platform.example.com/coordinator/");
    }

    #[test]
    fn test_proxy_config_follows_root_dir() {
        let config = ServerConfig {
            root_dir: PathBuf::from("/tmp/wsnet"),
            ..valid()
        };
        assert_eq!(
            config.proxy_config().socket_path(),
            PathBuf::from("/tmp/wsnet/devpod-net.sock")
        );
    }

    #[test]
    fn test_parse_identity() {
        let id = WorkspaceIdentity::parse("node.ws.proj.ts.loft").unwrap();
        assert_eq!(id.node, "node");
        assert_eq!(id.workspace, "ws");
        assert_eq!(id.project, "proj");

        let id = WorkspaceIdentity::parse("a.b.c.d").unwrap();
        assert_eq!((id.workspace.as_str(), id.project.as_str()), ("b", "c"));
    }

    #[test]
    fn test_parse_identity_too_short() {
        assert!(matches!(
            WorkspaceIdentity::parse("node.ws.proj"),
            Err(NetError::Config(_))
        ));
        assert!(WorkspaceIdentity::parse("").is_err());
    }
}
