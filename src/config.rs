//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// How the in-instance command is built when the client requests a shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShellMode {
    /// `su - "<user>"`, run through the instance's own login machinery.
    Su,
    /// `login -h "<host>" -f "<user>"`, likewise.
    Login,
    /// The target user's shell with `-l`, run directly as that user.
    #[default]
    Shell,
}

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Incus daemon UNIX socket
    pub incus_socket: PathBuf,

    /// Shell invocation mode
    pub shell: ShellMode,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// OpenSSH-format public keys allowed to connect
    pub authorized_keys_path: PathBuf,

    /// In-container account used when the login carries no `user+` prefix
    pub default_instance_user: String,

    /// Bound on establishing the Incus connection
    pub connect_timeout_secs: u64,

    /// Write the session banner when a PTY was requested
    pub banner: bool,

    /// Named remote Incus hosts: remote name -> UNIX socket path
    #[serde(default)]
    pub remotes: HashMap<String, PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("incusgate");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            incus_socket: PathBuf::from("/var/lib/incus/unix.socket"),
            shell: ShellMode::default(),
            host_key_path: data_dir.join("host_key"),
            authorized_keys_path: data_dir.join("authorized_keys"),
            default_instance_user: "root".to_string(),
            connect_timeout_secs: 10,
            banner: true,
            remotes: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
        }
        Ok(())
    }

    /// Socket path for a descriptor's remote, falling back to the local daemon.
    pub fn socket_for_remote(&self, remote: Option<&str>) -> Option<&Path> {
        match remote {
            None => Some(self.incus_socket.as_path()),
            Some(name) => self.remotes.get(name).map(PathBuf::as_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_mode_parses_lowercase() {
        let config: GatewayConfig = toml::from_str(r#"shell = "su""#).unwrap();
        assert_eq!(config.shell, ShellMode::Su);
        let config: GatewayConfig = toml::from_str(r#"shell = "login""#).unwrap();
        assert_eq!(config.shell, ShellMode::Login);
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.shell, ShellMode::Shell);
    }

    #[test]
    fn test_socket_for_remote() {
        let mut config = GatewayConfig::default();
        config
            .remotes
            .insert("paris".to_string(), PathBuf::from("/run/paris.socket"));

        assert_eq!(
            config.socket_for_remote(None),
            Some(Path::new("/var/lib/incus/unix.socket"))
        );
        assert_eq!(
            config.socket_for_remote(Some("paris")),
            Some(Path::new("/run/paris.socket"))
        );
        assert_eq!(config.socket_for_remote(Some("ghost")), None);
    }
}
