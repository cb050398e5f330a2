//! Typed wrapper over the Incus REST API.
//!
//! The daemon is reached over its UNIX socket; management calls are plain
//! HTTP/1.1 + JSON, exec I/O is carried over per-operation websockets.

mod client;
mod device;
mod exec;

pub use client::IncusClient;
pub use device::ProxyDeviceHandle;
pub use exec::{InstanceExec, Window};

/// Resolved identity of an in-instance account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUser {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    /// Home directory.
    pub dir: String,
    /// Login shell, absolute path.
    pub shell: String,
}

/// Declarative description of a forwarded endpoint: a host-side UNIX socket
/// materialised inside the guest with the given ownership and mode.
#[derive(Debug, Clone)]
pub struct ProxyDevice {
    pub project: String,
    pub instance: String,
    /// Host-side socket path.
    pub source: String,
    pub uid: u32,
    pub gid: u32,
    /// Octal mode string for the in-guest socket, e.g. "0660".
    pub mode: String,
}

/// Find `username` in passwd-format `content`.
pub(crate) fn parse_passwd_entry(content: &str, username: &str) -> Option<InstanceUser> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let user = fields.next()?;
        if user != username {
            continue;
        }
        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        let _gecos = fields.next()?;
        let dir = fields.next()?;
        let shell = fields.next().unwrap_or("/bin/sh");
        return Some(InstanceUser {
            user: user.to_string(),
            uid,
            gid,
            dir: dir.to_string(),
            shell: shell.to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
alice:x:1000:1000:Alice:/home/alice:/bin/bash
";

    #[test]
    fn test_parse_passwd_entry() {
        let iu = parse_passwd_entry(PASSWD, "alice").unwrap();
        assert_eq!(
            iu,
            InstanceUser {
                user: "alice".to_string(),
                uid: 1000,
                gid: 1000,
                dir: "/home/alice".to_string(),
                shell: "/bin/bash".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_passwd_entry_absent_user() {
        assert!(parse_passwd_entry(PASSWD, "bob").is_none());
        assert!(parse_passwd_entry("", "alice").is_none());
    }

    #[test]
    fn test_parse_passwd_entry_skips_malformed_lines() {
        let content = "garbage\nalice:x:1000:1000:Alice:/home/alice:/bin/zsh\n";
        let iu = parse_passwd_entry(content, "alice").unwrap();
        assert_eq!(iu.shell, "/bin/zsh");
    }
}
