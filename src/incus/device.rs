//! Per-session proxy devices.
//!
//! A proxy device makes a host-side UNIX socket appear inside the guest at
//! a fixed path with controlled ownership. Used for SSH agent forwarding.

use hyper::Method;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::{IncusClient, ProxyDevice};
use crate::error::GatewayError;

/// One materialised proxy device. `remove_socket` must run on every exit
/// path; it is a no-op when the add never happened or already got undone.
pub struct ProxyDeviceHandle {
    device: ProxyDevice,
    name: String,
    listen_path: String,
    added: bool,
}

impl ProxyDeviceHandle {
    pub fn new(device: ProxyDevice) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let short = &short[..8];
        Self {
            device,
            name: format!("incusgate-agent-{short}"),
            listen_path: format!("/tmp/ssh-agent-{short}.sock"),
            added: false,
        }
    }

    /// Add the device and return the in-guest socket path.
    pub async fn add_socket(&mut self, client: &mut IncusClient) -> Result<String, GatewayError> {
        let path = self.instance_path(client);
        let body = json!({
            "devices": {
                &self.name: {
                    "type": "proxy",
                    "bind": "instance",
                    "connect": format!("unix:{}", self.device.source),
                    "listen": format!("unix:{}", self.listen_path),
                    "uid": self.device.uid.to_string(),
                    "gid": self.device.gid.to_string(),
                    "mode": self.device.mode,
                }
            }
        });

        let resp = client.api(Method::PATCH, path, Some(body)).await?;
        if !resp.operation.is_empty() {
            client.wait_operation(&resp.operation).await?;
        }

        self.added = true;
        debug!(
            instance = %self.device.instance,
            device = %self.name,
            listen = %self.listen_path,
            "added proxy device"
        );
        Ok(self.listen_path.clone())
    }

    /// Remove the device. Idempotent, and safe after a failed add.
    pub async fn remove_socket(&mut self, client: &mut IncusClient) -> Result<(), GatewayError> {
        if !self.added {
            return Ok(());
        }
        self.added = false;

        let path = self.instance_path(client);
        let current = client.api(Method::GET, path.clone(), None).await?;
        let instance = current.metadata;

        let mut devices = instance["devices"].clone();
        let removed = match devices.as_object_mut() {
            Some(map) => map.remove(&self.name).is_some(),
            None => false,
        };
        if !removed {
            // Already gone.
            return Ok(());
        }

        let body = json!({
            "config": instance["config"],
            "devices": devices,
            "ephemeral": instance["ephemeral"],
            "profiles": instance["profiles"],
            "description": instance["description"],
        });

        let resp = client.api(Method::PUT, path, Some(body)).await?;
        if !resp.operation.is_empty() {
            client.wait_operation(&resp.operation).await?;
        }

        debug!(
            instance = %self.device.instance,
            device = %self.name,
            "removed proxy device"
        );
        Ok(())
    }

    fn instance_path(&self, client: &IncusClient) -> String {
        client.query_path(
            &format!("/1.0/instances/{}", self.device.instance),
            &[("project", &self.device.project)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn device() -> ProxyDevice {
        ProxyDevice {
            project: "default".to_string(),
            instance: "web01".to_string(),
            source: "/run/incusgate/abc/agent.sock".to_string(),
            uid: 1000,
            gid: 1000,
            mode: "0660".to_string(),
        }
    }

    #[test]
    fn test_new_generates_distinct_sockets() {
        let a = ProxyDeviceHandle::new(device());
        let b = ProxyDeviceHandle::new(device());
        assert_ne!(a.name, b.name);
        assert_ne!(a.listen_path, b.listen_path);
        assert!(a.listen_path.starts_with("/tmp/ssh-agent-"));
    }

    #[tokio::test]
    async fn test_remove_without_add_is_a_noop() {
        // Never touches the backend, so an unconnected client is fine.
        let mut client =
            IncusClient::new(PathBuf::from("/nonexistent.socket"), Duration::from_secs(1));
        let mut handle = ProxyDeviceHandle::new(device());
        handle.remove_socket(&mut client).await.unwrap();
        handle.remove_socket(&mut client).await.unwrap();
    }
}
