//! HTTP client for the Incus daemon's UNIX-socket REST API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::UnixStream;
use tracing::debug;

use super::{parse_passwd_entry, InstanceUser};
use crate::error::GatewayError;

/// Standard Incus response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default)]
    pub error_code: u32,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Client for one Incus daemon. Owned by a single session task; the
/// connection is established once and reused for every management call.
pub struct IncusClient {
    socket: PathBuf,
    connect_timeout: Duration,
    project: Option<String>,
    sender: Option<SendRequest<Full<Bytes>>>,
}

impl IncusClient {
    pub fn new(socket: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            socket,
            connect_timeout,
            project: None,
            sender: None,
        }
    }

    /// Open the daemon connection and probe `GET /1.0`. Idempotent.
    pub async fn connect(&mut self) -> Result<(), GatewayError> {
        if self.sender.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| {
                GatewayError::BackendUnavailable(format!(
                    "timed out connecting to {}",
                    self.socket.display()
                ))
            })?
            .map_err(|err| {
                GatewayError::BackendUnavailable(format!(
                    "connecting to {}: {err}",
                    self.socket.display()
                ))
            })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| GatewayError::BackendUnavailable(format!("http handshake: {err}")))?;

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("incus connection closed: {err}");
            }
        });

        self.sender = Some(sender);
        self.api(Method::GET, "/1.0".to_string(), None).await?;
        debug!("connected to incus at {}", self.socket.display());
        Ok(())
    }

    /// Drop the daemon connection. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.sender.take().is_some() {
            debug!("disconnected from incus at {}", self.socket.display());
        }
    }

    /// Scope all subsequent calls to `name`. Fails when the project does
    /// not exist.
    pub async fn use_project(&mut self, name: &str) -> Result<(), GatewayError> {
        match self
            .api(Method::GET, format!("/1.0/projects/{name}"), None)
            .await
        {
            Ok(_) => {
                if name != crate::login::DEFAULT_PROJECT {
                    self.project = Some(name.to_string());
                }
                Ok(())
            }
            Err(GatewayError::NotFound) => Err(GatewayError::NoSuchProject(name.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Resolve an in-instance account by reading the instance's
    /// `/etc/passwd` through the files API. Returns `Ok(None)` when the
    /// instance or the account does not exist; errors are transport-class.
    pub async fn instance_user(
        &mut self,
        project: &str,
        instance: &str,
        user: &str,
    ) -> Result<Option<InstanceUser>, GatewayError> {
        if user.is_empty() {
            return Ok(None);
        }

        let path = self.query_path(
            &format!("/1.0/instances/{instance}/files"),
            &[("path", "/etc/passwd"), ("project", project)],
        );
        let (status, body) = self.raw(Method::GET, path, None).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GatewayError::Backend(format!(
                "reading /etc/passwd from {instance}: http {status}"
            )));
        }

        let content = String::from_utf8_lossy(&body);
        Ok(parse_passwd_entry(&content, user))
    }

    /// One JSON API round trip, envelope checked. 404s surface as
    /// `NotFound` for the caller to contextualise.
    pub(crate) async fn api(
        &mut self,
        method: Method,
        path: String,
        body: Option<Value>,
    ) -> Result<ApiResponse, GatewayError> {
        let body = match body {
            Some(value) => Some(
                serde_json::to_vec(&value)
                    .map_err(|err| GatewayError::Internal(format!("encoding request: {err}")))?,
            ),
            None => None,
        };

        let (status, bytes) = self.raw(method, path, body).await?;
        let resp: ApiResponse = serde_json::from_slice(&bytes)
            .map_err(|err| GatewayError::Backend(format!("decoding response: {err}")))?;

        if resp.response_type == "error" {
            let code = if resp.error_code != 0 {
                resp.error_code
            } else {
                status.as_u16() as u32
            };
            return Err(match code {
                404 => GatewayError::NotFound,
                _ => GatewayError::Backend(format!("{code}: {}", resp.error)),
            });
        }

        Ok(resp)
    }

    /// Wait for a background operation and return its final state.
    pub(crate) async fn wait_operation(&mut self, operation: &str) -> Result<Value, GatewayError> {
        // `operation` is the envelope's path, e.g. "/1.0/operations/<id>".
        let path = self.query_path(&format!("{operation}/wait"), &[]);
        let resp = self.api(Method::GET, path, None).await?;

        let err = resp.metadata["err"].as_str().unwrap_or_default();
        if !err.is_empty() {
            return Err(GatewayError::Backend(err.to_string()));
        }
        Ok(resp.metadata)
    }

    async fn raw(
        &mut self,
        method: Method,
        path: String,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), GatewayError> {
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| GatewayError::Internal("incus client is not connected".to_string()))?;

        let request = Request::builder()
            .method(method)
            .uri(&path)
            .header(header::HOST, "incus")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
            .map_err(|err| GatewayError::Internal(format!("building request: {err}")))?;

        sender
            .ready()
            .await
            .map_err(|err| GatewayError::BackendUnavailable(err.to_string()))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|err| GatewayError::Backend(format!("{path}: {err}")))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| GatewayError::Backend(format!("{path}: reading body: {err}")))?
            .to_bytes();
        Ok((status, bytes))
    }

    /// Append query parameters plus the project scope, when one is set.
    pub(crate) fn query_path(&self, base: &str, extra: &[(&str, &str)]) -> String {
        let mut pairs: Vec<String> = extra
            .iter()
            .filter(|(k, v)| !(*k == "project" && *v == crate::login::DEFAULT_PROJECT))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !extra.iter().any(|(k, _)| *k == "project") {
            if let Some(project) = &self.project {
                pairs.push(format!("project={project}"));
            }
        }
        if pairs.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{}", pairs.join("&"))
        }
    }

    pub(crate) fn socket(&self) -> &Path {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IncusClient {
        IncusClient::new(PathBuf::from("/run/incus.socket"), Duration::from_secs(1))
    }

    #[test]
    fn test_query_path_default_project_is_omitted() {
        let c = client();
        assert_eq!(c.query_path("/1.0/instances/web01", &[]), "/1.0/instances/web01");
        assert_eq!(
            c.query_path("/1.0/instances/web01/files", &[("path", "/etc/passwd"), ("project", "default")]),
            "/1.0/instances/web01/files?path=/etc/passwd"
        );
    }

    #[test]
    fn test_query_path_carries_scoped_project() {
        let mut c = client();
        c.project = Some("prod".to_string());
        assert_eq!(
            c.query_path("/1.0/operations/abc/wait", &[]),
            "/1.0/operations/abc/wait?project=prod"
        );
        // An explicit project parameter wins over the scope.
        assert_eq!(
            c.query_path("/1.0/instances/api/files", &[("path", "/etc/passwd"), ("project", "prod")]),
            "/1.0/instances/api/files?path=/etc/passwd&project=prod"
        );
    }

    #[tokio::test]
    async fn test_connect_unreachable_socket_is_backend_unavailable() {
        let mut c = IncusClient::new(
            PathBuf::from("/nonexistent/incus.socket"),
            Duration::from_millis(100),
        );
        let err = c.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_requests_require_connect() {
        let mut c = client();
        let err = c.use_project("prod").await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut c = client();
        c.disconnect();
        c.disconnect();
    }
}
