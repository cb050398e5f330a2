//! Host-local user identity helpers.
//!
//! Group lookups shell out to the `id` utility. The binary path is resolved
//! once at startup and carried in the handle so tests and callers never
//! depend on ambient state.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::process::Command;

use crate::error::GatewayError;

/// Handle over the resolved `id` utility.
#[derive(Debug, Clone)]
pub struct HostUserdb {
    id_path: PathBuf,
}

impl HostUserdb {
    /// Resolve the `id` utility. Its absence is a startup failure.
    pub fn new() -> Result<Self> {
        let id_path = which::which("id").context("the 'id' utility was not found in PATH")?;
        Ok(Self { id_path })
    }

    /// Numeric group IDs of a host user (`id -G`).
    ///
    /// Not consumed by the dispatcher yet; kept alongside `group_names` for
    /// callers that need numeric IDs.
    #[allow(dead_code)]
    pub async fn group_ids(&self, username: &str) -> Result<Vec<u32>, GatewayError> {
        let fields = self.id_fields(&["-G", username]).await?;
        fields
            .iter()
            .map(|f| {
                f.parse::<u32>()
                    .map_err(|err| GatewayError::Internal(format!("unexpected id output: {err}")))
            })
            .collect()
    }

    /// Group names of a host user (`id -Gn`).
    pub async fn group_names(&self, username: &str) -> Result<Vec<String>, GatewayError> {
        self.id_fields(&["-Gn", username]).await
    }

    async fn id_fields(&self, args: &[&str]) -> Result<Vec<String>, GatewayError> {
        let output = Command::new(&self.id_path)
            .args(args)
            .output()
            .await
            .map_err(|err| GatewayError::Internal(format!("running id: {err}")))?;

        if !output.status.success() {
            return Err(GatewayError::NotFound);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let fields: Vec<String> = stdout.split_whitespace().map(str::to_string).collect();
        if fields.is_empty() {
            return Err(GatewayError::NotFound);
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_resolves_id() {
        let db = HostUserdb::new().unwrap();
        assert!(db.id_path.is_absolute());
    }

    #[tokio::test]
    async fn test_group_ids_for_root() {
        let db = HostUserdb::new().unwrap();
        let ids = db.group_ids("root").await.unwrap();
        assert!(!ids.is_empty());
        assert!(ids.contains(&0));
    }

    #[tokio::test]
    async fn test_group_names_for_root() {
        let db = HostUserdb::new().unwrap();
        let names = db.group_names("root").await.unwrap();
        assert!(names.iter().any(|n| n == "root"));
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let db = HostUserdb::new().unwrap();
        let err = db.group_ids("no-such-user-incusgate").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound));
    }
}
