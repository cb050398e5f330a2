//! Error taxonomy and SSH exit codes.
//!
//! Every session ends by mapping a `GatewayError` (or the remote process's
//! own exit code) to one of the codes below. The dispatcher is the only
//! place that turns errors into user-visible messages.

use thiserror::Error;

/// Exit codes reported back to the SSH client.
pub mod exit {
    #[allow(dead_code)]
    pub const NOT_IMPLEMENTED: i32 = -1;
    pub const INVALID_LOGIN: i32 = 1;
    pub const INVALID_PROJECT: i32 = 2;
    #[allow(dead_code)]
    pub const META_ERROR: i32 = 3;
    #[allow(dead_code)]
    pub const ARCHITECTURE_ERROR: i32 = 4;
    pub const INTERNAL_ERROR: i32 = 20;
    pub const CONNECTION_ERROR: i32 = 255;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed login {0:?}")]
    MalformedLogin(String),

    #[error("unknown project {0}")]
    NoSuchProject(String),

    #[error("unknown user {0}")]
    NoSuchUser(String),

    #[error("unknown instance {0}")]
    NoSuchInstance(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("session cancelled")]
    Cancelled,

    /// Host-side lookup came back empty. Never shown to the SSH client.
    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::MalformedLogin(_)
            | GatewayError::NoSuchUser(_)
            | GatewayError::NoSuchInstance(_) => exit::INVALID_LOGIN,
            GatewayError::NoSuchProject(_) => exit::INVALID_PROJECT,
            GatewayError::BackendUnavailable(_) | GatewayError::Backend(_) => {
                exit::CONNECTION_ERROR
            }
            // The SSH layer supplies its own status on disconnect.
            GatewayError::Cancelled => exit::CONNECTION_ERROR,
            GatewayError::NotFound | GatewayError::Internal(_) => exit::INTERNAL_ERROR,
        }
    }

    /// Short message written to the SSH channel, where one is warranted.
    pub fn user_message(&self) -> Option<String> {
        match self {
            GatewayError::MalformedLogin(_) => Some("invalid connection data\n".to_string()),
            GatewayError::NoSuchProject(name) => Some(format!("unknown project {name}\n")),
            GatewayError::NoSuchUser(_) | GatewayError::NoSuchInstance(_) => {
                Some("not found user or instance\n".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            GatewayError::MalformedLogin("x".into()).exit_code(),
            exit::INVALID_LOGIN
        );
        assert_eq!(
            GatewayError::NoSuchProject("ghost".into()).exit_code(),
            exit::INVALID_PROJECT
        );
        assert_eq!(
            GatewayError::BackendUnavailable("refused".into()).exit_code(),
            exit::CONNECTION_ERROR
        );
        assert_eq!(
            GatewayError::Internal("boom".into()).exit_code(),
            exit::INTERNAL_ERROR
        );
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            GatewayError::NoSuchProject("ghost".into()).user_message(),
            Some("unknown project ghost\n".to_string())
        );
        assert_eq!(
            GatewayError::NoSuchUser("alice".into()).user_message(),
            Some("not found user or instance\n".to_string())
        );
        assert!(GatewayError::Backend("500".into()).user_message().is_none());
        assert!(GatewayError::Cancelled.user_message().is_none());
    }
}
