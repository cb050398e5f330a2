//! SSH login-name parsing.
//!
//! The SSH username encodes the whole routing decision:
//!
//! - `user+instance.project@remote`
//! - `user+instance.project`
//! - `user+instance`
//! - `instance.project`
//! - `instance`
//! - `%shell` (the self-service subshell)
//!
//! Parsing is pure: no I/O, no defaults read from the environment. The
//! caller supplies the policy default for the in-container user.

use std::fmt;

use crate::error::GatewayError;

pub const DEFAULT_PROJECT: &str = "default";

/// Instance token selecting the self-service subshell.
pub const SHELL_INSTANCE: &str = "%shell";

/// Parsed routing descriptor. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginDescriptor {
    /// Account inside the instance the session should run as.
    pub instance_user: String,
    /// Instance name; `%shell` selects the subshell.
    pub instance: String,
    /// Incus project, `default` if the login did not name one.
    pub project: String,
    /// Named remote Incus host, if any.
    pub remote: Option<String>,
    /// True iff the descriptor requests the self-service subshell.
    pub command: bool,
}

impl LoginDescriptor {
    /// Parse an SSH username. `default_user` fills `instance_user` when the
    /// login carries no `user+` prefix.
    pub fn parse(login: &str, default_user: &str) -> Result<Self, GatewayError> {
        let malformed = || GatewayError::MalformedLogin(login.to_string());

        if login == SHELL_INSTANCE {
            return Ok(Self {
                instance_user: default_user.to_string(),
                instance: SHELL_INSTANCE.to_string(),
                project: DEFAULT_PROJECT.to_string(),
                remote: None,
                command: true,
            });
        }

        let (spec, remote) = match login.split_once('@') {
            Some((spec, remote)) => {
                if !is_identifier(remote) {
                    return Err(malformed());
                }
                (spec, Some(remote.to_string()))
            }
            None => (login, None),
        };

        let (user, rest) = match spec.split_once('+') {
            Some((user, rest)) => {
                if !is_identifier(user) || rest.contains('+') {
                    return Err(malformed());
                }
                (user.to_string(), rest)
            }
            None => (default_user.to_string(), spec),
        };

        // The instance name stops at the first dot; anything after it is the
        // project (which itself may contain dots).
        let (instance, project) = match rest.split_once('.') {
            Some((instance, project)) => {
                if !is_identifier(project) {
                    return Err(malformed());
                }
                (instance, project.to_string())
            }
            None => (rest, DEFAULT_PROJECT.to_string()),
        };

        if instance != SHELL_INSTANCE && !is_identifier(instance) {
            return Err(malformed());
        }

        Ok(Self {
            instance_user: user,
            instance: instance.to_string(),
            project,
            remote,
            command: instance == SHELL_INSTANCE,
        })
    }

    pub fn is_default_project(&self) -> bool {
        self.project == DEFAULT_PROJECT
    }
}

/// Canonical form: `user+instance[.project][@remote]`, omitting the default
/// project. `parse(format(d), _) == d` for any parsed descriptor.
impl fmt::Display for LoginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.instance_user, self.instance)?;
        if !self.is_default_project() {
            write!(f, ".{}", self.project)?;
        }
        if let Some(remote) = &self.remote {
            write!(f, "@{remote}")?;
        }
        Ok(())
    }
}

/// `[A-Za-z0-9_][A-Za-z0-9_.-]*`
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(login: &str) -> LoginDescriptor {
        LoginDescriptor::parse(login, "root").unwrap()
    }

    #[test]
    fn test_parse_full_form() {
        let lu = parse("alice+web01.prod@paris");
        assert_eq!(lu.instance_user, "alice");
        assert_eq!(lu.instance, "web01");
        assert_eq!(lu.project, "prod");
        assert_eq!(lu.remote.as_deref(), Some("paris"));
        assert!(!lu.command);
    }

    #[test]
    fn test_parse_defaults() {
        let lu = parse("web01");
        assert_eq!(lu.instance_user, "root");
        assert_eq!(lu.instance, "web01");
        assert_eq!(lu.project, "default");
        assert_eq!(lu.remote, None);

        let lu = parse("bob+api.prod");
        assert_eq!(lu.instance_user, "bob");
        assert_eq!(lu.project, "prod");

        let lu = parse("api.prod");
        assert_eq!(lu.instance_user, "root");
        assert_eq!(lu.instance, "api");
        assert_eq!(lu.project, "prod");
    }

    #[test]
    fn test_parse_shell_literal() {
        let lu = parse("%shell");
        assert!(lu.command);
        assert_eq!(lu.instance, "%shell");
        assert_eq!(lu.instance_user, "root");
        assert!(lu.is_default_project());
    }

    #[test]
    fn test_shell_as_instance_token_is_not_special_for_other_users() {
        // Falls through to a normal (failing) lookup in the dispatcher.
        let lu = parse("alice+%shell");
        assert_eq!(lu.instance_user, "alice");
        assert_eq!(lu.instance, "%shell");
        assert!(lu.command);
    }

    #[test]
    fn test_project_may_contain_dots() {
        let lu = parse("web01.team.prod");
        assert_eq!(lu.instance, "web01");
        assert_eq!(lu.project, "team.prod");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for login in [
            "",
            "+web01",
            "alice+",
            "alice++web01",
            "alice+web01@",
            "alice+web01@a@b",
            "web 01",
            "-web01",
            ".web01",
            "alice+web01.",
            "über",
        ] {
            assert!(
                LoginDescriptor::parse(login, "root").is_err(),
                "expected {login:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_parse_is_deterministic_and_roundtrips() {
        for login in [
            "web01",
            "api.prod",
            "alice+web01",
            "bob+api.prod",
            "alice+web01.prod@paris",
            "root+db-1.staging",
        ] {
            let first = parse(login);
            assert_eq!(first, parse(login));
            assert!(!first.instance.is_empty());
            let formatted = first.to_string();
            assert_eq!(parse(&formatted), first, "round-trip of {login:?}");
        }
    }
}
