//! Session banner rendering.
//!
//! A fresh string is produced for every session; the template itself is
//! never mutated.

use crate::login::LoginDescriptor;

const TEMPLATE: &str = r#"
┌──────────────────────────────────────────────┐
│   i n c u s g a t e                          │
│   SSH gateway for Incus instances            │
└──────────────────────────────────────────────┘
"#;

/// Render the per-session banner. `hostname` is the gateway host, when known.
pub fn render(lu: &LoginDescriptor, hostname: Option<&str>) -> String {
    if lu.command {
        return TEMPLATE.to_string();
    }

    let mut host = String::new();
    if let Some(name) = hostname {
        if !name.is_empty() {
            let remote = match &lu.remote {
                Some(r) => format!("{r} / "),
                None => String::new(),
            };
            host = format!(" 💻 {remote}{name}");
        }
    }

    format!(
        "{TEMPLATE}👤 {} 📦 {}.{}{}\n────────────────────────────────────────────────\n\n",
        lu.instance_user, lu.instance, lu.project, host
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(login: &str) -> LoginDescriptor {
        LoginDescriptor::parse(login, "root").unwrap()
    }

    #[test]
    fn test_render_is_fresh_per_session() {
        let lu = descriptor("alice+web01");
        let first = render(&lu, Some("gw1"));
        let second = render(&lu, Some("gw1"));
        assert_eq!(first, second);
        assert!(first.contains("👤 alice 📦 web01.default 💻 gw1"));
    }

    #[test]
    fn test_render_remote_prefix() {
        let lu = descriptor("bob+api.prod@paris");
        let banner = render(&lu, Some("gw1"));
        assert!(banner.contains("💻 paris / gw1"));
    }

    #[test]
    fn test_render_command_session_uses_plain_template() {
        let lu = descriptor("%shell");
        assert_eq!(render(&lu, Some("gw1")), TEMPLATE);
    }

    #[test]
    fn test_render_without_hostname() {
        let lu = descriptor("alice+web01");
        let banner = render(&lu, None);
        assert!(banner.contains("👤 alice 📦 web01.default\n"));
        assert!(!banner.contains("💻"));
    }
}
