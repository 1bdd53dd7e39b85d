//! Declarative network policy for spawned processes.
//!
//! The kernel has no packet filter; policy is enforced at the two places it
//! can see: the argument vector (URLs naming a host) and the child's
//! environment (proxy variables and offline switches honoured by npm,
//! cargo and NuGet).

use serde::{Deserialize, Serialize};

use super::KernelError;

/// Proxy address that accepts nothing (`discard` port on loopback).
const BLACKHOLE_PROXY: &str = "http://127.0.0.1:9";

/// Hosts that never count as outbound traffic.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]", "0.0.0.0"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No outbound access.
    None,
    /// Only hosts on the allow-list (package registries).
    #[default]
    Restricted,
    Full,
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Restricted => f.write_str("restricted"),
            Self::Full => f.write_str("full"),
        }
    }
}

/// Check `args` against `policy` and return the environment overrides the
/// child must run with.
pub(crate) fn enforce(
    policy: NetworkPolicy,
    args: &[String],
    allowed_hosts: &[String],
) -> Result<Vec<(String, String)>, KernelError> {
    match policy {
        NetworkPolicy::Full => Ok(Vec::new()),
        NetworkPolicy::None => {
            if let Some(host) = args.iter().filter_map(|a| url_host(a)).find(|h| !is_loopback(h)) {
                return Err(KernelError::NetworkDenied { host, policy });
            }
            let mut env: Vec<(String, String)> = [
                "HTTP_PROXY",
                "HTTPS_PROXY",
                "ALL_PROXY",
                "http_proxy",
                "https_proxy",
                "all_proxy",
            ]
            .into_iter()
            .map(|key| (key.to_owned(), BLACKHOLE_PROXY.to_owned()))
            .collect();
            env.push(("NO_PROXY".into(), "localhost,127.0.0.1,::1".into()));
            env.push(("npm_config_offline".into(), "true".into()));
            env.push(("CARGO_NET_OFFLINE".into(), "true".into()));
            Ok(env)
        }
        NetworkPolicy::Restricted => {
            for host in args.iter().filter_map(|a| url_host(a)) {
                if !is_loopback(&host) && !host_allowed(&host, allowed_hosts) {
                    return Err(KernelError::NetworkDenied { host, policy });
                }
            }
            Ok(vec![(
                "STACKPILOT_ALLOWED_HOSTS".into(),
                allowed_hosts.join(","),
            )])
        }
    }
}

/// An exact match or a subdomain of an allowed host.
fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allowed.iter().any(|a| {
        let a = a.to_ascii_lowercase();
        host == a || host.strip_suffix(&a).is_some_and(|prefix| prefix.ends_with('.'))
    })
}

fn is_loopback(host: &str) -> bool {
    LOOPBACK_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h))
}

/// Host part of the first URL embedded in `arg`, e.g. in
/// `--registry=https://registry.npmjs.org/`.
fn url_host(arg: &str) -> Option<String> {
    let after_scheme = &arg[arg.find("://")? + 3..];
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme);
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = if host_port.starts_with('[') {
        // IPv6 literal keeps its brackets.
        host_port.split_inclusive(']').next().unwrap_or(host_port)
    } else {
        host_port.split(':').next().unwrap_or(host_port)
    };
    (!host.is_empty()).then(|| host.to_owned())
}
