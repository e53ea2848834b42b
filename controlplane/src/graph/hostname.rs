/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::OnceLock;

use regex::Regex;

/// Hostname used for a listener or route that accepts any host.
pub const ANY_HOSTNAME: &str = "*";

const SUBDOMAIN_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";
const MAX_HOSTNAME_LEN: usize = 253;

fn subdomain_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(SUBDOMAIN_REGEX).expect("should compile"))
}

/// Checks that `hostname` is an RFC 1123 subdomain, optionally prefixed with
/// a `*.` wildcard label. IP addresses are not hostnames.
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("hostname cannot be empty".to_string());
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(format!(
            "hostname {hostname} must be no more than {MAX_HOSTNAME_LEN} characters"
        ));
    }
    if hostname.parse::<std::net::IpAddr>().is_ok() {
        return Err(format!("hostname {hostname} must not be an IP address"));
    }

    let domain = hostname.strip_prefix("*.").unwrap_or(hostname);
    if !subdomain_regex().is_match(domain) {
        return Err(format!(
            "hostname {hostname} must be a valid RFC 1123 subdomain, matching the regex: {SUBDOMAIN_REGEX}"
        ));
    }
    Ok(())
}

/// Returns the hostnames a route serves on a listener.
///
/// A listener without a hostname accepts every route hostname. A route without
/// hostnames inherits the listener hostname. Otherwise each route hostname that
/// matches the listener hostname contributes the more specific of the two. An
/// empty result means the route cannot attach to the listener.
pub fn intersect_hostnames(listener: Option<&str>, route: &[String]) -> Vec<String> {
    let listener = listener.filter(|h| !h.is_empty());

    match (listener, route.is_empty()) {
        (None, true) => vec![ANY_HOSTNAME.to_string()],
        (None, false) => route.to_vec(),
        (Some(l), true) => vec![l.to_string()],
        (Some(l), false) => {
            let mut result: Vec<String> = Vec::new();
            for h in route {
                if let Some(matched) = match_hostname(l, h) {
                    if !result.iter().any(|r| r == matched) {
                        result.push(matched.to_string());
                    }
                }
            }
            result
        }
    }
}

// Returns the more specific hostname if the two match each other.
fn match_hostname<'a>(listener: &'a str, route: &'a str) -> Option<&'a str> {
    if listener == route {
        return Some(route);
    }
    match (listener.strip_prefix('*'), route.strip_prefix('*')) {
        // a wildcard must cover at least one extra label
        (Some(suffix), None) if route.ends_with(suffix) && route.len() > suffix.len() => {
            Some(route)
        }
        (None, Some(suffix)) if listener.ends_with(suffix) && listener.len() > suffix.len() => {
            Some(listener)
        }
        (Some(l_suffix), Some(r_suffix)) => {
            if r_suffix.ends_with(l_suffix) {
                Some(route)
            } else if l_suffix.ends_with(r_suffix) {
                Some(listener)
            } else {
                None
            }
        }
        _ => None,
    }
}
