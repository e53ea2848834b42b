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

//! Data plane configuration derived from a Graph.
//!
//! The configuration groups the attached routes into one virtual server per
//! listener port and hostname. Within a server, match rules are grouped by
//! path; the match rules of a path are ordered by priority across every
//! route that contributes to it, so the data plane can take the first match.

use std::collections::{BTreeMap, BTreeSet};

use gateway_api::apis::standard::httproutes::{
    HTTPRouteRulesMatches, HTTPRouteRulesMatchesMethod, HTTPRouteRulesMatchesPathType,
};
use serde::Serialize;

use crate::consts::PROTOCOL_HTTPS;
use crate::graph::{BackendRef, Gateway, Graph, Listener, MatchRule, Route};
use crate::resolver::Endpoint;
use crate::sort::sort_match_rules;
use crate::NamespacedName;

const DEFAULT_PATH: &str = "/";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub http_servers: Vec<VirtualServer>,
    pub ssl_servers: Vec<VirtualServer>,
    pub upstreams: Vec<Upstream>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServer {
    pub hostname: String,
    pub port: i32,
    /// The Secret holding the certificate, for HTTPS listeners.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<NamespacedName>,
    pub path_rules: Vec<PathRule>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PathType {
    Exact,
    Prefix,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub path: String,
    pub path_type: PathType,
    /// Highest priority first.
    pub match_rules: Vec<MatchConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchConfig {
    pub route: String,
    pub rule_idx: usize,
    pub match_idx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<KeyValueMatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub query_params: Vec<KeyValueMatch>,
    pub backends: Vec<Backend>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyValueMatch {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub upstream: String,
    pub weight: i32,
    /// Requests sent to an invalid backend are answered with an error.
    pub valid: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Upstream {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Default)]
struct ServerBuilder {
    ssl: Option<NamespacedName>,
    paths: BTreeMap<(String, PathType), Vec<MatchRule>>,
}

/// Builds the configuration for the Gateway of the Graph. A Graph without a
/// valid Gateway yields an empty configuration.
pub fn build_configuration(graph: &Graph) -> Configuration {
    let mut config = Configuration::default();
    let Some(gateway) = graph.gateway.as_ref().filter(|gw| gw.valid) else {
        return config;
    };

    // (https, port, hostname)
    let mut servers: BTreeMap<(bool, i32, String), ServerBuilder> = BTreeMap::new();
    for listener in gateway.listeners.iter().filter(|l| l.valid) {
        let https = listener.source.protocol == PROTOCOL_HTTPS;
        for (route, hostnames) in attached_routes(graph, gateway, listener) {
            for hostname in hostnames {
                let server = servers
                    .entry((https, listener.source.port, hostname))
                    .or_default();
                if https && server.ssl.is_none() {
                    server.ssl = listener.secret.clone();
                }
                add_route(server, route);
            }
        }
    }

    for ((https, port, hostname), server) in servers {
        let vs = VirtualServer {
            hostname,
            port,
            ssl: server.ssl,
            path_rules: server
                .paths
                .into_iter()
                .map(|((path, path_type), mut match_rules)| {
                    sort_match_rules(&mut match_rules);
                    PathRule {
                        path,
                        path_type,
                        match_rules: match_rules.iter().map(|m| match_config(graph, m)).collect(),
                    }
                })
                .collect(),
        };
        if https {
            config.ssl_servers.push(vs);
        } else {
            config.http_servers.push(vs);
        }
    }

    config.upstreams = graph
        .backends
        .iter()
        .map(|(key, endpoints)| Upstream {
            name: key.to_string(),
            endpoints: endpoints.clone(),
        })
        .collect();

    config
}

// Routes attached to the listener, in key order, with the hostnames they
// were accepted for.
fn attached_routes<'a>(
    graph: &'a Graph,
    gateway: &Gateway,
    listener: &Listener,
) -> Vec<(&'a Route, BTreeSet<String>)> {
    listener
        .routes
        .iter()
        .filter_map(|key| graph.routes.get(key))
        .filter(|route| route.valid)
        .map(|route| {
            let hostnames = route
                .parent_refs
                .iter()
                .filter(|p| p.gateway == gateway.key)
                .filter_map(|p| p.attachment.accepted_hostnames.get(listener.name()))
                .flatten()
                .cloned()
                .collect();
            (route, hostnames)
        })
        .collect()
}

fn add_route(server: &mut ServerBuilder, route: &Route) {
    for rule in route.rules.iter().filter(|r| r.valid) {
        for match_rule in &rule.match_rules {
            let path = path_of(&match_rule.matches);
            let rules = server.paths.entry(path).or_default();
            // a route attached through several listeners contributes once
            let seen = rules.iter().any(|m| {
                m.source.key == match_rule.source.key
                    && m.rule_idx == match_rule.rule_idx
                    && m.match_idx == match_rule.match_idx
            });
            if !seen {
                rules.push(match_rule.clone());
            }
        }
    }
}

fn path_of(matches: &HTTPRouteRulesMatches) -> (String, PathType) {
    let Some(path) = &matches.path else {
        return (DEFAULT_PATH.to_string(), PathType::Prefix);
    };
    let value = path.value.clone().unwrap_or_else(|| DEFAULT_PATH.to_string());
    match path.r#type {
        Some(HTTPRouteRulesMatchesPathType::Exact) => (value, PathType::Exact),
        _ => (value, PathType::Prefix),
    }
}

// The wire name of the method, as written in the HTTPRoute.
fn method_name(method: &HTTPRouteRulesMatchesMethod) -> Option<String> {
    match serde_json::to_value(method) {
        Ok(serde_json::Value::String(name)) => Some(name),
        _ => None,
    }
}

fn match_config(graph: &Graph, match_rule: &MatchRule) -> MatchConfig {
    let matches = &match_rule.matches;
    let backends = graph
        .routes
        .get(&match_rule.source.key)
        .and_then(|route| route.rules.get(match_rule.rule_idx))
        .map(|rule| rule.backend_refs.iter().map(backend).collect())
        .unwrap_or_default();

    MatchConfig {
        route: match_rule.source.key.to_string(),
        rule_idx: match_rule.rule_idx,
        match_idx: match_rule.match_idx,
        method: matches.method.as_ref().and_then(method_name),
        headers: matches
            .headers
            .iter()
            .flatten()
            .map(|h| KeyValueMatch {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect(),
        query_params: matches
            .query_params
            .iter()
            .flatten()
            .map(|q| KeyValueMatch {
                name: q.name.clone(),
                value: q.value.clone(),
            })
            .collect(),
        backends,
    }
}

fn backend(backend_ref: &BackendRef) -> Backend {
    Backend {
        upstream: backend_ref.key().to_string(),
        weight: backend_ref.weight,
        valid: backend_ref.valid,
    }
}
