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

use std::collections::BTreeMap;
use std::sync::Arc;

use gateway_api::apis::standard::httproutes::{
    HTTPRoute, HTTPRouteParentRefs, HTTPRouteRulesMatches, HTTPRouteRulesMatchesHeadersType,
    HTTPRouteRulesMatchesPathType, HTTPRouteRulesMatchesQueryParamsType,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::warn;

use super::backend_refs::{resolve_backend_refs, BackendRef};
use super::gateway::{AllowedNamespaces, Gateway, ProcessedGateways};
use super::hostname::{intersect_hostnames, validate_hostname};
use super::ServicePortKey;
use crate::conditions::{self, Condition};
use crate::consts::{GATEWAY_API_GROUP, GATEWAY_KIND};
use crate::resolver::Endpoint;
use crate::sort::sort_match_rules;
use crate::store::ClusterState;
use crate::NamespacedName;

/// Metadata of the route a match came from, used to break priority ties.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteMeta {
    pub key: NamespacedName,
    pub creation_timestamp: Option<Time>,
}

/// One match of a rule, together with where it came from.
#[derive(Clone, Debug)]
pub struct MatchRule {
    pub source: RouteMeta,
    pub rule_idx: usize,
    pub match_idx: usize,
    pub matches: HTTPRouteRulesMatches,
}

/// How a parent reference attached to the Gateway.
#[derive(Clone, Debug, Default)]
pub struct Attachment {
    /// Hostnames served per attached listener name.
    pub accepted_hostnames: BTreeMap<String, Vec<String>>,
    /// Why the reference did not attach.
    pub failure: Option<Condition>,
}

impl Attachment {
    pub fn attached(&self) -> bool {
        !self.accepted_hostnames.is_empty()
    }
}

/// A parent reference of a route that points at a Gateway of our class.
#[derive(Clone, Debug)]
pub struct ParentRef {
    /// Index into the route's `spec.parentRefs`.
    pub idx: usize,
    pub gateway: NamespacedName,
    pub section_name: Option<String>,
    pub port: Option<i32>,
    pub attachment: Attachment,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub valid: bool,
    /// Sorted by priority, highest first.
    pub match_rules: Vec<MatchRule>,
    pub backend_refs: Vec<BackendRef>,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub source: Arc<HTTPRoute>,
    pub meta: RouteMeta,
    pub valid: bool,
    pub hostnames: Vec<String>,
    pub parent_refs: Vec<ParentRef>,
    pub rules: Vec<Rule>,
    /// Conditions that apply to every parent of the route.
    pub conditions: Vec<Condition>,
}

impl Route {
    pub fn attached(&self) -> bool {
        self.parent_refs.iter().any(|p| p.attachment.attached())
    }
}

/// Builds every route that references a Gateway of our class and attaches
/// them to the listeners of `gateway`. Endpoints of the backends of attached
/// routes are added to `backends`.
pub fn build_routes(
    state: &ClusterState,
    mut gateway: Option<&mut Gateway>,
    gateways: &ProcessedGateways,
    backends: &mut BTreeMap<ServicePortKey, Vec<Endpoint>>,
) -> BTreeMap<NamespacedName, Route> {
    let mut routes = BTreeMap::new();

    for (key, source) in &state.http_routes {
        let Some(mut route) = build_route(key, source, gateways) else {
            continue;
        };

        for parent_ref in &mut route.parent_refs {
            parent_ref.attachment = match gateway.as_deref_mut() {
                Some(gw) if gw.key == parent_ref.gateway => {
                    bind_parent_ref(parent_ref, key, route.valid, &route.hostnames, gw)
                }
                _ => Attachment {
                    failure: Some(conditions::route_no_matching_parent(
                        "The Gateway is ignored by the controller",
                    )),
                    ..Default::default()
                },
            };
        }

        if route.valid && route.attached() {
            resolve_rule_backends(&mut route, state, backends);
        }

        routes.insert(key.clone(), route);
    }

    routes
}

// Builds the route if it has a parent reference to one of our Gateways.
fn build_route(
    key: &NamespacedName,
    source: &Arc<HTTPRoute>,
    gateways: &ProcessedGateways,
) -> Option<Route> {
    let parent_refs: Vec<ParentRef> = source
        .spec
        .parent_refs
        .iter()
        .flatten()
        .enumerate()
        .filter(|(_, p)| is_gateway_ref(p))
        .map(|(idx, p)| ParentRef {
            idx,
            gateway: NamespacedName::new(
                p.namespace.as_deref().unwrap_or(&key.namespace),
                p.name.clone(),
            ),
            section_name: p.section_name.clone(),
            port: p.port,
            attachment: Attachment::default(),
        })
        .filter(|p| gateways.contains(&p.gateway))
        .collect();

    if parent_refs.is_empty() {
        return None;
    }

    let meta = RouteMeta {
        key: key.clone(),
        creation_timestamp: source.metadata.creation_timestamp.clone(),
    };
    let mut route = Route {
        source: source.clone(),
        meta,
        valid: true,
        hostnames: source.spec.hostnames.clone().unwrap_or_default(),
        parent_refs,
        rules: vec![],
        conditions: vec![],
    };

    if let Some(msg) = route.hostnames.iter().find_map(|h| validate_hostname(h).err()) {
        route.valid = false;
        route.conditions.push(conditions::route_unsupported_value(msg));
        return Some(route);
    }

    let mut invalid_rules = vec![];
    for (rule_idx, rule) in source.spec.rules.iter().flatten().enumerate() {
        let matches: Vec<HTTPRouteRulesMatches> = match &rule.matches {
            Some(matches) if !matches.is_empty() => matches.clone(),
            // no matches is a prefix match on "/"
            _ => vec![HTTPRouteRulesMatches {
                headers: None,
                method: None,
                path: None,
                query_params: None,
            }],
        };

        let validation: Result<(), String> = matches.iter().try_for_each(validate_match);
        if let Err(msg) = &validation {
            invalid_rules.push(format!("spec.rules[{rule_idx}]: {msg}"));
        }

        let mut match_rules: Vec<MatchRule> = matches
            .into_iter()
            .enumerate()
            .map(|(match_idx, matches)| MatchRule {
                source: route.meta.clone(),
                rule_idx,
                match_idx,
                matches,
            })
            .collect();
        sort_match_rules(&mut match_rules);

        route.rules.push(Rule {
            valid: validation.is_ok(),
            match_rules,
            backend_refs: vec![],
        });
    }

    if !invalid_rules.is_empty() {
        let msg = invalid_rules.join("; ");
        if route.rules.iter().all(|r| !r.valid) {
            route.valid = false;
            route.conditions.push(conditions::route_unsupported_value(msg));
        } else {
            warn!(route = %key, "ignoring invalid rules: {msg}");
        }
    }

    Some(route)
}

fn is_gateway_ref(parent_ref: &HTTPRouteParentRefs) -> bool {
    parent_ref.group.as_deref().unwrap_or(GATEWAY_API_GROUP) == GATEWAY_API_GROUP
        && parent_ref.kind.as_deref().unwrap_or(GATEWAY_KIND) == GATEWAY_KIND
}

fn validate_match(m: &HTTPRouteRulesMatches) -> Result<(), String> {
    if let Some(path) = &m.path {
        match path.r#type {
            Some(HTTPRouteRulesMatchesPathType::RegularExpression) => {
                return Err("path type RegularExpression is not supported".to_string());
            }
            Some(HTTPRouteRulesMatchesPathType::Exact)
            | Some(HTTPRouteRulesMatchesPathType::PathPrefix)
            | None => {}
        }
        if let Some(value) = &path.value {
            if !value.starts_with('/') {
                return Err(format!("path {value:?} must begin with '/'"));
            }
        }
    }

    for header in m.headers.iter().flatten() {
        if matches!(header.r#type, Some(HTTPRouteRulesMatchesHeadersType::RegularExpression)) {
            return Err(format!("header {} uses unsupported type RegularExpression", header.name));
        }
        if header.name.is_empty() {
            return Err("header name cannot be empty".to_string());
        }
    }

    for param in m.query_params.iter().flatten() {
        if matches!(param.r#type, Some(HTTPRouteRulesMatchesQueryParamsType::RegularExpression)) {
            return Err(format!(
                "query param {} uses unsupported type RegularExpression",
                param.name
            ));
        }
        if param.name.is_empty() {
            return Err("query param name cannot be empty".to_string());
        }
    }

    Ok(())
}

// Attaches the route to the listeners the parent reference selects.
fn bind_parent_ref(
    parent_ref: &ParentRef,
    route_key: &NamespacedName,
    route_valid: bool,
    route_hostnames: &[String],
    gateway: &mut Gateway,
) -> Attachment {
    let failed = |cond: Condition| Attachment {
        failure: Some(cond),
        ..Default::default()
    };

    if !gateway.valid {
        return failed(conditions::route_no_matching_parent(
            "GatewayClass is invalid or doesn't exist",
        ));
    }
    // route-wide conditions already explain an invalid route
    if !route_valid {
        return Attachment::default();
    }

    let candidates: Vec<usize> = gateway
        .listeners
        .iter()
        .enumerate()
        .filter(|(_, l)| parent_ref.section_name.as_ref().map_or(true, |s| s == l.name()))
        .filter(|(_, l)| parent_ref.port.map_or(true, |p| p == l.source.port))
        .map(|(idx, _)| idx)
        .collect();
    if candidates.is_empty() {
        let msg = match (&parent_ref.section_name, parent_ref.port) {
            (Some(section), _) => format!("Listener {section} not found on Gateway {}", gateway.key),
            (None, Some(port)) => format!("No listener with port {port} on Gateway {}", gateway.key),
            (None, None) => format!("Gateway {} has no listeners", gateway.key),
        };
        return failed(conditions::route_no_matching_parent(msg));
    }

    let valid: Vec<usize> = candidates
        .into_iter()
        .filter(|&idx| gateway.listeners[idx].valid)
        .collect();
    if valid.is_empty() {
        return failed(conditions::route_no_matching_parent(
            "All matching listeners are invalid",
        ));
    }

    let allowed: Vec<usize> = valid
        .into_iter()
        .filter(|&idx| match gateway.listeners[idx].allowed_namespaces {
            AllowedNamespaces::All => true,
            AllowedNamespaces::Same => route_key.namespace == gateway.key.namespace,
        })
        .collect();
    if allowed.is_empty() {
        return failed(conditions::route_not_allowed_by_listeners());
    }

    let mut attachment = Attachment::default();
    for idx in allowed {
        let listener = &mut gateway.listeners[idx];
        let hostnames = intersect_hostnames(listener.source.hostname.as_deref(), route_hostnames);
        if hostnames.is_empty() {
            continue;
        }
        listener.routes.insert(route_key.clone());
        attachment
            .accepted_hostnames
            .insert(listener.name().to_string(), hostnames);
    }

    if !attachment.attached() {
        attachment.failure = Some(conditions::route_no_matching_listener_hostname());
    }
    attachment
}

// Resolves the backends of every valid rule and records the outcome on the route.
fn resolve_rule_backends(
    route: &mut Route,
    state: &ClusterState,
    backends: &mut BTreeMap<ServicePortKey, Vec<Endpoint>>,
) {
    let source = route.source.clone();
    let mut failures = vec![];
    let mut notices = vec![];

    for (rule, rule_source) in route.rules.iter_mut().zip(source.spec.rules.iter().flatten()) {
        if !rule.valid {
            continue;
        }
        let refs = rule_source.backend_refs.as_deref().unwrap_or_default();
        let resolved = resolve_backend_refs(refs, &route.meta.key.namespace, state, backends);
        rule.backend_refs = resolved.backend_refs;
        failures.extend(resolved.failures);
        notices.extend(resolved.notices);
    }

    if let Some(cond) = failures.into_iter().next().or_else(|| notices.into_iter().next()) {
        route.conditions.push(cond);
    }
}
