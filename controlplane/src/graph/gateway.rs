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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use gateway_api::apis::standard::gateways::{
    Gateway as GatewayObject, GatewayListeners, GatewayListenersAllowedRoutesKinds,
    GatewayListenersAllowedRoutesNamespacesFrom, GatewayListenersTlsMode,
};
use k8s_openapi::api::core::v1::Secret;

use super::gatewayclass::GatewayClass;
use super::hostname::validate_hostname;
use crate::conditions::{self, Condition};
use crate::consts::{
    GATEWAY_API_GROUP, HTTP_ROUTE_KIND, PROTOCOL_HTTP, PROTOCOL_HTTPS, SECRET_KIND,
    TLS_SECRET_TYPE,
};
use crate::NamespacedName;

/// Namespaces from which a listener accepts routes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllowedNamespaces {
    #[default]
    Same,
    All,
}

#[derive(Clone, Debug)]
pub struct Listener {
    pub source: GatewayListeners,
    pub valid: bool,
    pub conditions: Vec<Condition>,
    pub allowed_namespaces: AllowedNamespaces,
    /// The TLS certificate Secret of an HTTPS listener.
    pub secret: Option<NamespacedName>,
    /// Routes attached to this listener.
    pub routes: BTreeSet<NamespacedName>,
}

impl Listener {
    pub fn name(&self) -> &str {
        &self.source.name
    }

    // A listener is served unless one of its conditions blocks it.
    fn set_conditions(&mut self, conds: Vec<Condition>) {
        self.valid = !conds.iter().any(Condition::is_blocking);
        self.conditions = conds;
    }
}

/// The Gateway this controller programs.
#[derive(Clone, Debug)]
pub struct Gateway {
    pub source: Arc<GatewayObject>,
    pub key: NamespacedName,
    /// Listeners in the order they are declared on the Gateway.
    pub listeners: Vec<Listener>,
    pub conditions: Vec<Condition>,
    /// False when the Gateway cannot be programmed at all, e.g. because its
    /// GatewayClass is invalid.
    pub valid: bool,
}

impl Gateway {
    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name() == name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProcessedGateways {
    pub winner: Option<Arc<GatewayObject>>,
    pub ignored: BTreeMap<NamespacedName, Arc<GatewayObject>>,
}

impl ProcessedGateways {
    /// Returns true if the key is one of the Gateways of our GatewayClass.
    pub fn contains(&self, key: &NamespacedName) -> bool {
        self.ignored.contains_key(key)
            || self
                .winner
                .as_ref()
                .is_some_and(|gw| &NamespacedName::from_object(gw.as_ref()) == key)
    }
}

/// Picks the Gateway to program among the ones using `class_name`: the
/// oldest, then the first in `namespace/name` order. The rest are ignored.
pub fn process_gateways(
    gateways: &BTreeMap<NamespacedName, Arc<GatewayObject>>,
    class_name: &str,
) -> ProcessedGateways {
    let mut candidates: Vec<(&NamespacedName, &Arc<GatewayObject>)> = gateways
        .iter()
        .filter(|(_, gw)| gw.spec.gateway_class_name == class_name)
        .collect();

    // map iteration is already ordered by key, so a stable sort on the
    // timestamp leaves ties in namespace/name order
    candidates.sort_by_key(|(_, gw)| gw.metadata.creation_timestamp.as_ref().map(|t| t.0));

    let mut processed = ProcessedGateways::default();
    let mut candidates = candidates.into_iter();
    processed.winner = candidates.next().map(|(_, gw)| gw.clone());
    processed.ignored = candidates.map(|(k, gw)| (k.clone(), gw.clone())).collect();
    processed
}

pub fn build_gateway(
    gateway: Option<&Arc<GatewayObject>>,
    class: Option<&GatewayClass>,
    secrets: &BTreeMap<NamespacedName, Arc<Secret>>,
) -> Option<Gateway> {
    let gateway = gateway?;
    let key = NamespacedName::from_object(gateway.as_ref());

    if !class.is_some_and(|c| c.valid) {
        return Some(Gateway {
            source: gateway.clone(),
            key,
            listeners: vec![],
            conditions: conditions::gateway_invalid_class("GatewayClass is invalid or doesn't exist"),
            valid: false,
        });
    }

    let mut listeners: Vec<Listener> = gateway
        .spec
        .listeners
        .iter()
        .map(|source| build_listener(source, &key.namespace, secrets))
        .collect();
    resolve_conflicts(&mut listeners);

    let conds = if listeners.iter().any(|l| l.valid) {
        conditions::gateway_accepted()
    } else {
        conditions::gateway_listeners_not_valid()
    };

    Some(Gateway {
        source: gateway.clone(),
        key,
        listeners,
        conditions: conds,
        valid: true,
    })
}

fn build_listener(
    source: &GatewayListeners,
    gateway_ns: &str,
    secrets: &BTreeMap<NamespacedName, Arc<Secret>>,
) -> Listener {
    let mut listener = Listener {
        source: source.clone(),
        valid: false,
        conditions: vec![],
        allowed_namespaces: AllowedNamespaces::Same,
        secret: None,
        routes: BTreeSet::new(),
    };

    let conds = match validate_listener(source, gateway_ns, secrets) {
        Ok((allowed_namespaces, secret)) => {
            listener.allowed_namespaces = allowed_namespaces;
            listener.secret = secret;
            conditions::listener_accepted()
        }
        Err(conds) => conds,
    };
    listener.set_conditions(conds);
    listener
}

// Checks a listener on its own. Returns the conditions of the first problem found.
fn validate_listener(
    listener: &GatewayListeners,
    gateway_ns: &str,
    secrets: &BTreeMap<NamespacedName, Arc<Secret>>,
) -> Result<(AllowedNamespaces, Option<NamespacedName>), Vec<Condition>> {
    let protocol = listener.protocol.as_str();
    if protocol != PROTOCOL_HTTP && protocol != PROTOCOL_HTTPS {
        return Err(conditions::listener_unsupported_protocol(format!(
            "Unsupported protocol: {protocol}, must be one of {PROTOCOL_HTTP} or {PROTOCOL_HTTPS}"
        )));
    }

    if !(1..=65535).contains(&listener.port) {
        return Err(conditions::listener_unsupported_value(format!(
            "Invalid port {}, must be between 1 and 65535",
            listener.port
        )));
    }

    if let Some(hostname) = &listener.hostname {
        validate_hostname(hostname).map_err(conditions::listener_unsupported_value)?;
    }

    let mut allowed_namespaces = AllowedNamespaces::Same;
    if let Some(allowed_routes) = &listener.allowed_routes {
        if let Some(kinds) = &allowed_routes.kinds {
            if let Some(msg) = check_route_kinds(kinds) {
                return Err(conditions::listener_invalid_route_kinds(msg));
            }
        }
        if let Some(from) = allowed_routes.namespaces.as_ref().and_then(|n| n.from.as_ref()) {
            allowed_namespaces = match from {
                GatewayListenersAllowedRoutesNamespacesFrom::Same => AllowedNamespaces::Same,
                GatewayListenersAllowedRoutesNamespacesFrom::All => AllowedNamespaces::All,
                GatewayListenersAllowedRoutesNamespacesFrom::Selector => {
                    return Err(conditions::listener_unsupported_value(
                        "allowedRoutes.namespaces.from: Selector is not supported",
                    ));
                }
            };
        }
    }

    let secret = if protocol == PROTOCOL_HTTPS {
        Some(validate_tls(listener, gateway_ns, secrets)?)
    } else {
        if listener.tls.is_some() {
            return Err(conditions::listener_unsupported_value(format!(
                "tls must not be set for protocol {PROTOCOL_HTTP}"
            )));
        }
        None
    };

    Ok((allowed_namespaces, secret))
}

fn check_route_kinds(kinds: &[GatewayListenersAllowedRoutesKinds]) -> Option<String> {
    for rgk in kinds {
        if rgk.kind != HTTP_ROUTE_KIND {
            return Some(format!(
                "Unsupported route kind {}; only {HTTP_ROUTE_KIND} is supported",
                rgk.kind
            ));
        }
        if let Some(group) = &rgk.group {
            if group != GATEWAY_API_GROUP {
                return Some(format!("Unsupported API group: {group}"));
            }
        }
    }
    None
}

// Resolves the certificate Secret of an HTTPS listener.
fn validate_tls(
    listener: &GatewayListeners,
    gateway_ns: &str,
    secrets: &BTreeMap<NamespacedName, Arc<Secret>>,
) -> Result<NamespacedName, Vec<Condition>> {
    let Some(tls) = &listener.tls else {
        return Err(conditions::listener_unsupported_value(format!(
            "tls must be set for protocol {PROTOCOL_HTTPS}"
        )));
    };

    if matches!(tls.mode, Some(GatewayListenersTlsMode::Passthrough)) {
        return Err(conditions::listener_unsupported_value(
            "tls.mode: Passthrough is not supported",
        ));
    }

    let refs = tls.certificate_refs.as_deref().unwrap_or_default();
    let [cert_ref] = refs else {
        return Err(conditions::listener_unsupported_value(format!(
            "tls.certificateRefs must contain exactly one reference, found {}",
            refs.len()
        )));
    };

    let group = cert_ref.group.as_deref().unwrap_or_default();
    let kind = cert_ref.kind.as_deref().unwrap_or(SECRET_KIND);
    if !(group.is_empty() || group == "core") || kind != SECRET_KIND {
        return Err(conditions::listener_invalid_certificate_ref(format!(
            "Unsupported certificate reference {group}/{kind}, must be a core {SECRET_KIND}"
        )));
    }

    let namespace = cert_ref.namespace.as_deref().unwrap_or(gateway_ns);
    if namespace != gateway_ns {
        return Err(conditions::listener_invalid_certificate_ref(
            "Certificate references to other namespaces are not supported",
        ));
    }

    let key = NamespacedName::new(namespace, cert_ref.name.clone());
    // only TLS Secrets are watched, any other type looks absent
    let Some(secret) = secrets
        .get(&key)
        .filter(|secret| secret.type_.as_deref() == Some(TLS_SECRET_TYPE))
    else {
        return Err(conditions::listener_invalid_certificate_ref(format!(
            "Secret {key} does not exist or is not of type {TLS_SECRET_TYPE}"
        )));
    };
    let data = secret.data.as_ref();
    for field in ["tls.crt", "tls.key"] {
        if !data.is_some_and(|d| d.contains_key(field)) {
            return Err(conditions::listener_invalid_certificate_ref(format!(
                "Secret {key} has no {field}"
            )));
        }
    }

    Ok(key)
}

// Marks valid listeners that cannot be served side by side as conflicted.
fn resolve_conflicts(listeners: &mut [Listener]) {
    let mut by_port: HashMap<i32, Vec<usize>> = HashMap::new();
    for (idx, listener) in listeners.iter().enumerate().filter(|(_, l)| l.valid) {
        by_port.entry(listener.source.port).or_default().push(idx);
    }

    let mut conflicts: Vec<(usize, Vec<Condition>)> = vec![];
    for indices in by_port.values() {
        let protocols: BTreeSet<&str> = indices
            .iter()
            .map(|&i| listeners[i].source.protocol.as_str())
            .collect();
        if protocols.len() > 1 {
            conflicts.extend(indices.iter().map(|&i| (i, conditions::listener_protocol_conflict())));
            continue;
        }

        let mut by_hostname: HashMap<&str, Vec<usize>> = HashMap::new();
        for &i in indices {
            let hostname = listeners[i].source.hostname.as_deref().unwrap_or_default();
            by_hostname.entry(hostname).or_default().push(i);
        }
        for same_host in by_hostname.values().filter(|v| v.len() > 1) {
            conflicts.extend(same_host.iter().map(|&i| (i, conditions::listener_hostname_conflict())));
        }
    }

    for (idx, conds) in conflicts {
        listeners[idx].set_conditions(conds);
    }
}
