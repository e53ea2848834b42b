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

use gateway_api::apis::standard::httproutes::HTTPRouteRulesBackendRefs;
use tracing::debug;

use super::ServicePortKey;
use crate::conditions::{self, Condition};
use crate::consts::SERVICE_KIND;
use crate::resolver::{self, Endpoint};
use crate::store::ClusterState;
use crate::{Error, NamespacedName};

const DEFAULT_WEIGHT: i32 = 1;

/// A rule's backend reference after resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendRef {
    pub service: NamespacedName,
    pub port: i32,
    pub weight: i32,
    /// Invalid backends stay in the rule so that their share of the traffic
    /// is answered with an error instead of going to the other backends.
    pub valid: bool,
}

impl BackendRef {
    pub fn key(&self) -> ServicePortKey {
        ServicePortKey::new(self.service.clone(), self.port)
    }
}

/// The outcome of resolving the backend references of one rule.
#[derive(Debug, Default)]
pub struct ResolvedBackends {
    pub backend_refs: Vec<BackendRef>,
    /// Failed references, in order.
    pub failures: Vec<Condition>,
    /// Informational conditions, such as the target port fallback.
    pub notices: Vec<Condition>,
}

/// Resolves the backend references of a rule of a route in `route_ns`.
/// Endpoints of resolved Service ports are added to `backends`.
pub fn resolve_backend_refs(
    refs: &[HTTPRouteRulesBackendRefs],
    route_ns: &str,
    state: &ClusterState,
    backends: &mut BTreeMap<ServicePortKey, Vec<Endpoint>>,
) -> ResolvedBackends {
    let mut resolved = ResolvedBackends::default();

    for backend_ref in refs {
        let namespace = backend_ref.namespace.as_deref().unwrap_or(route_ns);
        let mut backend = BackendRef {
            service: NamespacedName::new(namespace, backend_ref.name.clone()),
            port: backend_ref.port.unwrap_or_default(),
            weight: backend_ref.weight.unwrap_or(DEFAULT_WEIGHT),
            valid: false,
        };

        match resolve_backend_ref(backend_ref, &backend, route_ns, state, backends) {
            Ok(fallback) => {
                backend.valid = true;
                if fallback {
                    resolved.notices.push(conditions::route_target_port_fallback(format!(
                        "Service {} uses a named target port; endpoints use the service port {}",
                        backend.service, backend.port
                    )));
                }
            }
            Err(cond) => {
                debug!(service = %backend.service, reason = %cond.reason, "invalid backend reference");
                resolved.failures.push(cond);
            }
        }
        resolved.backend_refs.push(backend);
    }

    resolved
}

// Validates a single reference and stores its endpoints. Returns whether the
// named target port fallback was used.
fn resolve_backend_ref(
    backend_ref: &HTTPRouteRulesBackendRefs,
    backend: &BackendRef,
    route_ns: &str,
    state: &ClusterState,
    backends: &mut BTreeMap<ServicePortKey, Vec<Endpoint>>,
) -> Result<bool, Condition> {
    let group = backend_ref.group.as_deref().unwrap_or_default();
    let kind = backend_ref.kind.as_deref().unwrap_or(SERVICE_KIND);
    if !(group.is_empty() || group == "core") || kind != SERVICE_KIND {
        return Err(conditions::route_invalid_kind(format!(
            "Unsupported backend kind {kind} in group {group:?}, must be a core {SERVICE_KIND}"
        )));
    }

    if backend.service.namespace != route_ns {
        return Err(conditions::route_backend_unsupported_value(format!(
            "Backend {} is in another namespace, cross-namespace references are not supported",
            backend.service
        )));
    }

    if backend_ref.port.is_none() {
        return Err(conditions::route_backend_unsupported_value(format!(
            "Backend {} must specify a port",
            backend.service
        )));
    }

    let Some(svc) = state.services.get(&backend.service) else {
        return Err(conditions::route_backend_not_found(format!(
            "Service {} not found",
            backend.service
        )));
    };

    let slices = state.endpoint_slices_for(&backend.service);
    match resolver::resolve(svc, backend.port, &slices) {
        Ok(resolution) => {
            backends.insert(backend.key(), resolution.endpoints);
            Ok(resolution.target_port_fallback)
        }
        Err(Error::NotFound(msg)) => Err(conditions::route_backend_not_found(msg)),
        Err(e) => Err(conditions::route_backend_not_found(e.to_string())),
    }
}
