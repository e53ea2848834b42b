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

//! Resolution of a Service port into the concrete endpoints backing it.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::discovery::v1::{Endpoint as SliceEndpoint, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde::Serialize;
use tracing::debug;

use crate::consts::ADDRESS_TYPE_IPV4;
use crate::{Error, Result};

/// A routable backend: an IPv4 address and a port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub address: String,
    pub port: i32,
}

/// The endpoints of one Service port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Deduplicated endpoints, sorted by address then port.
    pub endpoints: Vec<Endpoint>,
    /// Set when an endpoint port had to be derived from the Service because the
    /// EndpointSlice did not carry one and the target port is named. The
    /// derived port is the Service port, which may differ from the container port.
    pub target_port_fallback: bool,
}

/// Resolves the endpoints of `port` on `svc` from the Service's EndpointSlices.
pub fn resolve_endpoints(
    svc: &Service,
    port: i32,
    endpoint_slices: &[&EndpointSlice],
) -> Result<Vec<Endpoint>> {
    resolve(svc, port, endpoint_slices).map(|r| r.endpoints)
}

/// Same as [`resolve_endpoints`] but also reports whether the named target
/// port fallback was used.
pub fn resolve(svc: &Service, port: i32, endpoint_slices: &[&EndpointSlice]) -> Result<Resolution> {
    let svc_port = get_service_port(svc, port)?;

    let filtered = filter_endpoint_slices(endpoint_slices, svc_port);
    if filtered.is_empty() {
        debug!(
            service = %svc.name_any(),
            port,
            "no usable EndpointSlices for service port"
        );
        return Ok(Resolution::default());
    }

    let mut target_port_fallback = false;
    let mut endpoint_set: HashSet<Endpoint> =
        HashSet::with_capacity(calculate_ready_endpoints(&filtered));

    for slice in filtered {
        let ports = slice.ports.as_deref().unwrap_or_default();
        let endpoint_port = find_port(ports, svc_port);
        if uses_default_port(ports, svc_port)
            && matches!(svc_port.target_port, Some(IntOrString::String(_)))
        {
            target_port_fallback = true;
        }

        for endpoint in slice.endpoints.iter().filter(|e| endpoint_ready(e)) {
            for address in &endpoint.addresses {
                if address.parse::<Ipv4Addr>().is_err() {
                    debug!(address, "skipping invalid IPv4 endpoint address");
                    continue;
                }
                endpoint_set.insert(Endpoint {
                    address: address.clone(),
                    port: endpoint_port,
                });
            }
        }
    }

    let mut endpoints: Vec<Endpoint> = endpoint_set.into_iter().collect();
    endpoints.sort();

    Ok(Resolution {
        endpoints,
        target_port_fallback,
    })
}

// Returns the ServicePort with the given port number.
fn get_service_port(svc: &Service, port: i32) -> Result<&ServicePort> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == port))
        .ok_or_else(|| {
            Error::NotFound(format!(
                "no matching port for Service {} and port {}",
                svc.name_any(),
                port
            ))
        })
}

fn filter_endpoint_slices<'a>(
    endpoint_slices: &[&'a EndpointSlice],
    svc_port: &ServicePort,
) -> Vec<&'a EndpointSlice> {
    endpoint_slices
        .iter()
        .copied()
        .filter(|slice| !ignore_endpoint_slice(slice, svc_port))
        .collect()
}

fn ignore_endpoint_slice(slice: &EndpointSlice, svc_port: &ServicePort) -> bool {
    if slice.address_type != ADDRESS_TYPE_IPV4 {
        return true;
    }

    // A slice without a matching port cannot serve this service port.
    find_port(slice.ports.as_deref().unwrap_or_default(), svc_port) == 0
}

// Mirrors find_port: true when the port is taken from get_default_port.
fn uses_default_port(ports: &[EndpointPort], svc_port: &ServicePort) -> bool {
    let port_name = svc_port.name.as_deref().unwrap_or_default();
    for p in ports {
        if p.port.is_none() {
            return true;
        }
        if p.name.as_deref() == Some(port_name) {
            return false;
        }
    }
    false
}

fn endpoint_ready(endpoint: &SliceEndpoint) -> bool {
    endpoint
        .conditions
        .as_ref()
        .and_then(|c| c.ready)
        .unwrap_or(false)
}

// Counts the addresses of ready endpoints; used to size the endpoint set.
fn calculate_ready_endpoints(slices: &[&EndpointSlice]) -> usize {
    slices
        .iter()
        .flat_map(|slice| slice.endpoints.iter())
        .filter(|e| endpoint_ready(e))
        .map(|e| e.addresses.len())
        .sum()
}

// Finds the endpoint port matching the service port by name. A port entry
// without a port number matches every service port and resolves to the
// service's default port. Returns 0 when nothing matches.
fn find_port(ports: &[EndpointPort], svc_port: &ServicePort) -> i32 {
    let port_name = svc_port.name.as_deref().unwrap_or_default();

    for p in ports {
        let Some(port) = p.port else {
            return get_default_port(svc_port);
        };

        if p.name.as_deref() == Some(port_name) {
            return port;
        }
    }

    0
}

// A named target port cannot be resolved without the Pod spec, so it falls
// back to the service port.
fn get_default_port(svc_port: &ServicePort) -> i32 {
    match svc_port.target_port {
        Some(IntOrString::Int(port)) if port != 0 => port,
        _ => svc_port.port,
    }
}
