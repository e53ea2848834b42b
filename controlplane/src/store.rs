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

//! The cache of watched objects.
//!
//! The cache is owned and mutated by the event loop only. Graph builds borrow
//! it immutably for their whole duration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass, gateways::Gateway, httproutes::HTTPRoute,
};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;

use crate::consts::{SERVICE_KIND, SERVICE_NAME_LABEL};
use crate::NamespacedName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    GatewayClass,
    Gateway,
    HTTPRoute,
    Service,
    EndpointSlice,
    Secret,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::GatewayClass,
        ObjectKind::Gateway,
        ObjectKind::HTTPRoute,
        ObjectKind::Service,
        ObjectKind::EndpointSlice,
        ObjectKind::Secret,
    ];
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A watched object of any kind.
#[derive(Clone, Debug)]
pub enum Object {
    GatewayClass(Arc<GatewayClass>),
    Gateway(Arc<Gateway>),
    HTTPRoute(Arc<HTTPRoute>),
    Service(Arc<Service>),
    EndpointSlice(Arc<EndpointSlice>),
    Secret(Arc<Secret>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub name: NamespacedName,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, name: NamespacedName) -> Self {
        Self { kind, name }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::GatewayClass(_) => ObjectKind::GatewayClass,
            Object::Gateway(_) => ObjectKind::Gateway,
            Object::HTTPRoute(_) => ObjectKind::HTTPRoute,
            Object::Service(_) => ObjectKind::Service,
            Object::EndpointSlice(_) => ObjectKind::EndpointSlice,
            Object::Secret(_) => ObjectKind::Secret,
        }
    }

    pub fn key(&self) -> ObjectKey {
        let name = match self {
            Object::GatewayClass(o) => NamespacedName::from_object(o.as_ref()),
            Object::Gateway(o) => NamespacedName::from_object(o.as_ref()),
            Object::HTTPRoute(o) => NamespacedName::from_object(o.as_ref()),
            Object::Service(o) => NamespacedName::from_object(o.as_ref()),
            Object::EndpointSlice(o) => NamespacedName::from_object(o.as_ref()),
            Object::Secret(o) => NamespacedName::from_object(o.as_ref()),
        };
        ObjectKey::new(self.kind(), name)
    }
}

/// Snapshot of every watched object, keyed by namespaced name.
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    pub gateway_classes: BTreeMap<NamespacedName, Arc<GatewayClass>>,
    pub gateways: BTreeMap<NamespacedName, Arc<Gateway>>,
    pub http_routes: BTreeMap<NamespacedName, Arc<HTTPRoute>>,
    pub services: BTreeMap<NamespacedName, Arc<Service>>,
    pub endpoint_slices: BTreeMap<NamespacedName, Arc<EndpointSlice>>,
    pub secrets: BTreeMap<NamespacedName, Arc<Secret>>,
}

// Stores obj and reports whether `changed` considers it different from the
// cached copy.
fn upsert_into<K: ResourceExt>(
    map: &mut BTreeMap<NamespacedName, Arc<K>>,
    key: NamespacedName,
    obj: Arc<K>,
    changed: fn(&K, &K) -> bool,
) -> bool {
    let changed = map.get(&key).map_or(true, |existing| changed(existing, &obj));
    map.insert(key, obj);
    changed
}

fn resource_version_changed<K: ResourceExt>(old: &K, new: &K) -> bool {
    let current = old.resource_version();
    current.is_none() || current != new.resource_version()
}

// Status writes do not bump the generation, so our own patches coming back
// through the watch are not changes.
fn generation_changed<K: ResourceExt>(old: &K, new: &K) -> bool {
    let current = old.meta().generation;
    current.is_none() || current != new.meta().generation || old.uid() != new.uid()
}

impl ClusterState {
    /// Stores the object and returns true if it changed in a way that can
    /// affect the graph. Gateway API objects change with their generation,
    /// other kinds with their resource version.
    pub fn upsert(&mut self, obj: Object) -> bool {
        let key = obj.key().name;
        match obj {
            Object::GatewayClass(o) => {
                upsert_into(&mut self.gateway_classes, key, o, generation_changed)
            }
            Object::Gateway(o) => upsert_into(&mut self.gateways, key, o, generation_changed),
            Object::HTTPRoute(o) => upsert_into(&mut self.http_routes, key, o, generation_changed),
            Object::Service(o) => upsert_into(&mut self.services, key, o, resource_version_changed),
            Object::EndpointSlice(o) => {
                upsert_into(&mut self.endpoint_slices, key, o, resource_version_changed)
            }
            Object::Secret(o) => upsert_into(&mut self.secrets, key, o, resource_version_changed),
        }
    }

    /// Removes the object and returns true if it was cached.
    pub fn delete(&mut self, key: &ObjectKey) -> bool {
        let name = &key.name;
        match key.kind {
            ObjectKind::GatewayClass => self.gateway_classes.remove(name).is_some(),
            ObjectKind::Gateway => self.gateways.remove(name).is_some(),
            ObjectKind::HTTPRoute => self.http_routes.remove(name).is_some(),
            ObjectKind::Service => self.services.remove(name).is_some(),
            ObjectKind::EndpointSlice => self.endpoint_slices.remove(name).is_some(),
            ObjectKind::Secret => self.secrets.remove(name).is_some(),
        }
    }

    /// Returns the EndpointSlices owned by the given Service.
    pub fn endpoint_slices_for(&self, svc: &NamespacedName) -> Vec<&EndpointSlice> {
        self.endpoint_slices
            .iter()
            .filter(|(key, slice)| {
                key.namespace == svc.namespace
                    && slice.labels().get(SERVICE_NAME_LABEL) == Some(&svc.name)
            })
            .map(|(_, slice)| slice.as_ref())
            .collect()
    }

    /// Returns true if a change to the given object can affect the graph.
    ///
    /// Gateway API objects always can. Services, EndpointSlices and Secrets
    /// only matter while something references them.
    pub fn is_relevant(&self, key: &ObjectKey, obj: Option<&Object>) -> bool {
        match key.kind {
            ObjectKind::GatewayClass | ObjectKind::Gateway | ObjectKind::HTTPRoute => true,
            ObjectKind::Service => self.references_service(&key.name),
            ObjectKind::EndpointSlice => {
                let incoming = match obj {
                    Some(Object::EndpointSlice(slice)) => slice.labels().get(SERVICE_NAME_LABEL),
                    _ => None,
                };
                let cached = self
                    .endpoint_slices
                    .get(&key.name)
                    .and_then(|slice| slice.labels().get(SERVICE_NAME_LABEL));
                // a relabelled slice matters to both its old and its new service
                [incoming, cached].into_iter().flatten().any(|name| {
                    self.references_service(&NamespacedName::new(key.name.namespace.clone(), name.clone()))
                })
            }
            ObjectKind::Secret => self.references_secret(&key.name),
        }
    }

    fn references_service(&self, svc: &NamespacedName) -> bool {
        self.http_routes.iter().any(|(route_key, route)| {
            route
                .spec
                .rules
                .iter()
                .flatten()
                .flat_map(|rule| rule.backend_refs.iter().flatten())
                .any(|backend_ref| {
                    backend_ref.kind.as_deref().unwrap_or(SERVICE_KIND) == SERVICE_KIND
                        && backend_ref.name == svc.name
                        && backend_ref.namespace.as_deref().unwrap_or(&route_key.namespace)
                            == svc.namespace
                })
        })
    }

    fn references_secret(&self, secret: &NamespacedName) -> bool {
        self.gateways.iter().any(|(gw_key, gw)| {
            gw.spec
                .listeners
                .iter()
                .filter_map(|l| l.tls.as_ref())
                .flat_map(|tls| tls.certificate_refs.iter().flatten())
                .any(|cert_ref| {
                    cert_ref.name == secret.name
                        && cert_ref.namespace.as_deref().unwrap_or(&gw_key.namespace)
                            == secret.namespace
                })
        })
    }
}
