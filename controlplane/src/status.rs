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

//! Statuses derived from a Graph and how they are written back.

use std::future::Future;

use chrono::Utc;
use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass, gateways::Gateway, httproutes::HTTPRoute,
    httproutes::{HTTPRouteParentRefs, HTTPRouteStatusParents},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::*;

use crate::conditions::{self, deduplicate, Condition};
use crate::consts::{GATEWAY_API_GROUP, HTTP_ROUTE_KIND, PROTOCOL_HTTP, PROTOCOL_HTTPS};
use crate::graph::{Graph, ParentRef, Route};
use crate::traits::HasConditions;
use crate::utils::merge_conditions;
use crate::{Error, NamespacedName, Result};

/// Status of a GatewayClass or of an ignored Gateway.
#[derive(Clone, Debug)]
pub struct ObjectStatus {
    pub key: NamespacedName,
    pub generation: Option<i64>,
    pub conditions: Vec<Condition>,
    /// Conditions currently written on the object.
    pub current: Vec<metav1::Condition>,
}

#[derive(Clone, Debug)]
pub struct ListenerStatus {
    pub name: String,
    pub attached_routes: i32,
    pub supported_kinds: Vec<&'static str>,
    pub conditions: Vec<Condition>,
    pub current: Vec<metav1::Condition>,
}

#[derive(Clone, Debug)]
pub struct GatewayStatus {
    pub object: ObjectStatus,
    pub listeners: Vec<ListenerStatus>,
}

#[derive(Clone, Debug)]
pub struct ParentStatus {
    pub parent_ref: HTTPRouteParentRefs,
    pub conditions: Vec<Condition>,
    pub current: Vec<metav1::Condition>,
}

#[derive(Clone, Debug)]
pub struct RouteStatus {
    pub key: NamespacedName,
    pub generation: Option<i64>,
    pub parents: Vec<ParentStatus>,
    /// Entries written by other controllers, kept as they are.
    pub other_parents: Vec<HTTPRouteStatusParents>,
}

/// Every status this controller owns, derived from one Graph.
#[derive(Clone, Debug, Default)]
pub struct Statuses {
    pub gateway_classes: Vec<ObjectStatus>,
    pub gateways: Vec<GatewayStatus>,
    pub routes: Vec<RouteStatus>,
}

/// Writes statuses back to the API.
pub trait StatusUpdater {
    fn update(&self, statuses: Statuses) -> impl Future<Output = Result<()>> + Send;
}

pub fn build_statuses(graph: &Graph, controller_name: &str) -> Statuses {
    let mut statuses = Statuses::default();

    if let Some(gc) = &graph.gateway_class {
        let conds = if gc.valid {
            vec![conditions::gateway_class_accepted()]
        } else {
            gc.conditions.clone()
        };
        statuses.gateway_classes.push(object_status(&*gc.source, conds));
    }
    for gc in graph.ignored_gateway_classes.values() {
        statuses
            .gateway_classes
            .push(object_status(&**gc, vec![conditions::gateway_class_conflict()]));
    }

    if let Some(gw) = &graph.gateway {
        let current = gw
            .source
            .status
            .as_ref()
            .and_then(|s| s.listeners.as_deref())
            .unwrap_or_default();
        let listeners = gw
            .listeners
            .iter()
            .map(|l| {
                let protocol = l.source.protocol.as_str();
                let supported_kinds = if protocol == PROTOCOL_HTTP || protocol == PROTOCOL_HTTPS {
                    vec![HTTP_ROUTE_KIND]
                } else {
                    vec![]
                };
                ListenerStatus {
                    name: l.name().to_string(),
                    attached_routes: i32::try_from(l.routes.len()).unwrap_or(i32::MAX),
                    supported_kinds,
                    conditions: l.conditions.clone(),
                    current: current
                        .iter()
                        .find(|c| c.name == l.name())
                        .map(|c| c.conditions.clone())
                        .unwrap_or_default(),
                }
            })
            .collect();
        statuses.gateways.push(GatewayStatus {
            object: object_status(&*gw.source, gw.conditions.clone()),
            listeners,
        });
    }
    for gw in graph.ignored_gateways.values() {
        statuses.gateways.push(GatewayStatus {
            object: object_status(&**gw, conditions::gateway_conflict()),
            listeners: vec![],
        });
    }

    for route in graph.routes.values() {
        statuses.routes.push(route_status(route, controller_name));
    }

    statuses
}

fn object_status<K: HasConditions + kube::ResourceExt>(obj: &K, conditions: Vec<Condition>) -> ObjectStatus {
    ObjectStatus {
        key: NamespacedName::from_object(obj),
        generation: obj.meta().generation,
        conditions,
        current: obj.get_conditions().to_vec(),
    }
}

fn route_status(route: &Route, controller_name: &str) -> RouteStatus {
    let source = &*route.source;
    let spec_refs = source.spec.parent_refs.as_deref().unwrap_or_default();

    let parents = route
        .parent_refs
        .iter()
        .filter_map(|parent| {
            let parent_ref = spec_refs.get(parent.idx)?;
            let mut conds = vec![conditions::route_accepted(), conditions::route_resolved_refs()];
            conds.extend(parent.attachment.failure.iter().cloned());
            conds.extend(route.conditions.iter().cloned());
            Some(ParentStatus {
                parent_ref: parent_ref.clone(),
                conditions: deduplicate(&conds),
                current: current_parent_conditions(source, parent, controller_name),
            })
        })
        .collect();

    let other_parents = source
        .status
        .iter()
        .flat_map(|s| s.parents.iter())
        .filter(|p| p.controller_name != controller_name)
        .cloned()
        .collect();

    RouteStatus {
        key: route.meta.key.clone(),
        generation: source.metadata.generation,
        parents,
        other_parents,
    }
}

// Finds the conditions this controller last wrote for the parent reference.
fn current_parent_conditions(
    route: &HTTPRoute,
    parent: &ParentRef,
    controller_name: &str,
) -> Vec<metav1::Condition> {
    let route_ns = route.metadata.namespace.as_deref().unwrap_or_default();
    route
        .status
        .iter()
        .flat_map(|s| s.parents.iter())
        .find(|p| {
            p.controller_name == controller_name
                && p.parent_ref.name == parent.gateway.name
                && p.parent_ref.namespace.as_deref().unwrap_or(route_ns) == parent.gateway.namespace
                && p.parent_ref.section_name == parent.section_name
                && p.parent_ref.port == parent.port
        })
        .and_then(|p| p.conditions.clone())
        .unwrap_or_default()
}

/// Writes statuses with server-side apply.
#[derive(Clone)]
pub struct KubeStatusUpdater {
    client: Client,
    controller_name: String,
    field_manager: String,
}

impl KubeStatusUpdater {
    pub fn new(client: Client, controller_name: impl Into<String>, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            controller_name: controller_name.into(),
            field_manager: field_manager.into(),
        }
    }

    fn params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    async fn patch_gateway_class(&self, status: &ObjectStatus, now: &metav1::Time) -> Result<()> {
        let api: Api<GatewayClass> = Api::all(self.client.clone());
        let conditions = to_k8s(&status.conditions, &status.current, status.generation, now);
        let patch = Patch::Apply(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "GatewayClass",
            "status": {
                "conditions": conditions
            }
        }));
        api.patch_status(&status.key.name, &self.params(), &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn patch_gateway(&self, status: &GatewayStatus, now: &metav1::Time) -> Result<()> {
        let key = &status.object.key;
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = Patch::Apply(gateway_patch(status, now));
        api.patch_status(&key.name, &self.params(), &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn patch_route(&self, status: &RouteStatus, now: &metav1::Time) -> Result<()> {
        let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), &status.key.namespace);
        let patch = Patch::Apply(route_patch(status, &self.controller_name, now));
        api.patch_status(&status.key.name, &self.params(), &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

fn gateway_patch(status: &GatewayStatus, now: &metav1::Time) -> serde_json::Value {
    let object = &status.object;
    let listeners: Vec<serde_json::Value> = status
        .listeners
        .iter()
        .map(|l| {
            let kinds: Vec<serde_json::Value> = l
                .supported_kinds
                .iter()
                .map(|kind| json!({ "group": GATEWAY_API_GROUP, "kind": kind }))
                .collect();
            json!({
                "name": l.name,
                "attachedRoutes": l.attached_routes,
                "supportedKinds": kinds,
                "conditions": to_k8s(&l.conditions, &l.current, object.generation, now),
            })
        })
        .collect();
    json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "Gateway",
        "status": {
            "listeners": listeners,
            "conditions": to_k8s(&object.conditions, &object.current, object.generation, now)
        }
    })
}

// The apply owns the whole parents list, so entries of other controllers
// are written back unchanged.
fn route_patch(status: &RouteStatus, controller_name: &str, now: &metav1::Time) -> serde_json::Value {
    let mut parents: Vec<serde_json::Value> = status
        .other_parents
        .iter()
        .map(|p| json!(p))
        .collect();
    parents.extend(status.parents.iter().map(|p| {
        json!({
            "parentRef": p.parent_ref,
            "controllerName": controller_name,
            "conditions": to_k8s(&p.conditions, &p.current, status.generation, now),
        })
    }));
    json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "status": {
            "parents": parents
        }
    })
}

impl StatusUpdater for KubeStatusUpdater {
    /// Patches every status, logging failures. Returns the first error.
    async fn update(&self, statuses: Statuses) -> Result<()> {
        let now = metav1::Time(Utc::now());
        let mut first_err: Option<Error> = None;
        let mut record = |kind: &str, key: &NamespacedName, res: Result<()>| {
            if let Err(e) = res {
                warn!(kind, object = %key, error = %e, "failed to update status");
                first_err.get_or_insert(e);
            }
        };

        for status in &statuses.gateway_classes {
            let res = self.patch_gateway_class(status, &now).await;
            record("GatewayClass", &status.key, res);
        }
        for status in &statuses.gateways {
            let res = self.patch_gateway(status, &now).await;
            record("Gateway", &status.object.key, res);
        }
        for status in &statuses.routes {
            let res = self.patch_route(status, &now).await;
            record("HTTPRoute", &status.key, res);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn to_k8s(
    conds: &[Condition],
    current: &[metav1::Condition],
    generation: Option<i64>,
    now: &metav1::Time,
) -> Vec<metav1::Condition> {
    let new_conds = conds.iter().map(|c| c.to_k8s(generation, now)).collect();
    merge_conditions(current, new_conds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{ConditionReason, ConditionStatus, ConditionType};
    use crate::graph::build_graph;
    use crate::store::{ClusterState, Object};
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> ClusterState {
        let mut state = ClusterState::default();
        for name in ["graph", "other"] {
            state.upsert(Object::GatewayClass(Arc::new(
                serde_json::from_value(json!({
                    "apiVersion": "gateway.networking.k8s.io/v1",
                    "kind": "GatewayClass",
                    "metadata": { "name": name, "generation": 1 },
                    "spec": { "controllerName": "ctrl" },
                }))
                .unwrap(),
            )));
        }
        for (name, day) in [("gw", 1), ("late", 2)] {
            state.upsert(Object::Gateway(Arc::new(
                serde_json::from_value(json!({
                    "apiVersion": "gateway.networking.k8s.io/v1",
                    "kind": "Gateway",
                    "metadata": {
                        "name": name,
                        "namespace": "test",
                        "generation": 3,
                        "creationTimestamp": format!("2024-01-0{day}T00:00:00Z"),
                    },
                    "spec": {
                        "gatewayClassName": "graph",
                        "listeners": [
                            { "name": "http", "port": 80, "protocol": "HTTP" },
                            { "name": "udp", "port": 53, "protocol": "UDP" },
                        ],
                    },
                    "status": {
                        "listeners": [{
                            "name": "http",
                            "attachedRoutes": 1,
                            "supportedKinds": [],
                            "conditions": [{
                                "type": "Accepted",
                                "status": "True",
                                "reason": "Accepted",
                                "message": "",
                                "lastTransitionTime": "2024-01-01T00:00:00Z",
                            }],
                        }],
                    },
                }))
                .unwrap(),
            )));
        }
        state.upsert(Object::HTTPRoute(Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "HTTPRoute",
                "metadata": { "name": "route", "namespace": "test", "generation": 2 },
                "spec": {
                    "parentRefs": [{ "name": "gw", "sectionName": "http" }, { "name": "late" }],
                    "rules": [{ "backendRefs": [{ "name": "missing", "port": 80 }] }],
                },
                "status": {
                    "parents": [{
                        "parentRef": { "name": "gw", "sectionName": "http" },
                        "controllerName": "ctrl",
                        "conditions": [{
                            "type": "Accepted",
                            "status": "True",
                            "reason": "Accepted",
                            "message": "",
                            "lastTransitionTime": "2024-01-01T00:00:00Z",
                        }],
                    }, {
                        "parentRef": { "name": "mesh", "kind": "Service", "group": "" },
                        "controllerName": "example.com/mesh",
                        "conditions": [],
                    }],
                },
            }))
            .unwrap(),
        )));
        state
    }

    fn find<'a>(conds: &'a [Condition], type_: ConditionType) -> &'a Condition {
        conds.iter().find(|c| c.type_ == type_).unwrap()
    }

    #[test]
    fn builds_statuses_for_everything_owned() {
        let graph = build_graph(&state(), "graph", "ctrl");

        let statuses = build_statuses(&graph, "ctrl");

        let classes: Vec<(&str, ConditionReason)> = statuses
            .gateway_classes
            .iter()
            .map(|s| (s.key.name.as_str(), s.conditions[0].reason))
            .collect();
        assert_eq!(
            classes,
            vec![
                ("graph", ConditionReason::Accepted),
                ("other", ConditionReason::GatewayClassConflict),
            ]
        );

        assert_eq!(statuses.gateways.len(), 2);
        let gw = &statuses.gateways[0];
        assert_eq!(gw.object.key.name, "gw");
        assert_eq!(gw.object.generation, Some(3));
        assert_eq!(gw.listeners[0].attached_routes, 1);
        assert_eq!(gw.listeners[0].supported_kinds, vec![HTTP_ROUTE_KIND]);
        assert!(gw.listeners[1].supported_kinds.is_empty());
        assert_eq!(statuses.gateways[1].object.conditions[0].reason, ConditionReason::GatewayConflict);
    }

    #[test]
    fn route_parents_carry_their_own_conditions() {
        let graph = build_graph(&state(), "graph", "ctrl");

        let statuses = build_statuses(&graph, "ctrl");

        let route = &statuses.routes[0];
        assert_eq!(route.generation, Some(2));
        assert_eq!(route.parents.len(), 2);

        let attached = &route.parents[0];
        assert_eq!(attached.parent_ref.name, "gw");
        let accepted = find(&attached.conditions, ConditionType::Accepted);
        assert_eq!(accepted.status, ConditionStatus::True);
        let resolved = find(&attached.conditions, ConditionType::ResolvedRefs);
        assert_eq!(resolved.reason, ConditionReason::BackendNotFound);
        assert_eq!(attached.current.len(), 1);

        let ignored = &route.parents[1];
        let accepted = find(&ignored.conditions, ConditionType::Accepted);
        assert_eq!(accepted.reason, ConditionReason::NoMatchingParent);
        assert!(ignored.current.is_empty());
    }

    fn conditions_of<'a>(value: &'a serde_json::Value, type_: &str) -> &'a serde_json::Value {
        value
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["type"] == type_)
            .unwrap()
    }

    #[test]
    fn unchanged_listener_conditions_keep_transition_time() {
        let graph = build_graph(&state(), "graph", "ctrl");
        let statuses = build_statuses(&graph, "ctrl");
        let now = metav1::Time(Utc::now());

        let gw = &statuses.gateways[0];
        assert_eq!(gw.listeners[0].current.len(), 1);
        assert!(gw.listeners[1].current.is_empty());

        let patch = gateway_patch(gw, &now);

        let http = &patch["status"]["listeners"][0]["conditions"];
        assert_eq!(conditions_of(http, "Accepted")["lastTransitionTime"], "2024-01-01T00:00:00Z");
        assert_eq!(conditions_of(http, "Programmed")["lastTransitionTime"], json!(now));
        assert_eq!(conditions_of(http, "Accepted")["observedGeneration"], 3);
    }

    #[test]
    fn route_patch_keeps_other_controllers_parents() {
        let graph = build_graph(&state(), "graph", "ctrl");
        let statuses = build_statuses(&graph, "ctrl");
        let now = metav1::Time(Utc::now());

        let route = &statuses.routes[0];
        assert_eq!(route.other_parents.len(), 1);

        let patch = route_patch(route, "ctrl", &now);

        let controllers: Vec<&str> = patch["status"]["parents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["controllerName"].as_str().unwrap())
            .collect();
        assert_eq!(controllers, vec!["example.com/mesh", "ctrl", "ctrl"]);
        assert_eq!(patch["status"]["parents"][0]["parentRef"]["name"], "mesh");
    }

    #[test]
    fn conversion_keeps_transition_time_of_unchanged_conditions() {
        let before = metav1::Time(Utc::now() - chrono::Duration::hours(1));
        let now = metav1::Time(Utc::now());
        let current = vec![conditions::route_accepted().to_k8s(Some(1), &before)];

        let converted = to_k8s(
            &[conditions::route_accepted(), conditions::route_resolved_refs()],
            &current,
            Some(2),
            &now,
        );

        assert_eq!(converted[0].last_transition_time, before);
        assert_eq!(converted[0].observed_generation, Some(2));
        assert_eq!(converted[1].last_transition_time, now);
    }
}
