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

//! The Graph: the validated view of the cluster this controller acts on.
//!
//! A Graph is built from a snapshot of the object cache in one pass and is
//! never modified afterwards. Every problem found while building it is
//! reported as a [`Condition`](crate::conditions::Condition) on the object it
//! concerns; building a Graph cannot fail.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass as GatewayClassObject, gateways::Gateway as GatewayObject,
};
use tracing::debug;

use crate::resolver::Endpoint;
use crate::store::ClusterState;
use crate::NamespacedName;

mod backend_refs;
mod gateway;
mod gatewayclass;
mod hostname;
mod httproute;

pub use backend_refs::BackendRef;
pub use gateway::{AllowedNamespaces, Gateway, Listener};
pub use gatewayclass::{build_gateway_class, process_gateway_classes, GatewayClass, ProcessedGatewayClasses};
pub use hostname::ANY_HOSTNAME;
pub use httproute::{Attachment, MatchRule, ParentRef, Route, RouteMeta, Rule};

/// Identifies the endpoints of one Service port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortKey {
    pub service: NamespacedName,
    pub port: i32,
}

impl ServicePortKey {
    pub fn new(service: NamespacedName, port: i32) -> Self {
        Self { service, port }
    }
}

impl fmt::Display for ServicePortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.service.namespace, self.service.name, self.port)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    /// None when the configured GatewayClass does not exist or belongs to
    /// another controller.
    pub gateway_class: Option<GatewayClass>,
    /// Other GatewayClasses that reference this controller.
    pub ignored_gateway_classes: BTreeMap<NamespacedName, Arc<GatewayClassObject>>,
    pub gateway: Option<Gateway>,
    /// Gateways of our class that lost to `gateway`.
    pub ignored_gateways: BTreeMap<NamespacedName, Arc<GatewayObject>>,
    /// Routes with a parent reference to one of our Gateways.
    pub routes: BTreeMap<NamespacedName, Route>,
    /// Endpoints of every Service port referenced by an attached route.
    pub backends: BTreeMap<ServicePortKey, Vec<Endpoint>>,
}

/// Builds the Graph for the GatewayClass `class_name` of `controller_name`.
pub fn build_graph(state: &ClusterState, class_name: &str, controller_name: &str) -> Graph {
    let (processed, exists) =
        process_gateway_classes(&state.gateway_classes, class_name, controller_name);
    let gateway_class = build_gateway_class(processed.winner.as_ref());

    let mut graph = Graph {
        gateway_class,
        ignored_gateway_classes: processed.ignored,
        ..Default::default()
    };

    if exists && processed.winner.is_none() {
        debug!(class = class_name, "GatewayClass belongs to another controller");
        return graph;
    }

    let gateways = gateway::process_gateways(&state.gateways, class_name);
    let mut gw = gateway::build_gateway(
        gateways.winner.as_ref(),
        graph.gateway_class.as_ref(),
        &state.secrets,
    );

    let mut backends = BTreeMap::new();
    graph.routes = httproute::build_routes(state, gw.as_mut(), &gateways, &mut backends);
    graph.backends = backends;
    graph.gateway = gw;
    graph.ignored_gateways = gateways.ignored;

    graph
}
