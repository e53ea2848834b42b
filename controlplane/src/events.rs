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

//! The event loop aggregating cluster changes into Graph rebuilds.
//!
//! Watch feeds send [`ChangeEvent`]s into one channel. The loop applies
//! upserts and deletes to its cache as they arrive and rebuilds the Graph
//! only at batch boundaries, once every watched kind has delivered its
//! initial list. A rebuild reads the whole cache, so reconciliation is
//! level-triggered: when writing status or configuration fails, the batch
//! stays dirty and the next boundary rebuilds from the latest state. There
//! is no timed retry, convergence waits for the next event.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::*;

use crate::generator::ConfigGenerator;
use crate::graph::{build_graph, Graph};
use crate::status::{build_statuses, StatusUpdater};
use crate::store::{ClusterState, Object, ObjectKey, ObjectKind};

/// Capacity of the channel between the watch feeds and the event loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum ChangeEvent {
    Upsert(Object),
    Delete(ObjectKey),
    /// The initial list of a kind has been delivered.
    Synced(ObjectKind),
    /// Marks the end of a group of related changes.
    BatchComplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Accumulating,
    Reconciling,
}

pub struct EventLoop<G, S> {
    class_name: String,
    controller_name: String,
    generator: G,
    updater: S,
    state: ClusterState,
    synced: BTreeSet<ObjectKind>,
    phase: Phase,
    dirty: bool,
    reconciled: bool,
    graph_tx: watch::Sender<Option<Arc<Graph>>>,
}

impl<G, S> EventLoop<G, S>
where
    G: ConfigGenerator,
    S: StatusUpdater,
{
    pub fn new(
        class_name: impl Into<String>,
        controller_name: impl Into<String>,
        generator: G,
        updater: S,
    ) -> Self {
        let (graph_tx, _) = watch::channel(None);
        Self {
            class_name: class_name.into(),
            controller_name: controller_name.into(),
            generator,
            updater,
            state: ClusterState::default(),
            synced: BTreeSet::new(),
            phase: Phase::Idle,
            dirty: false,
            reconciled: false,
            graph_tx,
        }
    }

    /// Returns a receiver that sees every Graph the loop builds.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Graph>>> {
        self.graph_tx.subscribe()
    }

    /// Runs until `shutdown` is raised or every event sender is dropped. A
    /// reconcile that has started always finishes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ChangeEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(
            class = %self.class_name,
            controller = %self.controller_name,
            "starting event loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("event channel closed");
                        break;
                    }
                },
            };

            if !self.handle(event) || !self.ready() {
                continue;
            }

            // fold whatever is already queued into this batch
            while let Ok(event) = rx.try_recv() {
                self.handle(event);
            }
            self.reconcile().await;
        }

        info!("event loop stopped");
    }

    // Applies the event to the cache. Returns true for batch boundaries.
    fn handle(&mut self, event: ChangeEvent) -> bool {
        if self.phase == Phase::Idle {
            self.set_phase(Phase::Accumulating);
        }

        match event {
            ChangeEvent::Upsert(obj) => {
                let key = obj.key();
                // checked against the cached copy too, before it is replaced
                let relevant = self.state.is_relevant(&key, Some(&obj));
                if self.state.upsert(obj) && relevant {
                    trace!(object = %key, "upserted");
                    self.dirty = true;
                }
                false
            }
            ChangeEvent::Delete(key) => {
                // relevance depends on the cached object, check before removing it
                let relevant = self.state.is_relevant(&key, None);
                if self.state.delete(&key) && relevant {
                    trace!(object = %key, "deleted");
                    self.dirty = true;
                }
                false
            }
            ChangeEvent::Synced(kind) => {
                if self.synced.insert(kind) {
                    debug!(%kind, "initial list delivered");
                }
                true
            }
            ChangeEvent::BatchComplete => true,
        }
    }

    fn ready(&mut self) -> bool {
        if self.synced.len() < ObjectKind::ALL.len() {
            return false;
        }
        if self.dirty || !self.reconciled {
            return true;
        }
        self.set_phase(Phase::Idle);
        false
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(from = ?self.phase, to = ?phase, "event loop phase");
            self.phase = phase;
        }
    }

    async fn reconcile(&mut self) {
        self.set_phase(Phase::Reconciling);
        let start = Instant::now();
        self.dirty = false;

        let graph = Arc::new(build_graph(&self.state, &self.class_name, &self.controller_name));
        self.reconciled = true;

        if let Err(error) = self.generator.generate(&graph).await {
            error!(%error, "failed to generate data plane configuration");
            self.dirty = true;
        }

        let statuses = build_statuses(&graph, &self.controller_name);
        if let Err(error) = self.updater.update(statuses).await {
            error!(%error, "failed to update statuses");
            self.dirty = true;
        }

        self.graph_tx.send_replace(Some(graph));
        self.set_phase(Phase::Idle);

        let duration = start.elapsed();
        info!("finished reconciling in {:?} ms", duration.as_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Statuses;
    use crate::{NamespacedName, Result};
    use serde_json::json;

    struct Noop;

    impl ConfigGenerator for Noop {
        async fn generate(&self, _graph: &Graph) -> Result<()> {
            Ok(())
        }
    }

    impl StatusUpdater for Noop {
        async fn update(&self, _statuses: Statuses) -> Result<()> {
            Ok(())
        }
    }

    fn event_loop() -> EventLoop<Noop, Noop> {
        EventLoop::new("graph", "ctrl", Noop, Noop)
    }

    fn service(name: &str) -> Object {
        Object::Service(Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": name, "namespace": "test", "resourceVersion": "1" },
                "spec": { "ports": [{ "port": 80 }] },
            }))
            .unwrap(),
        ))
    }

    fn route() -> Object {
        Object::HTTPRoute(Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "HTTPRoute",
                "metadata": { "name": "route", "namespace": "test", "resourceVersion": "1", "generation": 1 },
                "spec": { "rules": [{ "backendRefs": [{ "name": "svc", "port": 80 }] }] },
            }))
            .unwrap(),
        ))
    }

    fn gateway(resource_version: &str, generation: i64) -> Object {
        Object::Gateway(Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "Gateway",
                "metadata": {
                    "name": "gw",
                    "namespace": "test",
                    "resourceVersion": resource_version,
                    "generation": generation,
                },
                "spec": {
                    "gatewayClassName": "graph",
                    "listeners": [{ "name": "http", "port": 80, "protocol": "HTTP" }],
                },
            }))
            .unwrap(),
        ))
    }

    fn endpoint_slice(service: &str, resource_version: &str) -> Object {
        Object::EndpointSlice(Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "discovery.k8s.io/v1",
                "kind": "EndpointSlice",
                "metadata": {
                    "name": "slice",
                    "namespace": "test",
                    "resourceVersion": resource_version,
                    "labels": { "kubernetes.io/service-name": service },
                },
                "addressType": "IPv4",
                "endpoints": [],
            }))
            .unwrap(),
        ))
    }

    fn sync_all(lp: &mut EventLoop<Noop, Noop>) {
        for kind in ObjectKind::ALL {
            assert!(lp.handle(ChangeEvent::Synced(kind)));
        }
    }

    #[test]
    fn waits_for_every_kind() {
        let mut lp = event_loop();

        for kind in &ObjectKind::ALL[..5] {
            lp.handle(ChangeEvent::Synced(*kind));
            assert!(!lp.ready());
        }
        lp.handle(ChangeEvent::Synced(ObjectKind::Secret));

        // the first reconcile happens even with an empty cache
        assert!(lp.ready());
        assert_eq!(lp.phase, Phase::Accumulating);
    }

    #[test]
    fn unreferenced_services_do_not_dirty() {
        let mut lp = event_loop();
        sync_all(&mut lp);
        lp.reconciled = true;

        assert!(!lp.handle(ChangeEvent::Upsert(service("other"))));
        assert!(!lp.dirty);

        lp.handle(ChangeEvent::Upsert(route()));
        lp.dirty = false;
        lp.handle(ChangeEvent::Upsert(service("svc")));
        assert!(lp.dirty);
    }

    #[test]
    fn unchanged_objects_do_not_dirty() {
        let mut lp = event_loop();
        sync_all(&mut lp);
        lp.reconciled = true;
        lp.handle(ChangeEvent::Upsert(route()));
        lp.dirty = false;

        lp.handle(ChangeEvent::Upsert(route()));
        assert!(!lp.ready());
        assert_eq!(lp.phase, Phase::Idle);

        lp.handle(ChangeEvent::Delete(ObjectKey::new(
            ObjectKind::HTTPRoute,
            NamespacedName::new("test", "missing"),
        )));
        assert!(!lp.dirty);
    }

    #[tokio::test]
    async fn reconcile_publishes_graph() {
        let mut lp = event_loop();
        let rx = lp.subscribe();
        sync_all(&mut lp);

        lp.reconcile().await;

        assert!(rx.borrow().is_some());
        assert!(!lp.dirty);
        assert_eq!(lp.phase, Phase::Idle);
    }

    #[test]
    fn status_writes_do_not_dirty() {
        let mut lp = event_loop();
        sync_all(&mut lp);
        lp.reconciled = true;
        lp.handle(ChangeEvent::Upsert(gateway("1", 1)));
        lp.dirty = false;

        // our own status patch comes back with a new resourceVersion only
        lp.handle(ChangeEvent::Upsert(gateway("2", 1)));
        assert!(!lp.dirty);

        lp.handle(ChangeEvent::Upsert(gateway("3", 2)));
        assert!(lp.dirty);
    }

    #[test]
    fn relabelled_slice_dirties_its_old_service() {
        let mut lp = event_loop();
        sync_all(&mut lp);
        lp.reconciled = true;
        lp.handle(ChangeEvent::Upsert(route()));
        lp.handle(ChangeEvent::Upsert(endpoint_slice("svc", "1")));
        lp.dirty = false;

        lp.handle(ChangeEvent::Upsert(endpoint_slice("other", "2")));
        assert!(lp.dirty);

        // neither label is referenced any more
        lp.dirty = false;
        lp.handle(ChangeEvent::Upsert(endpoint_slice("unused", "3")));
        assert!(!lp.dirty);
    }
}
