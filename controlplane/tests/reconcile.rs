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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use controlplane::events::{ChangeEvent, EventLoop};
use controlplane::generator::ConfigGenerator;
use controlplane::graph::Graph;
use controlplane::status::{StatusUpdater, Statuses};
use controlplane::store::{Object, ObjectKey, ObjectKind};
use controlplane::{Error, NamespacedName, Result};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Generator {
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl ConfigGenerator for Generator {
    async fn generate(&self, _graph: &Graph) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::IoError(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Updater {
    updates: Arc<Mutex<Vec<Statuses>>>,
}

impl StatusUpdater for Updater {
    async fn update(&self, statuses: Statuses) -> Result<()> {
        self.updates.lock().unwrap().push(statuses);
        Ok(())
    }
}

struct Harness {
    tx: mpsc::Sender<ChangeEvent>,
    shutdown: watch::Sender<bool>,
    graphs: watch::Receiver<Option<Arc<Graph>>>,
    generator: Generator,
    updater: Updater,
    handle: JoinHandle<()>,
}

impl Harness {
    fn start(generator: Generator) -> Self {
        let updater = Updater::default();
        let event_loop = EventLoop::new("graph", "ctrl", generator.clone(), updater.clone());
        let graphs = event_loop.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(event_loop.run(rx, shutdown_rx));
        Harness {
            tx,
            shutdown,
            graphs,
            generator,
            updater,
            handle,
        }
    }

    async fn send(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.tx.send(event).await.unwrap();
        }
    }

    async fn next_graph(&mut self) -> Arc<Graph> {
        timeout(WAIT, self.graphs.changed()).await.unwrap().unwrap();
        self.graphs.borrow_and_update().clone().unwrap()
    }

    // Closes the channel and waits for the loop to drain it.
    async fn finish(self) -> (Generator, Updater) {
        drop(self.tx);
        timeout(WAIT, self.handle).await.unwrap().unwrap();
        (self.generator, self.updater)
    }

    fn rebuilds(&self) -> usize {
        self.generator.calls.load(Ordering::SeqCst)
    }
}

fn upsert(value: serde_json::Value) -> ChangeEvent {
    let object = match value["kind"].as_str() {
        Some("GatewayClass") => Object::GatewayClass(Arc::new(serde_json::from_value(value).unwrap())),
        Some("Gateway") => Object::Gateway(Arc::new(serde_json::from_value(value).unwrap())),
        Some("HTTPRoute") => Object::HTTPRoute(Arc::new(serde_json::from_value(value).unwrap())),
        Some("Service") => Object::Service(Arc::new(serde_json::from_value(value).unwrap())),
        Some("EndpointSlice") => Object::EndpointSlice(Arc::new(serde_json::from_value(value).unwrap())),
        other => panic!("unexpected kind {other:?}"),
    };
    ChangeEvent::Upsert(object)
}

fn gateway_class() -> ChangeEvent {
    upsert(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "GatewayClass",
        "metadata": { "name": "graph", "resourceVersion": "1", "generation": 1 },
        "spec": { "controllerName": "ctrl" },
    }))
}

fn gateway() -> ChangeEvent {
    upsert(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "Gateway",
        "metadata": { "name": "gw", "namespace": "test", "resourceVersion": "1", "generation": 1 },
        "spec": {
            "gatewayClassName": "graph",
            "listeners": [{ "name": "http", "port": 80, "protocol": "HTTP" }],
        },
    }))
}

fn route(name: &str, version: u32) -> ChangeEvent {
    upsert(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": {
            "name": name,
            "namespace": "test",
            "resourceVersion": version.to_string(),
            "generation": version,
        },
        "spec": {
            "parentRefs": [{ "name": "gw" }],
            "rules": [{ "backendRefs": [{ "name": "svc", "port": 80 }] }],
        },
    }))
}

fn service() -> ChangeEvent {
    upsert(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "svc", "namespace": "test", "resourceVersion": "1" },
        "spec": { "ports": [{ "port": 80, "targetPort": 8080 }] },
    }))
}

fn endpoint_slice(address: &str, version: u32) -> ChangeEvent {
    upsert(json!({
        "apiVersion": "discovery.k8s.io/v1",
        "kind": "EndpointSlice",
        "metadata": {
            "name": "svc-1",
            "namespace": "test",
            "resourceVersion": version.to_string(),
            "labels": { "kubernetes.io/service-name": "svc" },
        },
        "addressType": "IPv4",
        "endpoints": [{ "addresses": [address], "conditions": { "ready": true } }],
        "ports": [{ "port": 8080 }],
    }))
}

fn initial_list() -> Vec<ChangeEvent> {
    let mut events = vec![gateway_class(), gateway(), route("route", 1), service(), endpoint_slice("10.0.0.1", 1)];
    events.extend(ObjectKind::ALL.into_iter().map(ChangeEvent::Synced));
    events
}

#[tokio::test]
async fn waits_for_every_kind_before_reconciling() {
    let harness = Harness::start(Generator::default());
    let mut events = initial_list();
    // drop the Secret marker
    events.pop();
    events.push(ChangeEvent::BatchComplete);
    harness.send(events).await;

    let graphs = harness.graphs.clone();
    let (generator, updater) = harness.finish().await;

    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    assert!(updater.updates.lock().unwrap().is_empty());
    assert!(graphs.borrow().is_none());
}

#[tokio::test]
async fn burst_of_changes_rebuilds_once() {
    let mut harness = Harness::start(Generator::default());
    harness.send(initial_list()).await;
    harness.next_graph().await;
    assert_eq!(harness.rebuilds(), 1);

    let mut burst: Vec<ChangeEvent> = (2..12).map(|v| endpoint_slice(&format!("10.0.0.{v}"), v)).collect();
    burst.push(ChangeEvent::BatchComplete);
    harness.send(burst).await;
    let graph = harness.next_graph().await;

    assert_eq!(harness.rebuilds(), 2);
    let endpoints: Vec<&str> = graph.backends.values().flatten().map(|e| e.address.as_str()).collect();
    assert_eq!(endpoints, vec!["10.0.0.11"]);

    let (generator, _) = harness.finish().await;
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unchanged_batches_do_not_rebuild() {
    let mut harness = Harness::start(Generator::default());
    harness.send(initial_list()).await;
    harness.next_graph().await;

    // same generation and an unreferenced service
    harness
        .send(vec![
            route("route", 1),
            upsert(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": "unrelated", "namespace": "test", "resourceVersion": "1" },
            })),
            ChangeEvent::BatchComplete,
        ])
        .await;

    let (generator, _) = harness.finish().await;
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn collaborator_failure_is_retried_on_next_batch() {
    let generator = Generator::default();
    generator.failures_left.store(1, Ordering::SeqCst);
    let mut harness = Harness::start(generator);

    harness.send(initial_list()).await;
    harness.next_graph().await;
    assert_eq!(harness.rebuilds(), 1);
    // statuses are still written when configuration fails
    assert_eq!(harness.updater.updates.lock().unwrap().len(), 1);

    // nothing changed, but the failed batch is still dirty
    harness.send(vec![ChangeEvent::BatchComplete]).await;
    harness.next_graph().await;
    assert_eq!(harness.rebuilds(), 2);

    harness.send(vec![ChangeEvent::BatchComplete]).await;
    let (generator, updater) = harness.finish().await;
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(updater.updates.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn shutdown_stops_the_loop() {
    let mut harness = Harness::start(Generator::default());
    harness.send(initial_list()).await;
    harness.next_graph().await;

    harness.shutdown.send_replace(true);

    timeout(WAIT, &mut harness.handle).await.unwrap().unwrap();
    assert!(harness.tx.is_closed());
}

#[tokio::test]
async fn final_graph_reflects_all_events() {
    let mut harness = Harness::start(Generator::default());
    harness.send(initial_list()).await;
    let graph = harness.next_graph().await;
    assert_eq!(graph.routes.len(), 1);

    harness
        .send(vec![
            route("second", 1),
            ChangeEvent::Delete(ObjectKey::new(ObjectKind::HTTPRoute, NamespacedName::new("test", "route"))),
            ChangeEvent::BatchComplete,
        ])
        .await;
    let graph = harness.next_graph().await;

    let routes: Vec<&str> = graph.routes.keys().map(|k| k.name.as_str()).collect();
    assert_eq!(routes, vec!["second"]);
    let gateway = graph.gateway.as_ref().unwrap();
    assert_eq!(gateway.listeners[0].routes.len(), 1);

    let updater = harness.updater.clone();
    harness.finish().await;
    let updates = updater.updates.lock().unwrap();
    let last = updates.last().unwrap();
    assert_eq!(last.gateways[0].listeners[0].attached_routes, 1);
    assert_eq!(last.routes.len(), 1);
}

#[tokio::test]
async fn status_only_updates_do_not_rebuild() {
    let mut harness = Harness::start(Generator::default());
    harness.send(initial_list()).await;
    harness.next_graph().await;

    // what the watch delivers after our own status patch
    harness
        .send(vec![
            upsert(json!({
                "apiVersion": "gateway.networking.k8s.io/v1",
                "kind": "Gateway",
                "metadata": { "name": "gw", "namespace": "test", "resourceVersion": "7", "generation": 1 },
                "spec": {
                    "gatewayClassName": "graph",
                    "listeners": [{ "name": "http", "port": 80, "protocol": "HTTP" }],
                },
                "status": {
                    "conditions": [{
                        "type": "Accepted",
                        "status": "True",
                        "reason": "Accepted",
                        "message": "",
                        "observedGeneration": 1,
                        "lastTransitionTime": "2024-01-01T00:00:00Z",
                    }],
                },
            })),
            ChangeEvent::BatchComplete,
        ])
        .await;

    let (generator, updater) = harness.finish().await;
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(updater.updates.lock().unwrap().len(), 1);
}
