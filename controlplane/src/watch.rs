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

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass, gateways::Gateway, httproutes::HTTPRoute,
};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::*;

use crate::consts::TLS_SECRET_TYPE;
use crate::events::ChangeEvent;
use crate::store::{Object, ObjectKey, ObjectKind};
use crate::{Error, NamespacedName, Result};

/// Fails if the Gateway API CRDs are not installed.
pub async fn probe_crds(client: &Client) -> Result<()> {
    let params = ListParams::default().limit(1);
    Api::<GatewayClass>::all(client.clone())
        .list(&params)
        .await
        .map_err(Error::CRDNotFoundError)?;
    Api::<Gateway>::all(client.clone())
        .list(&params)
        .await
        .map_err(Error::CRDNotFoundError)?;
    Api::<HTTPRoute>::all(client.clone())
        .list(&params)
        .await
        .map_err(Error::CRDNotFoundError)?;
    Ok(())
}

/// Starts one watcher per watched kind, all feeding `tx`.
pub fn spawn_watchers(client: Client, tx: mpsc::Sender<ChangeEvent>) -> Vec<JoinHandle<()>> {
    let config = watcher::Config::default();
    vec![
        spawn_watcher(
            Api::<GatewayClass>::all(client.clone()),
            config.clone(),
            Feed::new(ObjectKind::GatewayClass, Object::GatewayClass),
            tx.clone(),
        ),
        spawn_watcher(
            Api::<Gateway>::all(client.clone()),
            config.clone(),
            Feed::new(ObjectKind::Gateway, Object::Gateway),
            tx.clone(),
        ),
        spawn_watcher(
            Api::<HTTPRoute>::all(client.clone()),
            config.clone(),
            Feed::new(ObjectKind::HTTPRoute, Object::HTTPRoute),
            tx.clone(),
        ),
        spawn_watcher(
            Api::<Service>::all(client.clone()),
            config.clone(),
            Feed::new(ObjectKind::Service, Object::Service),
            tx.clone(),
        ),
        spawn_watcher(
            Api::<EndpointSlice>::all(client.clone()),
            config.clone(),
            Feed::new(ObjectKind::EndpointSlice, Object::EndpointSlice),
            tx.clone(),
        ),
        spawn_watcher(
            Api::<Secret>::all(client),
            config.fields(&format!("type={TLS_SECRET_TYPE}")),
            Feed::new(ObjectKind::Secret, Object::Secret),
            tx,
        ),
    ]
}

fn spawn_watcher<K>(
    api: Api<K>,
    config: watcher::Config,
    mut feed: Feed<K>,
    tx: mpsc::Sender<ChangeEvent>,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let kind = feed.kind;
        let mut stream = watcher(api, config).default_backoff().boxed();
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    warn!(%kind, %error, "watch failed, retrying");
                    continue;
                }
            };
            for change in feed.translate(event) {
                if tx.send(change).await.is_err() {
                    debug!(%kind, "event loop gone, stopping watcher");
                    return;
                }
            }
        }
    })
}

/// Translates the watch events of one kind into change events.
///
/// A watcher that restarts re-lists every object without reporting the ones
/// deleted in between, so the feed remembers which keys it has reported and
/// deletes the missing ones once the new list is complete.
struct Feed<K> {
    kind: ObjectKind,
    wrap: fn(Arc<K>) -> Object,
    known: BTreeSet<NamespacedName>,
    listing: BTreeSet<NamespacedName>,
}

impl<K: Resource> Feed<K> {
    fn new(kind: ObjectKind, wrap: fn(Arc<K>) -> Object) -> Self {
        Self {
            kind,
            wrap,
            known: BTreeSet::new(),
            listing: BTreeSet::new(),
        }
    }

    fn translate(&mut self, event: watcher::Event<K>) -> Vec<ChangeEvent> {
        match event {
            watcher::Event::Init => {
                self.listing.clear();
                vec![]
            }
            watcher::Event::InitApply(obj) => {
                self.listing.insert(NamespacedName::from_object(&obj));
                vec![ChangeEvent::Upsert((self.wrap)(Arc::new(obj)))]
            }
            watcher::Event::InitDone => {
                let listed = std::mem::take(&mut self.listing);
                let mut changes: Vec<ChangeEvent> = self
                    .known
                    .difference(&listed)
                    .map(|name| ChangeEvent::Delete(ObjectKey::new(self.kind, name.clone())))
                    .collect();
                self.known = listed;
                changes.push(ChangeEvent::Synced(self.kind));
                changes
            }
            watcher::Event::Apply(obj) => {
                self.known.insert(NamespacedName::from_object(&obj));
                vec![
                    ChangeEvent::Upsert((self.wrap)(Arc::new(obj))),
                    ChangeEvent::BatchComplete,
                ]
            }
            watcher::Event::Delete(obj) => {
                let name = NamespacedName::from_object(&obj);
                self.known.remove(&name);
                vec![
                    ChangeEvent::Delete(ObjectKey::new(self.kind, name)),
                    ChangeEvent::BatchComplete,
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(name: &str) -> Service {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": "test" },
        }))
        .unwrap()
    }

    fn describe(changes: &[ChangeEvent]) -> Vec<String> {
        changes
            .iter()
            .map(|c| match c {
                ChangeEvent::Upsert(obj) => format!("upsert {}", obj.key()),
                ChangeEvent::Delete(key) => format!("delete {key}"),
                ChangeEvent::Synced(kind) => format!("synced {kind}"),
                ChangeEvent::BatchComplete => "batch".to_string(),
            })
            .collect()
    }

    #[test]
    fn initial_list_ends_with_synced() {
        let mut feed = Feed::new(ObjectKind::Service, Object::Service);

        let mut changes = feed.translate(watcher::Event::Init);
        changes.extend(feed.translate(watcher::Event::InitApply(service("a"))));
        changes.extend(feed.translate(watcher::Event::InitDone));

        assert_eq!(
            describe(&changes),
            vec!["upsert Service test/a", "synced Service"]
        );
    }

    #[test]
    fn live_changes_close_a_batch() {
        let mut feed = Feed::new(ObjectKind::Service, Object::Service);

        let mut changes = feed.translate(watcher::Event::Apply(service("a")));
        changes.extend(feed.translate(watcher::Event::Delete(service("a"))));

        assert_eq!(
            describe(&changes),
            vec!["upsert Service test/a", "batch", "delete Service test/a", "batch"]
        );
    }

    #[test]
    fn relist_deletes_objects_gone_in_between() {
        let mut feed = Feed::new(ObjectKind::Service, Object::Service);
        feed.translate(watcher::Event::Init);
        feed.translate(watcher::Event::InitApply(service("a")));
        feed.translate(watcher::Event::InitApply(service("b")));
        feed.translate(watcher::Event::InitDone);

        feed.translate(watcher::Event::Init);
        feed.translate(watcher::Event::InitApply(service("b")));
        let changes = feed.translate(watcher::Event::InitDone);

        assert_eq!(
            describe(&changes),
            vec!["delete Service test/a", "synced Service"]
        );
    }
}
