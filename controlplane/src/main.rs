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

use clap::Parser;
use controlplane::config::Config;
use controlplane::events::{EventLoop, EVENT_CHANNEL_CAPACITY};
use controlplane::generator::FileConfigGenerator;
use controlplane::status::KubeStatusUpdater;
use controlplane::watch::{probe_crds, spawn_watchers};

use kube::Client;
use tokio::sync::{mpsc, watch};
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    probe_crds(&client).await?;

    let generator = FileConfigGenerator::new(&config.config_output);
    let updater = KubeStatusUpdater::new(
        client.clone(),
        config.controller_name.clone(),
        config.field_manager.clone(),
    );
    let event_loop = EventLoop::new(
        config.gateway_class.clone(),
        config.controller_name.clone(),
        generator,
        updater,
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchers = spawn_watchers(client, tx);
    let event_loop = tokio::spawn(event_loop.run(rx, shutdown_rx));

    info!(
        gatewayclass = %config.gateway_class,
        output = %config.config_output.display(),
        "controlplane started"
    );

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    shutdown_tx.send_replace(true);
    for watcher in &watchers {
        watcher.abort();
    }
    event_loop.await?;

    Ok(())
}
