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

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dataplane::build_configuration;
use crate::graph::Graph;
use crate::{Error, Result};

/// Turns a Graph into data plane configuration.
pub trait ConfigGenerator {
    fn generate(&self, graph: &Graph) -> impl Future<Output = Result<()>> + Send;
}

/// Writes the configuration as YAML to a file. The file is replaced
/// atomically so the data plane never reads a partial document.
#[derive(Clone, Debug)]
pub struct FileConfigGenerator {
    path: PathBuf,
}

impl FileConfigGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigGenerator for FileConfigGenerator {
    async fn generate(&self, graph: &Graph) -> Result<()> {
        let config = build_configuration(graph);
        let yaml =
            serde_yaml::to_string(&config).map_err(|e| Error::SerializationError(e.to_string()))?;

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, yaml.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(
            path = %self.path.display(),
            servers = config.http_servers.len() + config.ssl_servers.len(),
            upstreams = config.upstreams.len(),
            "wrote data plane configuration"
        );
        Ok(())
    }
}
