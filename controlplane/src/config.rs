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

use std::path::PathBuf;
use std::sync::OnceLock;

use clap::Parser;
use regex::Regex;

use crate::consts::{DEFAULT_CONTROLLER_NAME, DEFAULT_GATEWAY_CLASS_NAME, FIELD_MANAGER};
use crate::{Error, Result};

#[derive(Clone, Debug, Parser)]
#[clap(name = "controller", about = "Gateway API controlplane")]
pub struct Config {
    /// Controller name GatewayClasses must reference to be handled
    #[clap(long = "gateway-ctlr-name", env = "GATEWAY_CTLR_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,
    /// Name of the GatewayClass to act on
    #[clap(long = "gatewayclass", env = "GATEWAY_CLASS_NAME", default_value = DEFAULT_GATEWAY_CLASS_NAME)]
    pub gateway_class: String,
    /// Where the data plane configuration is written
    #[clap(long, env = "CONFIG_OUTPUT", default_value = "/etc/gateway/config.yaml")]
    pub config_output: PathBuf,
    /// Field manager used for status patches
    #[clap(long, env = "FIELD_MANAGER", default_value = FIELD_MANAGER)]
    pub field_manager: String,
    /// Log filter used when RUST_LOG is unset
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

// A DNS subdomain followed by a non-empty path, e.g. example.com/controller.
fn controller_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/[A-Za-z0-9/\-._~%!$&'()*+,;=:]+$")
            .expect("controller name regex should compile")
    })
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.controller_name.len() > 253 || !controller_name_regex().is_match(&self.controller_name) {
            return Err(Error::InvalidConfigError(format!(
                "controller name {:?} must be a domain prefixed path",
                self.controller_name
            )));
        }
        if self.gateway_class.is_empty() {
            return Err(Error::InvalidConfigError("gatewayclass name cannot be empty".to_string()));
        }
        if self.field_manager.is_empty() {
            return Err(Error::InvalidConfigError("field manager cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::parse_from(["controller"]);

        assert_eq!(config.controller_name, DEFAULT_CONTROLLER_NAME);
        assert_eq!(config.gateway_class, DEFAULT_GATEWAY_CLASS_NAME);
        assert_eq!(config.config_output, PathBuf::from("/etc/gateway/config.yaml"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_controller_names() {
        for name in ["controller", "Example.com/ctrl", "example.com/", "-example.com/ctrl"] {
            let config = Config::parse_from(["controller", "--gateway-ctlr-name", name]);
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfigError(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_flags() {
        let config = Config::parse_from([
            "controller",
            "--gateway-ctlr-name",
            "example.com/gateway",
            "--gatewayclass",
            "custom",
            "--config-output",
            "/tmp/out.yaml",
        ]);

        assert!(config.validate().is_ok());
        assert_eq!(config.gateway_class, "custom");
        assert_eq!(config.config_output, PathBuf::from("/tmp/out.yaml"));
    }
}
