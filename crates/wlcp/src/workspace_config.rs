// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed workspace config (`.gigo/workspace.yaml`).
//!
//! Known keys are typed; anything else is kept in `extras` maps so configs
//! written for newer agents survive a round trip. Structurally invalid
//! configs are rejected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RegistryCacheRule;
use crate::registry_cache::rewrite_image;

/// Invalid workspace config.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceConfigError {
    #[error("malformed workspace config: {0}")]
    Malformed(#[from] serde_yaml::Error),
    #[error("workspace config is missing base_container")]
    MissingBaseContainer,
    #[error("service {0} has no image")]
    MissingServiceImage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuResources {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub class: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub mem: u32,
    #[serde(default)]
    pub disk: u32,
    #[serde(default)]
    pub gpu: GpuResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VsCodeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForward {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub disable_preview: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecCommand {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub init: bool,
    pub command: String,
}

/// One container of the `containers.services` compose section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// The `containers` compose section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainersSpec {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub version: f32,
    #[serde(default)]
    pub resources: Resources,
    pub base_container: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: ContainersSpec,
    #[serde(default)]
    pub vscode: VsCodeConfig,
    #[serde(default)]
    pub port_forward: Vec<PortForward>,
    #[serde(default)]
    pub exec: Vec<ExecCommand>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

impl WorkspaceConfig {
    /// Parse and validate a YAML config.
    pub fn parse(raw: &str) -> Result<Self, WorkspaceConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        if config.base_container.trim().is_empty() {
            return Err(WorkspaceConfigError::MissingBaseContainer);
        }
        if let Some((name, _)) = config
            .containers
            .services
            .iter()
            .find(|(_, service)| service.image.as_deref().is_none_or(str::is_empty))
        {
            return Err(WorkspaceConfigError::MissingServiceImage(name.clone()));
        }
        Ok(config)
    }

    /// The config used for every Bytes project.
    pub fn bytes_default() -> Self {
        Self {
            version: 0.1,
            resources: Resources {
                cpu: 1,
                mem: 1,
                disk: 10,
                gpu: GpuResources {
                    count: 1,
                    class: "p4".to_string(),
                },
            },
            base_container: "gigodev/gimg:bytes-base-ubuntu".to_string(),
            working_directory: "/home/gigo/codebase/".to_string(),
            environment: BTreeMap::new(),
            containers: ContainersSpec::default(),
            vscode: VsCodeConfig::default(),
            port_forward: Vec::new(),
            exec: Vec::new(),
            extras: BTreeMap::new(),
        }
    }

    /// Route the base container and every service image through the caches.
    pub fn apply_registry_caches(&mut self, caches: &[RegistryCacheRule]) {
        if caches.is_empty() {
            return;
        }
        self.base_container = rewrite_image(&self.base_container, caches);
        for service in self.containers.services.values_mut() {
            if let Some(image) = service.image.as_mut() {
                *image = rewrite_image(image, caches);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 0.1
resources:
  cpu: 2
  mem: 4
  disk: 15
base_container: gigodev/gimg:python
working_directory: /home/gigo/codebase
environment:
  PYTHONUNBUFFERED: "1"
containers:
  version: "3"
  services:
    db:
      image: postgres:16
      ports: ["5432:5432"]
vscode:
  enabled: true
  extensions: [ms-python.python]
port_forward:
  - name: web
    port: 8000
exec:
  - name: deps
    init: true
    command: pip install -r requirements.txt
future_key: kept
"#;

    #[test]
    fn test_parse_typed_fields() {
        let config = WorkspaceConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.resources.cpu, 2);
        assert_eq!(config.base_container, "gigodev/gimg:python");
        assert_eq!(config.environment["PYTHONUNBUFFERED"], "1");
        assert_eq!(
            config.containers.services["db"].image.as_deref(),
            Some("postgres:16")
        );
        assert!(config.containers.services["db"].extras.contains_key("ports"));
        assert!(config.containers.extras.contains_key("version"));
        assert!(config.vscode.enabled);
        assert_eq!(config.port_forward[0].port, 8000);
        assert!(config.exec[0].init);
        assert!(config.extras.contains_key("future_key"));
    }

    #[test]
    fn test_missing_base_container_rejected() {
        let result = WorkspaceConfig::parse("working_directory: /tmp\nbase_container: ''\n");
        assert!(matches!(result, Err(WorkspaceConfigError::MissingBaseContainer)));
    }

    #[test]
    fn test_service_without_image_rejected() {
        let raw = "base_container: x\ncontainers:\n  services:\n    db:\n      ports: []\n";
        assert!(matches!(
            WorkspaceConfig::parse(raw),
            Err(WorkspaceConfigError::MissingServiceImage(name)) if name == "db"
        ));
    }

    #[test]
    fn test_structurally_invalid_rejected() {
        let raw = "base_container: x\nport_forward: nope\n";
        assert!(matches!(
            WorkspaceConfig::parse(raw),
            Err(WorkspaceConfigError::Malformed(_))
        ));
    }

    #[test]
    fn test_bytes_default() {
        let config = WorkspaceConfig::bytes_default();
        assert_eq!(config.base_container, "gigodev/gimg:bytes-base-ubuntu");
        assert_eq!(config.working_directory, "/home/gigo/codebase/");
        assert_eq!(config.resources.disk, 10);
        assert_eq!(config.resources.gpu.class, "p4");
    }

    #[test]
    fn test_registry_caches_applied_to_services() {
        let mut config = WorkspaceConfig::parse(SAMPLE).unwrap();
        config.apply_registry_caches(&[RegistryCacheRule {
            source: "docker.io".to_string(),
            cache: "mirror.local".to_string(),
        }]);
        assert_eq!(config.base_container, "mirror.local/gigodev/gimg:python");
        assert_eq!(
            config.containers.services["db"].image.as_deref(),
            Some("mirror.local/postgres:16")
        );
    }
}
