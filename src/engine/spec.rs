//! Container creation specification.
//!
//! A fluent builder translating the sandbox's notion of a container (image,
//! labels, validated binds, hardening profile) into the bollard create
//! payload. Volume binds are validated by the security gate before they
//! reach this type.

use std::collections::HashMap;

use bollard::models::DeviceRequest;
use bollard::service::HostConfig;

use crate::engine::{LANGUAGE_LABEL, MANAGED_LABEL, ROLE_LABEL};
use crate::security::HardeningProfile;

/// Specification for a sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    image: String,
    cmd: Vec<String>,
    env: Vec<String>,
    binds: Vec<String>,
    network_mode: String,
    working_dir: String,
    labels: HashMap<String, String>,
    gpu: bool,
    hardening: HardeningProfile,
}

impl ContainerSpec {
    /// Start a spec for the given image with the standard long-lived
    /// command and isolated network.
    pub fn new(image: impl Into<String>, hardening: HardeningProfile) -> Self {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        Self {
            image: image.into(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            env: Vec::new(),
            binds: Vec::new(),
            network_mode: "none".to_string(),
            working_dir: "/workspace".to_string(),
            labels,
            gpu: false,
            hardening,
        }
    }

    /// Tag the container with its role (`pool` or `session`).
    pub fn role(mut self, role: &str) -> Self {
        self.labels.insert(ROLE_LABEL.to_string(), role.to_string());
        self
    }

    /// Tag the container with its language.
    pub fn language_label(mut self, language: &str) -> Self {
        self.labels
            .insert(LANGUAGE_LABEL.to_string(), language.to_string());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in envs {
            self.env.push(format!("{}={}", k.into(), v.into()));
        }
        self
    }

    /// Add a pre-validated volume bind (`host:container[:mode]`).
    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    /// Override the network mode. The default is `none`.
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    /// Request GPU pass-through via the engine's device-request mechanism.
    pub fn gpu(mut self, enable: bool) -> Self {
        self.gpu = enable;
        self
    }

    /// Override memory cap from the hardening default, bytes.
    pub fn memory_bytes(mut self, bytes: i64) -> Self {
        self.hardening.memory_bytes = bytes;
        self
    }

    /// Override CPU quota from the hardening default.
    pub fn cpu_quota(mut self, quota: i64) -> Self {
        self.hardening.cpu_quota = quota;
        self
    }

    /// Image this spec will run.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Render the bollard create payload.
    pub(crate) fn to_bollard(&self) -> bollard::container::Config<String> {
        let hardening = &self.hardening;

        let ulimits = hardening
            .ulimits
            .iter()
            .map(|u| bollard::models::ResourcesUlimits {
                name: Some(u.name.clone()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect::<Vec<_>>();

        let tmpfs = if hardening.tmpfs_mounts.is_empty() {
            None
        } else {
            Some(
                hardening
                    .tmpfs_mounts
                    .iter()
                    .cloned()
                    .collect::<HashMap<String, String>>(),
            )
        };

        let device_requests = self.gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            binds: (!self.binds.is_empty()).then(|| self.binds.clone()),
            memory: Some(hardening.memory_bytes),
            memory_swap: Some(hardening.memory_bytes),
            cpu_quota: Some(hardening.cpu_quota),
            cpu_period: Some(100_000),
            pids_limit: Some(hardening.pids_limit),
            network_mode: Some(self.network_mode.clone()),
            cap_drop: Some(hardening.cap_drop.clone()),
            cap_add: (!hardening.cap_add.is_empty()).then(|| hardening.cap_add.clone()),
            security_opt: Some(hardening.security_opts()),
            readonly_rootfs: Some(hardening.readonly_rootfs),
            tmpfs,
            ulimits: (!ulimits.is_empty()).then_some(ulimits),
            device_requests,
            ..Default::default()
        };

        bollard::container::Config {
            image: Some(self.image.clone()),
            cmd: Some(self.cmd.clone()),
            working_dir: Some(self.working_dir.clone()),
            env: (!self.env.is_empty()).then(|| self.env.clone()),
            labels: Some(self.labels.clone()),
            user: Some(hardening.user.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityLevel;

    fn spec() -> ContainerSpec {
        ContainerSpec::new(
            "python:3.12-slim",
            HardeningProfile::for_level(SecurityLevel::Standard),
        )
    }

    #[test]
    fn test_defaults_are_isolated() {
        let config = spec().to_bollard();
        let host = config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert!(
            host.security_opt
                .unwrap()
                .iter()
                .any(|opt| opt == "no-new-privileges:true")
        );
        assert!(host.cap_drop.unwrap().contains(&"ALL".to_string()));
    }

    #[test]
    fn test_managed_label_always_present() {
        let config = spec().role("pool").language_label("python").to_bollard();
        let labels = config.labels.unwrap();

        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some("pool"));
        assert_eq!(
            labels.get(LANGUAGE_LABEL).map(String::as_str),
            Some("python")
        );
    }

    #[test]
    fn test_gpu_requests_device() {
        let config = spec().gpu(true).to_bollard();
        let requests = config.host_config.unwrap().device_requests.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].driver.as_deref(), Some("nvidia"));
    }

    #[test]
    fn test_memory_swap_pinned_to_memory() {
        let config = spec().memory_bytes(256 * 1024 * 1024).to_bollard();
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
    }
}
