//! One-shot container resource statistics.

use futures::stream::StreamExt;
use tracing::debug;

use crate::engine::{Engine, EngineError, Result};

/// Resource usage sampled from the daemon's stats stream.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    /// Cumulative CPU time consumed, milliseconds
    pub cpu_ms: u64,
    /// Peak memory usage, MiB
    pub peak_memory_mib: f64,
    /// Block device bytes read, MiB
    pub disk_read_mib: f64,
    /// Block device bytes written, MiB
    pub disk_write_mib: f64,
}

impl Engine {
    /// Take a single stats sample for a container.
    ///
    /// # Errors
    ///
    /// Returns error if the container is gone or the stream yields nothing.
    pub async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        debug!("Sampling stats for container: {}", container_id);

        let mut stream = self.docker().stats(
            container_id,
            Some(bollard::container::StatsOptions {
                stream: false,
                ..Default::default()
            }),
        );

        let Some(sample) = stream.next().await else {
            return Err(EngineError::Other(format!(
                "no stats available for container {container_id}"
            )));
        };
        let stats = sample?;

        let cpu_ms = stats.cpu_stats.cpu_usage.total_usage / 1_000_000;

        let peak_memory = stats.memory_stats.max_usage.or(stats.memory_stats.usage).unwrap_or(0);

        let (read_bytes, write_bytes) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                    let value = entry.value;
                    if entry.op.eq_ignore_ascii_case("read") {
                        (read + value, write)
                    } else if entry.op.eq_ignore_ascii_case("write") {
                        (read, write + value)
                    } else {
                        (read, write)
                    }
                })
            })
            .unwrap_or((0, 0));

        const MIB: f64 = 1024.0 * 1024.0;

        Ok(ContainerStats {
            cpu_ms,
            peak_memory_mib: peak_memory as f64 / MIB,
            disk_read_mib: read_bytes as f64 / MIB,
            disk_write_mib: write_bytes as f64 / MIB,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_stats_sample() {
        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            crate::security::HardeningProfile::for_level(crate::security::SecurityLevel::Permissive),
        );
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let stats = engine.stats(&id).await.unwrap();
        assert!(stats.peak_memory_mib >= 0.0);

        engine.destroy_container(&id).await.unwrap();
    }
}
