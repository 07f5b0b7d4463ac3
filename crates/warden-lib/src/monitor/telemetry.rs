//! Heartbeat-file telemetry
//!
//! Workers write `<dir>/<worker_id>.json` containing a [`TelemetrySample`]
//! on every heartbeat.

use super::TelemetrySource;
use crate::models::{TelemetrySample, WorkerDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileTelemetrySource {
    dir: PathBuf,
}

impl FileTelemetrySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", worker_id))
    }
}

#[async_trait]
impl TelemetrySource for FileTelemetrySource {
    async fn sample(&self, worker: &WorkerDescriptor) -> Result<TelemetrySample> {
        let path = self.path_for(&worker.id);
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read heartbeat file {:?}", path))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid heartbeat file {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_worker_heartbeat_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("ingest-1.json"),
            r#"{"pid":4321,"commandSignature":"ingest","cpuPercent":12.5,"memPercent":40.0,
                "lastHeartbeat":"2024-05-01T12:00:00Z","queueBacklog":17}"#,
        )
        .unwrap();

        let source = FileTelemetrySource::new(dir.path());
        let sample = source
            .sample(&WorkerDescriptor::new("ingest-1", "ingest"))
            .await
            .unwrap();
        assert_eq!(sample.pid, 4321);
        assert_eq!(sample.queue_backlog, 17);
        assert_eq!(sample.instances, 1);
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let source = FileTelemetrySource::new(dir.path());
        let worker = WorkerDescriptor::new("w1", "worker");
        assert!(source.sample(&worker).await.is_err());

        std::fs::write(source.path_for("w1"), b"{").unwrap();
        let err = source.sample(&worker).await.unwrap_err();
        assert!(err.to_string().contains("Invalid heartbeat file"));
    }
}
