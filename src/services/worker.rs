use crate::services::upload_service::UploadService;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Periodically reaps expired upload sessions until shutdown is signalled.
pub struct BackgroundWorker {
    uploads: Arc<UploadService>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        uploads: Arc<UploadService>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uploads,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            "🚀 Session reaper started (interval {:?})",
            self.interval
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Session reaper shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    async fn perform_cleanup(&self) {
        tracing::debug!("🧹 Reaping expired upload sessions...");

        match self.uploads.reap_expired(Utc::now()).await {
            Ok(report) => {
                if report.expired_sessions + report.orphaned_chunk_dirs + report.staging_files > 0 {
                    tracing::info!(
                        "✅ Reaper removed {} expired sessions, {} orphaned chunk dirs, {} staging files",
                        report.expired_sessions,
                        report.orphaned_chunk_dirs,
                        report.staging_files
                    );
                }
            }
            Err(e) => tracing::error!("Reaper pass failed: {}", e),
        }
    }
}
