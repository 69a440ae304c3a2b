use anyhow::{Context, bail};
use clap::Parser;
use dotenvy::dotenv;
use lecture_upload::client::{
    ClientConfig, FileSource, HttpTransport, UploadEvent, UploadOrchestrator, UploadState,
};
use lecture_upload::models::Destination;
use lecture_upload::utils::auth::create_jwt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Upload lecture videos to a receiver in resumable chunks")]
struct Args {
    /// Receiver base URL
    #[arg(long, env = "UPLOAD_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    /// Bearer token for the receiver
    #[arg(long, env = "UPLOAD_TOKEN")]
    token: Option<String>,

    /// Mint a token for this user with JWT_SECRET instead of passing --token
    #[arg(long, env = "UPLOAD_USER")]
    user: Option<String>,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    #[arg(long)]
    course: String,

    #[arg(long)]
    section: String,

    #[arg(long)]
    lecture: String,

    /// Chunk size in bytes
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 5 * 1024 * 1024)]
    chunk_size: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Files to upload, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn bearer_token(&self) -> anyhow::Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        match (&self.user, &self.jwt_secret) {
            (Some(user), Some(secret)) => create_jwt(user, secret, chrono::Duration::hours(24)),
            _ => bail!("either --token or both --user and JWT_SECRET are required"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "upload_client=info,lecture_upload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig {
        base_url: args.base_url.clone(),
        token: args.bearer_token()?,
        chunk_size: args.chunk_size,
        request_timeout: Duration::from_secs(args.timeout_secs),
    };

    let transport = Arc::new(HttpTransport::new(&config).context("invalid client configuration")?);
    let orchestrator =
        UploadOrchestrator::with_request_timeout(transport, config.chunk_size, config.request_timeout);
    let mut events = orchestrator.subscribe();

    let destination = Destination::new(&args.course, &args.section, &args.lecture);
    info!(
        "📤 Uploading {} file(s) to {} at {}",
        args.files.len(),
        destination,
        config.base_url
    );

    for path in &args.files {
        let source = FileSource::open(path)
            .await
            .with_context(|| format!("cannot read {:?}", path))?;
        orchestrator.enqueue(Arc::new(source), destination.clone());
    }

    let total = args.files.len();
    let reporter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => report(&orchestrator, event),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} progress events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    // Failed items are reported and the remaining files still go out
    orchestrator.drain().await;
    reporter.abort();

    let mut failed = 0;
    for item in orchestrator.snapshot() {
        match (item.state, item.asset) {
            (UploadState::Completed, Some(asset)) => info!(
                "✅ {} -> {} ({} bytes, xxh3 {})",
                item.file_name, asset.asset_locator, asset.size, asset.checksum
            ),
            (state, _) => {
                failed += 1;
                error!(
                    "❌ {} not uploaded ({:?}): {}",
                    item.file_name,
                    state,
                    item.last_error.unwrap_or_default()
                );
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} uploads failed", failed, total);
    }
    Ok(())
}

fn report(orchestrator: &UploadOrchestrator, event: UploadEvent) {
    match event {
        UploadEvent::Progress {
            id,
            bytes_sent,
            total_bytes,
            next_chunk_index,
            total_chunks,
            bytes_per_second,
            eta,
        } => {
            let name = orchestrator
                .item(id)
                .map(|i| i.file_name)
                .unwrap_or_else(|| "?".to_string());
            info!(
                "⏳ {}: chunk {}/{} ({}/{} bytes, {:.1} KiB/s, eta {})",
                name,
                next_chunk_index,
                total_chunks,
                bytes_sent,
                total_bytes,
                bytes_per_second / 1024.0,
                eta.map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
        UploadEvent::StateChanged {
            id,
            to: UploadState::Failed,
            ..
        } => {
            if let Some(item) = orchestrator.item(id) {
                error!(
                    "❌ {} failed: {}",
                    item.file_name,
                    item.last_error.unwrap_or_default()
                );
            }
        }
        _ => {}
    }
}
