use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqs_local::sqs::registry::QueueRegistry;
use sqs_local::sqs::server;
use sqs_local::sqs::state::SqsState;

#[derive(Parser)]
#[command(name = "sqs-local", about = "Local Amazon SQS service")]
struct Args {
    #[arg(long, default_value = "9324")]
    port: u16,
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value = "us-east-1")]
    region: String,
    #[arg(long, default_value = "000000000000")]
    account_id: String,
    /// Queue to create at startup. Repeatable; `.fifo` names become FIFO queues.
    #[arg(long = "queue")]
    queues: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqs_local=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let registry = Arc::new(QueueRegistry::new());
    for name in &args.queues {
        registry
            .create_queue(name, &HashMap::new())
            .await
            .with_context(|| format!("failed to create queue {name}"))?;
    }

    let state = Arc::new(SqsState::new(
        registry,
        args.account_id,
        args.region,
        args.port,
    ));
    let shutdown = CancellationToken::new();
    let app = server::create_router(state, shutdown.clone());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "sqs-local listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server stopped");
    Ok(())
}
