//! # tracegraph
//!
//! Binary entry point: installs logging, parses the command line and runs
//! the selected command.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                apps/tracegraph (THE BINARY)          │
//! │                                                      │
//! │   ┌───────────┐   ┌────────────┐   ┌─────────────┐   │
//! │   │   CLI     │   │  HTTP API  │   │   Config    │   │
//! │   │  (clap)   │   │  (axum)    │   │   (toml)    │   │
//! │   └─────┬─────┘   └─────┬──────┘   └──────┬──────┘   │
//! │         └───────────────┼─────────────────┘          │
//! │                         ▼                            │
//! │                ┌─────────────────┐                   │
//! │                │ tracegraph-core │                   │
//! │                │  (THE ENGINE)   │                   │
//! │                └─────────────────┘                   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! tracegraph ingest -t acme -b bundle.json
//! tracegraph snapshot -t acme
//! tracegraph drift -t acme
//! tracegraph closure -t acme -b bundle.json -r 3f2c1a9
//! tracegraph serve --port 8080
//! ```

use clap::Parser;
use tracegraph::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // TRACEGRAPH_LOG_FORMAT=json switches to machine-parseable output.
    let log_format = std::env::var("TRACEGRAPH_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tracegraph=info,tracegraph_core=info,tower_http=debug".into());

    // Logs go to stderr so `--json` output on stdout stays parseable.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli).await {
        tracing::error!(code = e.code(), "{}", e);
        std::process::exit(1);
    }
}
