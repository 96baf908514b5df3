// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use hcp_common::Config;
use hcp_policysvc::{AppState, build_app};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "policysvc", version, about = "HCP policy sidecar")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0:9080")]
    bind: String,

    /// Policy document path; defaults to the `.webapi.config` field of
    /// the service config.
    #[arg(long)]
    policy: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hcp=info")))
        .init();

    let policy_path = match args.policy {
        Some(p) => p,
        None => {
            let cfg = Config::from_env().context("load service config")?;
            cfg.extract_str(".webapi.config")
                .context("read .webapi.config")?
                .context(".webapi.config missing")?
        }
    };
    let policy_text = std::fs::read_to_string(&policy_path)
        .with_context(|| format!("read policy document {policy_path}"))?;
    let state = Arc::new(AppState::new(policy_text).context("parse policy document")?);

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(target: "hcp.policysvc", bind = %args.bind, policy = %policy_path, "policysvc listening");
    axum::serve(listener, app).await.context("serve")
}
