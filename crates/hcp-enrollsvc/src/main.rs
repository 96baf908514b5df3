// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use hcp_common::Config;
use hcp_enrollsvc::{AppState, OpInvoker, build_app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "enrollsvc-mgmt", version, about = "HCP enrollment management API")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0:5000")]
    bind: String,

    /// Operation executor path (overrides the config).
    #[arg(long)]
    op_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hcp=info")),
        )
        .init();

    let cfg = Config::from_env().context("load service config")?;
    let op_bin = match args.op_bin {
        Some(p) => p,
        None => cfg
            .extract_str(".enrollsvc.op_bin")
            .context("read .enrollsvc.op_bin")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("enrollsvc-op")),
    };
    let sudo_user = cfg
        .extract_str(".enrollsvc.dbuser")
        .context("read .enrollsvc.dbuser")?;
    let signer_pem = cfg
        .extract_str(".enrollsvc.asset_signer")
        .context("read .enrollsvc.asset_signer")?
        .map(PathBuf::from);

    let state = Arc::new(AppState {
        invoker: OpInvoker {
            op_bin,
            sudo_user,
        },
        signer_pem,
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(target: "hcp.enrollsvc", bind = %args.bind, "enrollsvc-mgmt listening");
    axum::serve(listener, app).await.context("serve")
}
