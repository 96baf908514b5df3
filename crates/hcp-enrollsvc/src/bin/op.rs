// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The operation executor.
//!
//! Launched per verb across the privilege-separation channel, running as
//! the state-owning identity. Anything miscellaneous goes to stderr
//! ONLY: the caller expects stdout to carry exactly one JSON document
//! (on success) or one terse error line (on failure), and the exit code
//! to be the HTTP status compressed into 0–99.

use hcp_common::{Config, http2exit};
use hcp_store::{
    EnrollConfig, OpOutcome, Store, op_add, op_find, op_janitor, op_query, op_reenroll,
};
use std::path::Path;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hcp=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (line, status) = match run(&args) {
        Ok(out) => (out.body.to_string(), out.status),
        Err((status, msg)) => {
            error!(target: "hcp.enrollsvc.op", %msg, status, "operation failed");
            (msg, status)
        }
    };
    println!("{line}");
    std::process::exit(http2exit(status));
}

fn run(args: &[String]) -> Result<OpOutcome, (u16, String)> {
    let verb = args
        .first()
        .ok_or((500u16, "missing verb".to_string()))?
        .as_str();
    let expected = match verb {
        "add" => 3,
        "reenroll" | "query" | "delete" | "find" => 1,
        "janitor" => 0,
        other => return Err((500, format!("unknown verb: {other}"))),
    };
    if args.len() - 1 != expected {
        return Err((
            500,
            format!("wrong number of arguments for '{verb}': {}", args.len() - 1),
        ));
    }
    debug!(target: "hcp.enrollsvc.op", %verb, "starting");

    let cfg = Config::from_env().map_err(|e| (500u16, e.to_string()))?;
    let state_dir = cfg
        .extract_str(".enrollsvc.state")
        .map_err(|e| (500u16, e.to_string()))?
        .ok_or((500u16, "missing .enrollsvc.state".to_string()))?;
    let store = Store::new(Path::new(&state_dir));

    let store_err = |e: hcp_store::StoreError| (e.http_status(), e.to_string());
    let parse_client = |text: &str| {
        serde_json::from_str::<serde_json::Value>(text)
            .map_err(|e| (500u16, format!("malformed request JSON: {e}")))
    };

    match verb {
        "add" => {
            let enroll = EnrollConfig::from_config(&cfg).map_err(store_err)?;
            op_add(&store, &enroll, Path::new(&args[1]), &args[2], &args[3]).map_err(store_err)
        }
        "reenroll" => {
            let enroll = EnrollConfig::from_config(&cfg).map_err(store_err)?;
            op_reenroll(&store, &enroll, &args[1]).map_err(store_err)
        }
        "query" | "delete" => {
            let client = parse_client(&args[1])?;
            op_query(&store, &client, verb == "delete").map_err(store_err)
        }
        "find" => {
            let client = parse_client(&args[1])?;
            op_find(&store, &client).map_err(store_err)
        }
        "janitor" => op_janitor(&store).map_err(store_err),
        _ => unreachable!("verb validated above"),
    }
}
