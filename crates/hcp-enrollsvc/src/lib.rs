// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-enrollsvc
#![deny(unsafe_code)]
//!
//! The enrollment management web front-end. Handlers validate the
//! request, assemble the job JSON, and delegate the real work across the
//! privilege-separation channel to the `enrollsvc-op` executor; the
//! executor's exit code and stdout become the HTTP response.

pub mod exec;

pub use exec::{OpInvoker, OpOutput};

use axum::{
    Router,
    extract::{Form, Multipart, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use hcp_json::union;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

/// Header carrying the client certificate PEM, forwarded by the HTTPS
/// terminator when client authentication was performed.
pub const CLIENT_CERT_HEADER: &str = "ssl-client-cert";

/// Shared state of the management service.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Channel to the operation executor.
    pub invoker: OpInvoker,
    /// Asset-signing trust anchor served by `/v1/get-asset-signer`.
    pub signer_pem: Option<PathBuf>,
}

/// Build the management router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/v1/add", post(cmd_add))
        .route("/v1/reenroll", post(cmd_reenroll))
        .route("/v1/query", get(cmd_query))
        .route("/v1/delete", post(cmd_delete))
        .route("/v1/find", get(cmd_find))
        .route("/v1/janitor", get(cmd_janitor))
        .route("/v1/get-asset-signer", get(cmd_asset_signer))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

/// Request metadata passed down to the executor for policy lookups: the
/// request URI plus whatever client authentication the terminator
/// forwarded.
pub fn request_metadata(uri: &str, headers: &HeaderMap) -> Value {
    let mut auth = json!({});
    if let Some(cert) = headers
        .get(CLIENT_CERT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        auth["client_cert"] = json!(cert);
    }
    json!({"uri": uri, "auth": auth})
}

/// Flatten an uploaded filename to something safe to join to a
/// directory: basename only, restricted character set.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let clean: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        "ek.pub".to_string()
    } else {
        clean
    }
}

fn bad_request(what: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("Error: {what} not in request"),
    )
        .into_response()
}

/// Translate executor output into the HTTP response: 2xx means stdout is
/// the JSON body, anything else is the decoded status with a terse body.
fn op_response(out: OpOutput) -> Response {
    let status =
        StatusCode::from_u16(out.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_success() {
        match serde_json::from_str::<Value>(&out.stdout) {
            Ok(body) => (status, Json(body)).into_response(),
            Err(e) => {
                error!(target: "hcp.enrollsvc", error = %e, "executor emitted unparseable JSON");
                (StatusCode::INTERNAL_SERVER_ERROR, "Server JSON error").into_response()
            }
        }
    } else {
        // The executor's stdout is a terse error line on failure; pass
        // it along so callers see e.g. which halfhash conflicted.
        let line = out.stdout.trim().to_string();
        let body = if line.is_empty() {
            "Error".to_string()
        } else {
            line
        };
        (status, body).into_response()
    }
}

async fn run_op(state: &AppState, verb: &str, args: &[String]) -> Response {
    match state.invoker.invoke(verb, args).await {
        Ok(out) => op_response(out),
        Err(e) => {
            error!(target: "hcp.enrollsvc", %verb, error = %e, "executor invocation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response()
        }
    }
}

async fn cmd_add(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut ekpub: Option<(String, Vec<u8>)> = None;
    let mut hostname: Option<String> = None;
    let mut profile = "{}".to_string();

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("ekpub") => {
                let filename = field.file_name().unwrap_or("ek.pub").to_string();
                match field.bytes().await {
                    Ok(bytes) => ekpub = Some((filename, bytes.to_vec())),
                    Err(_) => return bad_request("ekpub"),
                }
            }
            Some("hostname") => match field.text().await {
                Ok(text) => hostname = Some(text),
                Err(_) => return bad_request("hostname"),
            },
            Some("profile") => {
                if let Ok(text) = field.text().await {
                    if !text.is_empty() {
                        profile = text;
                    }
                }
            }
            _ => {}
        }
    }

    let Some((filename, bytes)) = ekpub else {
        return bad_request("ekpub");
    };
    let Some(hostname) = hostname else {
        return bad_request("hostname");
    };
    let Ok(form_data) = serde_json::from_str::<Value>(&profile) else {
        return (StatusCode::BAD_REQUEST, "Error: profile is not valid JSON").into_response();
    };
    let request_data = union(&form_data, &request_metadata("/v1/add", &headers));

    // The executor runs as another identity; the upload lands in a
    // world-readable+executable scratch directory it can reach.
    let tmp = match tempfile::tempdir() {
        Ok(t) => t,
        Err(e) => {
            error!(target: "hcp.enrollsvc", error = %e, "scratch dir creation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response();
        }
    };
    let mut perms = match std::fs::metadata(tmp.path()) {
        Ok(m) => m.permissions(),
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response(),
    };
    perms.set_mode(perms.mode() | 0o005);
    let _ = std::fs::set_permissions(tmp.path(), perms);

    let local_ekpub = tmp.path().join(sanitize_filename(&filename));
    if std::fs::write(&local_ekpub, &bytes).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response();
    }
    debug!(target: "hcp.enrollsvc", %hostname, ekpub = %local_ekpub.display(), "add request");

    run_op(
        &state,
        "add",
        &[
            local_ekpub.to_string_lossy().to_string(),
            hostname,
            request_data.to_string(),
        ],
    )
    .await
}

async fn cmd_reenroll(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(ekpubhash) = form.get("ekpubhash") else {
        return bad_request("ekpubhash");
    };
    let mut request_data = request_metadata("/v1/reenroll", &headers);
    request_data["ekpubhash"] = json!(ekpubhash);
    run_op(&state, "reenroll", &[request_data.to_string()]).await
}

async fn cmd_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(ekpubhash) = params.get("ekpubhash") else {
        return bad_request("ekpubhash");
    };
    let mut request_data = request_metadata("/v1/query", &headers);
    request_data["ekpubhash"] = json!(ekpubhash);
    request_data["nofiles"] = json!(params.contains_key("nofiles"));
    run_op(&state, "query", &[request_data.to_string()]).await
}

async fn cmd_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(ekpubhash) = form.get("ekpubhash") else {
        return bad_request("ekpubhash");
    };
    let mut request_data = request_metadata("/v1/delete", &headers);
    request_data["ekpubhash"] = json!(ekpubhash);
    request_data["nofiles"] = json!(form.contains_key("nofiles"));
    run_op(&state, "delete", &[request_data.to_string()]).await
}

async fn cmd_find(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(hostname_regex) = params.get("hostname_regex") else {
        return bad_request("hostname_regex");
    };
    let mut request_data = request_metadata("/v1/find", &headers);
    request_data["hostname_regex"] = json!(hostname_regex);
    run_op(&state, "find", &[request_data.to_string()]).await
}

async fn cmd_janitor(State(state): State<Arc<AppState>>) -> Response {
    run_op(&state, "janitor", &[]).await
}

async fn cmd_asset_signer(State(state): State<Arc<AppState>>) -> Response {
    let Some(path) = &state.signer_pem else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response();
    };
    match std::fs::read(path) {
        Ok(pem) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-pem-file")],
            pem,
        )
            .into_response(),
        Err(e) => {
            error!(target: "hcp.enrollsvc", error = %e, "asset signer unreadable");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error").into_response()
        }
    }
}
