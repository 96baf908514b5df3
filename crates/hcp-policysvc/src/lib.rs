// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-policysvc
#![deny(unsafe_code)]
//!
//! A trivial HTTP wrapper around the policy engine. Other services POST
//! a hook name, a request uid and a JSON `params` document to `/run`;
//! the policy decides, and the caller gets either its params back (200)
//! or a refusal (403).

use axum::{
    Form, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use hcp_policy::{Policy, run_with_env};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Shared service state: the policy document is kept as text because
/// each request's `__env` may parameterise it before parsing.
#[derive(Debug)]
pub struct AppState {
    /// The policy document text.
    pub policy_text: String,
}

impl AppState {
    /// Validate the policy once up front so a broken document fails the
    /// service at start rather than on the first request.
    pub fn new(policy_text: String) -> Result<Self, hcp_policy::PolicyError> {
        Policy::parse(&policy_text)?;
        Ok(Self { policy_text })
    }
}

/// Build the service router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/run", post(run_hook))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

/// Form body of `POST /run`.
#[derive(Debug, Deserialize)]
pub struct RunForm {
    /// Which hook is asking (e.g. `enrollsvc::add_request`).
    pub hookname: Option<String>,
    /// Correlation id chosen by the caller.
    pub request_uid: Option<String>,
    /// The JSON document to filter.
    pub params: Option<String>,
}

async fn run_hook(State(state): State<Arc<AppState>>, Form(form): Form<RunForm>) -> Response {
    let mut params: serde_json::Value = match form.params.as_deref() {
        None | Some("") => serde_json::json!({}),
        Some(text) => match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                return (StatusCode::UNAUTHORIZED, "Bad JSON input").into_response();
            }
        },
    };

    // Fold the side-band fields into the filtered document. Params must
    // not carry conflicting members of their own.
    if let Some(obj) = params.as_object_mut() {
        if let Some(hookname) = &form.hookname {
            obj.insert("hookname".to_string(), serde_json::json!(hookname));
        }
        if let Some(request_uid) = &form.request_uid {
            obj.insert("request_uid".to_string(), serde_json::json!(request_uid));
        }
    }

    let verdict = match run_with_env(&state.policy_text, &params, true) {
        Ok(v) => v,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("policy error: {e}"))
                .into_response();
        }
    };

    let summary = serde_json::to_string(&verdict).unwrap_or_default();
    if !verdict.accepted() {
        info!(target: "hcp.policysvc", hook = form.hookname.as_deref().unwrap_or(""), %summary, "REJECT");
        return (StatusCode::FORBIDDEN, "Blocked by policy").into_response();
    }
    info!(target: "hcp.policysvc", hook = form.hookname.as_deref().unwrap_or(""), %summary, "ALLOW");
    Json(params).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn policy() -> String {
        json!({
            "default": "reject",
            "start": "gate",
            "filters": {
                "gate": [
                    {"action": "reject", "if": {"equal": ".hostname", "value": "forbidden"}},
                    {"action": "accept", "if": {"equal": ".hookname", "value": "enrollsvc::add_request"}},
                    {"action": "reject"}
                ]
            }
        })
        .to_string()
    }

    fn app() -> Router {
        build_app(Arc::new(AppState::new(policy()).unwrap()))
    }

    async fn post_run(app: Router, body: String) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn healthcheck_is_ok() {
        let response = app()
            .oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn accepted_requests_echo_their_params() {
        let params = json!({"hostname":"host1"}).to_string();
        let (status, body) =
            post_run(app(), format!("hookname=enrollsvc::add_request&params={params}")).await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["hostname"], json!("host1"));
        assert_eq!(body["hookname"], json!("enrollsvc::add_request"));
    }

    #[tokio::test]
    async fn rejected_requests_are_forbidden() {
        let params = json!({"hostname":"forbidden"}).to_string();
        let (status, body) =
            post_run(app(), format!("hookname=enrollsvc::add_request&params={params}")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Blocked by policy");
    }

    #[tokio::test]
    async fn unknown_hooks_fall_to_the_chain_tail() {
        let params = json!({"hostname":"host1"}).to_string();
        let (status, _) = post_run(app(), format!("hookname=other::hook&params={params}")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_params_are_bad_json() {
        let (status, body) = post_run(app(), "params=notjson".to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Bad JSON input");
    }

    #[test]
    fn broken_policies_fail_at_startup() {
        assert!(AppState::new("{\"filters\": 42}".to_string()).is_err());
    }
}
