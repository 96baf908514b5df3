// SPDX-License-Identifier: MIT OR Apache-2.0
//! Drives the management router end to end with the executor replaced
//! by a stub script, verifying the exit-code/stdout contract and the
//! request plumbing on this side of the privilege boundary.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hcp_enrollsvc::{AppState, OpInvoker, build_app};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tower::ServiceExt;

/// Stub executor: answers per verb with canned JSON and the contract's
/// compressed exit codes, and echoes its argv into a file so tests can
/// inspect what crossed the boundary.
const STUB: &str = r#"#!/bin/sh
ARGSFILE="${STUB_DIR}/argv"
printf '%s\n' "$@" > "$ARGSFILE"
case "$1" in
  add)
    [ $# -eq 4 ] || { echo "wrong argv"; exit 50; }
    [ -f "$2" ] || { echo "no ekpub file"; exit 50; }
    printf '{"returncode":0,"hostname":"%s","ekpubhash":"feed","profile":{}}' "$3"
    exit 21 ;;
  query)
    printf '{"entries":[]}'
    exit 20 ;;
  find)
    printf '{"hostname_regex":"x","entries":[]}'
    exit 20 ;;
  janitor)
    printf '{"hn2ek":[]}'
    exit 20 ;;
  refuse)
    echo "policy said no"
    exit 43 ;;
  garbage)
    printf 'this is not json'
    exit 20 ;;
  *)
    echo "unknown verb"
    exit 50 ;;
esac
"#;

struct Fixture {
    tmp: tempfile::TempDir,
    app: Router,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let stub = tmp.path().join("op-stub");
    fs::write(&stub, STUB).unwrap();
    let mut perm = fs::metadata(&stub).unwrap().permissions();
    perm.set_mode(0o755);
    fs::set_permissions(&stub, perm).unwrap();

    // The stub writes its argv here; PATH survives the env scrub, so
    // smuggle the location through a wrapper script instead of env.
    let wrapper = tmp.path().join("op");
    fs::write(
        &wrapper,
        format!(
            "#!/bin/sh\nexport STUB_DIR={}\nexec {} \"$@\"\n",
            tmp.path().display(),
            stub.display()
        ),
    )
    .unwrap();
    let mut perm = fs::metadata(&wrapper).unwrap().permissions();
    perm.set_mode(0o755);
    fs::set_permissions(&wrapper, perm).unwrap();

    let signer = tmp.path().join("asset-signer.pem");
    fs::write(&signer, "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n").unwrap();

    let state = Arc::new(AppState {
        invoker: OpInvoker {
            op_bin: wrapper,
            sudo_user: None,
        },
        signer_pem: Some(signer),
    });
    Fixture {
        app: build_app(state),
        tmp,
    }
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

fn argv(fx: &Fixture) -> Vec<String> {
    fs::read_to_string(fx.tmp.path().join("argv"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn healthcheck_is_ok() {
    let fx = fixture();
    let (status, _) = send(
        fx.app,
        Request::builder().uri("/healthcheck").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn query_round_trips_through_the_executor() {
    let fx = fixture();
    let (status, body) = send(
        fx.app.clone(),
        Request::builder()
            .uri("/v1/query?ekpubhash=0d3f&nofiles=1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body, json!({"entries": []}));

    let argv = argv(&fx);
    assert_eq!(argv[0], "query");
    let request: Value = serde_json::from_str(&argv[1]).unwrap();
    assert_eq!(request["ekpubhash"], json!("0d3f"));
    assert_eq!(request["nofiles"], json!(true));
    assert_eq!(request["uri"], json!("/v1/query"));
}

#[tokio::test]
async fn query_without_ekpubhash_is_400() {
    let fx = fixture();
    let (status, body) = send(
        fx.app,
        Request::builder().uri("/v1/query").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Error: ekpubhash not in request");
}

#[tokio::test]
async fn add_uploads_the_ekpub_and_merges_metadata() {
    let fx = fixture();
    let boundary = "hcptestboundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"hostname\"\r\n\r\n\
         host1.example.com\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"profile\"\r\n\r\n\
         {{\"genprogs\":\"gencert\"}}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"ekpub\"; filename=\"../ek.pub\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         EKBYTES\r\n\
         --{boundary}--\r\n"
    );
    let (status, response) = send(
        fx.app.clone(),
        Request::builder()
            .method("POST")
            .uri("/v1/add")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("ssl-client-cert", "PEMDATA")
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let response: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(response["hostname"], json!("host1.example.com"));

    let argv = argv(&fx);
    assert_eq!(argv[0], "add");
    // Path traversal in the filename was flattened.
    assert!(argv[1].ends_with("/ek.pub"), "unsafe upload path: {}", argv[1]);
    assert_eq!(argv[2], "host1.example.com");
    let request: Value = serde_json::from_str(&argv[3]).unwrap();
    assert_eq!(request["genprogs"], json!("gencert"));
    assert_eq!(request["uri"], json!("/v1/add"));
    assert_eq!(request["auth"]["client_cert"], json!("PEMDATA"));
}

#[tokio::test]
async fn add_without_ekpub_is_400() {
    let fx = fixture();
    let boundary = "hcptestboundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"hostname\"\r\n\r\n\
         host1.example.com\r\n\
         --{boundary}--\r\n"
    );
    let (status, response) = send(
        fx.app,
        Request::builder()
            .method("POST")
            .uri("/v1/add")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response, "Error: ekpub not in request");
}

#[tokio::test]
async fn delete_without_ekpubhash_is_400() {
    let fx = fixture();
    let (status, _) = send(
        fx.app,
        Request::builder()
            .method("POST")
            .uri("/v1/delete")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("nothing=here"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invoker_decodes_refusal_and_garbage() {
    let fx = fixture();
    let invoker = OpInvoker {
        op_bin: fx.tmp.path().join("op"),
        sudo_user: None,
    };
    let out = invoker.invoke("refuse", &[]).await.unwrap();
    assert_eq!(out.status, 403);
    assert_eq!(out.stdout.trim(), "policy said no");

    let out = invoker.invoke("garbage", &[]).await.unwrap();
    assert_eq!(out.status, 200);
    assert!(serde_json::from_str::<Value>(&out.stdout).is_err());
}

#[tokio::test]
async fn find_and_janitor_pass_through() {
    let fx = fixture();
    let (status, _) = send(
        fx.app.clone(),
        Request::builder()
            .uri("/v1/find?hostname_regex=example")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        fx.app,
        Request::builder().uri("/v1/janitor").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"hn2ek": []}));
}

#[tokio::test]
async fn asset_signer_serves_the_pem() {
    let fx = fixture();
    let response = fx
        .app
        .oneshot(
            Request::builder()
                .uri("/v1/get-asset-signer")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-pem-file"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.starts_with(b"-----BEGIN PUBLIC KEY-----"));
}
