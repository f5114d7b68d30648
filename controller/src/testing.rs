//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use kube::{
    client::{Body, Client},
    runtime::events::Recorder,
};
use serde_json::{json, Value};

use super::*;

pub use test_log::test;

/// Test_context builds a Context backed by two mock apiservers, one per
/// plane.
pub fn test_context() -> (Arc<Context>, ApiServerVerifier, ApiServerVerifier) {
    let (service, service_handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let service_client = Client::new(service, "default");
    let (platform, platform_handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let platform_client = Client::new(platform, "default");

    let recorder = Recorder::new(service_client.clone(), REPORTER.clone());
    let ctx = Context {
        client: service_client,
        platform: platform_client,
        recorder,
        options: AgentOptions {
            agent_name: "test-agent".into(),
            apiexport_ref: "kcp.example.com".into(),
            namespace: "sync-agent-system".into(),
            published_resource_selector: None,
        },
    };
    (
        Arc::new(ctx),
        ApiServerVerifier::new(service_handle),
        ApiServerVerifier::new(platform_handle),
    )
}

/// Mock_client builds a bare client plus its request handle, for driving the
/// sync engine directly.
pub fn mock_client() -> (Client, ApiServerVerifier) {
    let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), ApiServerVerifier::new(handle))
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// ApiServerVerifier asserts the request stream a reconciler produces.
///
/// Tests drive it from a spawned task, one expectation per request, and
/// await the task with [timeout_after_1s]. If the reconciler makes more
/// calls than the test handles, the reconciler sees a closed service error;
/// if it makes fewer, the timeout fires.
pub struct ApiServerVerifier {
    handle: ApiServerHandle,
}

impl ApiServerVerifier {
    fn new(handle: ApiServerHandle) -> Self {
        Self { handle }
    }

    /// Expect asserts the next request and answers it.
    ///
    /// The request must use `method` and its URI must contain `path_part`.
    /// A `status` of 404 produces an apiserver-shaped NotFound failure; for
    /// 2xx, `body` is sent back, or the request body is echoed when `body`
    /// is `Value::Null` (the apiserver echo on create/update).
    ///
    /// Returns the decoded request body (`Value::Null` for bodyless
    /// requests) so tests can assert on it.
    pub async fn expect(&mut self, method: &str, path_part: &str, status: u16, body: Value) -> Value {
        let (request, send) = self
            .handle
            .next_request()
            .await
            .expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{uri}", request.method());
        assert_eq!(request.method().as_str(), method, "unexpected method for {uri}");
        assert!(
            uri.contains(path_part),
            "expected URI to contain {path_part:?}, got {uri}"
        );

        let req_bytes = request
            .into_body()
            .collect_bytes()
            .await
            .expect("request body is readable");
        let req_body: Value = if req_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&req_bytes).expect("request body is json")
        };

        let response = match status {
            404 => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(serde_json::to_vec(&not_found()).expect("encodes")))
                .expect("response builds"),
            409 => Response::builder()
                .status(StatusCode::CONFLICT)
                .body(Body::from(serde_json::to_vec(&conflict()).expect("encodes")))
                .expect("response builds"),
            _ => {
                let payload = if body.is_null() { req_body.clone() } else { body };
                Response::builder()
                    .status(status)
                    .body(Body::from(serde_json::to_vec(&payload).expect("encodes")))
                    .expect("response builds")
            }
        };
        send.send_response(response);
        req_body
    }
}

fn not_found() -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "message": "not found",
    })
}

fn conflict() -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "code": 409,
        "status": "Failure",
        "reason": "AlreadyExists",
        "message": "already exists",
    })
}

/// Timeout_after_1s awaits a verifier task, catching missing API calls.
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Object_list wraps items in an apiserver list response.
pub fn object_list(api_version: &str, kind: &str, items: Vec<Value>) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": format!("{kind}List"),
        "metadata": {"resourceVersion": "1"},
        "items": items,
    })
}
