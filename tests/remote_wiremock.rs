//! End-to-end connector tests against WireMock servers.
//!
//! Each test builds a connector pointing at a mock server, runs it through
//! `Executor` + `RemoteInvoker`, and checks both what went over the wire and
//! what came back.

use std::collections::BTreeMap;
use std::sync::Arc;

use ml_connector::executor::{ConnectorExecutor, Executor, ExecutorOptions};
use ml_connector::remote::RemoteInvoker;
use ml_connector::script::ScriptEngine;
use ml_connector_core::connector::{ActionType, Connector};
use ml_connector_core::input::MlInput;
use ml_connector_core::Error;
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, header_exists, method, path, path_regex},
    Mock, MockServer, Request, ResponseTemplate,
};

// =============================================================================
// Test Helpers
// =============================================================================

const GENERATE_TEXT_PATH: &str = "/20231130/actions/generateText";

fn fixture_key_path() -> String {
    format!("{}/tests/fixtures/oci_test_key.pem", env!("CARGO_MANIFEST_DIR"))
}

fn generated_text_response() -> serde_json::Value {
    json!({ "generatedTexts": [[{ "text": "answer" }]] })
}

fn http_connector(base_url: &str, http_method: &str) -> Connector {
    Connector::from_value(json!({
        "name": "generate",
        "protocol": "http",
        "parameters": { "model": "cohere.command" },
        "credential": { "api_key": "secret-key" },
        "actions": [{
            "action_type": "PREDICT",
            "method": http_method,
            "url": format!("{base_url}/generateText"),
            "headers": { "Authorization": "Bearer ${credential.api_key}" },
            "request_body": "{\"input\":\"${parameters.input}\",\"model\":\"${parameters.model}\"}"
        }]
    }))
    .unwrap()
}

fn oci_connector(base_url: &str, pemfile_path: &str) -> Connector {
    Connector::from_value(json!({
        "name": "oci-genai",
        "protocol": "oci_genai",
        "parameters": {
            "auth_type": "USER_PRINCIPAL",
            "tenant_id": "ocid1.tenancy.oc1..tenant",
            "user_id": "ocid1.user.oc1..user",
            "fingerprint": "3a:9c:00:11",
            "pemfile_path": pemfile_path,
            "region": "us-chicago-1",
            "endpoint": base_url
        },
        "actions": [{
            "action_type": "PREDICT",
            "method": "POST",
            "url": "${parameters.endpoint}/20231130/actions/generateText",
            "request_body": "{\"prompts\":[\"${parameters.prompt}\"]}"
        }]
    }))
    .unwrap()
}

fn invoker(connector: Connector) -> RemoteInvoker<Executor> {
    let executor = Executor::for_connector(Arc::new(connector), &ExecutorOptions::default()).unwrap();
    RemoteInvoker::new(executor, ScriptEngine::default())
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// HTTP
// =============================================================================

#[tokio::test]
async fn test_http_predict_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generateText"))
        .and(header("authorization", "Bearer secret-key"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "input": "hi", "model": "cohere.command" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(generated_text_response()))
        .expect(1)
        .mount(&server)
        .await;

    let output = invoker(http_connector(&server.uri(), "POST"))
        .execute_predict(&MlInput::remote(params(&[("input", "hi")])))
        .await
        .unwrap();

    assert_eq!(output.outputs.len(), 1);
    let tensors = &output.outputs[0];
    assert_eq!(tensors.status_code, Some(200));
    assert_eq!(tensors.tensors.len(), 1);
    let map = tensors.tensors[0].data_as_map.as_ref().unwrap();
    assert_eq!(map["generatedTexts"][0][0]["text"], "answer");
}

#[tokio::test]
async fn test_http_predict_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generateText"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "code": "NotFound" })))
        .mount(&server)
        .await;

    let err = invoker(http_connector(&server.uri(), "POST"))
        .execute_predict(&MlInput::remote(params(&[("input", "hi")])))
        .await
        .unwrap_err();

    match err {
        Error::RemoteService { status, body } => {
            assert_eq!(status, 404);
            assert!(body.contains("NotFound"), "body was {body}");
        }
        other => panic!("expected RemoteService, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unsupported_method_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = invoker(http_connector(&server.uri(), "PATCH"))
        .execute_predict(&MlInput::remote(params(&[("input", "hi")])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedMethod(_)), "got {err:?}");
}

#[tokio::test]
async fn test_missing_template_parameter_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = invoker(http_connector(&server.uri(), "POST"))
        .execute_predict(&MlInput::remote(BTreeMap::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingParameter(ref p) if p == "input"), "got {err:?}");
}

#[tokio::test]
async fn test_text_docs_batch_sends_texts_parameter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .and(body_json(json!({ "texts": ["first", "second"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [[0.1], [0.2]] })))
        .expect(1)
        .mount(&server)
        .await;

    let connector = Connector::from_value(json!({
        "name": "embed",
        "protocol": "http",
        "actions": [{
            "action_type": "PREDICT",
            "method": "POST",
            "url": format!("{}/embed", server.uri()),
            "request_body": "{\"texts\":${parameters.texts}}"
        }]
    }))
    .unwrap();

    let output = invoker(connector)
        .execute_predict(&MlInput::text_docs(["first", "second"]))
        .await
        .unwrap();
    assert_eq!(output.outputs.len(), 1);
    assert_eq!(output.outputs[0].status_code, Some(200));
}

#[tokio::test]
async fn test_get_request_has_no_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generateText"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
        .expect(1)
        .mount(&server)
        .await;

    let output = invoker(http_connector(&server.uri(), "GET"))
        .execute_predict(&MlInput::remote(params(&[("input", "hi")])))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].body.is_empty());
    let tensor = &output.outputs[0].tensors[0];
    assert_eq!(tensor.result.as_deref(), Some("plain text"));
}

#[tokio::test]
async fn test_transport_failure_names_connector() {
    // Reserve a port, then release it so nothing is listening there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = invoker(http_connector(&uri, "POST"))
        .execute_predict(&MlInput::remote(params(&[("input", "hi")])))
        .await
        .unwrap_err();
    match err {
        Error::Transport { connector, endpoint, .. } => {
            assert_eq!(connector, "generate");
            assert!(endpoint.ends_with("/generateText"));
        }
        other => panic!("expected Transport, got {other:?}"),
    }
}

// =============================================================================
// AWS SigV4
// =============================================================================

#[tokio::test]
async fn test_aws_sigv4_request_is_signed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/endpoints/my-model/invocations"))
        .and(header_exists("x-amz-date"))
        .and(header_exists("x-amz-content-sha256"))
        .and(header("x-amz-security-token", "session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([0.5, 0.25])))
        .expect(1)
        .mount(&server)
        .await;

    let connector = Connector::from_value(json!({
        "name": "sagemaker",
        "protocol": "aws_sigv4",
        "parameters": { "region": "us-east-1", "service_name": "sagemaker" },
        "credential": {
            "access_key": "AKIDEXAMPLE",
            "secret_key": "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "session_token": "session-token"
        },
        "actions": [{
            "action_type": "PREDICT",
            "method": "POST",
            "url": format!("{}/endpoints/my-model/invocations", server.uri()),
            "request_body": "{\"inputs\":\"${parameters.inputs}\"}"
        }]
    }))
    .unwrap();

    let output = invoker(connector)
        .execute_predict(&MlInput::remote(params(&[("inputs", "hello")])))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0]
        .headers
        .get("authorization")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"), "{auth}");
    assert!(auth.contains("/us-east-1/sagemaker/aws4_request"));
    assert!(auth.contains("SignedHeaders="));

    // Non-object JSON is wrapped under "response".
    let map = output.outputs[0].tensors[0].data_as_map.as_ref().unwrap();
    assert_eq!(map["response"], json!([0.5, 0.25]));
}

#[test]
fn test_aws_connector_without_credentials_fails_at_load() {
    let err = Connector::from_value(json!({
        "name": "sagemaker",
        "protocol": "aws_sigv4",
        "parameters": { "region": "us-east-1", "service_name": "sagemaker" },
        "credential": { "access_key": "AKIDEXAMPLE" }
    }))
    .unwrap_err();
    assert!(err.to_string().contains("secret_key"), "{err}");
}

// =============================================================================
// OCI
// =============================================================================

fn authorization_of(request: &Request) -> String {
    request
        .headers
        .get("authorization")
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_oci_genai_user_principal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_TEXT_PATH))
        .and(header_exists("date"))
        .and(header_exists("x-content-sha256"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generated_text_response()))
        .expect(1)
        .mount(&server)
        .await;

    let output = invoker(oci_connector(&server.uri(), &fixture_key_path()))
        .execute_predict(&MlInput::remote(params(&[("prompt", "What is OpenSearch?")])))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let auth = authorization_of(&requests[0]);
    assert!(auth.starts_with(
        "Signature version=\"1\",keyId=\"ocid1.tenancy.oc1..tenant/ocid1.user.oc1..user/3a:9c:00:11\""
    ));
    assert!(auth.contains(
        "headers=\"date (request-target) host x-content-sha256 content-type content-length\""
    ));

    let map = output.outputs[0].tensors[0].data_as_map.as_ref().unwrap();
    assert_eq!(map["generatedTexts"][0][0]["text"], "answer");
}

#[tokio::test]
async fn test_oci_genai_wrong_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("opc-request-id", "req-404")
                .set_body_json(json!({
                    "code": "NotAuthorizedOrNotFound",
                    "message": "Authorization failed or requested resource not found."
                })),
        )
        .mount(&server)
        .await;

    let connector = oci_connector(&format!("{}/wrong", server.uri()), &fixture_key_path());
    let err = invoker(connector)
        .execute_predict(&MlInput::remote(params(&[("prompt", "hi")])))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(err.to_string().contains("NotAuthorizedOrNotFound"));
}

#[tokio::test]
async fn test_oci_missing_key_fails_on_first_use() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let tmp = tempfile::TempDir::new().unwrap();
    let missing = tmp.path().join("missing.pem");
    let connector = oci_connector(&server.uri(), missing.to_str().unwrap());

    // Construction does not touch the key file.
    let invoker = invoker(connector);
    let err = invoker
        .execute_predict(&MlInput::remote(params(&[("prompt", "hi")])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyLoad { .. }), "got {err:?}");

    // The supplier retries: once the key shows up, the next call succeeds.
    std::fs::copy(fixture_key_path(), &missing).unwrap();
    server.reset().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_TEXT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(generated_text_response()))
        .expect(1)
        .mount(&server)
        .await;
    invoker
        .execute_predict(&MlInput::remote(params(&[("prompt", "hi")])))
        .await
        .unwrap();
}

#[test]
fn test_oci_user_principal_missing_field() {
    let err = Connector::from_value(json!({
        "name": "oci",
        "protocol": "oci_sigv1",
        "parameters": {
            "auth_type": "USER_PRINCIPAL",
            "tenant_id": "t",
            "user_id": "u",
            "pemfile_path": "/k.pem",
            "region": "r"
        }
    }))
    .unwrap_err();
    assert_eq!(err.to_string(), "Missing fingerprint");
}

// =============================================================================
// Download
// =============================================================================

#[tokio::test]
async fn test_download_action_streams_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models/m.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip-bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let connector = Connector::from_value(json!({
        "name": "model-store",
        "protocol": "http",
        "actions": [{
            "action_type": "DOWNLOAD",
            "method": "GET",
            "url": format!("{}/models/${{parameters.object}}", server.uri())
        }]
    }))
    .unwrap();
    let invoker = invoker(connector);
    assert!(invoker.executor().connector().has_action(ActionType::Download));

    let response = invoker
        .execute_download(&params(&[("object", "m.zip")]))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await.unwrap()[..], b"zip-bytes");
}

#[tokio::test]
async fn test_download_failure_appends_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-amzn-requestid", "abc-123")
                .set_body_string("denied"),
        )
        .mount(&server)
        .await;

    let connector = Connector::from_value(json!({
        "name": "model-store",
        "protocol": "http",
        "actions": [{ "action_type": "DOWNLOAD", "method": "GET", "url": format!("{}/m.zip", server.uri()) }]
    }))
    .unwrap();
    let err = invoker(connector)
        .execute_download(&BTreeMap::new())
        .await
        .unwrap_err();
    match err {
        Error::RemoteService { status, body } => {
            assert_eq!(status, 403);
            assert_eq!(body, "denied request id: abc-123");
        }
        other => panic!("expected RemoteService, got {other:?}"),
    }
}

// =============================================================================
// Concurrency
// =============================================================================

/// Echo which server answered, plus the tenant and prompt the request
/// carried. The delay keeps calls in flight at the same time.
fn echo_request(server_name: &'static str) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    move |request: &Request| {
        let tenant = request.url.path().split('/').nth(2).unwrap_or_default().to_string();
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        ResponseTemplate::new(200)
            .set_body_json(json!({
                "server": server_name,
                "tenant": tenant,
                "prompt": body["prompts"][0],
            }))
            .set_delay(std::time::Duration::from_millis(50))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_predictions_keep_their_own_endpoints() {
    const CALLS: usize = 8;
    let servers = [MockServer::start().await, MockServer::start().await];
    for (server, name) in servers.iter().zip(["a", "b"]) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/tenants/[^/]+/generateText$"))
            .and(header_exists("authorization"))
            .respond_with(echo_request(name))
            .expect(CALLS as u64 / 2)
            .mount(server)
            .await;
    }

    let key = fixture_key_path();
    let connector = Connector::from_value(json!({
        "name": "oci-genai",
        "protocol": "oci_genai",
        "parameters": {
            "auth_type": "USER_PRINCIPAL",
            "tenant_id": "ocid1.tenancy.oc1..tenant",
            "user_id": "ocid1.user.oc1..user",
            "fingerprint": "3a:9c:00:11",
            "pemfile_path": key,
            "region": "us-chicago-1"
        },
        "actions": [{
            "action_type": "PREDICT",
            "method": "POST",
            "url": "${parameters.endpoint}/tenants/${parameters.tenant}/generateText",
            "request_body": "{\"prompts\":[\"${parameters.prompt}\"]}"
        }]
    }))
    .unwrap();
    let shared = Arc::new(invoker(connector));

    let handles: Vec<_> = (0..CALLS)
        .map(|i| {
            let invoker = Arc::clone(&shared);
            let endpoint = servers[i % 2].uri();
            tokio::spawn(async move {
                let tenant = format!("tenant-{i}");
                let prompt = format!("prompt-{i}");
                let input = MlInput::remote(params(&[
                    ("endpoint", endpoint.as_str()),
                    ("tenant", tenant.as_str()),
                    ("prompt", prompt.as_str()),
                ]));
                invoker.execute_predict(&input).await
            })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    for (i, result) in results.into_iter().enumerate() {
        let output = result.unwrap().unwrap();
        let map = output.outputs[0].tensors[0].data_as_map.as_ref().unwrap();
        assert_eq!(map["server"], if i % 2 == 0 { "a" } else { "b" }, "call {i}");
        assert_eq!(map["tenant"], format!("tenant-{i}"), "call {i}");
        assert_eq!(map["prompt"], format!("prompt-{i}"), "call {i}");
    }

    for (parity, server) in servers.iter().enumerate() {
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), CALLS / 2);
        for request in requests {
            let tenant = request.url.path().split('/').nth(2).unwrap().to_string();
            let index: usize = tenant.trim_start_matches("tenant-").parse().unwrap();
            assert_eq!(index % 2, parity, "{tenant} reached the wrong server");

            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            assert_eq!(body["prompts"][0], format!("prompt-{index}"));
            let host = request.headers.get("host").unwrap().to_str().unwrap();
            assert!(server.uri().ends_with(host), "host {host} on {}", server.uri());
            let auth = request.headers.get("authorization").unwrap().to_str().unwrap();
            assert!(auth.contains("keyId=\"ocid1.tenancy.oc1..tenant/ocid1.user.oc1..user/3a:9c:00:11\""));
        }
    }
}
