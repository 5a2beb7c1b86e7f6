//! Conversion webhook exchange over real HTTP against a local stub
//! endpoint: successful conversion, reported failure, empty payloads and
//! transport errors.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use keel_convert::{VersionConverter, VersioningContext};
use keel_core::{
    ConversionStrategy, Error, Resource, ResourceConversion, ResourceDefinitionNames,
    ResourceDefinitionSpec, ResourceDefinitionVersion, ResourceReference, ResourceScope,
    WebhookClientConfig,
};

async fn read_json_body(socket: &mut TcpStream) -> Value {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let (body_start, content_length) = loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&raw[..pos]).to_ascii_lowercase();
            let len = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            break (pos + 4, len);
        }
    };
    while raw.len() < body_start + content_length {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        raw.extend_from_slice(&buf[..n]);
    }
    serde_json::from_slice(&raw[body_start..body_start + content_length]).unwrap()
}

/// One-shot HTTP stub: accepts a single POST, hands the decoded body to
/// `respond`, and writes back the status/body it returns.
async fn stub_endpoint<F>(respond: F) -> String
where
    F: FnOnce(Value) -> (u16, Value) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_json_body(&mut socket).await;
        let (status, body) = respond(request);
        let reason = if status < 400 { "OK" } else { "Error" };
        let body = body.to_string();
        let reply = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len(),
        );
        socket.write_all(reply.as_bytes()).await.unwrap();
    });
    url
}

fn webhook_definition(url: &str) -> ResourceDefinitionSpec {
    ResourceDefinitionSpec {
        group: "example.com".into(),
        names: ResourceDefinitionNames { plural: "widgets".into(), singular: None, kind: "Widget".into() },
        scope: ResourceScope::Namespaced,
        versions: vec![
            ResourceDefinitionVersion { name: "v1alpha1".into(), storage: false },
            ResourceDefinitionVersion { name: "v1".into(), storage: true },
        ],
        conversion: Some(ResourceConversion {
            strategy: ConversionStrategy::Webhook,
            webhook: Some(WebhookClientConfig { url: url.to_string() }),
        }),
    }
}

fn ctx(url: &str) -> VersioningContext {
    let resource: Resource = serde_json::from_value(json!({
        "apiVersion": "example.com/v1alpha1",
        "kind": "Widget",
        "metadata": { "name": "web", "namespace": "prod" },
        "spec": { "size": "large" }
    }))
    .unwrap();
    VersioningContext::new(
        ResourceReference::new("example.com", "v1alpha1", "widgets", "web", Some("prod")),
        webhook_definition(url),
        resource,
    )
}

#[tokio::test]
async fn webhook_converts_to_the_storage_version() {
    let url = stub_endpoint(|request| {
        let uid = request["request"]["uid"].as_str().unwrap().to_string();
        assert_eq!(request["request"]["desiredApiVersion"], "example.com/v1");
        let mut object = request["request"]["objects"][0].clone();
        object["apiVersion"] = json!("example.com/v1");
        object["spec"] = json!({ "replicas": 3 });
        (
            200,
            json!({
                "apiVersion": "conversion.keel.io/v1",
                "kind": "ConversionReview",
                "response": {
                    "uid": uid,
                    "result": { "success": true },
                    "convertedObjects": [object]
                }
            }),
        )
    })
    .await;

    let mut c = ctx(&url);
    let out = VersionConverter::new().convert_to_storage_version(&mut c).await.unwrap();
    assert_eq!(out.api_version, "example.com/v1");
    assert_eq!(out.spec().unwrap()["replicas"], 3);
    // the context tracks the converted state
    assert_eq!(c.resource.api_version, "example.com/v1");
}

#[tokio::test]
async fn reported_failure_carries_the_webhook_errors() {
    let url = stub_endpoint(|request| {
        let uid = request["request"]["uid"].as_str().unwrap().to_string();
        (
            200,
            json!({
                "apiVersion": "conversion.keel.io/v1",
                "kind": "ConversionReview",
                "response": {
                    "uid": uid,
                    "result": { "success": false, "errors": ["unknown field spec.size"] }
                }
            }),
        )
    })
    .await;

    let mut c = ctx(&url);
    let err = VersionConverter::new().convert_to_storage_version(&mut c).await.unwrap_err();
    let problem = err.as_problem().expect("typed problem");
    assert!(problem.type_uri.ends_with("resource-conversion-failed"));
    let messages = problem.errors.get("conversion-webhook").expect("webhook messages");
    assert!(messages.iter().any(|m| m.contains("unknown field")));
}

#[tokio::test]
async fn success_without_a_converted_object_is_a_failure() {
    let url = stub_endpoint(|request| {
        let uid = request["request"]["uid"].as_str().unwrap().to_string();
        (
            200,
            json!({
                "apiVersion": "conversion.keel.io/v1",
                "kind": "ConversionReview",
                "response": {
                    "uid": uid,
                    "result": { "success": true },
                    "convertedObjects": []
                }
            }),
        )
    })
    .await;

    let mut c = ctx(&url);
    let err = VersionConverter::new().convert_to_storage_version(&mut c).await.unwrap_err();
    assert!(err.as_problem().map(|p| p.type_uri.ends_with("resource-conversion-failed")).unwrap_or(false));
}

#[tokio::test]
async fn mismatched_uid_is_a_failure() {
    let url = stub_endpoint(|_| {
        (
            200,
            json!({
                "apiVersion": "conversion.keel.io/v1",
                "kind": "ConversionReview",
                "response": {
                    "uid": "someone-elses-review",
                    "result": { "success": true },
                    "convertedObjects": []
                }
            }),
        )
    })
    .await;

    let mut c = ctx(&url);
    let err = VersionConverter::new().convert_to_storage_version(&mut c).await.unwrap_err();
    assert!(err.as_problem().is_some());
}

#[tokio::test]
async fn non_success_status_propagates_as_webhook_error() {
    let url = stub_endpoint(|_| (502, json!({ "error": "bad gateway" }))).await;
    let mut c = ctx(&url);
    let err = VersionConverter::new().convert_to_storage_version(&mut c).await.unwrap_err();
    assert!(matches!(err, Error::Webhook(_)));
}
