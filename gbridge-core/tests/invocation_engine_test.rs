use gbridge_core::codec::CodecOptions;
use gbridge_core::engine::{EngineOptions, ErrorDetail, ErrorKind, Invocation};
use greeter_service::VERSION_METADATA_KEY;
use serde_json::json;

mod common;

fn call(service: &str, method: &str, body: serde_json::Value) -> Invocation {
    Invocation::new(service, method, body.to_string().into_bytes())
}

#[tokio::test]
async fn test_say_hello_end_to_end() {
    let engine = common::engine(EngineOptions::default());

    let output = engine
        .invoke(call("pkg.Greeter", "SayHello", json!({"name": "Ada"})))
        .await
        .unwrap();

    assert_eq!(output.body, json!({"greeting": "Hello, Ada"}));
    assert_eq!(output.metadata.get(VERSION_METADATA_KEY).unwrap(), "1");
}

#[tokio::test]
async fn test_empty_body_is_an_empty_message() {
    let engine = common::engine(EngineOptions::default());

    let err = engine
        .invoke(Invocation::new("pkg.Greeter", "SayHello", Vec::new()))
        .await
        .unwrap_err();

    // The backend rejects the empty name, proving the call went through.
    assert_eq!(err.kind, ErrorKind::BadRequest);
    assert!(matches!(
        err.detail,
        Some(ErrorDetail::Upstream { grpc_code: 3, .. })
    ));
}

#[tokio::test]
async fn test_unknown_method() {
    let engine = common::engine(EngineOptions::default());

    let err = engine
        .invoke(call("pkg.Greeter", "Nonexistent", json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UnknownMethod);
    assert_eq!(err.kind.http_status(), 404);
}

#[tokio::test]
async fn test_unknown_service() {
    let engine = common::engine(EngineOptions::default());

    let err = engine
        .invoke(call("pkg.Ghost", "SayHello", json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UnknownService);
}

#[tokio::test]
async fn test_streaming_methods_are_rejected() {
    let engine = common::engine(EngineOptions::default());

    for method in ["StreamGreetings", "CollectNames"] {
        let err = engine
            .invoke(call("pkg.Greeter", method, json!({"name": "Ada"})))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::UnsupportedStreaming);
    }
}

#[tokio::test]
async fn test_invalid_body_points_at_the_field() {
    let engine = common::engine(EngineOptions::default());

    let err = engine
        .invoke(call(
            "pkg.Greeter",
            "UpdateProfile",
            json!({"address": {"city": 7}}),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::BadRequest);
    assert_eq!(
        err.detail,
        Some(ErrorDetail::Request {
            field: Some("address.city".to_string()),
            reason: "TypeMismatch".to_string(),
        })
    );

    let err = engine
        .invoke(call("pkg.Greeter", "SayHello", json!({"totally_unknown_field": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadRequest);
}

#[tokio::test]
async fn test_upstream_statuses_are_mapped() {
    let engine = common::engine(EngineOptions::default());

    let cases = [
        (5, ErrorKind::NotFound),
        (7, ErrorKind::Forbidden),
        (16, ErrorKind::Unauthenticated),
        (4, ErrorKind::Timeout),
        (13, ErrorKind::UpstreamError),
    ];

    for (code, kind) in cases {
        let err = engine
            .invoke(call(
                "pkg.Greeter",
                "Fail",
                json!({"code": code, "message": "boom"}),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.kind, kind, "code {code}");
        assert!(
            matches!(err.detail, Some(ErrorDetail::Upstream { grpc_code, ref grpc_message, .. }) if grpc_code == code && grpc_message == "boom"),
            "unexpected detail: {:?}",
            err.detail
        );
    }
}

#[tokio::test]
async fn test_unimplemented_invalidates_the_service() {
    let engine = common::engine(EngineOptions::default());
    let store = engine.resolver().store();

    let err = engine
        .invoke(call("pkg.Greeter", "Fail", json!({"code": 12, "message": "gone"})))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UpstreamError);
    assert!(store.lookup_service("pkg.Greeter").is_none());

    // The next call resolves the service again.
    let output = engine
        .invoke(call("pkg.Greeter", "SayHello", json!({"name": "Bob"})))
        .await
        .unwrap();
    assert_eq!(output.body, json!({"greeting": "Hello, Bob"}));
    assert!(store.lookup_service("pkg.Greeter").is_some());
}

#[tokio::test]
async fn test_profile_survives_the_round_trip() {
    let engine = common::engine(EngineOptions::default());
    let profile = json!({
        "id": "p-1",
        "status": "INACTIVE",
        "balance": "-42",
        "visits": "18446744073709551615",
        "avatar": "AQID",
        "tags": ["a", "b"],
        "scores": {"math": 9},
        "address": {"city": "Lisbon", "zipCode": "1000"},
        "level": 0,
        "email": "ada@example.com",
        "createdAt": "2024-01-02T03:04:05Z",
        "history": {"7": "INACTIVE"},
        "checksum": "99",
    });

    let output = engine
        .invoke(call("pkg.Greeter", "UpdateProfile", profile.clone()))
        .await
        .unwrap();

    assert_eq!(output.body, profile);
}

#[tokio::test]
async fn test_emit_defaults() {
    let engine = common::engine(EngineOptions::default());

    let compact = engine
        .invoke(call("pkg.Greeter", "UpdateProfile", json!({"id": "p"})))
        .await
        .unwrap();
    assert_eq!(compact.body, json!({"id": "p"}));

    let mut invocation = call("pkg.Greeter", "UpdateProfile", json!({"id": "p"}));
    invocation.emit_defaults = Some(true);
    let full = engine.invoke(invocation).await.unwrap();

    assert_eq!(full.body["balance"], json!("0"));
    assert_eq!(full.body["status"], json!("ACTIVE"));
    assert_eq!(full.body["tags"], json!([]));

    let configured = common::engine(EngineOptions {
        codec: CodecOptions {
            emit_defaults: true,
            ..Default::default()
        },
        ..Default::default()
    });
    let mut invocation = call("pkg.Greeter", "SayHello", json!({"name": "Ada"}));
    invocation.emit_defaults = Some(false);
    let output = configured.invoke(invocation).await.unwrap();
    assert_eq!(output.body, json!({"greeting": "Hello, Ada"}));
}

#[tokio::test]
async fn test_invalid_metadata_is_a_bad_request() {
    let engine = common::engine(EngineOptions::default());

    let mut invocation = call("pkg.Greeter", "SayHello", json!({"name": "Ada"}));
    invocation.metadata = vec![("bad key".to_string(), "v".to_string())];

    let err = engine.invoke(invocation).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadRequest);
}

#[tokio::test]
async fn test_concurrent_first_use() {
    let engine = common::engine(EngineOptions::default());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .invoke(call("pkg.Greeter", "SayHello", json!({"name": format!("#{i}")})))
                    .await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.body, json!({"greeting": format!("Hello, #{i}")}));
    }
}

#[tokio::test]
async fn test_list_services_hides_reflection() {
    let engine = common::engine(EngineOptions::default());

    assert_eq!(engine.list_services().await.unwrap(), vec!["pkg.Greeter"]);
}
