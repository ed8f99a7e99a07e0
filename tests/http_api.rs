mod common;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use common::{MockS3, TINY_NET, checkpoint, closed_addr, storage_config, tiny_checkpoint};
use http_body_util::BodyExt;
use onnx_export_service::{
    AppConfig, Converter, DefinitionLoader, S3Gateway, build_router,
    export::{ExportPipeline, ExportSettings},
    onnx::{check_model, proto::ModelProto},
};
use prost::Message;
use serde_json::{Value, json};
use tower::ServiceExt;

fn router(addr: SocketAddr) -> Router {
    let config = AppConfig::from_lookup(|key| match key {
        "MINIO_ENDPOINT" => Some(addr.to_string()),
        "MINIO_TIMEOUT_SECS" => Some("5".into()),
        _ => None,
    })
    .unwrap();
    let store = Arc::new(S3Gateway::new(&storage_config(addr)).unwrap());
    let loader = DefinitionLoader::new().with_tensor_limit(config.max_tensor_elements);
    let converter = Converter::new(
        store,
        Arc::new(loader),
        ExportPipeline::standard(&ExportSettings::default()),
        config.device,
    )
    .with_tensor_limit(config.max_tensor_elements);
    build_router(Arc::new(config), converter)
}

async fn seeded() -> (MockS3, SocketAddr) {
    let s3 = MockS3::default();
    s3.insert("models", "tiny_net.yaml", TINY_NET);
    s3.insert("weights", "tiny3.safetensors", tiny_checkpoint(3));
    s3.insert("weights", "tiny5.safetensors", tiny_checkpoint(5));
    s3.insert(
        "weights",
        "reshape.safetensors",
        checkpoint(&[("1.weight", vec![2, 2]), ("1.bias", vec![2])]),
    );
    let addr = s3.clone().serve().await;
    (s3, addr)
}

async fn post(router: Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn tiny_request(weights: &str, args: Option<&str>) -> String {
    json!({
        "python_path": "tiny_net.yaml",
        "weights_path": weights,
        "model_class": "TinyNet",
        "args": args,
        "input_shape": [4],
    })
    .to_string()
}

#[tokio::test]
async fn health_reports_ok() {
    let response = router(closed_addr())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn converts_model_end_to_end() {
    let (s3, addr) = seeded().await;
    let request = tiny_request("tiny3.safetensors", None);
    let (status, body) = post(router(addr), "/convert", request).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Model exported and validated successfully.");
    assert_eq!(body["onnx_path"], "TinyNet.onnx");
    assert_eq!(
        body["download_url"],
        format!("http://{addr}/onnx/TinyNet.onnx")
    );
    assert!(body.get("warnings").is_none());

    let bytes = s3.get("onnx", "TinyNet.onnx").unwrap();
    let model = ModelProto::decode(bytes.as_slice()).unwrap();
    check_model(&model).unwrap();
    let graph = model.graph.unwrap();
    assert!(graph.initializer.iter().all(|t| t.external_data.is_empty()));
    assert_eq!(s3.keys("onnx"), vec!["TinyNet.onnx"]);
}

#[tokio::test]
async fn rerun_replaces_previous_export() {
    let (s3, addr) = seeded().await;
    let (status, _) = post(router(addr), "/", tiny_request("tiny3.safetensors", None)).await;
    assert_eq!(status, StatusCode::OK);
    let first = s3.get("onnx", "TinyNet.onnx").unwrap();

    let (status, body) = post(
        router(addr),
        "/",
        tiny_request("tiny5.safetensors", Some("hidden=5")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let second = s3.get("onnx", "TinyNet.onnx").unwrap();
    assert_ne!(first, second);
    assert_eq!(s3.keys("onnx"), vec!["TinyNet.onnx"]);

    let graph = ModelProto::decode(second.as_slice()).unwrap().graph.unwrap();
    assert_eq!(graph.initializer[0].dims, vec![5, 4]);
}

#[tokio::test]
async fn reshape_models_fall_back_to_legacy_export() {
    let (s3, addr) = seeded().await;
    let request = json!({
        "python_path": "tiny_net.yaml",
        "weights_path": "reshape.safetensors",
        "model_class": "ReshapeNet",
        "input_shape": [4],
    });
    let (status, body) = post(router(addr), "/convert", request.to_string()).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    let warnings = body["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().starts_with("dynamic export failed"));

    let model = ModelProto::decode(s3.get("onnx", "ReshapeNet.onnx").unwrap().as_slice()).unwrap();
    assert_eq!(model.opset_import[0].version, 17);
    assert_eq!(model.graph.unwrap().input[0].name, "input");
}

#[tokio::test]
async fn oversized_input_shape_is_a_client_error() {
    let request = json!({
        "python_path": "tiny_net.yaml",
        "weights_path": "tiny3.safetensors",
        "model_class": "TinyNet",
        "input_shape": [17_592_186_044_416u64],
    });
    let (status, body) = post(router(closed_addr()), "/convert", request.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["category"], "bad_request");
}

#[tokio::test]
async fn oversized_constructor_argument_keeps_the_service_up() {
    let (s3, addr) = seeded().await;
    let request = tiny_request("tiny3.safetensors", Some("hidden=100000000000000"));
    let (status, body) = post(router(addr), "/convert", request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["category"], "type");
    assert!(s3.keys("onnx").is_empty());

    let (status, _) = post(router(addr), "/convert", tiny_request("tiny3.safetensors", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn empty_body_is_invalid_json() {
    let (status, body) = post(router(closed_addr()), "/convert", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid JSON");
    assert_eq!(body["category"], "invalid_json");
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn missing_field_is_a_client_error() {
    let request = json!({"python_path": "tiny_net.yaml", "model_class": "TinyNet"});
    let (status, body) = post(router(closed_addr()), "/convert", request.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["category"], "missing_field");
    assert!(body["error"].as_str().unwrap().contains("weights_path"));
}

#[tokio::test]
async fn unreachable_storage_is_a_server_error() {
    let (status, body) = post(
        router(closed_addr()),
        "/convert",
        tiny_request("tiny3.safetensors", None),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["category"], "connection");
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to connect to object storage")
    );
}

#[tokio::test]
async fn missing_weights_are_not_found() {
    let (s3, addr) = seeded().await;
    let (status, body) = post(
        router(addr),
        "/convert",
        tiny_request("absent.safetensors", None),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["category"], "not_found");
    assert!(s3.keys("onnx").is_empty());
}

#[tokio::test]
async fn unknown_class_is_a_lookup_error() {
    let (_, addr) = seeded().await;
    let request = json!({
        "python_path": "tiny_net.yaml",
        "weights_path": "tiny3.safetensors",
        "model_class": "ResNet18",
    });
    let (status, body) = post(router(addr), "/convert", request.to_string()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["category"], "lookup");
}
