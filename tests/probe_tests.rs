use axum::{http::StatusCode, routing::get, Json, Router};
use lmvisor::{HealthProbe, HttpProbe};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Stand-in for llama-server's `/models` endpoint.
async fn spawn_stub(loading: Arc<AtomicBool>) -> u16 {
    let app = Router::new().route(
        "/models",
        get(move || {
            let loading = loading.clone();
            async move {
                if loading.load(Ordering::SeqCst) {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({"error": {"code": 503, "message": "Loading model", "type": "unavailable_error"}})),
                    )
                } else {
                    (StatusCode::OK, Json(json!({"object": "list", "data": [{"id": "model.gguf"}]})))
                }
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_loading_then_ready() {
    let loading = Arc::new(AtomicBool::new(true));
    let port = spawn_stub(loading.clone()).await;
    let probe = HttpProbe::new("127.0.0.1").unwrap();

    assert!(probe.is_listening(port).await);
    assert!(!probe.is_ready(port).await);

    loading.store(false, Ordering::SeqCst);
    assert!(probe.is_ready(port).await);
}

#[tokio::test]
async fn test_any_other_answer_counts_as_ready() {
    let app = Router::new().route("/models", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let probe = HttpProbe::new("127.0.0.1").unwrap();
    assert!(probe.is_ready(port).await);
    assert!(probe.is_listening(port).await);
}

#[tokio::test]
async fn test_closed_port() {
    let port = free_port().await;
    let probe = HttpProbe::new("127.0.0.1").unwrap();

    assert!(!probe.is_listening(port).await);
    assert!(!probe.is_ready(port).await);
}
