use std::sync::{Arc, OnceLock};

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api;
use crate::core::{config::Settings, redis::RedisHandle, state::AppState};
use crate::progress::ProgressHub;

const TEST_REDIS_DB: &str = "1";

/// Process-wide variables the settings loader reads; cleared before each test.
const TUNABLES: &[&str] = &[
    "API_V1_STR",
    "BACKEND_CORS_ORIGINS",
    "TOPIC_CHANNELS",
    "TOPIC_RECONNECT_SECONDS",
    "SQS_ENABLED",
    "SQS_QUEUE_URL",
    "SQS_ENDPOINT",
    "SQS_MAX_MESSAGES",
    "SQS_WAIT_SECONDS",
    "SQS_POLL_INTERVAL_MS",
    "SQS_MAX_FAILURES",
    "PRESIGNED_URL_EXPIRE_MINUTES",
    "SSE_HEARTBEAT_SECONDS",
    "SESSION_IDLE_TIMEOUT_SECONDS",
    "SSE_CHANNEL_CAPACITY",
    "DEDUP_TTL_SECONDS",
    "DEDUP_MAX_ENTRIES",
];

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    dotenvy::dotenv().ok();

    std::env::set_var("GRADI_ENV", "test");
    std::env::set_var("GRADI_STRICT_CONFIG", "0");
    std::env::set_var("REDIS_HOST", "127.0.0.1");
    std::env::set_var("REDIS_PORT", "6379");
    std::env::set_var("REDIS_DB", TEST_REDIS_DB);
    std::env::remove_var("REDIS_PASSWORD");
    std::env::set_var("TOPIC_ENABLED", "0");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("S3_ENDPOINT");
    std::env::remove_var("S3_ACCESS_KEY");
    std::env::remove_var("S3_SECRET_KEY");
    std::env::remove_var("S3_BUCKET");
    std::env::remove_var("S3_REGION");
    for key in TUNABLES {
        std::env::remove_var(key);
    }
    std::env::set_var("AWS_EC2_METADATA_DISABLED", "true");
}

pub(crate) fn set_test_storage_env() {
    std::env::set_var("S3_ENDPOINT", "http://localhost:9000");
    std::env::set_var("S3_ACCESS_KEY", "test-access-key");
    std::env::set_var("S3_SECRET_KEY", "test-secret-key");
    std::env::set_var("S3_BUCKET", "gradi-test-bucket");
    std::env::set_var("S3_REGION", "ap-northeast-2");
}

/// Router over a fresh hub; Redis is configured but never connected.
pub(crate) async fn setup_test_context() -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let redis = RedisHandle::new(settings.redis().redis_url());
    let hub = ProgressHub::from_settings(&settings, None);

    let state = AppState::new(settings, redis, hub);
    let app = api::router::router(state.clone());

    TestContext { state, app, _guard: guard }
}

pub(crate) fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .expect("request")
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
