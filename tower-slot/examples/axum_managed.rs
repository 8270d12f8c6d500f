use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    Router, error_handling::HandleErrorLayer, extract::Request, http::HeaderMap,
    http::StatusCode, response::IntoResponse, routing::get,
};
use slot_limit::{ConcurrencyCache, MemoryStore, RedisStore, SlotConfig, SlotStore};
use tower::BoxError;
use tower::ServiceBuilder;
use tower_slot::{ManagedSlotLayer, SlotError, SlotRequest};
use tracing_subscriber::EnvFilter;

const MAX_USER_CONCURRENCY: u32 = 2;
const MAX_USER_WAIT: u32 = 4;

fn header_id(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 1. Setup Store: Redis when REDIS_URL is set, otherwise in-process
    let store: Arc<dyn SlotStore> = match std::env::var("REDIS_URL") {
        Ok(url) => Arc::new(RedisStore::connect(&url).await.unwrap()),
        Err(_) => Arc::new(MemoryStore::new()),
    };
    let config = SlotConfig::from_env().unwrap();
    let cache = ConcurrencyCache::from_config(store, &config);

    // 2. Setup Managed Layer, one slot per request keyed by the caller's user id
    let next_request = Arc::new(AtomicU64::new(0));
    let managed_layer = ManagedSlotLayer::<_, _, Request>::new(
        cache,
        move |req: &Request| {
            let user_id = header_id(req.headers(), "x-user-id");
            let seq = next_request.fetch_add(1, Ordering::Relaxed);
            SlotRequest::user(user_id, MAX_USER_CONCURRENCY, format!("http-{seq}"))
                .with_wait_queue(user_id, MAX_USER_WAIT)
        },
        Duration::from_secs(3),
    );

    // 3. Build the Router
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "Hello, Slot!"
            }),
        )
        .layer(
            ServiceBuilder::new()
                // 1. The outermost layer: catches BoxError and returns Response
                .layer(HandleErrorLayer::new(handle_slot_error))
                // 2. The middle layer: introduces BoxError
                .layer(managed_layer)
                // 3. Converts the Route's Infallible to BoxError for the managed layer
                .map_err(BoxError::from),
        );

    // 4. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .unwrap();
    println!("📡 Listening on http://127.0.0.1:3000");

    axum::serve(listener, app).await.unwrap();
}

/// The signature must match BoxError -> IntoResponse
async fn handle_slot_error(err: BoxError) -> impl IntoResponse {
    if let Some(slot_err) = err.downcast_ref::<SlotError>() {
        slot_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}
