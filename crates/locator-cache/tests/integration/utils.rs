use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the `locator_cache` crate.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("locator_cache=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    pub async fn with_router(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A presigning endpoint that counts its requests.
///
/// Serves `/presign?key={key}`, responding with `https://cdn.test/{key}?sig=test` for most keys.
/// A few keys trigger failures:
///
/// - `missing`: responds with `404`
/// - `broken`: responds with `500`
/// - `garbage`: responds with a body that is not JSON
/// - `empty`: responds with an empty url
/// - `slow`: responds after 5 seconds
#[derive(Debug)]
pub struct PresignServer {
    server: Server,
    hits: Arc<AtomicUsize>,
}

impl PresignServer {
    pub async fn new() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/presign", get(presign))
            .with_state(Arc::clone(&hits));

        Self {
            server: Server::with_router(router).await,
            hits,
        }
    }

    pub fn url(&self) -> Url {
        self.server.url("/presign")
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn locator(key: &str) -> String {
        format!("https://cdn.test/{key}?sig=test")
    }
}

async fn presign(
    State(hits): State<Arc<AtomicUsize>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);

    let key = params.get("key").map(String::as_str).unwrap_or_default();
    match key {
        "missing" => StatusCode::NOT_FOUND.into_response(),
        "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "garbage" => "<html>definitely not json</html>".into_response(),
        "empty" => Json(json!({ "url": "" })).into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "url": PresignServer::locator(key) })).into_response()
        }
        key => Json(json!({ "url": PresignServer::locator(key) })).into_response(),
    }
}
