//! Local HTTP server with fixed routes for exercising real transfers.
//!
//! Routes:
//! - `GET /hello`: `200` with body `hello world` and an `x-fixture` header.
//! - `* /echo`: `200` echoing the request body (fixed length or chunked), with the
//!   request method in `x-method`.
//! - `* /status/{code}`: empty response with that status.
//! - `GET /redirect`: `302` to `/hello`.
//! - `GET /stall`: accepts the request and never answers.
//! - anything else: `404`.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Body served by `/hello`.
pub const HELLO_BODY: &str = "hello world";

/// Running fixture server; stops accepting when dropped.
#[derive(Debug)]
pub struct FixtureServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FixtureServer {
    /// Bind a loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("failed to bind fixture listener")?;
        let addr = listener.local_addr()?;
        debug!(%addr, "fixture server listening");
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router()).await {
                warn!(error = %err, "fixture server stopped");
            }
        });
        Ok(Self { addr, task })
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute `http://` URL for `path`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn router() -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/echo", any(echo))
        .route("/status/{code}", any(status))
        .route("/redirect", get(redirect))
        .route("/stall", get(stall))
}

async fn hello() -> impl IntoResponse {
    (
        [("x-fixture", "konnect"), (CONTENT_TYPE.as_str(), "text/plain")],
        HELLO_BODY,
    )
}

async fn echo(method: Method, body: Bytes) -> impl IntoResponse {
    debug!(%method, body_len = body.len(), "fixture echo");
    ([("x-method", method.to_string())], body)
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn redirect() -> impl IntoResponse {
    (StatusCode::FOUND, [(LOCATION, "/hello")])
}

async fn stall() -> StatusCode {
    std::future::pending::<()>().await;
    StatusCode::OK
}
