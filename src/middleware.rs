/* src/middleware.rs */

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use fancy_log::{LogLevel, log};
use std::net::SocketAddr;
use std::time::Instant;

/// Logs every request line and its response status with latency, in the
/// gateway's `==>` / `<==` format.
pub async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    log(
        LogLevel::Info,
        &format!("==> {} {} from {}", method, path, client),
    );

    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed();

    log(
        LogLevel::Info,
        &format!(
            "<== {} {} - {} - {}ms",
            method,
            path,
            response.status(),
            elapsed.as_millis()
        ),
    );

    response
}
