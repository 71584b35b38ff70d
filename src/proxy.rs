/* src/proxy.rs */

use crate::breaker::Admission;
use crate::error::GatewayError;
use crate::pipeline;
use crate::state::AppState;
use axum::{
    body::{Body, HttpBody, to_bytes},
    extract::{ConnectInfo, State},
    http::{Request, Uri, Version, header},
    response::Response,
};
use axum_extra::typed_header::TypedHeader;
use bytes::Bytes;
use fancy_log::{LogLevel, log};
use headers::{Authorization, authorization::Bearer};
use http::Method;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

const IP_HEADERS_TO_CLEAN: &[&str] = &[
    "x-real-ip",
    "x-forwarded-for",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// Request payload prepared for dispatch. Buffered bodies can be replayed
/// across retry attempts; a streaming body is handed over exactly once.
enum Payload {
    Buffered(Bytes),
    Streaming(Option<Body>),
}

#[axum::debug_handler]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request<Body>,
) -> Result<Response, GatewayError> {
    state.metrics.record_request();
    let started = Instant::now();

    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let table = state.routes.load_full();
    let Some(route) = table.matches(&method, &path) else {
        let err = GatewayError::RouteNotFound;
        state.metrics.record_outcome(
            &path,
            "-",
            None,
            err.status().as_u16(),
            started.elapsed().as_millis() as u64,
        );
        return Err(err);
    };

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    let bearer = auth_header.as_ref().map(|TypedHeader(a)| a.token());
    let ctx = match pipeline::run(
        &state,
        route,
        bearer,
        client_ip.as_deref().unwrap_or("unknown"),
    ) {
        Ok(ctx) => ctx,
        Err(err) => {
            state.metrics.record_outcome(
                &route.pattern,
                &route.service,
                None,
                err.status().as_u16(),
                started.elapsed().as_millis() as u64,
            );
            return Err(err);
        }
    };

    // Keep the path and query as an owned string so the request can be
    // consumed into parts below.
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_owned();

    let (mut parts, body) = req.into_parts();

    // Clean identity and IP headers the gateway owns, then stamp the real
    // client address and the validated user context.
    for h in IP_HEADERS_TO_CLEAN {
        parts.headers.remove(*h);
    }
    for h in crate::auth::CONTEXT_HEADERS {
        parts.headers.remove(*h);
    }
    if let Some(ip) = &client_ip
        && let Ok(value) = ip.parse()
    {
        parts.headers.insert("x-forwarded-for", value);
    }
    if let (Some(ctx), Some(verifier)) = (&ctx, &state.auth) {
        verifier.apply_context_headers(&mut parts.headers, ctx);
    }

    let retry_safe = route.retry_safe.unwrap_or(matches!(
        method,
        Method::GET | Method::HEAD | Method::OPTIONS
    ));

    // Only bodies known to fit the replay threshold are buffered; oversized
    // or unsized bodies stream through in a single attempt. The size hint
    // keeps header-less empty bodies (plain GETs) on the buffered path.
    let threshold = state.config.main.defaults.stream_threshold;
    let known_size = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or_else(|| HttpBody::size_hint(&body).exact());
    let buffer_body = known_size.map(|len| len <= threshold).unwrap_or(false);

    let mut payload = if buffer_body {
        let bytes = to_bytes(body, threshold as usize)
            .await
            .map_err(|e| GatewayError::BadGateway(e.into()))?;
        Payload::Buffered(bytes)
    } else {
        Payload::Streaming(Some(body))
    };

    let max_attempts = match payload {
        Payload::Buffered(_) if retry_safe => 1 + route.retries,
        _ => 1,
    };

    let mut tried: HashSet<String> = HashSet::new();
    let mut last_error: Option<GatewayError> = None;
    // An upstream 5xx kept around in case every other instance also fails;
    // relaying it beats masking it behind a gateway error.
    let mut last_response: Option<(String, Response)> = None;

    for attempt in 0..max_attempts {
        // Re-resolve each attempt: a backend may have gone DOWN since the
        // last selection.
        let selection = loop {
            let candidates: Vec<_> = state
                .registry
                .resolve(&route.service)
                .into_iter()
                .filter(|b| !tried.contains(&b.address))
                .collect();
            match state.balancer.pick(&route.service, &candidates) {
                None => break None,
                Some(b) => match state.breakers.try_acquire(&b.address, &state.breaker_params) {
                    Admission::Rejected => {
                        tried.insert(b.address.clone());
                        continue;
                    }
                    Admission::Allowed => break Some((b, None)),
                    Admission::Trial(probe) => break Some((b, Some(probe))),
                },
            }
        };

        // The probe guard rides along for the attempt: settling through
        // on_success/on_failure decides the breaker state, and an attempt
        // abandoned before settling (URI failure, cancellation) frees the
        // trial slot when the guard drops.
        let Some((backend, _probe)) = selection else {
            break;
        };

        let attempt_body = match &mut payload {
            Payload::Buffered(bytes) => Body::from(bytes.clone()),
            Payload::Streaming(body) => match body.take() {
                Some(b) => b,
                None => break,
            },
        };

        let target = format!(
            "{}{}",
            backend.address.trim_end_matches('/'),
            path_and_query
        );
        let target_uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                last_error = Some(GatewayError::BadGateway(anyhow::anyhow!(
                    "Invalid target URL '{}': {}",
                    target,
                    e
                )));
                tried.insert(backend.address.clone());
                continue;
            }
        };

        let mut attempt_parts = parts.clone();
        attempt_parts.uri = target_uri;
        attempt_parts.version = Version::HTTP_11;
        let attempt_req = Request::from_parts(attempt_parts, attempt_body);

        log(
            LogLevel::Debug,
            &format!(
                "Dispatching {} {} to {} (attempt {}/{})",
                method,
                path,
                target,
                attempt + 1,
                max_attempts
            ),
        );

        match tokio::time::timeout(route.timeout, state.http_client.request(attempt_req)).await {
            Ok(Ok(response)) => {
                if response.status().is_server_error() {
                    state.breakers.on_failure(&backend.address, &state.breaker_params);
                    state.metrics.record_upstream_failure();
                    tried.insert(backend.address.clone());

                    if attempt + 1 < max_attempts {
                        log(
                            LogLevel::Warn,
                            &format!(
                                "Backend {} returned {}. Trying another instance.",
                                backend.address,
                                response.status()
                            ),
                        );
                        last_response = Some((backend.address.clone(), response.map(Body::new)));
                        continue;
                    }
                    // Last attempt: relay the upstream status as-is.
                    state.metrics.record_outcome(
                        &route.pattern,
                        &route.service,
                        Some(&backend.address),
                        response.status().as_u16(),
                        started.elapsed().as_millis() as u64,
                    );
                    return Ok(response.map(Body::new));
                }

                state.breakers.on_success(&backend.address, &state.breaker_params);
                state.registry.report_success(&route.service, &backend.address);
                state.metrics.record_outcome(
                    &route.pattern,
                    &route.service,
                    Some(&backend.address),
                    response.status().as_u16(),
                    started.elapsed().as_millis() as u64,
                );
                // The response body streams back without buffering.
                return Ok(response.map(Body::new));
            }
            Ok(Err(e)) => {
                log(
                    LogLevel::Warn,
                    &format!("Connection to {} failed: {}", backend.address, e),
                );
                state.registry.report_failure(&route.service, &backend.address);
                state.breakers.on_failure(&backend.address, &state.breaker_params);
                state.metrics.record_upstream_failure();
                tried.insert(backend.address.clone());
                last_error = Some(GatewayError::BadGateway(e.into()));
            }
            Err(_) => {
                log(
                    LogLevel::Warn,
                    &format!(
                        "Backend {} timed out after {:?}",
                        backend.address, route.timeout
                    ),
                );
                state.registry.report_failure(&route.service, &backend.address);
                state.breakers.on_failure(&backend.address, &state.breaker_params);
                state.metrics.record_upstream_failure();
                tried.insert(backend.address.clone());
                last_error = Some(GatewayError::GatewayTimeout(route.service.clone()));
            }
        }
    }

    log(
        LogLevel::Error,
        &format!(
            "All instances of {} failed for {} {}",
            route.service, method, path
        ),
    );

    if let Some((address, response)) = last_response {
        state.metrics.record_outcome(
            &route.pattern,
            &route.service,
            Some(&address),
            response.status().as_u16(),
            started.elapsed().as_millis() as u64,
        );
        return Ok(response);
    }

    let err = last_error.unwrap_or_else(|| GatewayError::ServiceUnavailable(route.service.clone()));
    state.metrics.record_outcome(
        &route.pattern,
        &route.service,
        None,
        err.status().as_u16(),
        started.elapsed().as_millis() as u64,
    );
    Err(err)
}
