/* src/pipeline.rs */

use crate::auth::AuthContext;
use crate::error::GatewayError;
use crate::models::RateKey;
use crate::routing::CompiledRoute;
use crate::state::AppState;

/// The closed set of per-route filters, executed in this fixed order. Any
/// rejection short-circuits the request before the dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Auth,
    RateLimit,
    CircuitBreak,
}

pub const FILTER_CHAIN: [Filter; 3] = [Filter::Auth, Filter::RateLimit, Filter::CircuitBreak];

/// Runs the route's resilience pipeline. Returns the validated identity for
/// authenticated routes, `None` for public ones.
pub fn run(
    state: &AppState,
    route: &CompiledRoute,
    bearer: Option<&str>,
    client_ip: &str,
) -> Result<Option<AuthContext>, GatewayError> {
    let mut ctx = None;

    for filter in FILTER_CHAIN {
        match filter {
            Filter::Auth => {
                if !route.auth {
                    continue;
                }
                let Some(token) = bearer else {
                    state.metrics.record_auth_rejection();
                    return Err(GatewayError::Unauthorized(
                        "Missing or invalid Authorization header".to_string(),
                    ));
                };
                let Some(verifier) = &state.auth else {
                    state.metrics.record_auth_rejection();
                    return Err(GatewayError::Unauthorized(
                        "Authentication is not configured".to_string(),
                    ));
                };
                match verifier.validate(token) {
                    Ok(validated) => ctx = Some(validated),
                    Err(e) => {
                        state.metrics.record_auth_rejection();
                        return Err(e);
                    }
                }
            }
            Filter::RateLimit => {
                let Some(params) = &route.rate_limit else {
                    continue;
                };
                let key = match params.key {
                    RateKey::Route => route.pattern.clone(),
                    RateKey::Ip => format!("{}|{}", route.pattern, client_ip),
                };
                if !state.limiter.check(&key, params) {
                    state.metrics.record_rate_limited();
                    return Err(GatewayError::TooManyRequests);
                }
            }
            Filter::CircuitBreak => {
                let backends = state.registry.resolve(&route.service);
                if backends.is_empty() {
                    return Err(GatewayError::ServiceUnavailable(route.service.clone()));
                }
                // Fail fast when every instance's breaker is open; the
                // dispatcher acquires per-backend admission afterwards.
                if !backends
                    .iter()
                    .any(|b| state.breakers.is_admissible(&b.address))
                {
                    state.metrics.record_breaker_rejection();
                    return Err(GatewayError::ServiceUnavailable(route.service.clone()));
                }
            }
        }
    }

    Ok(ctx)
}
