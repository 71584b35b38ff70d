/* src/routing.rs */

use crate::models::{DefaultsConfig, MatchKind, RouteConfig};
use crate::path_matcher;
use crate::ratelimit::RateLimitParams;
use anyhow::{Context, Result, bail};
use http::Method;
use std::collections::HashSet;
use std::time::Duration;

/// Compiled matcher for one route.
pub enum RouteMatcher {
    Exact(String),
    /// Segment-wise prefix with `*` wildcards.
    Prefix(String),
    Regex(fancy_regex::Regex),
}

/// An immutable, fully resolved routing rule. Per-route overrides are folded
/// in at compile time so the request path never consults the defaults.
pub struct CompiledRoute {
    /// The pattern as written in the config; also the rate-limit key base.
    pub pattern: String,
    pub matcher: RouteMatcher,
    /// `None` means all methods.
    pub methods: Option<HashSet<Method>>,
    pub service: String,
    pub auth: bool,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_safe: Option<bool>,
    pub rate_limit: Option<RateLimitParams>,
}

impl CompiledRoute {
    fn allows_method(&self, method: &Method) -> bool {
        match &self.methods {
            Some(set) => set.contains(method),
            None => true,
        }
    }
}

/// An immutable route table snapshot. Reload builds a whole new table and
/// publishes it through an atomic swap; entries are never mutated in place.
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
    exact: Vec<usize>,
    prefix: Vec<usize>,
    regex: Vec<usize>,
}

impl RouteTable {
    /// Compiles the configured routes, folding gateway defaults into each.
    /// Any invalid pattern, method, or rate-limit period fails the whole
    /// table, so a corrupt config never half-loads.
    pub fn compile(configs: &[RouteConfig], defaults: &DefaultsConfig) -> Result<RouteTable> {
        let mut routes = Vec::with_capacity(configs.len());
        let mut exact = Vec::new();
        let mut prefix = Vec::new();
        let mut regex = Vec::new();

        for cfg in configs {
            if cfg.service.trim().is_empty() {
                bail!("Route '{}' has an empty service name", cfg.path);
            }

            let matcher = match cfg.match_kind {
                MatchKind::Exact => RouteMatcher::Exact(cfg.path.clone()),
                MatchKind::Prefix => RouteMatcher::Prefix(cfg.path.clone()),
                MatchKind::Regex => RouteMatcher::Regex(
                    fancy_regex::Regex::new(&cfg.path)
                        .with_context(|| format!("Invalid route regex '{}'", cfg.path))?,
                ),
            };

            let methods = if cfg.methods.is_empty() {
                None
            } else {
                let mut set = HashSet::new();
                for m in &cfg.methods {
                    let method = m
                        .to_uppercase()
                        .parse::<Method>()
                        .with_context(|| format!("Invalid method '{}' on route '{}'", m, cfg.path))?;
                    set.insert(method);
                }
                Some(set)
            };

            let rate_limit = match cfg.rate_limit.as_ref().or(defaults.rate_limit.as_ref()) {
                Some(rule) => Some(
                    RateLimitParams::from_rule(rule)
                        .with_context(|| format!("Invalid rate limit on route '{}'", cfg.path))?,
                ),
                None => None,
            };

            let idx = routes.len();
            match cfg.match_kind {
                MatchKind::Exact => exact.push(idx),
                MatchKind::Prefix => prefix.push(idx),
                MatchKind::Regex => regex.push(idx),
            }

            routes.push(CompiledRoute {
                pattern: cfg.path.clone(),
                matcher,
                methods,
                service: cfg.service.clone(),
                auth: cfg.auth,
                timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(defaults.timeout_ms)),
                retries: cfg.retries.unwrap_or(defaults.retries),
                retry_safe: cfg.retry_safe,
                rate_limit,
            });
        }

        Ok(RouteTable {
            routes,
            exact,
            prefix,
            regex,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Matches in precedence order: exact, then prefix (most specific wins,
    /// earlier table order breaking ties), then regex in table order.
    pub fn matches(&self, method: &Method, path: &str) -> Option<&CompiledRoute> {
        for &idx in &self.exact {
            let route = &self.routes[idx];
            if !route.allows_method(method) {
                continue;
            }
            if let RouteMatcher::Exact(p) = &route.matcher
                && p == path
            {
                return Some(route);
            }
        }

        let mut best: Option<(&CompiledRoute, path_matcher::MatchScore)> = None;
        for &idx in &self.prefix {
            let route = &self.routes[idx];
            if !route.allows_method(method) {
                continue;
            }
            if let RouteMatcher::Prefix(p) = &route.matcher
                && let Some(score) = path_matcher::get_match_score(p, path)
            {
                match &best {
                    Some((_, best_score)) if *best_score >= score => {}
                    _ => best = Some((route, score)),
                }
            }
        }
        if let Some((route, _)) = best {
            return Some(route);
        }

        for &idx in &self.regex {
            let route = &self.routes[idx];
            if !route.allows_method(method) {
                continue;
            }
            if let RouteMatcher::Regex(re) = &route.matcher
                && matches!(re.is_match(path), Ok(true))
            {
                return Some(route);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchKind, RateKey, RateLimitRule};

    fn route(path: &str, kind: MatchKind, service: &str) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            match_kind: kind,
            methods: Vec::new(),
            service: service.to_string(),
            auth: false,
            timeout_ms: None,
            retries: None,
            retry_safe: None,
            rate_limit: None,
        }
    }

    fn table(configs: Vec<RouteConfig>) -> RouteTable {
        RouteTable::compile(&configs, &DefaultsConfig::default()).unwrap()
    }

    #[test]
    fn exact_beats_prefix_beats_regex() {
        let t = table(vec![
            route("^/api/v1/.*$", MatchKind::Regex, "regex-svc"),
            route("/api/v1", MatchKind::Prefix, "prefix-svc"),
            route("/api/v1/jobs", MatchKind::Exact, "exact-svc"),
        ]);
        let hit = t.matches(&Method::GET, "/api/v1/jobs").unwrap();
        assert_eq!(hit.service, "exact-svc");

        let hit = t.matches(&Method::GET, "/api/v1/companies").unwrap();
        assert_eq!(hit.service, "prefix-svc");
    }

    #[test]
    fn most_specific_prefix_wins() {
        let t = table(vec![
            route("/api", MatchKind::Prefix, "broad"),
            route("/api/v1/jobs", MatchKind::Prefix, "narrow"),
        ]);
        let hit = t.matches(&Method::GET, "/api/v1/jobs/42").unwrap();
        assert_eq!(hit.service, "narrow");
    }

    #[test]
    fn equal_specificity_resolves_by_table_order() {
        let t = table(vec![
            route("/api/*/jobs", MatchKind::Prefix, "first"),
            route("/api/v1/*", MatchKind::Prefix, "second"),
        ]);
        // Both score two exact segments out of three; ties keep the
        // earlier rule.
        let hit = t.matches(&Method::GET, "/api/v1/jobs").unwrap();
        assert_eq!(hit.service, "first");
    }

    #[test]
    fn method_set_is_honored() {
        let mut cfg = route("/api/v1/jobs", MatchKind::Exact, "jobs");
        cfg.methods = vec!["get".to_string(), "HEAD".to_string()];
        let t = table(vec![cfg]);
        assert!(t.matches(&Method::GET, "/api/v1/jobs").is_some());
        assert!(t.matches(&Method::POST, "/api/v1/jobs").is_none());
    }

    #[test]
    fn regex_tier_matches_when_others_miss() {
        let t = table(vec![route(
            r"^/files/[0-9a-f]{8}$",
            MatchKind::Regex,
            "file-service",
        )]);
        assert!(t.matches(&Method::GET, "/files/deadbeef").is_some());
        assert!(t.matches(&Method::GET, "/files/nope").is_none());
    }

    #[test]
    fn bad_regex_fails_compilation() {
        let result = RouteTable::compile(
            &[route("([unclosed", MatchKind::Regex, "svc")],
            &DefaultsConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn bad_period_fails_compilation() {
        let mut cfg = route("/api", MatchKind::Prefix, "svc");
        cfg.rate_limit = Some(RateLimitRule {
            requests: 10,
            period: "fortnight".to_string(),
            burst: None,
            key: RateKey::Route,
        });
        let result = RouteTable::compile(&[cfg], &DefaultsConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn matching_is_deterministic() {
        let t = table(vec![
            route("/api/v1", MatchKind::Prefix, "a"),
            route("/api/v1/jobs", MatchKind::Prefix, "b"),
        ]);
        let first = t.matches(&Method::GET, "/api/v1/jobs").unwrap().service.clone();
        for _ in 0..50 {
            assert_eq!(
                t.matches(&Method::GET, "/api/v1/jobs").unwrap().service,
                first
            );
        }
    }
}
