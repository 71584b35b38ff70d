/* src/registry.rs */

use crate::models::{RegistryConfig, RegistryMode, ServiceConfig};
use dashmap::DashMap;
use fancy_log::{LogLevel, log};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

/// Health of one backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Never probed yet. Resolvable, so a cold start is not a total outage.
    Unknown,
    Up,
    Down,
}

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_UP: u8 = 1;
const HEALTH_DOWN: u8 = 2;

/// One network-addressable replica of a downstream service. Health is only
/// mutated by heartbeat processing and failure reports.
pub struct Backend {
    pub address: String,
    pub weight: u32,
    health: AtomicU8,
    misses: AtomicU32,
}

impl Backend {
    pub fn new(address: String, weight: u32, health: Health) -> Backend {
        Backend {
            address,
            weight,
            health: AtomicU8::new(match health {
                Health::Unknown => HEALTH_UNKNOWN,
                Health::Up => HEALTH_UP,
                Health::Down => HEALTH_DOWN,
            }),
            misses: AtomicU32::new(0),
        }
    }

    pub fn health(&self) -> Health {
        match self.health.load(Ordering::Acquire) {
            HEALTH_UP => Health::Up,
            HEALTH_DOWN => Health::Down,
            _ => Health::Unknown,
        }
    }

    fn set_health(&self, health: Health) {
        let raw = match health {
            Health::Unknown => HEALTH_UNKNOWN,
            Health::Up => HEALTH_UP,
            Health::Down => HEALTH_DOWN,
        };
        self.health.store(raw, Ordering::Release);
    }
}

/// Live mapping from logical service name to its backend instances.
///
/// Lookup filters out DOWN instances. An instance that misses
/// `miss_threshold` consecutive heartbeats is demoted to DOWN and excluded
/// from resolution until a heartbeat succeeds again.
pub struct Registry {
    services: DashMap<String, Vec<Arc<Backend>>>,
    miss_threshold: u32,
}

impl Registry {
    pub fn new(miss_threshold: u32) -> Registry {
        Registry {
            services: DashMap::new(),
            miss_threshold: miss_threshold.max(1),
        }
    }

    /// Seeds the registry from static config. Instances start UNKNOWN until
    /// the first heartbeat settles them.
    pub fn from_static(services: &[ServiceConfig], miss_threshold: u32) -> Registry {
        let registry = Registry::new(miss_threshold);
        for svc in services {
            let backends = svc
                .instances
                .iter()
                .map(|i| Arc::new(Backend::new(i.address.clone(), i.weight, Health::Unknown)))
                .collect();
            registry.services.insert(svc.name.clone(), backends);
        }
        registry
    }

    /// Returns the service's non-DOWN instances, in registration order.
    /// Never blocks on I/O; an empty result surfaces upstream as a 503.
    pub fn resolve(&self, service: &str) -> Vec<Arc<Backend>> {
        match self.services.get(service) {
            Some(backends) => backends
                .iter()
                .filter(|b| b.health() != Health::Down)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn report_success(&self, service: &str, address: &str) {
        if let Some(backend) = self.find(service, address) {
            backend.misses.store(0, Ordering::Release);
            if backend.health() != Health::Up {
                log(
                    LogLevel::Info,
                    &format!("Instance {} of {} is UP", address, service),
                );
            }
            backend.set_health(Health::Up);
        }
    }

    /// Records a missed heartbeat or failed call; demotes the instance once
    /// the consecutive-miss threshold is reached.
    pub fn report_failure(&self, service: &str, address: &str) {
        if let Some(backend) = self.find(service, address) {
            let misses = backend.misses.fetch_add(1, Ordering::AcqRel) + 1;
            if misses >= self.miss_threshold && backend.health() != Health::Down {
                backend.set_health(Health::Down);
                log(
                    LogLevel::Warn,
                    &format!(
                        "Instance {} of {} is DOWN after {} consecutive misses",
                        address, service, misses
                    ),
                );
            }
        }
    }

    /// Replaces a service's membership wholesale (discovery-snapshot mode).
    /// Instances surviving the swap keep their health and miss counts; new
    /// addresses start with the snapshot's advertised health.
    pub fn replace_instances(&self, service: &str, incoming: Vec<(String, u32, Health)>) {
        let existing: HashMap<String, Arc<Backend>> = match self.services.get(service) {
            Some(backends) => backends
                .iter()
                .map(|b| (b.address.clone(), b.clone()))
                .collect(),
            None => HashMap::new(),
        };

        let backends: Vec<Arc<Backend>> = incoming
            .into_iter()
            .map(|(address, weight, health)| match existing.get(&address) {
                Some(kept) if kept.weight == weight => kept.clone(),
                _ => Arc::new(Backend::new(address, weight, health)),
            })
            .collect();

        self.services.insert(service.to_string(), backends);
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Every known (service, backend) pair, for the static-mode prober.
    pub fn all_backends(&self) -> Vec<(String, Arc<Backend>)> {
        let mut out = Vec::new();
        for entry in self.services.iter() {
            for backend in entry.value() {
                out.push((entry.key().clone(), backend.clone()));
            }
        }
        out
    }

    fn find(&self, service: &str, address: &str) -> Option<Arc<Backend>> {
        self.services
            .get(service)?
            .iter()
            .find(|b| b.address == address)
            .cloned()
    }
}

/// One instance entry in a discovery snapshot.
#[derive(Debug, Deserialize)]
struct SnapshotInstance {
    address: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_snapshot_weight")]
    weight: u32,
}

fn default_snapshot_weight() -> u32 {
    1
}

fn snapshot_health(status: Option<&str>) -> Health {
    match status.map(|s| s.to_ascii_uppercase()) {
        Some(s) if s == "UP" => Health::Up,
        Some(s) if s == "DOWN" => Health::Down,
        _ => Health::Unknown,
    }
}

/// Spawns the single background refresher task. Static mode probes each
/// instance's health endpoint; HTTP mode pulls a membership snapshot from
/// the discovery endpoint and reconciles it into the registry.
pub fn spawn_refresher(
    registry: Arc<Registry>,
    config: RegistryConfig,
) -> tokio::task::JoinHandle<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.heartbeat_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match config.mode {
                RegistryMode::Static => {
                    probe_static(&registry, &client, &config.health_path).await;
                }
                RegistryMode::Http => {
                    if let Some(endpoint) = &config.endpoint {
                        pull_snapshot(&registry, &client, endpoint).await;
                    }
                }
            }
        }
    })
}

async fn probe_static(registry: &Registry, client: &reqwest::Client, health_path: &str) {
    for (service, backend) in registry.all_backends() {
        let url = format!(
            "{}{}",
            backend.address.trim_end_matches('/'),
            health_path
        );
        let healthy = match client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        if healthy {
            registry.report_success(&service, &backend.address);
        } else {
            registry.report_failure(&service, &backend.address);
        }
    }
}

async fn pull_snapshot(registry: &Registry, client: &reqwest::Client, endpoint: &str) {
    let snapshot: HashMap<String, Vec<SnapshotInstance>> = match client.get(endpoint).send().await {
        Ok(resp) => match resp.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                log(
                    LogLevel::Warn,
                    &format!("Discovery snapshot from {} is malformed: {}", endpoint, e),
                );
                return;
            }
        },
        Err(e) => {
            log(
                LogLevel::Warn,
                &format!("Discovery pull from {} failed: {}", endpoint, e),
            );
            return;
        }
    };

    for (service, instances) in snapshot {
        let incoming = instances
            .into_iter()
            .map(|i| {
                let health = snapshot_health(i.status.as_deref());
                (i.address, i.weight, health)
            })
            .collect();
        registry.replace_instances(&service, incoming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceConfig;

    fn seeded() -> Registry {
        Registry::from_static(
            &[ServiceConfig {
                name: "job-service".to_string(),
                instances: vec![
                    InstanceConfig {
                        address: "http://127.0.0.1:8081".to_string(),
                        weight: 1,
                    },
                    InstanceConfig {
                        address: "http://127.0.0.1:8082".to_string(),
                        weight: 1,
                    },
                ],
            }],
            3,
        )
    }

    #[test]
    fn unknown_instances_resolve_on_cold_start() {
        let r = seeded();
        assert_eq!(r.resolve("job-service").len(), 2);
    }

    #[test]
    fn unknown_service_resolves_empty() {
        let r = seeded();
        assert!(r.resolve("ghost-service").is_empty());
    }

    #[test]
    fn down_instances_are_never_resolved() {
        let r = seeded();
        for _ in 0..3 {
            r.report_failure("job-service", "http://127.0.0.1:8081");
        }
        let resolved = r.resolve("job-service");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].address, "http://127.0.0.1:8082");
        assert!(resolved.iter().all(|b| b.health() != Health::Down));
    }

    #[test]
    fn misses_below_threshold_keep_instance_resolvable() {
        let r = seeded();
        r.report_failure("job-service", "http://127.0.0.1:8081");
        r.report_failure("job-service", "http://127.0.0.1:8081");
        assert_eq!(r.resolve("job-service").len(), 2);
    }

    #[test]
    fn success_resets_the_miss_streak() {
        let r = seeded();
        r.report_failure("job-service", "http://127.0.0.1:8081");
        r.report_failure("job-service", "http://127.0.0.1:8081");
        r.report_success("job-service", "http://127.0.0.1:8081");
        r.report_failure("job-service", "http://127.0.0.1:8081");
        r.report_failure("job-service", "http://127.0.0.1:8081");
        // Still only two consecutive misses since the success.
        assert_eq!(r.resolve("job-service").len(), 2);
    }

    #[test]
    fn heartbeat_revives_a_down_instance() {
        let r = seeded();
        for _ in 0..3 {
            r.report_failure("job-service", "http://127.0.0.1:8081");
        }
        assert_eq!(r.resolve("job-service").len(), 1);
        r.report_success("job-service", "http://127.0.0.1:8081");
        assert_eq!(r.resolve("job-service").len(), 2);
    }

    #[test]
    fn snapshot_replace_preserves_surviving_state() {
        let r = seeded();
        for _ in 0..3 {
            r.report_failure("job-service", "http://127.0.0.1:8081");
        }
        r.replace_instances(
            "job-service",
            vec![
                ("http://127.0.0.1:8081".to_string(), 1, Health::Up),
                ("http://127.0.0.1:9090".to_string(), 1, Health::Unknown),
            ],
        );
        // 8081 kept its DOWN health (snapshot status only applies to new
        // addresses), 8082 was dropped, 9090 joined as UNKNOWN.
        let resolved = r.resolve("job-service");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].address, "http://127.0.0.1:9090");
    }

    #[test]
    fn snapshot_status_parsing() {
        assert_eq!(snapshot_health(Some("UP")), Health::Up);
        assert_eq!(snapshot_health(Some("up")), Health::Up);
        assert_eq!(snapshot_health(Some("DOWN")), Health::Down);
        assert_eq!(snapshot_health(Some("STARTING")), Health::Unknown);
        assert_eq!(snapshot_health(None), Health::Unknown);
    }
}
