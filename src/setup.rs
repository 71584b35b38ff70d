/* src/setup.rs */

use crate::config;
use anyhow::{Context, Result};
use fancy_log::{LogLevel, log};
use std::fs;

const DEFAULT_CONFIG: &str = r#"
# Rudder gateway configuration.
# Routes map inbound paths to logical services; the registry tracks which
# instances of each service are healthy.

[registry]
# "static": instances below are health-probed on the heartbeat interval.
# "http": instances are pulled as a JSON snapshot from `endpoint`.
mode = "static"
heartbeat_secs = 10
miss_threshold = 3
health_path = "/health"

[[services]]
name = "auth-service"
instances = [{ address = "http://127.0.0.1:8081" }]

[[services]]
name = "job-service"
instances = [
    { address = "http://127.0.0.1:8082", weight = 2 },
    { address = "http://127.0.0.1:8083" },
]

[[services]]
name = "file-service"
instances = [{ address = "http://127.0.0.1:8084" }]

[defaults]
timeout_ms = 10000
retries = 1
# Request bodies above this size stream through and are never retried.
stream_threshold = 262144

# Applied to every route without its own rate limit. 0 requests = no limit.
[defaults.rate_limit]
requests = 10
period = "1s"
burst = 20
key = "ip"

[defaults.breaker]
window = 10
failure_threshold = 5
cooldown_secs = 30
trial_limit = 1

# Public endpoints: no bearer token required.
[[routes]]
path = "/api/v1/auth/login"
match = "exact"
service = "auth-service"
auth = false

[[routes]]
path = "/api/v1/auth/register"
match = "exact"
service = "auth-service"
auth = false

[[routes]]
path = "/api/v1/jobs"
service = "job-service"
auth = false
methods = ["GET"]

# Everything else on the jobs API requires a token.
[[routes]]
path = "/api/v1/jobs"
service = "job-service"

[[routes]]
path = "/api/v1/files"
service = "file-service"
timeout_ms = 30000
rate_limit = { requests = 5, period = "1s", key = "ip" }
"#;

/// Handles the first-run scenario by writing an example configuration.
pub async fn handle_first_run() -> Result<()> {
    log(
        LogLevel::Warn,
        "No routes configured. Performing first-time setup.",
    );

    let (config_path, config_dir) = config::get_config_paths()?;

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory at {:?}", config_dir))?;
    }

    if !config_path.exists() {
        fs::write(&config_path, DEFAULT_CONFIG.trim_start())
            .with_context(|| format!("Failed to write example config at {:?}", config_path))?;
        log(
            LogLevel::Info,
            &format!("Created example config: {:?}", config_path),
        );
    }

    log(
        LogLevel::Info,
        "Set JWT_BASE64_SECRET and GATEWAY_SIGNATURE_SECRET, review the config, then start Rudder again.",
    );
    Ok(())
}
