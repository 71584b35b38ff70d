/* src/config.rs */

use crate::models::{MainConfig, RegistryMode};
use anyhow::{Context, Result, bail};
use fancy_log::{LogLevel, log};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub jwt_base64_secret: Option<String>,
    pub signature_secret: Option<String>,
    pub main: MainConfig,
}

/// Returns the main config file path and its parent directory.
pub fn get_config_paths() -> Result<(PathBuf, PathBuf)> {
    let config_path_str = env::var("CONFIG").unwrap_or_else(|_| "~/rudder/config.toml".to_string());
    let config_path = PathBuf::from(shellexpand::tilde(&config_path_str).into_owned());
    let config_dir = config_path
        .parent()
        .map(PathBuf::from)
        .context("Could not determine config directory")?;
    Ok((config_path, config_dir))
}

pub fn load_config() -> Result<AppConfig> {
    let port = env::var("BIND_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .context("Invalid BIND_PORT")?;

    let jwt_base64_secret = env::var("JWT_BASE64_SECRET").ok();
    let signature_secret = env::var("GATEWAY_SIGNATURE_SECRET").ok();

    let (config_path, _) = get_config_paths()?;

    log(
        LogLevel::Info,
        &format!("Loading config from {:?}", config_path),
    );

    // A missing file is the first-run case; the server handles it.
    if !config_path.exists() {
        return Ok(AppConfig {
            port,
            jwt_base64_secret,
            signature_secret,
            main: empty_main_config(),
        });
    }

    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file at {:?}", config_path))?;
    let main: MainConfig = toml::from_str(&content).context("Failed to parse config file")?;

    validate(&main)?;

    Ok(AppConfig {
        port,
        jwt_base64_secret,
        signature_secret,
        main,
    })
}

/// Structural checks that must hold before any table is compiled. A config
/// failing these aborts startup rather than serving with a partial table.
fn validate(main: &MainConfig) -> Result<()> {
    if main.registry.mode == RegistryMode::Http && main.registry.endpoint.is_none() {
        bail!("Registry mode 'http' requires registry.endpoint");
    }

    if main.registry.mode == RegistryMode::Static {
        for route in &main.routes {
            if !main.services.iter().any(|s| s.name == route.service) {
                bail!(
                    "Route '{}' targets unknown service '{}'",
                    route.path,
                    route.service
                );
            }
        }
    }

    Ok(())
}

fn empty_main_config() -> MainConfig {
    MainConfig {
        registry: crate::models::RegistryConfig {
            mode: RegistryMode::Static,
            endpoint: None,
            heartbeat_secs: 10,
            miss_threshold: 3,
            health_path: "/health".to_string(),
        },
        services: Vec::new(),
        defaults: Default::default(),
        routes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceConfig, RouteConfig, ServiceConfig};

    fn base_config() -> MainConfig {
        let mut main = empty_main_config();
        main.services.push(ServiceConfig {
            name: "job-service".to_string(),
            instances: vec![InstanceConfig {
                address: "http://127.0.0.1:8081".to_string(),
                weight: 1,
            }],
        });
        main.routes.push(RouteConfig {
            path: "/api/v1/jobs".to_string(),
            match_kind: Default::default(),
            methods: Vec::new(),
            service: "job-service".to_string(),
            auth: false,
            timeout_ms: None,
            retries: None,
            retry_safe: None,
            rate_limit: None,
        });
        main
    }

    #[test]
    fn valid_static_config_passes() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn route_to_unknown_service_is_fatal() {
        let mut main = base_config();
        main.routes[0].service = "ghost-service".to_string();
        assert!(validate(&main).is_err());
    }

    #[test]
    fn http_mode_requires_endpoint() {
        let mut main = base_config();
        main.registry.mode = RegistryMode::Http;
        assert!(validate(&main).is_err());
        main.registry.endpoint = Some("http://127.0.0.1:8761/instances".to_string());
        assert!(validate(&main).is_ok());
    }

    #[test]
    fn toml_shape_parses() {
        let main: MainConfig = toml::from_str(
            r#"
            [registry]
            mode = "static"
            heartbeat_secs = 5

            [[services]]
            name = "job-service"
            instances = [{ address = "http://127.0.0.1:8081" }]

            [defaults]
            timeout_ms = 5000

            [defaults.rate_limit]
            requests = 10
            period = "1s"
            burst = 20

            [[routes]]
            path = "/api/v1/jobs"
            service = "job-service"
            auth = false
            methods = ["GET"]
            "#,
        )
        .unwrap();
        assert_eq!(main.routes.len(), 1);
        assert_eq!(main.defaults.timeout_ms, 5000);
        assert_eq!(main.defaults.rate_limit.as_ref().unwrap().burst, Some(20));
        assert!(validate(&main).is_ok());
    }
}
