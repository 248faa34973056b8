//! Portal configuration
//!
//! Options come from a JSON file (`/data/options.json`, or `EV_OPTIONS_PATH`)
//! layered under `EV_`-prefixed environment variables, then validated into a
//! [`PortalConfig`]. Credentials are never logged.

use anyhow::{Context, Result, bail};
use common::database::DatabaseConfig;
use common::mqtt::MqttConfig;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::lifecycle::EngineSettings;
use crate::square::SquareConfig;
use crate::validation::validate_identifier;

pub const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_HTTP_PORT: u16 = 8090;
const DEFAULT_CHARGE_CENTS: i64 = 100;

/// Raw options as written by the operator
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Options {
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<Value>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub home_id: Option<String>,
    pub charger_id: Option<String>,
    pub default_charger_id: Option<String>,
    pub square_sandbox: Option<bool>,
    pub square_sandbox_app_id: Option<String>,
    pub square_sandbox_access_token: Option<String>,
    pub square_production_app_id: Option<String>,
    pub square_production_access_token: Option<String>,
    pub square_location_id: Option<String>,
    pub square_charge_cents: Option<i64>,
    pub db_path: Option<String>,
    pub admin_enabled: Option<bool>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub http_port: Option<u16>,
    pub response_timeout_secs: Option<u64>,
    pub processor_timeout_secs: Option<u64>,
    pub publish_timeout_secs: Option<u64>,
    pub pending_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Wait for booking and activation responses
    pub response: Duration,
    pub processor: Duration,
    pub publish: Duration,
    pub pending_ttl: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(15),
            processor: Duration::from_secs(10),
            publish: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl Timeouts {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            processor_timeout: self.processor,
            pending_ttl: self.pending_ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub bind_addr: SocketAddr,
    pub home_id: String,
    /// Charger used when `/start` names none
    pub charger_id: String,
    /// None disables the bus; `/start` then answers 503
    pub mqtt: Option<MqttConfig>,
    pub square: SquareConfig,
    /// Hold amount when the booking response carries none
    pub charge_cents: i64,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub timeouts: Timeouts,
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn mqtt_port(raw: Option<&Value>) -> u16 {
    let parsed = match raw {
        None => return DEFAULT_MQTT_PORT,
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    match parsed.and_then(|p| u16::try_from(p).ok()).filter(|p| *p > 0) {
        Some(port) => port,
        None => {
            warn!("Invalid mqtt_port ({:?}), falling back to {}", raw, DEFAULT_MQTT_PORT);
            DEFAULT_MQTT_PORT
        }
    }
}

impl PortalConfig {
    /// Load from `EV_OPTIONS_PATH` or the default options file
    pub fn load() -> Result<Self> {
        let path = std::env::var("EV_OPTIONS_PATH").unwrap_or_else(|_| DEFAULT_OPTIONS_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        info!("Options file: {}", path.display());
        if !path.exists() {
            bail!(
                "Options file not found: {}. Set EV_OPTIONS_PATH to point at your options file.",
                path.display()
            );
        }

        let options: Options = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json))
            .add_source(Environment::with_prefix("EV").try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read {}", path.display()))?
            .try_deserialize()
            .context("Invalid options")?;

        Self::from_options(options, path)
    }

    /// Validate raw options; relative paths resolve against `options_path`
    pub fn from_options(options: Options, options_path: &Path) -> Result<Self> {
        let mut database = DatabaseConfig::from_env()?;
        let db_path = trimmed(options.db_path.clone());
        if !db_path.is_empty() {
            let candidate = PathBuf::from(&db_path);
            database.database_path = if candidate.is_absolute() {
                db_path
            } else {
                let base = options_path.parent().unwrap_or_else(|| Path::new("."));
                base.join(candidate).to_string_lossy().into_owned()
            };
        }

        let sandbox = options.square_sandbox.unwrap_or(true);
        let (app_id, access_token, fields) = if sandbox {
            (
                trimmed(options.square_sandbox_app_id),
                trimmed(options.square_sandbox_access_token),
                "square_sandbox_app_id / square_sandbox_access_token",
            )
        } else {
            (
                trimmed(options.square_production_app_id),
                trimmed(options.square_production_access_token),
                "square_production_app_id / square_production_access_token",
            )
        };
        if app_id.is_empty() || access_token.is_empty() {
            bail!("square_sandbox={}: {} must both be set", sandbox, fields);
        }

        let charge_cents = options
            .square_charge_cents
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_CHARGE_CENTS);

        let home_id = trimmed(options.home_id);
        let mut charger_id = trimmed(options.charger_id);
        if charger_id.is_empty() {
            charger_id = trimmed(options.default_charger_id);
        }
        if !charger_id.is_empty() {
            validate_identifier("charger_id", &charger_id).map_err(anyhow::Error::msg)?;
        }

        let mut timeouts = Timeouts::default();
        if let Some(secs) = options.response_timeout_secs.filter(|s| *s > 0) {
            timeouts.response = Duration::from_secs(secs);
        }
        if let Some(secs) = options.processor_timeout_secs.filter(|s| *s > 0) {
            timeouts.processor = Duration::from_secs(secs);
        }
        if let Some(secs) = options.publish_timeout_secs.filter(|s| *s > 0) {
            timeouts.publish = Duration::from_secs(secs);
        }
        if let Some(secs) = options.pending_ttl_secs.filter(|s| *s > 0) {
            timeouts.pending_ttl = Duration::from_secs(secs);
        }

        let mqtt_host = trimmed(options.mqtt_host);
        let port = mqtt_port(options.mqtt_port.as_ref());
        let mqtt = if mqtt_host.is_empty() {
            warn!("mqtt_host not set; MQTT functionality is disabled until configured");
            None
        } else {
            validate_identifier("home_id", &home_id)
                .map_err(|e| anyhow::anyhow!("{} (required when mqtt_host is set)", e))?;
            let mut mqtt = MqttConfig::new(mqtt_host, port, format!("ev-portal-{}", home_id));
            mqtt.username = options.mqtt_username.filter(|u| !u.trim().is_empty());
            mqtt.password = options.mqtt_password;
            mqtt.publish_timeout = timeouts.publish;
            Some(mqtt)
        };

        let admin_enabled = options.admin_enabled.unwrap_or(true);
        let admin_password = options.admin_password.unwrap_or_default();
        if admin_enabled && admin_password.is_empty() {
            bail!("admin_enabled is true but admin_password is not set; set admin_password or disable admin");
        }
        let admin_username = trimmed(options.admin_username);

        let config = Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], options.http_port.unwrap_or(DEFAULT_HTTP_PORT))),
            home_id,
            charger_id,
            mqtt,
            square: SquareConfig {
                sandbox,
                app_id,
                access_token,
                location_id: trimmed(options.square_location_id),
                currency: "USD".to_string(),
            },
            charge_cents,
            database,
            admin: AdminConfig {
                enabled: admin_enabled,
                username: if admin_username.is_empty() {
                    "admin".to_string()
                } else {
                    admin_username
                },
                password: admin_password,
            },
            timeouts,
        };
        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        info!("DB path: {}", self.database.database_path);
        info!(
            "Square environment: {}",
            if self.square.sandbox { "sandbox" } else { "production" }
        );
        match &self.mqtt {
            Some(mqtt) => info!("MQTT broker: {}:{}", mqtt.host, mqtt.port),
            None => info!("MQTT broker: (not set)"),
        }
        info!("Home / charger: {} / {}", self.home_id, self.charger_id);
        info!(
            "Admin interface: {}",
            if self.admin.enabled { "enabled" } else { "disabled" }
        );
    }
}
