//! Server TOML config and the per-plant JSON config: loading, validation,
//! and saving.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::bus::MAX_WATERING_MS;
use crate::persist::write_atomic;
use crate::station::PLANT_COUNT;

// ---------------------------------------------------------------------------
// Server config structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub login: LoginConfig,
    pub files: FilesConfig,
    pub mqtt: MqttConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
    /// PEM certificate chain. TLS is used when both cert and key are set.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".into(),
            cert: None,
            key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub user: String,
    pub pass: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            user: "user".into(),
            pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Per-plant JSON config.
    pub config: PathBuf,
    /// History and calibration snapshot.
    pub data: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            config: "plants.json".into(),
            data: "station.json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host. Publishing is disabled when unset.
    pub server: Option<String>,
    pub port: u16,
    pub client_id: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub plant_topics: [String; PLANT_COUNT],
    pub ambient_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: 1883,
            client_id: "plantstation".into(),
            user: None,
            pass: None,
            plant_topics: ["plant1".into(), "plant2".into()],
            ambient_topic: "room".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub i2c_bus: u8,
    pub mcu_address: u16,
    pub ambient_address: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            mcu_address: crate::bus::MCU_ADDRESS,
            ambient_address: 0x44,
        }
    }
}

/// Highest 7-bit I²C address.
const I2C_ADDR_MAX: u16 = 0x7F;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn report(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "config validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }
}

impl ServerConfig {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.http.addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "http.addr {:?} is not a socket address",
                self.http.addr
            ));
        }
        if self.http.cert.is_some() != self.http.key.is_some() {
            errors.push("http.cert and http.key must be set together".into());
        }

        if self.login.user.trim().is_empty() {
            errors.push("login.user is empty".into());
        }
        if self.login.pass.is_empty() {
            errors.push("login.pass is empty".into());
        }

        if self.files.config.as_os_str().is_empty() {
            errors.push("files.config is empty".into());
        }
        if self.files.data.as_os_str().is_empty() {
            errors.push("files.data is empty".into());
        }

        if let Some(server) = &self.mqtt.server {
            if server.trim().is_empty() {
                errors.push("mqtt.server is empty".into());
            }
            if self.mqtt.client_id.trim().is_empty() {
                errors.push("mqtt.client_id is empty".into());
            }
            for (i, topic) in self.mqtt.plant_topics.iter().enumerate() {
                if topic.trim().is_empty() {
                    errors.push(format!("mqtt.plant_topics[{i}] is empty"));
                }
            }
            if self.mqtt.ambient_topic.trim().is_empty() {
                errors.push("mqtt.ambient_topic is empty".into());
            }
        }

        for (name, addr) in [
            ("bus.mcu_address", self.bus.mcu_address),
            ("bus.ambient_address", self.bus.ambient_address),
        ] {
            if addr > I2C_ADDR_MAX {
                errors.push(format!("{name} 0x{addr:02x} is not a 7-bit i2c address"));
            }
        }
        if self.bus.mcu_address == self.bus.ambient_address {
            errors.push("bus.mcu_address and bus.ambient_address collide".into());
        }

        report(errors)
    }
}

/// Read, parse, and validate a TOML server config file.
pub fn load(path: &str) -> Result<ServerConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: ServerConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Plant config
// ---------------------------------------------------------------------------

/// Per-plant watering policy. Weights in sensor units, durations in ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlantConfig {
    /// Local hour (0-23) at which watering is considered.
    pub hour: u32,
    /// Minimum watering duration.
    pub start: i32,
    /// Maximum watering duration.
    pub max: i32,
    /// Water when the weight is at or below this.
    pub low: i32,
    /// Target weight after watering.
    pub dst: i32,
    /// Tolerance band; kept for the status page.
    pub range: i32,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            hour: 7,
            start: 2000,
            max: 20000,
            low: 1400,
            dst: 1500,
            range: 100,
        }
    }
}

impl PlantConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        self.check(&mut errors, "plant");
        report(errors)
    }

    fn check(&self, errors: &mut Vec<String>, ctx: &str) {
        if self.hour > 23 {
            errors.push(format!("{ctx}: hour {} out of range [0, 23]", self.hour));
        }
        if self.start < 0 {
            errors.push(format!("{ctx}: start must not be negative, got {}", self.start));
        }
        if self.max < self.start {
            errors.push(format!(
                "{ctx}: max ({}) is less than start ({})",
                self.max, self.start
            ));
        }
        if self.max > MAX_WATERING_MS {
            errors.push(format!(
                "{ctx}: max ({}) exceeds device limit ({MAX_WATERING_MS})",
                self.max
            ));
        }
        if self.low < 0 {
            errors.push(format!("{ctx}: low must not be negative, got {}", self.low));
        }
        if self.dst < self.low {
            errors.push(format!(
                "{ctx}: dst ({}) is less than low ({})",
                self.dst, self.low
            ));
        }
        if self.range <= 0 {
            errors.push(format!("{ctx}: range must be positive, got {}", self.range));
        }
    }
}

fn validate_plants(configs: &[PlantConfig; PLANT_COUNT]) -> Result<()> {
    let mut errors = Vec::new();
    for (i, c) in configs.iter().enumerate() {
        c.check(&mut errors, &format!("plants[{i}]"));
    }
    report(errors)
}

/// Load both plant configs. A missing file yields defaults.
pub fn load_plant_configs(path: &Path) -> Result<[PlantConfig; PLANT_COUNT]> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no plant config, using defaults");
            return Ok(Default::default());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read plant config: {}", path.display()))
        }
    };
    let configs: [PlantConfig; PLANT_COUNT] = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse plant config: {}", path.display()))?;
    validate_plants(&configs)
        .with_context(|| format!("invalid plant config: {}", path.display()))?;
    Ok(configs)
}

pub fn save_plant_configs(path: &Path, configs: &[PlantConfig; PLANT_COUNT]) -> Result<()> {
    let json = serde_json::to_vec_pretty(configs).context("failed to encode plant config")?;
    write_atomic(path, &json)
        .with_context(|| format!("failed to save plant config: {}", path.display()))
}

/// Apply a partial JSON object on top of `current` and validate the result.
/// Fields missing from `body` keep their current value.
pub fn merge_plant_config(current: &PlantConfig, body: &[u8]) -> Result<PlantConfig> {
    let patch: serde_json::Value = serde_json::from_slice(body).context("body is not JSON")?;
    let serde_json::Value::Object(patch) = patch else {
        bail!("plant config must be a JSON object");
    };

    let mut merged = serde_json::to_value(current).context("failed to encode plant config")?;
    if let serde_json::Value::Object(fields) = &mut merged {
        fields.extend(patch);
    }

    let config: PlantConfig =
        serde_json::from_value(merged).context("invalid plant config fields")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
