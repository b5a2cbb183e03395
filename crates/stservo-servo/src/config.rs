use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use stservo_bus::{BusSettings, DEFAULT_BAUDRATE};
use stservo_proto::frame::MAX_SERVO_ID;
use stservo_proto::registers::{ACCEL_MAX, POSITION_MAX, SPEED_MAX};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[servo.{servo}] {key} = {value} outside {min}..={max}")]
    Range { servo: String, key: &'static str, value: f64, min: f64, max: f64 },

    #[error("[servo.{servo}] {reason}")]
    Invalid { servo: String, reason: String },

    #[error("no [servo.<name>] sections configured")]
    NoServos,
}

/// Whole configuration file: optional `[bus]` policy plus one
/// `[servo.<name>]` table per servo.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub servo: BTreeMap<String, ServoSection>,
}

/// One `[servo.<name>]` table as written by the user, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServoSection {
    pub serial: String,
    pub servo_id: i64,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub position_min: i64,
    #[serde(default = "default_position_max")]
    pub position_max: i64,
    pub initial_position: Option<i64>,
    #[serde(default = "default_max_speed")]
    pub max_speed: i64,
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: i64,
    #[serde(default = "default_status_update_interval")]
    pub status_update_interval: f64,
    #[serde(default = "default_temperature_warning")]
    pub temperature_warning: i64,
    #[serde(default = "default_temperature_critical")]
    pub temperature_critical: i64,
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_position_max() -> i64 {
    POSITION_MAX as i64
}

fn default_max_speed() -> i64 {
    SPEED_MAX as i64
}

fn default_max_acceleration() -> i64 {
    ACCEL_MAX as i64
}

fn default_status_update_interval() -> f64 {
    1.0
}

fn default_temperature_warning() -> i64 {
    70
}

fn default_temperature_critical() -> i64 {
    85
}

/// Validated, immutable per-servo configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServoConfig {
    pub name: String,
    pub serial: String,
    pub baudrate: u32,
    pub servo_id: u8,
    pub position_min: u16,
    pub position_max: u16,
    pub initial_position: Option<u16>,
    pub max_speed: u16,
    pub max_acceleration: u8,
    pub status_update_interval: Duration,
    pub temperature_warning: u8,
    pub temperature_critical: u8,
}

impl ServoConfig {
    /// Defaults for everything but the bus address.
    pub fn new(name: &str, serial: &str, servo_id: u8) -> Self {
        Self {
            name: name.to_string(),
            serial: serial.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            servo_id,
            position_min: 0,
            position_max: POSITION_MAX,
            initial_position: None,
            max_speed: SPEED_MAX,
            max_acceleration: ACCEL_MAX,
            status_update_interval: Duration::from_secs(1),
            temperature_warning: 70,
            temperature_critical: 85,
        }
    }

    pub fn contains(&self, position: i64) -> bool {
        (self.position_min as i64..=self.position_max as i64).contains(&position)
    }
}

impl HostConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Validates every servo section, in name order.
    pub fn servos(&self) -> Result<Vec<ServoConfig>, ConfigError> {
        if self.servo.is_empty() {
            return Err(ConfigError::NoServos);
        }
        self.servo.iter().map(|(name, s)| s.validate(name)).collect()
    }
}

impl ServoSection {
    pub fn validate(&self, name: &str) -> Result<ServoConfig, ConfigError> {
        let range = |key: &'static str, value: i64, min: i64, max: i64| {
            if (min..=max).contains(&value) {
                Ok(value)
            } else {
                Err(ConfigError::Range {
                    servo: name.to_string(),
                    key,
                    value: value as f64,
                    min: min as f64,
                    max: max as f64,
                })
            }
        };
        let invalid = |reason: String| ConfigError::Invalid { servo: name.to_string(), reason };

        if self.serial.trim().is_empty() {
            return Err(invalid("serial must name a port".into()));
        }
        let servo_id = range("servo_id", self.servo_id, 0, MAX_SERVO_ID as i64)? as u8;
        let position_min = range("position_min", self.position_min, 0, POSITION_MAX as i64)? as u16;
        let position_max = range("position_max", self.position_max, 0, POSITION_MAX as i64)? as u16;
        if position_min >= position_max {
            return Err(invalid(format!(
                "position_min ({position_min}) must be less than position_max ({position_max})"
            )));
        }
        let initial_position = match self.initial_position {
            Some(p) => {
                let p = range("initial_position", p, position_min as i64, position_max as i64)?;
                Some(p as u16)
            }
            None => None,
        };
        let max_speed = range("max_speed", self.max_speed, 0, SPEED_MAX as i64)? as u16;
        let max_acceleration =
            range("max_acceleration", self.max_acceleration, 0, ACCEL_MAX as i64)? as u8;

        let interval = self.status_update_interval;
        if !(0.1..=10.0).contains(&interval) {
            return Err(ConfigError::Range {
                servo: name.to_string(),
                key: "status_update_interval",
                value: interval,
                min: 0.1,
                max: 10.0,
            });
        }

        let temperature_warning =
            range("temperature_warning", self.temperature_warning, 0, 100)? as u8;
        let temperature_critical =
            range("temperature_critical", self.temperature_critical, 0, 100)? as u8;
        if temperature_warning > temperature_critical {
            return Err(invalid(format!(
                "temperature_warning ({temperature_warning}) must not exceed \
                 temperature_critical ({temperature_critical})"
            )));
        }
        if self.baudrate == 0 {
            return Err(invalid("baudrate must be positive".into()));
        }

        Ok(ServoConfig {
            name: name.to_string(),
            serial: self.serial.clone(),
            baudrate: self.baudrate,
            servo_id,
            position_min,
            position_max,
            initial_position,
            max_speed,
            max_acceleration,
            status_update_interval: Duration::from_secs_f64(interval),
            temperature_warning,
            temperature_critical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [bus]
        transaction_timeout_ms = 50

        [servo.gripper]
        serial = "/dev/ttyUSB0"
        servo_id = 1
        position_min = 500
        position_max = 3500
        initial_position = 2048

        [servo.pan]
        serial = "/dev/ttyUSB0"
        servo_id = 2
    "#;

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = HostConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.bus.transaction_timeout_ms, 50);
        assert_eq!(cfg.bus.attempts, 3);

        let servos = cfg.servos().unwrap();
        let gripper = &servos[0];
        assert_eq!(gripper.name, "gripper");
        assert_eq!((gripper.position_min, gripper.position_max), (500, 3500));
        assert_eq!(gripper.initial_position, Some(2048));
        assert_eq!(gripper.baudrate, 1_000_000);

        let pan = &servos[1];
        assert_eq!((pan.position_min, pan.position_max), (0, 4095));
        assert_eq!(pan.max_speed, 3400);
        assert_eq!(pan.max_acceleration, 254);
        assert_eq!(pan.status_update_interval, Duration::from_secs(1));
        assert_eq!((pan.temperature_warning, pan.temperature_critical), (70, 85));
    }

    #[test]
    fn inverted_bounds_are_a_load_error() {
        let cfg = HostConfig::from_toml_str(
            "[servo.x]\nserial = \"/dev/ttyUSB0\"\nservo_id = 1\n\
             position_min = 3000\nposition_max = 3000\n",
        )
        .unwrap();
        assert!(matches!(cfg.servos(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            ("servo_id = 254", "servo_id"),
            ("max_speed = 4000", "max_speed"),
            ("max_acceleration = 255", "max_acceleration"),
            ("status_update_interval = 0.0", "status_update_interval"),
            ("initial_position = 4095\nposition_max = 4000", "initial_position"),
        ];
        for (extra, key) in cases {
            let text = format!("[servo.x]\nserial = \"/dev/ttyUSB0\"\nservo_id = 1\n{extra}\n")
                .replacen("servo_id = 1\nservo_id = 254", "servo_id = 254", 1);
            let cfg = HostConfig::from_toml_str(&text).unwrap();
            match cfg.servos() {
                Err(ConfigError::Range { key: k, .. }) => assert_eq!(k, key),
                other => panic!("{extra}: expected range error, got {other:?}"),
            }
        }
    }

    #[test]
    fn warning_above_critical_is_rejected() {
        let cfg = HostConfig::from_toml_str(
            "[servo.x]\nserial = \"/dev/ttyUSB0\"\nservo_id = 1\ntemperature_warning = 90\n",
        )
        .unwrap();
        assert!(matches!(cfg.servos(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn unknown_keys_and_empty_configs_fail() {
        let unknown = "[servo.x]\nserial = \"a\"\nservo_id = 1\nspeed = 3\n";
        assert!(HostConfig::from_toml_str(unknown).is_err());
        let empty = HostConfig::from_toml_str("").unwrap();
        assert!(matches!(empty.servos(), Err(ConfigError::NoServos)));
    }
}
