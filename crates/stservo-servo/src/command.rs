//! Textual servo commands: `STSERVO_MOVE SERVO=gripper POSITION=3000 WAIT=2`.
//!
//! Every command is parsed into a typed value before any servo is touched,
//! so malformed or out-of-range parameters never reach the bus.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use stservo_proto::registers::{ACCEL_MAX, POSITION_MAX, SPEED_MAX};
use stservo_proto::{ServoPhase, ServoStatus};

use crate::error::ServoError;

/// Longest accepted `WAIT`.
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("{command}: missing parameter {key}")]
    Missing { command: &'static str, key: &'static str },

    #[error("{command}: unexpected parameter {key}")]
    Unexpected { command: &'static str, key: String },

    #[error("malformed parameter '{0}', expected KEY=value")]
    Malformed(String),

    #[error("{key}: cannot parse '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("{key}={value} outside {min}..={max}")]
    Range { key: &'static str, value: String, min: String, max: String },

    #[error("unknown servo '{0}'")]
    UnknownServo(String),

    #[error(transparent)]
    Servo(#[from] ServoError),
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Range { .. } => "RangeError",
            CommandError::UnknownServo(_) => "UnknownServo",
            CommandError::Servo(e) => e.kind(),
            _ => "CommandError",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveParams {
    pub servo: String,
    pub position: u16,
    pub speed: Option<u16>,
    pub accel: Option<u8>,
    /// `None` returns right after the move is queued.
    pub wait: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServoCommand {
    Enable { servo: String },
    Disable { servo: String },
    Move(MoveParams),
    Stop { servo: String },
    SetPosition { servo: String, position: u16 },
    Status { servo: String },
}

const COMMANDS: &[(&str, &str)] = &[
    ("ENABLE", "Enable ST3215 servo torque"),
    ("DISABLE", "Disable ST3215 servo torque"),
    ("MOVE", "Move ST3215 servo to position"),
    ("STOP", "Stop ST3215 servo movement"),
    ("SET_POSITION", "Set ST3215 servo position without moving"),
    ("STATUS", "Query ST3215 servo status"),
];

/// Registered command names with their help text, including the
/// `ST3215_*` aliases.
pub fn command_names() -> impl Iterator<Item = (String, &'static str)> {
    ["STSERVO_", "ST3215_"].into_iter().flat_map(|prefix| {
        COMMANDS
            .iter()
            .map(move |(name, help)| (format!("{prefix}{name}"), *help))
    })
}

struct Params {
    command: &'static str,
    values: BTreeMap<String, String>,
}

impl Params {
    fn take(&mut self, key: &'static str) -> Option<String> {
        self.values.remove(key)
    }

    fn require(&mut self, key: &'static str) -> Result<String, CommandError> {
        self.take(key).ok_or(CommandError::Missing { command: self.command, key })
    }

    fn int(&mut self, key: &'static str, max: u16) -> Result<Option<u16>, CommandError> {
        let Some(raw) = self.take(key) else {
            return Ok(None);
        };
        let value: i64 = raw
            .parse()
            .map_err(|_| CommandError::Invalid { key, value: raw.clone() })?;
        if !(0..=max as i64).contains(&value) {
            return Err(CommandError::Range {
                key,
                value: raw,
                min: "0".into(),
                max: max.to_string(),
            });
        }
        Ok(Some(value as u16))
    }

    fn seconds(&mut self, key: &'static str) -> Result<Option<Duration>, CommandError> {
        let Some(raw) = self.take(key) else {
            return Ok(None);
        };
        let value: f64 = raw
            .parse()
            .map_err(|_| CommandError::Invalid { key, value: raw.clone() })?;
        let max = MAX_WAIT.as_secs_f64();
        if !(0.0..=max).contains(&value) {
            return Err(CommandError::Range {
                key,
                value: raw,
                min: "0".into(),
                max: max.to_string(),
            });
        }
        Ok((value > 0.0).then(|| Duration::from_secs_f64(value)))
    }

    /// Fails on any parameter the command did not consume.
    fn finish(self) -> Result<(), CommandError> {
        match self.values.into_keys().next() {
            Some(key) => Err(CommandError::Unexpected { command: self.command, key }),
            None => Ok(()),
        }
    }
}

impl ServoCommand {
    /// Parses one command line. Blank lines and `;` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.split(';').next().unwrap_or_default().trim();
        let mut tokens = line.split_whitespace();
        let Some(head) = tokens.next() else {
            return Ok(None);
        };

        let upper = head.to_ascii_uppercase();
        let name = upper
            .strip_prefix("STSERVO_")
            .or_else(|| upper.strip_prefix("ST3215_"))
            .and_then(|rest| COMMANDS.iter().find(|(n, _)| *n == rest))
            .map(|(n, _)| *n)
            .ok_or_else(|| CommandError::Unknown(head.to_string()))?;

        let mut values = BTreeMap::new();
        for tok in tokens {
            let (k, v) = tok
                .split_once('=')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| CommandError::Malformed(tok.to_string()))?;
            values.insert(k.to_ascii_uppercase(), v.to_string());
        }
        let mut p = Params { command: name, values };
        let servo = p.require("SERVO")?;

        let cmd = match name {
            "ENABLE" => ServoCommand::Enable { servo },
            "DISABLE" => ServoCommand::Disable { servo },
            "STOP" => ServoCommand::Stop { servo },
            "STATUS" => ServoCommand::Status { servo },
            "SET_POSITION" => {
                let position = required_position(&mut p)?;
                ServoCommand::SetPosition { servo, position }
            }
            _ => {
                let position = required_position(&mut p)?;
                let speed = p.int("SPEED", SPEED_MAX)?;
                let accel = p.int("ACCEL", ACCEL_MAX as u16)?.map(|a| a as u8);
                let wait = p.seconds("WAIT")?;
                ServoCommand::Move(MoveParams { servo, position, speed, accel, wait })
            }
        };
        p.finish()?;
        Ok(Some(cmd))
    }

    pub fn servo(&self) -> &str {
        match self {
            ServoCommand::Enable { servo }
            | ServoCommand::Disable { servo }
            | ServoCommand::Stop { servo }
            | ServoCommand::SetPosition { servo, .. }
            | ServoCommand::Status { servo } => servo,
            ServoCommand::Move(m) => &m.servo,
        }
    }
}

fn required_position(p: &mut Params) -> Result<u16, CommandError> {
    match p.int("POSITION", POSITION_MAX)? {
        Some(pos) => Ok(pos),
        None => Err(CommandError::Missing { command: p.command, key: "POSITION" }),
    }
}

/// Lines sent back to the operator plus, for status queries, the record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResponse {
    pub lines: Vec<String>,
    pub status: Option<ServoStatus>,
}

impl CommandResponse {
    pub fn line(text: impl Into<String>) -> Self {
        Self { lines: vec![text.into()], status: None }
    }
}

/// Multi-line human readable status report.
pub struct StatusReport<'a> {
    pub name: &'a str,
    pub status: &'a ServoStatus,
}

impl fmt::Display for StatusReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.status;
        let opt = |v: Option<i32>| v.map_or_else(|| "unknown".to_string(), |p| p.to_string());
        let phase = match st.state {
            ServoPhase::Disabled => "disabled",
            ServoPhase::Idle => "idle",
            ServoPhase::Moving => "moving",
            ServoPhase::Faulted => "faulted",
        };
        writeln!(f, "{} Status:", self.name)?;
        writeln!(f, "  State: {phase}")?;
        writeln!(f, "  Position: {}", opt(st.position))?;
        writeln!(f, "  Target: {}", opt(st.target_position))?;
        writeln!(f, "  Moving: {}", st.is_moving)?;
        if let Some(t) = st.temperature {
            let flag = if st.temperature_warning { " (warning)" } else { "" };
            writeln!(f, "  Temperature: {t:.1}°C{flag}")?;
        }
        if let Some(c) = st.current {
            writeln!(f, "  Current: {c:.1}mA")?;
        }
        if let Some(v) = st.voltage {
            writeln!(f, "  Voltage: {v:.1}V")?;
        }
        write!(f, "  Enabled: {}", st.enabled)?;
        if let Some(e) = &st.last_error {
            write!(f, "\n  Last Error: {e}")?;
        }
        Ok(())
    }
}
