use std::fmt;

use stservo_proto::{ServoPhase, ServoStatus, Telemetry};
use time::OffsetDateTime;

use crate::error::ServoError;
use crate::thermal::{ThermalLevel, ThermalLimits};

/// Encoder counts within which a move counts as arrived.
pub const ARRIVAL_TOLERANCE: i32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum FaultCause {
    Overheat { temperature: f32, critical: u8 },
    Unreachable { reason: String },
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::Overheat { temperature, critical } => {
                write!(f, "overheat ({temperature:.1}C >= {critical}C)")
            }
            FaultCause::Unreachable { reason } => write!(f, "unreachable ({reason})"),
        }
    }
}

impl FaultCause {
    pub fn to_error(&self, name: &str) -> ServoError {
        match self {
            FaultCause::Overheat { temperature, critical } => ServoError::SafetyShutdown {
                name: name.to_string(),
                temperature: *temperature,
                critical: *critical,
            },
            FaultCause::Unreachable { reason } => ServoError::Unreachable {
                name: name.to_string(),
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Disabled,
    Idle,
    Moving,
    Faulted(FaultCause),
}

impl Lifecycle {
    pub fn phase(&self) -> ServoPhase {
        match self {
            Lifecycle::Disabled => ServoPhase::Disabled,
            Lifecycle::Idle => ServoPhase::Idle,
            Lifecycle::Moving => ServoPhase::Moving,
            Lifecycle::Faulted(_) => ServoPhase::Faulted,
        }
    }
}

/// What a status poll changed, for the controller to act on and log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOutcome {
    pub arrived: bool,
    pub level: ThermalLevel,
    /// Set only on the poll that moved the servo into `Faulted(Overheat)`.
    pub overheated: bool,
    pub warning_raised: bool,
}

/// Mutable per-servo state. Owned by one controller.
#[derive(Debug, Clone)]
pub struct ServoState {
    pub lifecycle: Lifecycle,
    pub enabled: bool,
    pub target_position: Option<i32>,
    pub last_known_position: Option<i32>,
    pub is_moving: bool,
    pub temperature: Option<f32>,
    pub current: Option<f32>,
    pub voltage: Option<f32>,
    pub temperature_warning: bool,
    pub last_error: Option<String>,
    pub last_poll: Option<OffsetDateTime>,
    pub poll_failures: u32,
}

impl Default for ServoState {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Disabled,
            enabled: false,
            target_position: None,
            last_known_position: None,
            is_moving: false,
            temperature: None,
            current: None,
            voltage: None,
            temperature_warning: false,
            last_error: None,
            last_poll: None,
            poll_failures: 0,
        }
    }
}

impl ServoState {
    pub fn fault(&self) -> Option<&FaultCause> {
        match &self.lifecycle {
            Lifecycle::Faulted(cause) => Some(cause),
            _ => None,
        }
    }

    /// Error for a motion command in the current state, if any.
    pub fn motion_blocked(&self, name: &str) -> Option<ServoError> {
        match &self.lifecycle {
            Lifecycle::Disabled => Some(ServoError::NotEnabled { name: name.to_string() }),
            Lifecycle::Faulted(cause) => Some(cause.to_error(name)),
            Lifecycle::Idle | Lifecycle::Moving => None,
        }
    }

    pub fn mark_enabled(&mut self) {
        self.lifecycle = if self.is_moving { Lifecycle::Moving } else { Lifecycle::Idle };
        self.enabled = true;
        self.poll_failures = 0;
    }

    pub fn mark_disabled(&mut self) {
        self.lifecycle = Lifecycle::Disabled;
        self.enabled = false;
        self.is_moving = false;
    }

    pub fn mark_moving(&mut self, target: i32) {
        self.target_position = Some(target);
        self.is_moving = true;
        self.lifecycle = Lifecycle::Moving;
    }

    pub fn mark_stopped(&mut self, position: i32) {
        self.last_known_position = Some(position);
        self.target_position = Some(position);
        self.is_moving = false;
        if self.lifecycle == Lifecycle::Moving {
            self.lifecycle = Lifecycle::Idle;
        }
    }

    pub fn fault_with(&mut self, cause: FaultCause) {
        self.last_error = Some(cause.to_string());
        self.lifecycle = Lifecycle::Faulted(cause);
        self.is_moving = false;
    }

    /// Folds one successful status read into the state.
    pub fn apply_poll(
        &mut self,
        t: &Telemetry,
        limits: ThermalLimits,
        at: OffsetDateTime,
    ) -> PollOutcome {
        self.last_known_position = Some(t.position);
        self.temperature = Some(t.temperature);
        self.current = Some(t.current);
        self.voltage = Some(t.voltage);
        self.last_poll = Some(at);
        self.poll_failures = 0;

        let mut arrived = false;
        if self.is_moving {
            if let Some(target) = self.target_position {
                if (t.position - target).abs() <= ARRIVAL_TOLERANCE {
                    self.is_moving = false;
                    arrived = true;
                    if self.lifecycle == Lifecycle::Moving {
                        self.lifecycle = Lifecycle::Idle;
                    }
                }
            }
        }

        let level = limits.classify(t.temperature);
        let was_warning = self.temperature_warning;
        self.temperature_warning = level == ThermalLevel::Warning;
        let mut overheated = false;
        if level == ThermalLevel::Critical {
            if !matches!(self.lifecycle, Lifecycle::Faulted(FaultCause::Overheat { .. })) {
                overheated = true;
                self.fault_with(FaultCause::Overheat {
                    temperature: t.temperature,
                    critical: limits.critical_c() as u8,
                });
            }
        } else if self.fault().is_none() {
            self.last_error = None;
        }

        PollOutcome {
            arrived,
            level,
            overheated,
            warning_raised: self.temperature_warning && !was_warning,
        }
    }

    /// Records a status read that failed after the bus gave up retrying.
    pub fn apply_poll_failure(&mut self, reason: String) -> bool {
        self.poll_failures += 1;
        if self.fault().is_some() {
            self.last_error = Some(reason);
            return false;
        }
        self.fault_with(FaultCause::Unreachable { reason });
        true
    }

    pub fn status(&self) -> ServoStatus {
        ServoStatus {
            position: self.last_known_position,
            target_position: self.target_position,
            is_moving: self.is_moving,
            temperature: self.temperature,
            current: self.current,
            voltage: self.voltage,
            enabled: self.enabled,
            last_error: self.last_error.clone(),
            state: self.lifecycle.phase(),
            temperature_warning: self.temperature_warning,
            last_poll: self.last_poll,
        }
    }
}
