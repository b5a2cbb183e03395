use std::time::Duration;

use stservo_bus::BusError;

#[derive(Debug, thiserror::Error)]
pub enum ServoError {
    #[error("{what} {value} outside {min}..={max}")]
    Range { what: &'static str, value: i64, min: i64, max: i64 },

    #[error(
        "{name}: safety shutdown, temperature {temperature:.1}C reached critical {critical}C; \
         re-enable to recover"
    )]
    SafetyShutdown { name: String, temperature: f32, critical: u8 },

    #[error("{name}: unreachable ({reason}); re-enable to recover")]
    Unreachable { name: String, reason: String },

    #[error("{name}: torque is disabled, enable the servo first")]
    NotEnabled { name: String },

    #[error("{name}: not found at id {id} on {port}")]
    NotFound { name: String, id: u8, port: String },

    #[error("{name}: {source}")]
    Communication {
        name: String,
        #[source]
        source: BusError,
    },

    #[error("timeout waiting for {name} to reach {target} after {waited:?}")]
    Timeout { name: String, target: i32, waited: Duration },
}

impl ServoError {
    pub fn range(what: &'static str, value: i64, min: i64, max: i64) -> Self {
        ServoError::Range { what, value, min, max }
    }

    /// Short kind name used in command responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServoError::Range { .. } => "RangeError",
            ServoError::SafetyShutdown { .. } => "SafetyShutdown",
            ServoError::Unreachable { .. } => "Unreachable",
            ServoError::NotEnabled { .. } => "NotEnabled",
            ServoError::NotFound { .. } => "NotFound",
            ServoError::Communication { .. } => "CommunicationError",
            ServoError::Timeout { .. } => "TimeoutError",
        }
    }
}
