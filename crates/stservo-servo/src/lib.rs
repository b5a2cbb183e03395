//! Position control, telemetry and thermal safety for ST3215 servos, plus
//! the `STSERVO_*` command layer on top.

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod state;
pub mod thermal;
pub mod wait;

pub use command::{CommandError, CommandResponse, MoveParams, ServoCommand, StatusReport};
pub use config::{ConfigError, HostConfig, ServoConfig};
pub use controller::{MoveAck, ServoController};
pub use error::ServoError;
pub use host::{HostError, ServoHost};
pub use state::{FaultCause, Lifecycle, ServoState, ARRIVAL_TOLERANCE};
pub use wait::PendingWait;
