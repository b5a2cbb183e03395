use std::collections::BTreeMap;
use std::sync::Arc;

use stservo_bus::{BusHandle, BusRegistry, BusSettings, RegistryError};
use stservo_proto::ServoStatus;
use tracing::{info, warn};

use crate::command::{CommandError, CommandResponse, MoveParams, ServoCommand, StatusReport};
use crate::config::{ConfigError, HostConfig, ServoConfig};
use crate::controller::ServoController;
use crate::error::ServoError;
use crate::wait::PendingWait;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] RegistryError),
}

/// Every configured servo, the buses they share, and the command dispatcher.
#[derive(Debug)]
pub struct ServoHost {
    buses: BusRegistry,
    servos: BTreeMap<String, Arc<ServoController>>,
}

impl ServoHost {
    /// Builds controllers over real serial ports. Ports open on first use.
    pub fn from_config(cfg: &HostConfig) -> Result<Self, HostError> {
        Self::build(cfg, |buses, sc| buses.get_or_open(&sc.serial, sc.baudrate))
    }

    /// Builds controllers with a caller-supplied bus constructor, called
    /// once per distinct port.
    pub fn from_config_with<F>(cfg: &HostConfig, mut spawn: F) -> Result<Self, HostError>
    where
        F: FnMut(&str, u32, &BusSettings) -> BusHandle,
    {
        Self::build(cfg, |buses, sc| {
            buses.get_or_spawn_with(&sc.serial, sc.baudrate, |s| spawn(&sc.serial, sc.baudrate, s))
        })
    }

    fn build<F>(cfg: &HostConfig, mut bus_for: F) -> Result<Self, HostError>
    where
        F: FnMut(&mut BusRegistry, &ServoConfig) -> Result<BusHandle, RegistryError>,
    {
        let mut buses = BusRegistry::new(cfg.bus.clone());
        let mut servos = BTreeMap::new();
        for sc in cfg.servos()? {
            let bus = bus_for(&mut buses, &sc)?;
            info!("servo {}: id {} on {}", sc.name, sc.servo_id, sc.serial);
            servos.insert(sc.name.clone(), Arc::new(ServoController::new(sc, bus)));
        }
        Ok(Self { buses, servos })
    }

    pub fn buses(&self) -> &BusRegistry {
        &self.buses
    }

    pub fn servo(&self, name: &str) -> Option<&Arc<ServoController>> {
        self.servos.get(name)
    }

    pub fn servos(&self) -> impl Iterator<Item = &Arc<ServoController>> {
        self.servos.values()
    }

    /// Pings every servo and seeds its position. Stops at the first failure.
    pub async fn connect(&self) -> Result<(), ServoError> {
        for servo in self.servos.values() {
            servo.connect().await?;
        }
        Ok(())
    }

    pub async fn ready(&self) {
        for servo in self.servos.values() {
            servo.ready().await;
        }
    }

    pub async fn shutdown(&self) {
        for servo in self.servos.values() {
            servo.shutdown().await;
        }
    }

    pub fn status(&self, name: &str) -> Option<ServoStatus> {
        self.servos.get(name).map(|s| s.status())
    }

    pub fn status_all(&self) -> BTreeMap<String, ServoStatus> {
        self.servos.iter().map(|(n, s)| (n.clone(), s.status())).collect()
    }

    /// Parses and runs one command line. Blank lines produce an empty response.
    pub async fn dispatch(&self, line: &str) -> Result<CommandResponse, CommandError> {
        match ServoCommand::parse(line)? {
            Some(cmd) => self.execute(cmd).await,
            None => Ok(CommandResponse::default()),
        }
    }

    pub async fn execute(&self, cmd: ServoCommand) -> Result<CommandResponse, CommandError> {
        let servo = self
            .servos
            .get(cmd.servo())
            .ok_or_else(|| CommandError::UnknownServo(cmd.servo().to_string()))?;
        let name = servo.name();

        let result = match cmd {
            ServoCommand::Enable { .. } => {
                servo.enable().await?;
                CommandResponse::line(format!("Enabled {name}"))
            }
            ServoCommand::Disable { .. } => {
                servo.disable().await?;
                CommandResponse::line(format!("Disabled {name}"))
            }
            ServoCommand::Move(params) => self.run_move(servo, params).await?,
            ServoCommand::Stop { .. } => match servo.stop().await? {
                Some(at) => CommandResponse::line(format!("Stopped {name} at position {at}")),
                None => CommandResponse::line(format!("{name} is disabled, nothing to stop")),
            },
            ServoCommand::SetPosition { position, .. } => {
                servo.set_position(position as i64).await?;
                CommandResponse::line(format!("Set {name} position to {position}"))
            }
            ServoCommand::Status { .. } => {
                let status = servo.status();
                let report = StatusReport { name, status: &status }.to_string();
                CommandResponse {
                    lines: report.lines().map(String::from).collect(),
                    status: Some(status),
                }
            }
        };
        Ok(result)
    }

    async fn run_move(
        &self,
        servo: &ServoController,
        params: MoveParams,
    ) -> Result<CommandResponse, CommandError> {
        let name = servo.name();
        let ack = servo
            .move_to(
                params.position as i64,
                params.speed.map(i64::from),
                params.accel.map(i64::from),
            )
            .await?;
        let mut resp = CommandResponse::line(format!(
            "Moving {name} to position {} (speed={}, accel={})",
            ack.position, ack.speed, ack.accel
        ));

        if let Some(wait) = params.wait {
            let interval = servo.config().status_update_interval;
            let pending = PendingWait::new(ack.position as i32, wait, interval);
            match pending.resolve(servo).await {
                Ok(status) => {
                    let at = status.position.unwrap_or(ack.position as i32);
                    resp.lines.push(format!("{name} reached position {at}"));
                    resp.status = Some(status);
                }
                Err(e) => {
                    warn!("servo {}: {}", name, e);
                    return Err(e.into());
                }
            }
        }
        Ok(resp)
    }
}
