use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use stservo_bus::{BusError, BusHandle};
use stservo_proto::registers::{
    decode_sign_magnitude, encode_sign_magnitude, request, OFFSET_LIMIT, POSITION_MAX,
    STATUS_BLOCK_LEN,
};
use stservo_proto::{Register, ServoFault, ServoStatus, Telemetry};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ServoConfig;
use crate::error::ServoError;
use crate::state::{Lifecycle, PollOutcome, ServoState};
use crate::thermal::ThermalLimits;

const POSITION_SIGN_BIT: u8 = 15;
const OFFSET_SIGN_BIT: u8 = 11;

/// Parameters actually sent for a move, after defaults were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveAck {
    pub position: u16,
    pub speed: u16,
    pub accel: u8,
}

/// State machine for one servo on a shared bus.
///
/// Methods take `&self`; the controller is normally held in an `Arc` so the
/// status poll task can run alongside command handling.
#[derive(Debug)]
pub struct ServoController {
    config: ServoConfig,
    bus: BusHandle,
    limits: ThermalLimits,
    state: Mutex<ServoState>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ServoController {
    pub fn new(config: ServoConfig, bus: BusHandle) -> Self {
        let limits = ThermalLimits::new(
            config.temperature_warning as f32,
            config.temperature_critical as f32,
        );
        Self {
            config,
            bus,
            limits,
            state: Mutex::new(ServoState::default()),
            poller: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    fn state(&self) -> MutexGuard<'_, ServoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current state; never touches the bus.
    pub fn snapshot(&self) -> ServoState {
        self.state().clone()
    }

    pub fn status(&self) -> ServoStatus {
        self.state().status()
    }

    fn id(&self) -> u8 {
        self.config.servo_id
    }

    /// Wraps a bus failure and remembers it as the last error.
    fn comm(&self, source: BusError) -> ServoError {
        let err = ServoError::Communication { name: self.config.name.clone(), source };
        self.state().last_error = Some(err.to_string());
        err
    }

    fn note_fault(&self, op: &str, fault: ServoFault) {
        if !fault.is_empty() {
            warn!("servo {}: {} acknowledged with status {}", self.name(), op, fault);
        }
    }

    async fn read_position(&self) -> Result<i32, ServoError> {
        let reply = self
            .bus
            .read(self.id(), Register::PresentPosition, 2)
            .await
            .map_err(|e| self.comm(e))?;
        let raw = u16::from_le_bytes([reply.data[0], reply.data[1]]);
        Ok(decode_sign_magnitude(raw, POSITION_SIGN_BIT))
    }

    async fn write(&self, op: &str, register: Register, data: &[u8]) -> Result<(), ServoError> {
        let fault = self.bus.write(self.id(), register, data).await.map_err(|e| self.comm(e))?;
        self.note_fault(op, fault);
        Ok(())
    }

    fn check_bounds(&self, position: i64) -> Result<(), ServoError> {
        let cfg = &self.config;
        if cfg.contains(position) {
            return Ok(());
        }
        let (min, max) = (cfg.position_min as i64, cfg.position_max as i64);
        Err(ServoError::range("position", position, min, max))
    }

    async fn command(
        &self,
        op: &str,
        frame: Result<Vec<u8>, stservo_proto::CodecError>,
    ) -> Result<(), ServoError> {
        let frame = frame.map_err(|e| self.comm(e.into()))?;
        let fault = self.bus.command(frame).await.map_err(|e| self.comm(e))?;
        self.note_fault(op, fault);
        Ok(())
    }

    /// Checks presence and seeds the cached position.
    pub async fn connect(&self) -> Result<(), ServoError> {
        let present = self.bus.ping(self.id()).await.map_err(|e| self.comm(e))?;
        if !present {
            return Err(ServoError::NotFound {
                name: self.config.name.clone(),
                id: self.id(),
                port: self.bus.port().to_string(),
            });
        }
        info!("servo {}: detected as id {} on {}", self.name(), self.id(), self.bus.port());

        let position = self.read_position().await?;
        let mut st = self.state();
        st.last_known_position = Some(position);
        st.target_position = Some(position);
        info!("servo {}: initial position {}", self.name(), position);
        Ok(())
    }

    /// Moves to the configured initial position, then starts status polling.
    pub async fn ready(self: &Arc<Self>) {
        if let Some(initial) = self.config.initial_position {
            info!("servo {}: moving to initial position {}", self.name(), initial);
            let result = match self.enable().await {
                Ok(()) => self.move_to(initial as i64, None, None).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!("servo {}: initial move failed: {}", self.name(), e);
            }
        }
        self.start_polling();
    }

    /// Best-effort torque off and poll task teardown.
    pub async fn shutdown(&self) {
        self.stop_polling();
        match self.disable().await {
            Ok(()) => info!("servo {}: disabled on shutdown", self.name()),
            Err(e) => warn!("servo {}: disable on shutdown failed: {}", self.name(), e),
        }
    }

    pub async fn enable(&self) -> Result<(), ServoError> {
        let recovering = self.state().fault().cloned();
        self.command("enable", request::torque(self.id(), true)).await?;
        self.state().mark_enabled();
        match recovering {
            Some(cause) => info!("servo {}: enabled, cleared fault: {}", self.name(), cause),
            None => info!("servo {}: enabled", self.name()),
        }
        Ok(())
    }

    pub async fn disable(&self) -> Result<(), ServoError> {
        self.command("disable", request::torque(self.id(), false)).await?;
        self.state().mark_disabled();
        info!("servo {}: disabled", self.name());
        Ok(())
    }

    /// Validates and starts an absolute move. `None` speed or accel use the
    /// configured maxima.
    pub async fn move_to(
        &self,
        position: i64,
        speed: Option<i64>,
        accel: Option<i64>,
    ) -> Result<MoveAck, ServoError> {
        self.check_bounds(position)?;
        let cfg = &self.config;
        let speed = speed.unwrap_or(cfg.max_speed as i64);
        if !(0..=cfg.max_speed as i64).contains(&speed) {
            return Err(ServoError::range("speed", speed, 0, cfg.max_speed as i64));
        }
        let accel = accel.unwrap_or(cfg.max_acceleration as i64);
        if !(0..=cfg.max_acceleration as i64).contains(&accel) {
            return Err(ServoError::range("accel", accel, 0, cfg.max_acceleration as i64));
        }
        if let Some(err) = self.state().motion_blocked(self.name()) {
            return Err(err);
        }

        let ack = MoveAck { position: position as u16, speed: speed as u16, accel: accel as u8 };
        self.command("move", request::move_to(self.id(), ack.position, ack.speed, ack.accel))
            .await?;
        self.state().mark_moving(position as i32);
        info!(
            "servo {}: moving to {} (speed={}, accel={})",
            self.name(),
            ack.position,
            ack.speed,
            ack.accel
        );
        Ok(ack)
    }

    /// Holds the servo where it is. Returns the stop position, or `None` when
    /// the servo was disabled and nothing was sent.
    pub async fn stop(&self) -> Result<Option<i32>, ServoError> {
        match &self.state().lifecycle {
            Lifecycle::Disabled => return Ok(None),
            Lifecycle::Faulted(cause) => return Err(cause.to_error(self.name())),
            Lifecycle::Idle | Lifecycle::Moving => {}
        }
        let position = self.read_position().await?;
        let goal = position.clamp(0, POSITION_MAX as i32) as u16;
        self.command("stop", request::move_to(self.id(), goal, 0, 0)).await?;
        self.state().mark_stopped(position);
        info!("servo {}: stopped at {}", self.name(), position);
        Ok(Some(position))
    }

    /// Re-zeroes the servo so it reports `position` where it stands now,
    /// through the position-correction register.
    pub async fn set_position(&self, position: i64) -> Result<(), ServoError> {
        self.check_bounds(position)?;
        let current = self.read_position().await?;
        let reply = self
            .bus
            .read(self.id(), Register::PositionOffset, 2)
            .await
            .map_err(|e| self.comm(e))?;
        let raw = u16::from_le_bytes([reply.data[0], reply.data[1]]);
        let old = decode_sign_magnitude(raw, OFFSET_SIGN_BIT);
        let new = old + (current - position as i32);
        if new.abs() > OFFSET_LIMIT {
            let limit = OFFSET_LIMIT as i64;
            return Err(ServoError::range("position offset", new as i64, -limit, limit));
        }

        self.write("unlock", Register::Lock, &[0]).await?;
        let offset = encode_sign_magnitude(new, OFFSET_SIGN_BIT).to_le_bytes();
        let written = self.write("offset", Register::PositionOffset, &offset).await;
        let locked = self.write("lock", Register::Lock, &[1]).await;
        written?;
        locked?;

        let mut st = self.state();
        st.last_known_position = Some(position as i32);
        st.target_position = Some(position as i32);
        drop(st);
        info!("servo {}: position set to {} (offset {} -> {})", self.name(), position, old, new);
        Ok(())
    }

    /// One status read: updates telemetry, resolves arrival, enforces the
    /// temperature limits.
    pub async fn poll_once(&self) -> Result<PollOutcome, ServoError> {
        let result = self.bus.read(self.id(), Register::PresentPosition, STATUS_BLOCK_LEN).await;
        let telemetry =
            result.and_then(|reply| Telemetry::parse(&reply.data).map_err(BusError::from));
        let telemetry = match telemetry {
            Ok(t) => t,
            Err(source) => {
                let err = ServoError::Communication { name: self.config.name.clone(), source };
                if self.state().apply_poll_failure(err.to_string()) {
                    error!(
                        "servo {}: status poll failed, marking unreachable: {}",
                        self.name(),
                        err
                    );
                } else {
                    debug!("servo {}: status poll failed: {}", self.name(), err);
                }
                return Err(err);
            }
        };

        let outcome = self.state().apply_poll(&telemetry, self.limits, OffsetDateTime::now_utc());
        if outcome.arrived {
            info!("servo {}: reached {}", self.name(), telemetry.position);
        }
        if outcome.warning_raised {
            warn!("servo {}: temperature high: {:.1}C", self.name(), telemetry.temperature);
        }
        if outcome.overheated {
            error!(
                "servo {}: temperature critical: {:.1}C, disabling torque",
                self.name(),
                telemetry.temperature
            );
            match self.command("torque off", request::torque(self.id(), false)).await {
                Ok(()) => self.state().enabled = false,
                Err(e) => warn!("servo {}: torque off after overheat failed: {}", self.name(), e),
            }
        }
        Ok(outcome)
    }

    /// Starts (or restarts) the recurring status poll.
    pub fn start_polling(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.status_update_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(servo) = weak.upgrade() else {
                    break;
                };
                let _ = servo.poll_once().await;
            }
        });
        let previous = self.poller.lock().unwrap_or_else(PoisonError::into_inner).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!("servo {}: polling every {:?}", self.name(), period);
    }

    pub fn stop_polling(&self) {
        if let Some(task) = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl Drop for ServoController {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
