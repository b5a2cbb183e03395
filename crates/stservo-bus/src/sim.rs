//! In-memory ST3215 bus for bench runs without hardware and for tests.
//!
//! Each simulated servo keeps a register file and a constant-speed motion
//! model evaluated against the tokio clock, so paused-time tests advance
//! servos deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use stservo_proto::frame::{self, Scan, BROADCAST_ID};
use stservo_proto::registers::{decode_sign_magnitude, encode_sign_magnitude, SPEED_MAX};
use stservo_proto::{Instruction, Packet, Register};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::link::{Connector, FnConnector};
use crate::{BusHandle, BusSettings};

const REG_FILE_LEN: usize = 128;
const NOMINAL_VOLTAGE: u8 = 120;
/// Request frames kept for inspection; older ones are dropped.
pub const FRAME_LOG_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: i32,
    to: i32,
    speed: f32,
    started: Instant,
}

impl Motion {
    fn rest(at: i32) -> Self {
        Self { from: at, to: at, speed: 0.0, started: Instant::now() }
    }

    fn position(&self, now: Instant, hold: bool) -> i32 {
        if hold || self.from == self.to {
            return self.from;
        }
        let travelled = (self.speed * now.duration_since(self.started).as_secs_f32()) as i32;
        let span = self.to - self.from;
        if travelled >= span.abs() {
            self.to
        } else {
            self.from + travelled * span.signum()
        }
    }
}

#[derive(Debug, Clone)]
struct SimServo {
    regs: [u8; REG_FILE_LEN],
    motion: Motion,
    offset: i32,
    temperature: u8,
    fault: u8,
    hold: bool,
    silent: bool,
}

impl SimServo {
    fn new(position: i32) -> Self {
        let mut regs = [0u8; REG_FILE_LEN];
        regs[Register::ModelNumber as usize] = 0x09;
        regs[Register::Lock as usize] = 1;
        Self {
            regs,
            motion: Motion::rest(position),
            offset: 0,
            temperature: 35,
            fault: 0,
            hold: false,
            silent: false,
        }
    }

    fn position(&self, now: Instant) -> i32 {
        self.motion.position(now, self.hold)
    }

    fn moving(&self, now: Instant) -> bool {
        self.position(now) != self.motion.to
    }

    fn word(&self, reg: Register) -> u16 {
        let at = reg as usize;
        u16::from_le_bytes([self.regs[at], self.regs[at + 1]])
    }

    fn set_word(&mut self, reg: Register, value: u16) {
        let at = reg as usize;
        self.regs[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn refresh(&mut self, now: Instant) {
        let moving = self.moving(now);
        let position = self.position(now);
        self.set_word(Register::PresentPosition, encode_sign_magnitude(position, 15));
        self.set_word(Register::PresentSpeed, if moving { self.motion.speed as u16 } else { 0 });
        self.regs[Register::PresentVoltage as usize] = NOMINAL_VOLTAGE;
        self.regs[Register::PresentTemperature as usize] = self.temperature;
        self.regs[Register::Moving as usize] = moving as u8;
        self.set_word(Register::PresentCurrent, if moving { 20 } else { 2 });
    }

    fn write(&mut self, addr: usize, data: &[u8], now: Instant) {
        let end = addr + data.len();
        if end > REG_FILE_LEN {
            return;
        }
        let touches = |reg: Register, width: usize| {
            let at = reg as usize;
            addr < at + width && at < end
        };
        let current = self.position(now);
        self.regs[addr..end].copy_from_slice(data);

        if touches(Register::PositionOffset, 2) {
            let offset = decode_sign_magnitude(self.word(Register::PositionOffset), 11);
            let shift = offset - self.offset;
            self.offset = offset;
            self.motion = Motion::rest(current - shift);
            return;
        }
        if touches(Register::TorqueEnable, 1) && self.regs[Register::TorqueEnable as usize] == 0 {
            self.motion = Motion::rest(current);
        }
        if touches(Register::GoalPosition, 2) || touches(Register::GoalSpeed, 2) {
            let goal = decode_sign_magnitude(self.word(Register::GoalPosition), 15);
            let speed = match self.word(Register::GoalSpeed) {
                0 => SPEED_MAX,
                s => s,
            };
            self.regs[Register::TorqueEnable as usize] = 1;
            self.motion = Motion { from: current, to: goal, speed: speed as f32, started: now };
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    servos: BTreeMap<u8, SimServo>,
    log: VecDeque<Vec<u8>>,
    corrupt_replies: u32,
}

impl SimState {
    fn handle(&mut self, raw: &[u8], packet: Packet) -> Option<Vec<u8>> {
        if self.log.len() == FRAME_LOG_LIMIT {
            self.log.pop_front();
        }
        self.log.push_back(raw.to_vec());
        if packet.id == BROADCAST_ID {
            return None;
        }
        let now = Instant::now();
        let servo = self.servos.get_mut(&packet.id).filter(|s| !s.silent)?;

        let data = match Instruction::try_from(packet.code) {
            Ok(Instruction::Read) if packet.params.len() >= 2 => {
                let (addr, len) = (packet.params[0] as usize, packet.params[1] as usize);
                if addr + len > REG_FILE_LEN {
                    return None;
                }
                servo.refresh(now);
                servo.regs[addr..addr + len].to_vec()
            }
            Ok(Instruction::Write) if !packet.params.is_empty() => {
                servo.write(packet.params[0] as usize, &packet.params[1..], now);
                Vec::new()
            }
            _ => Vec::new(),
        };

        let mut reply = frame::encode_raw(packet.id, servo.fault, &data).ok()?;
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            if let Some(last) = reply.last_mut() {
                *last ^= 0xFF;
            }
        }
        Some(reply)
    }
}

/// Shared handle to a simulated bus. Clones observe the same servos.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_servo<R>(&self, id: u8, f: impl FnOnce(&mut SimServo) -> R) -> Option<R> {
        self.state().servos.get_mut(&id).map(f)
    }

    pub fn add_servo(&self, id: u8, position: i32) {
        self.state().servos.insert(id, SimServo::new(position));
    }

    pub fn set_temperature(&self, id: u8, celsius: u8) {
        self.with_servo(id, |s| s.temperature = celsius);
    }

    /// Stops the motion model: the servo stays where it is while "moving".
    pub fn hold_motion(&self, id: u8, hold: bool) {
        let now = Instant::now();
        self.with_servo(id, |s| {
            let at = s.position(now);
            s.motion = Motion { from: at, started: now, ..s.motion };
            s.hold = hold;
        });
    }

    /// A silent servo receives frames but never answers.
    pub fn silence(&self, id: u8, silent: bool) {
        self.with_servo(id, |s| s.silent = silent);
    }

    pub fn set_fault(&self, id: u8, bits: u8) {
        self.with_servo(id, |s| s.fault = bits);
    }

    /// Flips the checksum of the next `n` replies.
    pub fn corrupt_replies(&self, n: u32) {
        self.state().corrupt_replies = n;
    }

    pub fn position(&self, id: u8) -> Option<i32> {
        let now = Instant::now();
        self.with_servo(id, |s| s.position(now))
    }

    pub fn torque_enabled(&self, id: u8) -> Option<bool> {
        self.with_servo(id, |s| s.regs[Register::TorqueEnable as usize] != 0)
    }

    pub fn offset(&self, id: u8) -> Option<i32> {
        self.with_servo(id, |s| s.offset)
    }

    /// The most recent request frames, oldest first, at most
    /// [`FRAME_LOG_LIMIT`] of them.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state().log.iter().cloned().collect()
    }

    pub fn clear_frames(&self) {
        self.state().log.clear();
    }

    /// Each connect yields a fresh in-memory stream served by this bus.
    pub fn connector(&self) -> impl Connector<Stream = DuplexStream> {
        let sim = self.clone();
        FnConnector(move || -> io::Result<DuplexStream> {
            let (host, device) = tokio::io::duplex(1024);
            tokio::spawn(sim.clone().serve(device));
            Ok(host)
        })
    }

    pub fn spawn_bus(&self, port: &str, baud: u32, settings: BusSettings) -> BusHandle {
        BusHandle::spawn(port, baud, self.connector(), settings)
    }

    async fn serve(self, mut stream: DuplexStream) {
        let mut buf = BytesMut::with_capacity(256);
        loop {
            match frame::scan(&buf) {
                Scan::Frame(n) => {
                    let raw = buf.split_to(n);
                    let Ok(packet) = frame::decode(&raw) else {
                        continue;
                    };
                    let reply = self.state().handle(&raw, packet);
                    if let Some(reply) = reply {
                        trace!("sim: reply {:02X?}", reply);
                        if stream.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
                Scan::Garbage(n) => {
                    buf.advance(n);
                    continue;
                }
                Scan::Incomplete => {}
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!("sim: connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stservo_proto::registers::request;
    use stservo_proto::Telemetry;

    #[tokio::test(start_paused = true)]
    async fn simulated_servo_moves_toward_goal() {
        let sim = SimulatedBus::new();
        sim.add_servo(1, 1000);
        let bus = sim.spawn_bus("sim0", 1_000_000, BusSettings::default());

        bus.command(request::move_to(1, 2000, 1000, 0).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let block = bus.read(1, Register::PresentPosition, 15).await.unwrap();
        let t = Telemetry::parse(&block.data).unwrap();
        assert!(t.moving);
        assert!((1400..=1600).contains(&t.position), "position {}", t.position);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sim.position(1), Some(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn offset_write_shifts_reported_position() {
        let sim = SimulatedBus::new();
        sim.add_servo(2, 2048);
        let bus = sim.spawn_bus("sim0", 1_000_000, BusSettings::default());

        bus.write(2, Register::PositionOffset, &encode_sign_magnitude(48, 11).to_le_bytes())
            .await
            .unwrap();
        assert_eq!(sim.position(2), Some(2000));
        assert_eq!(sim.offset(2), Some(48));
    }

    #[tokio::test(start_paused = true)]
    async fn frame_log_keeps_only_the_newest_frames() {
        let sim = SimulatedBus::new();
        sim.add_servo(1, 0);
        let mut state = sim.state();
        for i in 0..FRAME_LOG_LIMIT + 10 {
            let raw = request::read(1, Register::PresentPosition, (i % 16 + 1) as u8).unwrap();
            let packet = frame::decode(&raw).unwrap();
            state.handle(&raw, packet);
        }
        assert_eq!(state.log.len(), FRAME_LOG_LIMIT);
        let first = frame::decode(&state.log[0]).unwrap();
        assert_eq!(first.params[1], 11);
    }
}
