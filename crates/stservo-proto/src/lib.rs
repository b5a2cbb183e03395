//! Wire format and register map for Feetech ST3215 serial-bus servos.

pub mod frame;
pub mod registers;
pub mod telemetry;

pub use frame::{decode, encode, CodecError, Packet, Scan};
pub use registers::{Instruction, Register, ServoFault, Telemetry};
pub use telemetry::{ServoPhase, ServoStatus};
