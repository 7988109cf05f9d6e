//! Device emulation for the VMM.
//!
//! Only one device exists: the transmit side of COM1.

mod serial;

pub use serial::SerialPort;

use crate::kvm::PioExit;
use thiserror::Error;

/// I/O port of COM1's transmit holding register.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to write guest output: {0}")]
    OutputFailed(#[source] std::io::Error),
}

/// Trait for handling trapped port I/O.
///
/// Called once per `KVM_EXIT_IO`, while the exit payload is still valid.
pub trait PioHandler {
    /// Handle one I/O exit. Returns how many bytes were emitted to the host.
    fn handle_pio(&mut self, pio: &PioExit<'_>) -> Result<usize, DeviceError>;
}
