//! Write-only COM1 byte sink.
//!
//! The guest transmits a character by executing `out %al, (%dx)` with
//! `%dx = 0x3f8`. Every such OUT puts exactly one byte on the host sink.
//! Reads, and writes to any other port, are dropped: this is not a UART, just
//! the transmit holding register of one.

use super::{DeviceError, PioHandler, SERIAL_COM1_BASE};
use crate::kvm::{PioDirection, PioExit};
use log::trace;
use std::io::Write;

/// COM1 transmit register bridged to a host writer.
pub struct SerialPort<W: Write> {
    out: W,
}

impl<W: Write> SerialPort<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Give back the sink.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PioHandler for SerialPort<W> {
    fn handle_pio(&mut self, pio: &PioExit<'_>) -> Result<usize, DeviceError> {
        if pio.direction != PioDirection::Out || pio.port != SERIAL_COM1_BASE {
            trace!(
                "[I/O] {:?} port={:#x} size={} count={} ignored",
                pio.direction,
                pio.port,
                pio.size,
                pio.count
            );
            return Ok(0);
        }

        let Some(&byte) = pio.data.first() else {
            return Ok(0);
        };
        trace!("[I/O] OUT port={:#x} <- {byte:#04x}", pio.port);

        self.out
            .write_all(&[byte])
            .and_then(|()| self.out.flush())
            .map_err(DeviceError::OutputFailed)?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn pio(direction: PioDirection, port: u16, data: &[u8]) -> PioExit<'_> {
        PioExit {
            direction,
            size: data.len() as u8,
            port,
            count: 1,
            data,
        }
    }

    #[test]
    fn test_out_to_com1_is_forwarded() {
        let mut serial = SerialPort::new(Vec::new());
        assert_eq!(serial.handle_pio(&pio(PioDirection::Out, 0x3f8, b"4")).unwrap(), 1);
        assert_eq!(serial.handle_pio(&pio(PioDirection::Out, 0x3f8, b"\n")).unwrap(), 1);
        assert_eq!(serial.into_inner(), b"4\n");
    }

    #[test]
    fn test_other_ports_ignored() {
        let mut serial = SerialPort::new(Vec::new());
        for port in [0x2f8, 0x3f9, 0x3fd, 0x80] {
            assert_eq!(serial.handle_pio(&pio(PioDirection::Out, port, b"x")).unwrap(), 0);
        }
        assert!(serial.into_inner().is_empty());
    }

    #[test]
    fn test_in_on_com1_ignored() {
        let mut serial = SerialPort::new(Vec::new());
        assert_eq!(serial.handle_pio(&pio(PioDirection::In, 0x3f8, &[0])).unwrap(), 0);
        assert!(serial.into_inner().is_empty());
    }

    #[test]
    fn test_wide_out_emits_low_byte_only() {
        let mut serial = SerialPort::new(Vec::new());
        serial
            .handle_pio(&pio(PioDirection::Out, 0x3f8, &[b'A', b'B', 0, 0]))
            .unwrap();
        assert_eq!(serial.into_inner(), b"A");
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_failure_surfaces() {
        let mut serial = SerialPort::new(BrokenSink);
        assert!(matches!(
            serial.handle_pio(&pio(PioDirection::Out, 0x3f8, b"x")),
            Err(DeviceError::OutputFailed(_))
        ));
    }
}
