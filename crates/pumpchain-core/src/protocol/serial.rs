//! Serial port handling
//!
//! Provides the byte-level channel the pump protocol runs over, and the serial-port
//! implementation of it. Framing is fixed by the pumps: 8 data bits, no parity, 2 stop bits.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::trace;

use super::PumpError;

/// Byte-level access to the shared bus
///
/// `read` returns `Ok(0)` when the read timeout elapses with no data; that is not an error.
pub trait PumpChannel: Send {
    /// Write every byte of a command
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PumpError>;

    /// Read what is available, waiting at most one read timeout
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PumpError>;

    /// Discard anything received but not yet read
    fn flush_input(&mut self) -> Result<(), PumpError>;

    /// Discard anything queued but not yet transmitted
    fn flush_output(&mut self) -> Result<(), PumpError>;
}

impl<C: PumpChannel + ?Sized> PumpChannel for Box<C> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PumpError> {
        (**self).write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PumpError> {
        (**self).read(buf)
    }

    fn flush_input(&mut self) -> Result<(), PumpError> {
        (**self).flush_input()
    }

    fn flush_output(&mut self) -> Result<(), PumpError> {
        (**self).flush_output()
    }
}

/// Opens channels to the bus; closing is dropping the channel
pub trait ChannelFactory: Send + Sync {
    /// Open a fresh channel
    fn open(&self) -> Result<Box<dyn PumpChannel>, PumpError>;

    /// Human-readable target, used in logs
    fn describe(&self) -> String;
}

/// Serial-port channel factory
#[derive(Debug, Clone)]
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialTransport {
    /// Factory for `port_name`; framing is fixed, only speed and read timeout vary
    pub fn new(port_name: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout,
        }
    }
}

impl ChannelFactory for SerialTransport {
    fn open(&self) -> Result<Box<dyn PumpChannel>, PumpError> {
        let mut port = open_port(&self.port_name, self.baud_rate, self.read_timeout)?;
        configure_port(port.as_mut())?;
        Ok(Box::new(SerialChannel { port }))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_name, self.baud_rate)
    }
}

/// An open serial port
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl PumpChannel for SerialChannel {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PumpError> {
        self.port
            .write_all(bytes)
            .map_err(|e| PumpError::Transport(e.to_string()))?;
        self.port
            .flush()
            .map_err(|e| PumpError::Transport(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PumpError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                trace!("Serial read timed out");
                Ok(0)
            }
            Err(e) => Err(PumpError::Transport(e.to_string())),
        }
    }

    fn flush_input(&mut self) -> Result<(), PumpError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| PumpError::Transport(e.to_string()))
    }

    fn flush_output(&mut self) -> Result<(), PumpError> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(|e| PumpError::Transport(e.to_string()))
    }
}

/// Open a serial port with the given read timeout
pub fn open_port(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, PumpError> {
    serialport::new(name, baud_rate)
        .timeout(read_timeout)
        .open()
        .map_err(|e| PumpError::Transport(format!("{}: {}", name, e)))
}

/// Apply the pumps' fixed framing: 8 data bits, no parity, 2 stop bits, no flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), PumpError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::Two)?;
    port.set_flow_control(serialport::FlowControl::None)?;
    Ok(())
}
