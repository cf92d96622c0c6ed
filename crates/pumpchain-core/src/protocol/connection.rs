//! Connection management
//!
//! One `PumpSession` owns the bus for the life of the process. Every operation borrows it
//! through a `BusGuard`, which serializes access, flushes stale input and closes (or parks)
//! the channel when it goes out of scope.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::decoder::{self, DecodeResult, Marker, IDLE_BACKOFF};
use super::serial::{ChannelFactory, PumpChannel, SerialTransport};
use super::{
    Command, PumpError, DEFAULT_BAUD_RATE, DEFAULT_CHAIN_LENGTH, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RESPONSE_TIMEOUT_MS,
};

#[cfg(windows)]
const DEFAULT_PORT: &str = "COM4";
#[cfg(not(windows))]
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout of each low-level read in milliseconds
    pub read_timeout_ms: u64,
    /// Budget for one whole reply in milliseconds; a reply can overrun it by at most one read timeout
    pub response_timeout_ms: u64,
    /// Number of addresses probed by discovery
    pub chain_length: u8,
    /// Keep the port open between operations instead of reopening per call
    pub keep_open: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            chain_length: DEFAULT_CHAIN_LENGTH,
            keep_open: false,
        }
    }
}

impl ConnectionConfig {
    /// Per-read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Whole-reply budget
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Serial transport for this configuration
    pub fn transport(&self) -> SerialTransport {
        SerialTransport::new(self.port_name.clone(), self.baud_rate, self.read_timeout())
    }
}

/// A decoded, fault-free reply
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Last complete line, if the pump sent any
    pub message: Option<String>,
    /// Pump state after the command
    pub marker: Marker,
    /// Bytes between the last line and the marker
    pub trailing: String,
}

/// Owner of the pump bus
pub struct PumpSession {
    factory: Box<dyn ChannelFactory>,
    config: ConnectionConfig,
    /// Parked channel when `keep_open` is set
    bus: Mutex<Option<Box<dyn PumpChannel>>>,
}

impl PumpSession {
    /// Session on the serial port named in `config`
    pub fn new(config: ConnectionConfig) -> Self {
        let transport = config.transport();
        Self::with_factory(config, transport)
    }

    /// Session over any channel source (simulators, test doubles)
    pub fn with_factory(config: ConnectionConfig, factory: impl ChannelFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            config,
            bus: Mutex::new(None),
        }
    }

    /// Settings this session was built with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Take exclusive use of the bus for one logical operation
    ///
    /// Blocks while another operation holds the bus. Input and output are flushed before
    /// the guard is handed out.
    pub fn acquire(&self) -> Result<BusGuard<'_>, PumpError> {
        let mut slot = self.bus.lock().unwrap_or_else(PoisonError::into_inner);

        let mut channel = match slot.take() {
            Some(channel) => channel,
            None => {
                if self.config.keep_open {
                    info!("Opening {}", self.factory.describe());
                } else {
                    debug!("Opening {}", self.factory.describe());
                }
                self.factory.open()?
            }
        };

        channel.flush_input()?;
        channel.flush_output()?;

        Ok(BusGuard {
            slot,
            channel: Some(channel),
            keep_open: self.config.keep_open,
            healthy: true,
            read_timeout: self.config.read_timeout(),
            response_timeout: self.config.response_timeout(),
        })
    }

    /// Close a parked channel; the next operation reopens it
    pub fn close(&self) {
        let mut slot = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            info!("Closed {}", self.factory.describe());
        }
    }
}

/// Exclusive, scoped use of the bus
///
/// Dropping the guard closes the channel, or parks it for reuse when the session keeps
/// the port open and nothing went wrong during the operation.
pub struct BusGuard<'a> {
    slot: MutexGuard<'a, Option<Box<dyn PumpChannel>>>,
    channel: Option<Box<dyn PumpChannel>>,
    keep_open: bool,
    healthy: bool,
    read_timeout: Duration,
    response_timeout: Duration,
}

impl BusGuard<'_> {
    fn channel(&mut self) -> Result<&mut Box<dyn PumpChannel>, PumpError> {
        self.channel
            .as_mut()
            .ok_or_else(|| PumpError::Transport("bus channel already released".to_string()))
    }

    /// Mark the stream as untrustworthy when `result` failed
    fn track<T>(&mut self, result: Result<T, PumpError>) -> Result<T, PumpError> {
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    /// Drop unread input
    pub fn flush_input(&mut self) -> Result<(), PumpError> {
        let result = self.channel().and_then(|c| c.flush_input());
        self.track(result)
    }

    /// Write a command without reading the reply
    pub fn send(&mut self, command: &Command) -> Result<(), PumpError> {
        debug!("-> {}", command);
        let bytes = command.to_bytes();
        let result = self.channel().and_then(|c| c.write_all(&bytes));
        self.track(result)
    }

    /// Write a command and decode its reply
    ///
    /// A missing marker becomes `Timeout`; a fault sentinel becomes `DeviceFault`.
    pub fn exchange(&mut self, command: &Command) -> Result<Reply, PumpError> {
        self.send(command)?;

        let budget = self.response_timeout;
        let decoded = self.channel().and_then(|c| decoder::decode(c, budget));
        let decoded = self.track(decoded)?;
        debug!("<- {:?}", decoded);

        let result = match decoded {
            DecodeResult::Timeout => {
                warn!("No reply to {} within {}ms", command, budget.as_millis());
                Err(PumpError::Timeout {
                    command: command.to_string(),
                    waited_ms: budget.as_millis() as u64,
                })
            }
            DecodeResult::Message {
                context: super::decoder::ReplyContext { fault: Some(fault), .. },
                ..
            }
            | DecodeResult::Marker {
                context: super::decoder::ReplyContext { fault: Some(fault), .. },
                ..
            } => Err(PumpError::DeviceFault {
                address: command.address.get(),
                kind: fault.kind,
                detail: fault.detail,
            }),
            DecodeResult::Message {
                text,
                marker,
                context,
            } => Ok(Reply {
                message: Some(text),
                marker,
                trailing: context.trailing,
            }),
            DecodeResult::Marker { marker, context } => Ok(Reply {
                message: None,
                marker,
                trailing: context.trailing,
            }),
        };
        self.track(result)
    }

    /// Collect up to `len` raw bytes, waiting at most one read timeout overall
    pub fn read_window(&mut self, len: usize) -> Result<Vec<u8>, PumpError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut window = vec![0u8; len];
        let mut filled = 0;

        while filled < len && Instant::now() < deadline {
            let read = self.channel().and_then(|c| c.read(&mut window[filled..]));
            match self.track(read)? {
                0 => std::thread::sleep(IDLE_BACKOFF),
                n => filled += n,
            }
        }

        window.truncate(filled);
        Ok(window)
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if self.keep_open && self.healthy && !std::thread::panicking() {
            *self.slot = Some(channel);
        } else {
            if self.keep_open {
                warn!("Discarding bus channel after a failed operation");
            }
            drop(channel);
        }
    }
}
