//! Pump Bus Protocol
//!
//! Implements the addressed ASCII protocol of daisy-chained syringe pumps:
//! command encoding, the serial channel, and decoding of the pumps' reply stream.

pub mod commands;
mod connection;
pub mod decoder;
mod error;
pub mod serial;

pub use commands::{encode, Command, Direction, PumpAddress, Verb, MAX_ADDRESS};
pub use connection::{BusGuard, ConnectionConfig, PumpSession, Reply};
pub use decoder::{decode, DecodeResult, DeviceFault, FaultKind, Marker, ReplyContext, ResponseDecoder};
pub use error::PumpError;
pub use serial::{ChannelFactory, PumpChannel, SerialTransport};

/// Default baud rate of the pump chain
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Timeout of a single serial read in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Budget for a complete reply in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3000;

/// Number of addresses probed by discovery unless configured otherwise
pub const DEFAULT_CHAIN_LENGTH: u8 = 5;

/// Longest reply line accepted before the decoder gives up
pub const MAX_REPLY_LEN: usize = 256;
