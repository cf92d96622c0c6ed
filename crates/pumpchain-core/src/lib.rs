//! # PumpChain Core Library
//!
//! Protocol engine for daisy-chained syringe pumps sharing one serial line.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Addressed ASCII command encoding (`01RUN`, `03ULH 1500`, ...)
//! - Decoding of the pumps' reply stream (lines, prompt markers, fault sentinels)
//! - Flow rate normalization between µl/h and the device's µl/ml command families
//! - Blocking pump operations over a shared, exclusively-held bus
//! - A simulated pump chain for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use pumpchain_core::prelude::*;
//!
//! let session = PumpSession::new(ConnectionConfig::default());
//! let pumps = session.discover()?;
//!
//! let rates: RateSet = "0=1500,1=-20000".parse()?;
//! session.set_rates(&rates)?;
//! session.run(&rates)?;
//! println!("{}", session.get_rates(&rates)?);
//! ```

pub mod demo;
pub mod protocol;
pub mod rates;
pub mod session;
pub mod unit_conversion;

pub use rates::{Rate, RateSet};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::SimulatedBus;
    pub use crate::protocol::{
        ConnectionConfig, Direction, Marker, PumpAddress, PumpError, PumpSession,
    };
    pub use crate::rates::{Rate, RateSet};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
