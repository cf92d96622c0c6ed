//! Flow rates and ordered per-pump rate batches

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::{PumpAddress, PumpError};
use crate::unit_conversion::format_magnitude;

/// Signed flow rate in µl/h; positive infuses, negative withdraws, zero is stopped
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(f64);

impl Rate {
    /// Zero flow
    pub const STOPPED: Rate = Rate(0.0);

    /// Rate from a signed µl/h value
    pub fn new(ul_per_hour: f64) -> Self {
        Self(ul_per_hour)
    }

    /// Signed value in µl/h
    pub fn ul_per_hour(self) -> f64 {
        self.0
    }

    /// True for exactly zero
    pub fn is_stopped(self) -> bool {
        self.0 == 0.0
    }

    /// This rate, or `InvalidArgument` when it is NaN or infinite
    pub fn finite(self) -> Result<Self, PumpError> {
        if self.0.is_finite() {
            Ok(self)
        } else {
            Err(PumpError::InvalidArgument(format!(
                "rate {} ul/h is not finite",
                self.0
            )))
        }
    }
}

impl From<f64> for Rate {
    fn from(ul_per_hour: f64) -> Self {
        Self(ul_per_hour)
    }
}

impl From<i32> for Rate {
    fn from(ul_per_hour: i32) -> Self {
        Self(ul_per_hour as f64)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ul/h", format_magnitude(self.0))
    }
}

/// One batch of per-pump rates
///
/// Iteration follows insertion order, which is the order pumps are addressed on the bus.
/// Inserting an address that is already present replaces its rate in place.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateSet {
    entries: Vec<(PumpAddress, Rate)>,
}

impl RateSet {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rate for `address`, keeping its original position if already present
    pub fn insert(&mut self, address: PumpAddress, rate: Rate) {
        match self.entries.iter_mut().find(|(a, _)| *a == address) {
            Some(entry) => entry.1 = rate,
            None => self.entries.push((address, rate)),
        }
    }

    /// Rate stored for `address`
    pub fn get(&self, address: PumpAddress) -> Option<Rate> {
        self.entries
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, r)| *r)
    }

    /// Addresses in bus order
    pub fn addresses(&self) -> impl Iterator<Item = PumpAddress> + '_ {
        self.entries.iter().map(|(a, _)| *a)
    }

    /// Entries in bus order
    pub fn iter(&self) -> impl Iterator<Item = (PumpAddress, Rate)> + '_ {
        self.entries.iter().copied()
    }

    /// Number of pumps in the batch
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no pump is listed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(PumpAddress, Rate)> for RateSet {
    fn from_iter<I: IntoIterator<Item = (PumpAddress, Rate)>>(iter: I) -> Self {
        let mut set = RateSet::new();
        for (address, rate) in iter {
            set.insert(address, rate);
        }
        set
    }
}

impl IntoIterator for RateSet {
    type Item = (PumpAddress, Rate);
    type IntoIter = std::vec::IntoIter<(PumpAddress, Rate)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Parses `0=1500,1=-20000` (whitespace around items is ignored)
impl FromStr for RateSet {
    type Err = PumpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = RateSet::new();
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (address, rate) = item
                .split_once('=')
                .ok_or_else(|| PumpError::InvalidArgument(format!("expected address=rate, got {:?}", item)))?;

            let address: PumpAddress = address.parse()?;
            let rate: f64 = rate.trim().parse().map_err(|_| {
                PumpError::InvalidArgument(format!("rate {:?} is not a number", rate.trim()))
            })?;
            set.insert(address, Rate::new(rate).finite()?);
        }
        Ok(set)
    }
}

impl fmt::Display for RateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (address, rate) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "p{}={}", address.get(), rate)?;
        }
        Ok(())
    }
}
