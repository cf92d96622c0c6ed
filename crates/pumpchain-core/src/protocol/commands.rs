//! Protocol commands
//!
//! Defines the addressed ASCII commands understood by daisy-chained syringe pumps.
//! Every command is `AA<MNEMONIC>[ <arg>]\r` where `AA` is the two-digit address.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::PumpError;
use crate::unit_conversion::{self, WireRate};
use crate::Rate;

/// Highest address that fits the two-digit wire prefix
pub const MAX_ADDRESS: u8 = 99;

/// Command terminator
pub const CR: u8 = 0x0D;

/// Address of one pump on the shared bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u8")]
pub struct PumpAddress(u8);

impl PumpAddress {
    /// Validate an address; anything above 99 cannot be encoded
    pub fn new(value: u32) -> Result<Self, PumpError> {
        if value > MAX_ADDRESS as u32 {
            return Err(PumpError::AddressOutOfRange(value));
        }
        Ok(Self(value as u8))
    }

    /// Raw address, 0..=99
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u32> for PumpAddress {
    type Error = PumpError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for PumpAddress {
    type Err = PumpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s.trim().parse().map_err(|_| {
            PumpError::InvalidArgument(format!("address {:?} is not a number", s.trim()))
        })?;
        Self::new(value)
    }
}

impl From<PumpAddress> for u8 {
    fn from(address: PumpAddress) -> Self {
        address.0
    }
}

impl fmt::Display for PumpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Pumping direction; reverse is "withdraw" on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Infuse
    Forward,
    /// Withdraw
    Reverse,
}

impl Direction {
    /// Direction implied by a signed rate; `None` when stopped
    pub fn of(rate: Rate) -> Option<Self> {
        let ul = rate.ul_per_hour();
        if ul > 0.0 {
            Some(Direction::Forward)
        } else if ul < 0.0 {
            Some(Direction::Reverse)
        } else {
            None
        }
    }

    /// Apply this direction to an unsigned magnitude
    pub fn signed(self, magnitude: f64) -> f64 {
        match self {
            Direction::Forward => magnitude.abs(),
            Direction::Reverse => -magnitude.abs(),
        }
    }

    pub(crate) fn suffix(self) -> &'static str {
        match self {
            Direction::Forward => "",
            Direction::Reverse => "W",
        }
    }
}

/// Operation requested of a single pump
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    /// Stop pumping (`STP`)
    Stop,
    /// Infuse at the configured rate (`RUN`)
    RunForward,
    /// Withdraw at the configured rate (`RUNW`)
    RunReverse,
    /// Set the rate for one direction (`ULH`/`MLH`, `W` suffix for reverse)
    SetRate(WireRate),
    /// Set syringe diameter in millimeters, passed to the device verbatim (`MMD`)
    SetDiameter(String),
    /// Query the configured rate for a direction (`RAT`/`RATW`)
    GetRate(Direction),
    /// Query syringe diameter (`DIA`)
    GetDiameter,
}

impl Verb {
    /// Verb that establishes `rate` on the device: `Stop` for zero, otherwise a rate setting
    pub fn for_rate(rate: Rate) -> Result<Self, PumpError> {
        Ok(match unit_conversion::to_wire(rate)? {
            Some(wire) => Verb::SetRate(wire),
            None => Verb::Stop,
        })
    }

    /// Verb that starts or stops the pump according to the sign of `rate`
    pub fn run_for(rate: Rate) -> Result<Self, PumpError> {
        Ok(match Direction::of(rate.finite()?) {
            Some(Direction::Forward) => Verb::RunForward,
            Some(Direction::Reverse) => Verb::RunReverse,
            None => Verb::Stop,
        })
    }

    /// Mnemonic and optional argument, without address or terminator
    pub fn mnemonic(&self) -> String {
        match self {
            Verb::Stop => "STP".to_string(),
            Verb::RunForward => "RUN".to_string(),
            Verb::RunReverse => "RUNW".to_string(),
            Verb::SetRate(wire) => format!("{} {}", wire.mnemonic(), wire.argument()),
            Verb::SetDiameter(mm) => format!("MMD {}", mm),
            Verb::GetRate(direction) => format!("RAT{}", direction.suffix()),
            Verb::GetDiameter => "DIA".to_string(),
        }
    }
}

/// An addressed command ready for the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Target pump
    pub address: PumpAddress,
    /// What the pump is asked to do
    pub verb: Verb,
}

impl Command {
    /// Command for one pump
    pub fn new(address: PumpAddress, verb: Verb) -> Self {
        Self { address, verb }
    }

    /// Encode to ASCII bytes terminated by a single carriage return
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.address, &self.verb)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.address, self.verb.mnemonic())
    }
}

/// Encode `verb` for the pump at `address`
pub fn encode(address: PumpAddress, verb: &Verb) -> Vec<u8> {
    let mut bytes = format!("{}{}", address, verb.mnemonic()).into_bytes();
    bytes.push(CR);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> PumpAddress {
        PumpAddress::new(n).unwrap()
    }

    #[test]
    fn test_address_range() {
        assert!(PumpAddress::new(0).is_ok());
        assert!(PumpAddress::new(99).is_ok());
        assert!(matches!(
            PumpAddress::new(100),
            Err(PumpError::AddressOutOfRange(100))
        ));
    }

    #[test]
    fn test_address_from_str() {
        assert_eq!(" 7".parse::<PumpAddress>().unwrap().get(), 7);
        assert!(matches!(
            "seven".parse::<PumpAddress>(),
            Err(PumpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stop_every_address() {
        for n in 0..=99 {
            let bytes = encode(addr(n), &Verb::Stop);
            let text = String::from_utf8(bytes).unwrap();
            assert_eq!(text, format!("{:02}STP\r", n));
            assert_eq!(text.matches('\r').count(), 1);
        }
    }

    #[test]
    fn test_mnemonic_table() {
        let a = addr(3);
        assert_eq!(encode(a, &Verb::Stop), b"03STP\r");
        assert_eq!(encode(a, &Verb::RunForward), b"03RUN\r");
        assert_eq!(encode(a, &Verb::RunReverse), b"03RUNW\r");
        assert_eq!(encode(a, &Verb::GetRate(Direction::Forward)), b"03RAT\r");
        assert_eq!(encode(a, &Verb::GetRate(Direction::Reverse)), b"03RATW\r");
        assert_eq!(encode(a, &Verb::GetDiameter), b"03DIA\r");
        assert_eq!(
            encode(a, &Verb::SetDiameter("14.60".to_string())),
            b"03MMD 14.60\r"
        );
    }

    #[test]
    fn test_diameter_passed_verbatim() {
        let bytes = encode(addr(1), &Verb::SetDiameter("not-a-number".to_string()));
        assert_eq!(bytes, b"01MMD not-a-number\r");
    }

    #[test]
    fn test_rate_verbs() {
        let a = addr(12);
        let rate_verb = |ul: f64| Verb::for_rate(Rate::new(ul)).unwrap();
        assert_eq!(encode(a, &rate_verb(1500.0)), b"12ULH 1500\r");
        assert_eq!(encode(a, &rate_verb(-500.0)), b"12ULHW 500\r");
        assert_eq!(encode(a, &rate_verb(20000.0)), b"12MLH 20\r");
        assert_eq!(encode(a, &rate_verb(0.0)), b"12STP\r");
        assert!(Verb::for_rate(Rate::new(f64::INFINITY)).is_err());
    }

    #[test]
    fn test_run_verbs() {
        assert_eq!(Verb::run_for(Rate::new(1.0)).unwrap(), Verb::RunForward);
        assert_eq!(Verb::run_for(Rate::new(-1.0)).unwrap(), Verb::RunReverse);
        assert_eq!(Verb::run_for(Rate::new(0.0)).unwrap(), Verb::Stop);
        assert!(matches!(
            Verb::run_for(Rate::new(f64::NAN)),
            Err(PumpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_command_display() {
        let cmd = Command::new(addr(4), Verb::RunReverse);
        assert_eq!(cmd.to_string(), "04RUNW");
        assert_eq!(cmd.to_bytes(), b"04RUNW\r");
    }
}
