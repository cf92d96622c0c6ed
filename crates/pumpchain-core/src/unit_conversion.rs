//! Flow Rate Unit Conversion
//!
//! Converts between the canonical in-memory rate (signed µl/h) and what the pumps
//! speak on the wire:
//! - Inbound: reply text such as `1500.0 ul/h` or `20.00 ml/h` → µl/h
//! - Outbound: signed µl/h → `ULH`/`MLH` family (plus `W` for withdraw) and magnitude
//!
//! The µl field on the device holds at most 9999, so anything larger is sent in ml/h.

use serde::{Deserialize, Serialize};

use crate::protocol::{Direction, PumpError};
use crate::Rate;

/// Largest magnitude (µl/h) the device accepts in the µl family
pub const UL_FIELD_MAX: f64 = 9999.0;

/// µl per ml
pub const UL_PER_ML: f64 = 1000.0;

/// Length of the unit suffix at the end of a rate reply, including its leading space
pub const UNIT_SUFFIX_LEN: usize = 5;

/// Mnemonic family used for a rate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateFamily {
    /// `ULH` / `ULHW`, magnitude in µl/h
    Microliters,
    /// `MLH` / `MLHW`, magnitude in ml/h
    Milliliters,
}

impl RateFamily {
    /// Unit suffix as the device prints it
    pub fn unit(self) -> &'static str {
        match self {
            RateFamily::Microliters => "ul/h",
            RateFamily::Milliliters => "ml/h",
        }
    }

    fn scale(self) -> f64 {
        match self {
            RateFamily::Microliters => 1.0,
            RateFamily::Milliliters => UL_PER_ML,
        }
    }
}

/// A rate as it is sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireRate {
    /// Infuse or withdraw
    pub direction: Direction,
    /// Unit family the magnitude is expressed in
    pub family: RateFamily,
    /// Unsigned, in the family's unit
    pub magnitude: f64,
}

impl WireRate {
    /// `ULH`, `ULHW`, `MLH` or `MLHW`
    pub fn mnemonic(&self) -> String {
        let base = match self.family {
            RateFamily::Microliters => "ULH",
            RateFamily::Milliliters => "MLH",
        };
        format!("{}{}", base, self.direction.suffix())
    }

    /// Numeric argument as written after the mnemonic
    pub fn argument(&self) -> String {
        format_magnitude(self.magnitude)
    }

    /// Reply text a pump prints for this setting, e.g. `20 ml/h`
    pub fn to_text(&self) -> String {
        format!("{} {}", self.argument(), self.family.unit())
    }

    /// Back to the canonical signed rate
    pub fn to_rate(&self) -> Rate {
        Rate::new(self.direction.signed(self.magnitude * self.family.scale()))
    }
}

/// Choose the wire encoding for `rate`; `Ok(None)` means the pump should be stopped
///
/// Direction comes from the sign of the input, never from the scaled magnitude.
/// Rates that are not finite, or too small to survive three-decimal formatting, are
/// rejected rather than sent as a stop or a zero setting.
pub fn to_wire(rate: Rate) -> Result<Option<WireRate>, PumpError> {
    let rate = rate.finite()?;
    let Some(direction) = Direction::of(rate) else {
        return Ok(None);
    };
    let magnitude = rate.ul_per_hour().abs();

    let (family, magnitude) = if magnitude > UL_FIELD_MAX {
        (RateFamily::Milliliters, magnitude / UL_PER_ML)
    } else {
        (RateFamily::Microliters, magnitude)
    };

    let wire = WireRate {
        direction,
        family,
        magnitude,
    };
    if wire.argument() == "0" {
        return Err(PumpError::InvalidArgument(format!(
            "rate {} ul/h is too small to encode",
            rate.ul_per_hour()
        )));
    }
    Ok(Some(wire))
}

/// Parse a rate reply into µl/h
///
/// The value is the text before a trailing ` ul/h` or ` ml/h`; any other suffix is rejected.
/// Replies carry magnitudes only, so the result is unsigned as far as the device is concerned.
pub fn to_canonical(text: &str) -> Result<Rate, PumpError> {
    let trimmed = text.trim_end();
    let split = trimmed
        .len()
        .checked_sub(UNIT_SUFFIX_LEN)
        .filter(|&at| trimmed.is_char_boundary(at))
        .ok_or_else(|| PumpError::MalformedResponse(format!("rate reply too short: {:?}", text)))?;
    let (number, unit) = trimmed.split_at(split);

    let family = match unit {
        " ul/h" => RateFamily::Microliters,
        " ml/h" => RateFamily::Milliliters,
        other => {
            return Err(PumpError::MalformedResponse(format!(
                "unrecognized rate unit {:?} in {:?}",
                other, text
            )))
        }
    };

    let value: f64 = number.trim().parse().map_err(|_| {
        PumpError::MalformedResponse(format!("rate value {:?} is not a number", number.trim()))
    })?;

    if !value.is_finite() {
        return Err(PumpError::MalformedResponse(format!(
            "rate value {:?} is not finite",
            number.trim()
        )));
    }

    Ok(Rate::new(value * family.scale()))
}

/// Format a magnitude with up to three decimals and no trailing zeros
pub fn format_magnitude(value: f64) -> String {
    let fixed = format!("{:.3}", value);
    match fixed.trim_end_matches('0').trim_end_matches('.') {
        "" | "-" | "-0" => "0".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundary() {
        let below = to_wire(Rate::new(9999.0)).unwrap().unwrap();
        assert_eq!(below.family, RateFamily::Microliters);
        assert_eq!(below.mnemonic(), "ULH");
        assert_eq!(below.argument(), "9999");

        let at = to_wire(Rate::new(10000.0)).unwrap().unwrap();
        assert_eq!(at.family, RateFamily::Milliliters);
        assert_eq!(at.mnemonic(), "MLH");
        assert!((at.magnitude - 10.0).abs() < 1e-9);
        assert_eq!(at.argument(), "10");

        let reverse = to_wire(Rate::new(-10000.0)).unwrap().unwrap();
        assert_eq!(reverse.mnemonic(), "MLHW");
        assert_eq!(reverse.direction, Direction::Reverse);
        assert_eq!(reverse.argument(), "10");
    }

    #[test]
    fn test_zero_is_stop() {
        assert!(to_wire(Rate::new(0.0)).unwrap().is_none());
        assert!(to_wire(Rate::new(-0.0)).unwrap().is_none());
    }

    #[test]
    fn test_non_finite_rate_not_encoded() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                to_wire(Rate::new(bad)),
                Err(PumpError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_rate_rounding_to_zero_rejected() {
        assert!(matches!(
            to_wire(Rate::new(0.0004)),
            Err(PumpError::InvalidArgument(_))
        ));
        assert!(matches!(
            to_wire(Rate::new(-0.0004)),
            Err(PumpError::InvalidArgument(_))
        ));
        assert_eq!(to_wire(Rate::new(0.001)).unwrap().unwrap().argument(), "0.001");
    }

    #[test]
    fn test_reverse_micro_family() {
        let wire = to_wire(Rate::new(-500.0)).unwrap().unwrap();
        assert_eq!(wire.mnemonic(), "ULHW");
        assert_eq!(wire.argument(), "500");
    }

    #[test]
    fn test_parse_units() {
        assert!((to_canonical("1500.0 ul/h\r\n").unwrap().ul_per_hour() - 1500.0).abs() < 1e-9);
        assert!((to_canonical(" 20.00 ml/h\r\n").unwrap().ul_per_hour() - 20000.0).abs() < 1e-9);
        assert!((to_canonical("0.5 ml/h").unwrap().ul_per_hour() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rejects_unknown_unit() {
        assert!(matches!(
            to_canonical("12.0 ul/m\r\n"),
            Err(PumpError::MalformedResponse(_))
        ));
        assert!(matches!(to_canonical("ul/h"), Err(PumpError::MalformedResponse(_))));
        assert!(matches!(
            to_canonical("abc ul/h"),
            Err(PumpError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_finite() {
        for text in ["inf ul/h\r\n", "NaN ml/h\r\n", "-infinity ul/h"] {
            assert!(
                matches!(to_canonical(text), Err(PumpError::MalformedResponse(_))),
                "{:?} was accepted",
                text
            );
        }
    }

    #[test]
    fn test_format_magnitude() {
        assert_eq!(format_magnitude(1500.0), "1500");
        assert_eq!(format_magnitude(100.0), "100");
        assert_eq!(format_magnitude(15.5), "15.5");
        assert_eq!(format_magnitude(0.125), "0.125");
        assert_eq!(format_magnitude(0.0), "0");
    }
}
