use pumpchain_core::protocol::{Direction, PumpError};
use pumpchain_core::unit_conversion::{to_canonical, to_wire, RateFamily};
use pumpchain_core::Rate;

/// Render `rate` the way a pump reports it, then parse it back with the direction applied
fn through_device_text(rate: f64) -> f64 {
    match to_wire(Rate::new(rate)).unwrap() {
        Some(wire) => {
            let parsed = to_canonical(&format!("{}\r\n", wire.to_text())).unwrap();
            wire.direction.signed(parsed.ul_per_hour())
        }
        None => 0.0,
    }
}

#[test]
fn test_round_trip_recovers_rate() {
    for rate in [0.0, 500.0, 9999.0, 10000.0, -10000.0, -500.0] {
        let back = through_device_text(rate);
        assert!((back - rate).abs() < 1e-6, "{} came back as {}", rate, back);
    }
}

#[test]
fn test_round_trip_fractional_ml() {
    let back = through_device_text(15500.0);
    assert!((back - 15500.0).abs() < 1e-6);
}

#[test]
fn test_9999_stays_in_micro_family() {
    let wire = to_wire(Rate::new(9999.0)).unwrap().unwrap();
    assert_eq!(wire.family, RateFamily::Microliters);
    assert_eq!(wire.mnemonic(), "ULH");
    assert_eq!(wire.argument(), "9999");
}

#[test]
fn test_10000_switches_to_milli_family() {
    let wire = to_wire(Rate::new(10000.0)).unwrap().unwrap();
    assert_eq!(wire.family, RateFamily::Milliliters);
    assert_eq!(wire.mnemonic(), "MLH");
    assert_eq!(wire.argument(), "10");
}

#[test]
fn test_negative_10000_uses_reverse_milli_family() {
    let wire = to_wire(Rate::new(-10000.0)).unwrap().unwrap();
    assert_eq!(wire.direction, Direction::Reverse);
    assert_eq!(wire.mnemonic(), "MLHW");
    assert_eq!(wire.argument(), "10");
}

#[test]
fn test_direction_from_sign_not_magnitude() {
    let wire = to_wire(Rate::new(-9999.0)).unwrap().unwrap();
    assert_eq!(wire.mnemonic(), "ULHW");
    assert_eq!(wire.argument(), "9999");
}

#[test]
fn test_wire_rate_back_to_canonical() {
    let wire = to_wire(Rate::new(-20000.0)).unwrap().unwrap();
    assert_eq!(wire.to_rate(), Rate::new(-20000.0));
}

#[test]
fn test_ml_reply_scaled_to_ul() {
    let rate = to_canonical("20.000 ml/h\r\n").unwrap();
    assert!((rate.ul_per_hour() - 20000.0).abs() < 1e-9);
}

#[test]
fn test_unknown_unit_is_malformed() {
    let err = to_canonical("3.0 ul/mn\r\n").unwrap_err();
    assert!(matches!(err, PumpError::MalformedResponse(_)));
    assert!(err.is_malformed());
}

#[test]
fn test_non_numeric_value_is_malformed() {
    assert!(matches!(
        to_canonical("fast ul/h"),
        Err(PumpError::MalformedResponse(_))
    ));
}

#[test]
fn test_non_finite_reply_is_malformed() {
    let err = to_canonical("inf ul/h\r\n").unwrap_err();
    assert!(matches!(err, PumpError::MalformedResponse(_)));
    assert!(matches!(
        to_canonical("NaN ml/h\r\n"),
        Err(PumpError::MalformedResponse(_))
    ));
}

#[test]
fn test_non_finite_rate_is_invalid_argument() {
    assert!(matches!(
        to_wire(Rate::new(f64::INFINITY)),
        Err(PumpError::InvalidArgument(_))
    ));
    assert!(matches!(
        to_wire(Rate::new(f64::NAN)),
        Err(PumpError::InvalidArgument(_))
    ));
}

#[test]
fn test_rate_display() {
    assert_eq!(Rate::new(1500.0).to_string(), "1500 ul/h");
    assert_eq!(Rate::new(-0.5).to_string(), "-0.5 ul/h");
}
