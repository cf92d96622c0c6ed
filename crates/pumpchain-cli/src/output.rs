//! Output formatting for pumpchain (text or json)

use pumpchain_core::protocol::PumpAddress;
use pumpchain_core::RateSet;
use serde::Serialize;

/// One pump and its rate, as printed by the rate commands
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateRow {
    pub address: u8,
    pub rate_ul_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiameterRow {
    pub address: u8,
    pub diameter_mm: String,
}

pub fn rate_rows(rates: &RateSet) -> Vec<RateRow> {
    rates
        .iter()
        .map(|(address, rate)| RateRow {
            address: address.get(),
            rate_ul_per_hour: rate.ul_per_hour(),
        })
        .collect()
}

pub struct OutputContext {
    pub json: bool,
}

impl OutputContext {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print a confirmation line; suppressed in json mode so stdout stays parseable
    pub fn success(&self, msg: &str) {
        if !self.json {
            println!("{}", msg);
        }
    }

    pub fn addresses(&self, addresses: &[PumpAddress]) {
        if self.json {
            let raw: Vec<u8> = addresses.iter().map(|a| a.get()).collect();
            print_json(&raw);
        } else if addresses.is_empty() {
            println!("No pumps");
        } else {
            for address in addresses {
                println!("pump {}", address);
            }
        }
    }

    pub fn rates(&self, rates: &RateSet) {
        if self.json {
            print_json(&rate_rows(rates));
        } else {
            for (address, rate) in rates.iter() {
                println!("pump {}  {}", address, rate);
            }
        }
    }

    pub fn diameter(&self, address: PumpAddress, diameter_mm: &str) {
        if self.json {
            print_json(&DiameterRow {
                address: address.get(),
                diameter_mm: diameter_mm.to_string(),
            });
        } else {
            println!("pump {}  {} mm", address, diameter_mm);
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}
