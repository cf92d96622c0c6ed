//! Pump operations
//!
//! The verbs a front-end calls. Each one is a single logical operation on the bus:
//! acquire (flush) → one or more command/reply round trips → release.

use tracing::{debug, info, warn};

use crate::protocol::{
    BusGuard, Command, Direction, PumpAddress, PumpError, PumpSession, Reply, Verb, MAX_ADDRESS,
};
use crate::unit_conversion::{self, RateFamily, WireRate};
use crate::{Rate, RateSet};

/// Bytes inspected by a discovery probe
pub const PROBE_WINDOW: usize = 10;

/// Forward rate used while priming, in µl/h
pub const PRIME_RATE_UL: f64 = 5000.0;

/// True when a probe reply shows a live pump: any ASCII digit in the window
pub fn probe_reply_has_digits(window: &[u8]) -> bool {
    window.iter().take(PROBE_WINDOW).any(u8::is_ascii_digit)
}

impl PumpSession {
    /// Probe the configured chain length
    pub fn discover(&self) -> Result<Vec<PumpAddress>, PumpError> {
        self.discover_up_to(self.config().chain_length)
    }

    /// Probe addresses `0..max_address` with `STP` and return those that answered
    ///
    /// A pump counts as present when its raw reply contains a digit within the first
    /// [`PROBE_WINDOW`] bytes. Input is flushed between probes so one pump's trailing
    /// bytes do not land in the next probe's window.
    pub fn discover_up_to(&self, max_address: u8) -> Result<Vec<PumpAddress>, PumpError> {
        if max_address > MAX_ADDRESS + 1 {
            return Err(PumpError::AddressOutOfRange(max_address as u32 - 1));
        }

        let mut bus = self.acquire()?;
        let mut present = Vec::new();

        for n in 0..max_address {
            let address = PumpAddress::new(n as u32)?;
            bus.send(&Command::new(address, Verb::Stop))?;
            let window = bus.read_window(PROBE_WINDOW)?;

            if probe_reply_has_digits(&window) {
                debug!("Pump {} answered: {:?}", address, String::from_utf8_lossy(&window));
                present.push(address);
            } else if !window.is_empty() {
                warn!(
                    "Address {} returned bytes without digits: {:?}",
                    address,
                    String::from_utf8_lossy(&window)
                );
            }

            bus.flush_input()?;
        }

        if present.is_empty() {
            return Err(PumpError::NoPumpsFound { probed: max_address });
        }

        info!(
            "Discovered pumps: {:?}",
            present.iter().map(|a| a.get()).collect::<Vec<_>>()
        );
        Ok(present)
    }

    /// Start or stop each pump according to the sign of its rate
    ///
    /// `RUN`/`RUNW` resume whatever rate the pump already holds, so call
    /// [`set_rates`](Self::set_rates) first.
    pub fn run(&self, rates: &RateSet) -> Result<(), PumpError> {
        check_rates(rates)?;
        let mut bus = self.acquire()?;
        run_on(&mut bus, rates)
    }

    /// Program each pump's rate, in the order given
    pub fn set_rates(&self, rates: &RateSet) -> Result<(), PumpError> {
        check_rates(rates)?;
        let mut bus = self.acquire()?;
        set_rates_on(&mut bus, rates)
    }

    /// Read back each pump's configured rate
    ///
    /// The query direction comes from the sign of the rate passed in. A zero rate is
    /// reported as stopped without asking the pump.
    pub fn get_rates(&self, rates: &RateSet) -> Result<RateSet, PumpError> {
        check_rates(rates)?;
        let needs_bus = rates.iter().any(|(_, rate)| Direction::of(rate).is_some());
        let mut bus = if needs_bus { Some(self.acquire()?) } else { None };
        get_rates_on(bus.as_mut(), rates)
    }

    /// Set syringe inner diameter, in millimeters as the device accepts it
    pub fn set_diameter(&self, address: PumpAddress, diameter_mm: &str) -> Result<(), PumpError> {
        let mut bus = self.acquire()?;
        bus.exchange(&Command::new(
            address,
            Verb::SetDiameter(diameter_mm.to_string()),
        ))?;
        Ok(())
    }

    /// Read syringe diameter as the device prints it
    pub fn get_diameter(&self, address: PumpAddress) -> Result<String, PumpError> {
        let mut bus = self.acquire()?;
        get_diameter_on(&mut bus, address)
    }

    /// Stop one pump
    pub fn stop(&self, address: PumpAddress) -> Result<(), PumpError> {
        let mut bus = self.acquire()?;
        bus.exchange(&Command::new(address, Verb::Stop))?;
        Ok(())
    }

    /// Set a high forward rate and start infusing; runs until stopped
    pub fn prime(&self, address: PumpAddress) -> Result<(), PumpError> {
        let mut bus = self.acquire()?;
        let wire = WireRate {
            direction: Direction::Forward,
            family: RateFamily::Microliters,
            magnitude: PRIME_RATE_UL,
        };
        bus.exchange(&Command::new(address, Verb::SetRate(wire)))?;
        bus.exchange(&Command::new(address, Verb::RunForward))?;
        info!("Priming pump {}", address);
        Ok(())
    }

    /// Stop every listed pump
    ///
    /// A failure on one pump does not prevent stopping the rest; the first error is
    /// returned once every pump has been tried.
    pub fn stop_all(&self, addresses: &[PumpAddress]) -> Result<(), PumpError> {
        let mut bus = self.acquire()?;
        let mut first_error = None;

        for &address in addresses {
            let result = match bus.flush_input() {
                Ok(()) => bus.exchange(&Command::new(address, Verb::Stop)).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Failed to stop pump {}: {}", address, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Program rates, start the pumps, and read the rates back
    pub fn apply(&self, rates: &RateSet) -> Result<RateSet, PumpError> {
        check_rates(rates)?;
        let mut bus = self.acquire()?;
        set_rates_on(&mut bus, rates)?;
        run_on(&mut bus, rates)?;
        get_rates_on(Some(&mut bus), rates)
    }

    /// Set the diameter and return what the device now reports
    pub fn configure_syringe(
        &self,
        address: PumpAddress,
        diameter_mm: &str,
    ) -> Result<String, PumpError> {
        let mut bus = self.acquire()?;
        bus.exchange(&Command::new(
            address,
            Verb::SetDiameter(diameter_mm.to_string()),
        ))?;
        get_diameter_on(&mut bus, address)
    }
}

/// Reject the whole batch before any I/O if one rate cannot be encoded
fn check_rates(rates: &RateSet) -> Result<(), PumpError> {
    for (address, rate) in rates.iter() {
        Verb::for_rate(rate).map_err(|e| match e {
            PumpError::InvalidArgument(msg) => {
                PumpError::InvalidArgument(format!("pump {}: {}", address, msg))
            }
            other => other,
        })?;
    }
    Ok(())
}

fn run_on(bus: &mut BusGuard<'_>, rates: &RateSet) -> Result<(), PumpError> {
    for (address, rate) in rates.iter() {
        let reply = bus.exchange(&Command::new(address, Verb::run_for(rate)?))?;
        debug!("Pump {} now {:?}", address, reply.marker);
    }
    Ok(())
}

fn set_rates_on(bus: &mut BusGuard<'_>, rates: &RateSet) -> Result<(), PumpError> {
    for (address, rate) in rates.iter() {
        bus.exchange(&Command::new(address, Verb::for_rate(rate)?))?;
    }
    Ok(())
}

fn get_rates_on(mut bus: Option<&mut BusGuard<'_>>, rates: &RateSet) -> Result<RateSet, PumpError> {
    let mut measured = RateSet::new();

    for (address, rate) in rates.iter() {
        let actual = match (Direction::of(rate), bus.as_deref_mut()) {
            (Some(direction), Some(bus)) => {
                let reply = bus.exchange(&Command::new(address, Verb::GetRate(direction)))?;
                let text = reply_text(&reply, address, "rate")?;
                let magnitude = unit_conversion::to_canonical(text)?;
                Rate::new(direction.signed(magnitude.ul_per_hour()))
            }
            _ => Rate::STOPPED,
        };
        measured.insert(address, actual);
    }

    Ok(measured)
}

fn get_diameter_on(bus: &mut BusGuard<'_>, address: PumpAddress) -> Result<String, PumpError> {
    let reply = bus.exchange(&Command::new(address, Verb::GetDiameter))?;
    let text = reply_text(&reply, address, "diameter")?;
    let diameter = text.split('\r').next().unwrap_or_default().trim();
    Ok(diameter.to_string())
}

fn reply_text<'r>(reply: &'r Reply, address: PumpAddress, what: &str) -> Result<&'r str, PumpError> {
    reply.message.as_deref().ok_or_else(|| {
        PumpError::MalformedResponse(format!(
            "pump {} sent no {} line before {:?}",
            address, what, reply.marker
        ))
    })
}
