//! Demo Mode - Simulated pump chain
//!
//! Emulates a daisy chain of syringe pumps behind a serial line so the protocol engine
//! and front-ends can run without hardware. Each simulated pump keeps its own infuse and
//! withdraw rate, run state and syringe diameter, and answers in the same byte format as
//! the real devices. Reply chunking and line noise are configurable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::protocol::{ChannelFactory, Marker, PumpChannel, PumpError};
use crate::unit_conversion::{format_magnitude, RateFamily, UL_FIELD_MAX};

/// Diameter a fresh simulated pump reports, in mm
const DEFAULT_DIAMETER: &str = "14.60";

/// Bytes a noisy line may inject
const NOISE_BYTES: &[u8] = b"0123456789\r\n ";

/// State of one simulated pump
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPump {
    /// Infuse rate as (family, magnitude in that family's unit)
    pub infuse: (RateFamily, f64),
    /// Withdraw rate as (family, magnitude in that family's unit)
    pub withdraw: (RateFamily, f64),
    /// Prompt the pump answers with
    pub state: Marker,
    /// Diameter text as last accepted by `MMD`
    pub diameter: String,
    /// Extra line printed before the prompt in reply to `STP`
    pub status_line: Option<String>,
}

impl Default for SimulatedPump {
    fn default() -> Self {
        Self {
            infuse: (RateFamily::Microliters, 0.0),
            withdraw: (RateFamily::Microliters, 0.0),
            state: Marker::Stopped,
            diameter: DEFAULT_DIAMETER.to_string(),
            status_line: None,
        }
    }
}

struct Noise {
    rng: StdRng,
    probability: f64,
}

#[derive(Default)]
struct BusState {
    pumps: BTreeMap<u8, SimulatedPump>,
    /// Bytes waiting for the controller to read
    rx: VecDeque<u8>,
    /// Partially received command
    pending: Vec<u8>,
    /// Every command received, without terminator
    log: Vec<String>,
    chunk_size: usize,
    noise: Option<Noise>,
    opens: usize,
}

impl BusState {
    fn handle_command(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw).trim().to_string();
        trace!("Simulated bus received {:?}", text);
        self.log.push(text.clone());

        let reply = parse_address(&text).and_then(|(address, body)| {
            self.pumps
                .get_mut(&address)
                .map(|pump| respond(pump, address, body))
        });
        if let Some(reply) = reply {
            self.rx.extend(reply.bytes());
        }

        if let Some(noise) = self.noise.as_mut() {
            if noise.rng.gen_bool(noise.probability) {
                let byte = NOISE_BYTES[noise.rng.gen_range(0..NOISE_BYTES.len())];
                self.rx.push_back(byte);
            }
        }
    }
}

fn parse_address(text: &str) -> Option<(u8, &str)> {
    let digits = text.get(..2)?;
    let address = digits.parse().ok()?;
    Some((address, &text[2..]))
}

fn prompt(address: u8, marker: Marker) -> String {
    format!("\r\n{:02}{}", address, marker.byte() as char)
}

fn with_line(line: &str, address: u8, marker: Marker) -> String {
    format!("\r\n{}{}", line, prompt(address, marker))
}

/// Parse a rate argument the way the device would; `None` means out of range
fn parse_rate(arg: &str, family: RateFamily) -> Option<(RateFamily, f64)> {
    let value: f64 = arg.trim().parse().ok()?;
    // Both families share the same four-digit field
    (value > 0.0 && value <= UL_FIELD_MAX).then_some((family, value))
}

fn rate_text((family, magnitude): (RateFamily, f64)) -> String {
    format!("{} {}", format_magnitude(magnitude), family.unit())
}

fn respond(pump: &mut SimulatedPump, address: u8, body: &str) -> String {
    let (mnemonic, arg) = match body.split_once(' ') {
        Some((m, a)) => (m, Some(a)),
        None => (body, None),
    };

    match (mnemonic, arg) {
        ("STP", None) => {
            pump.state = Marker::Stopped;
            match &pump.status_line {
                Some(line) => with_line(line, address, pump.state),
                None => prompt(address, pump.state),
            }
        }
        ("RUN", None) => {
            pump.state = Marker::Forward;
            prompt(address, pump.state)
        }
        ("RUNW", None) => {
            pump.state = Marker::Backward;
            prompt(address, pump.state)
        }
        ("ULH" | "MLH" | "ULHW" | "MLHW", Some(arg)) => {
            let family = if mnemonic.starts_with('U') {
                RateFamily::Microliters
            } else {
                RateFamily::Milliliters
            };
            match parse_rate(arg, family) {
                Some(rate) if mnemonic.ends_with('W') => {
                    pump.withdraw = rate;
                    prompt(address, pump.state)
                }
                Some(rate) => {
                    pump.infuse = rate;
                    prompt(address, pump.state)
                }
                None => with_line("OOR", address, pump.state),
            }
        }
        ("MMD", Some(arg)) => match arg.trim().parse::<f64>() {
            Ok(mm) if (0.1..=50.0).contains(&mm) => {
                pump.diameter = arg.trim().to_string();
                prompt(address, pump.state)
            }
            _ => with_line("OOR", address, pump.state),
        },
        ("RAT", None) => with_line(&rate_text(pump.infuse), address, pump.state),
        ("RATW", None) => with_line(&rate_text(pump.withdraw), address, pump.state),
        ("DIA", None) => with_line(&pump.diameter, address, pump.state),
        _ => with_line("?", address, pump.state),
    }
}

/// A simulated pump chain; cloning shares the same pumps
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// Chain with pumps answering at `addresses`
    pub fn with_pumps(addresses: impl IntoIterator<Item = u8>) -> Self {
        let pumps = addresses
            .into_iter()
            .map(|a| (a, SimulatedPump::default()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(BusState {
                pumps,
                chunk_size: usize::MAX,
                ..BusState::default()
            })),
        }
    }

    /// Hand replies to the controller at most `size` bytes per read
    pub fn with_chunk_size(self, size: usize) -> Self {
        self.lock().chunk_size = size.max(1);
        self
    }

    /// After each command, inject one random byte with the given probability
    pub fn with_noise(self, seed: u64, probability: f64) -> Self {
        self.lock().noise = Some(Noise {
            rng: StdRng::seed_from_u64(seed),
            probability: probability.clamp(0.0, 1.0),
        });
        self
    }

    /// Make the pump at `address` print `line` before its prompt when stopped
    pub fn with_status_line(self, address: u8, line: &str) -> Self {
        if let Some(pump) = self.lock().pumps.get_mut(&address) {
            pump.status_line = Some(line.to_string());
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of one pump
    pub fn pump(&self, address: u8) -> Option<SimulatedPump> {
        self.lock().pumps.get(&address).cloned()
    }

    /// Commands received so far, without terminators
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Number of times a channel was opened
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Queue raw bytes as if a device had sent them unprompted
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }
}

impl ChannelFactory for SimulatedBus {
    fn open(&self) -> Result<Box<dyn PumpChannel>, PumpError> {
        self.lock().opens += 1;
        Ok(Box::new(SimulatedChannel { bus: self.clone() }))
    }

    fn describe(&self) -> String {
        let pumps: Vec<u8> = self.lock().pumps.keys().copied().collect();
        format!("simulated chain {:?}", pumps)
    }
}

struct SimulatedChannel {
    bus: SimulatedBus,
}

impl PumpChannel for SimulatedChannel {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PumpError> {
        let mut state = self.bus.lock();
        for &byte in bytes {
            if byte == b'\r' {
                let command = std::mem::take(&mut state.pending);
                state.handle_command(&command);
            } else {
                state.pending.push(byte);
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PumpError> {
        let mut state = self.bus.lock();
        let n = buf.len().min(state.chunk_size).min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            // n never exceeds the queue length
            *slot = state.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn flush_input(&mut self) -> Result<(), PumpError> {
        self.bus.lock().rx.clear();
        Ok(())
    }

    fn flush_output(&mut self) -> Result<(), PumpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(bus: &SimulatedBus, command: &str) -> String {
        let mut channel = bus.open().unwrap();
        channel.write_all(format!("{}\r", command).as_bytes()).unwrap();
        let mut buf = [0u8; 128];
        let n = channel.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_stop_prompt() {
        let bus = SimulatedBus::with_pumps([1]);
        assert_eq!(roundtrip(&bus, "01STP"), "\r\n01:");
    }

    #[test]
    fn test_absent_pump_is_silent() {
        let bus = SimulatedBus::with_pumps([1]);
        assert_eq!(roundtrip(&bus, "02STP"), "");
    }

    #[test]
    fn test_rate_storage() {
        let bus = SimulatedBus::with_pumps([0]);
        roundtrip(&bus, "00MLHW 20");
        assert_eq!(roundtrip(&bus, "00RATW"), "\r\n20 ml/h\r\n00:");
        assert_eq!(bus.pump(0).unwrap().withdraw, (RateFamily::Milliliters, 20.0));
    }

    #[test]
    fn test_micro_field_overflow_is_out_of_range() {
        let bus = SimulatedBus::with_pumps([0]);
        assert_eq!(roundtrip(&bus, "00ULH 10000"), "\r\nOOR\r\n00:");
    }

    #[test]
    fn test_unknown_mnemonic() {
        let bus = SimulatedBus::with_pumps([0]);
        roundtrip(&bus, "00RUN");
        assert_eq!(roundtrip(&bus, "00XYZ"), "\r\n?\r\n00>");
    }

    #[test]
    fn test_status_line_on_stop() {
        let bus = SimulatedBus::with_pumps([2]).with_status_line(2, "P2 READY 1200");
        assert_eq!(roundtrip(&bus, "02STP"), "\r\nP2 READY 1200\r\n02:");
    }

    #[test]
    fn test_chunked_reads() {
        let bus = SimulatedBus::with_pumps([0]).with_chunk_size(2);
        let mut channel = bus.open().unwrap();
        channel.write_all(b"00STP\r").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"\r\n");
    }
}
