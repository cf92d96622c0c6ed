//! Reply decoding
//!
//! Pumps answer with an irregular stream: an echo line, then text lines ending in `\n`,
//! and finally a single prompt character telling the pump state. Fault sentinels
//! (`?`, `O`, `E`) in the lead position are followed by one line of detail.
//!
//! ```text
//! \r\n1500.0 ul/h\r\n01:
//! ^^^^ echo line      ^^ address prompt, then ':' = stopped
//! ```
//!
//! The prompt character is the only normal end of an exchange; every newline merely
//! completes a message and accumulation carries on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::serial::PumpChannel;
use super::{PumpError, MAX_REPLY_LEN};

/// Sleep between reads that returned nothing, so a non-blocking channel does not spin
pub(crate) const IDLE_BACKOFF: Duration = Duration::from_millis(2);

/// Size of each low-level read
const CHUNK_SIZE: usize = 64;

/// Pump state prompt that ends a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    /// `<` withdrawing
    Backward,
    /// `>` infusing
    Forward,
    /// `:` stopped
    Stopped,
    /// `*` stalled
    Stalled,
}

impl Marker {
    /// Marker for a prompt byte, if it is one
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'<' => Some(Marker::Backward),
            b'>' => Some(Marker::Forward),
            b':' => Some(Marker::Stopped),
            b'*' => Some(Marker::Stalled),
            _ => None,
        }
    }

    /// Prompt byte on the wire
    pub fn byte(self) -> u8 {
        match self {
            Marker::Backward => b'<',
            Marker::Forward => b'>',
            Marker::Stopped => b':',
            Marker::Stalled => b'*',
        }
    }
}

/// Device-level fault announced by a sentinel in the lead position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// `?` command not understood
    Unrecognized,
    /// `O` argument out of range
    OutOfRange,
    /// `E` generic device error
    Error,
}

impl FaultKind {
    /// Fault for a sentinel byte, if it is one
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'?' => Some(FaultKind::Unrecognized),
            b'O' => Some(FaultKind::OutOfRange),
            b'E' => Some(FaultKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FaultKind::Unrecognized => "unrecognized command",
            FaultKind::OutOfRange => "out of range",
            FaultKind::Error => "device error",
        };
        f.write_str(text)
    }
}

/// Fault sentinel and the line that followed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    /// Which sentinel was seen
    pub kind: FaultKind,
    /// The line after the sentinel, trimmed
    pub detail: String,
}

/// Everything seen besides the message itself
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyContext {
    /// Bytes after the last completed line, before the marker (usually the address prompt)
    pub trailing: String,
    /// Set when the reply opened with a fault sentinel
    pub fault: Option<DeviceFault>,
}

/// Terminal outcome of one decode
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult {
    /// A marker ended the reply after at least one completed line; `text` is the last line
    Message {
        /// Last completed line, terminator included
        text: String,
        /// Pump state
        marker: Marker,
        /// Trailing bytes and fault
        context: ReplyContext,
    },
    /// A marker ended the reply before any line completed
    Marker {
        /// Pump state
        marker: Marker,
        /// Trailing bytes and fault
        context: ReplyContext,
    },
    /// No marker within the response budget
    Timeout,
}

impl DecodeResult {
    /// Pump state, unless the decode timed out
    pub fn marker(&self) -> Option<Marker> {
        match self {
            DecodeResult::Message { marker, .. } | DecodeResult::Marker { marker, .. } => {
                Some(*marker)
            }
            DecodeResult::Timeout => None,
        }
    }

    /// Last completed line, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            DecodeResult::Message { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Trailing bytes and fault, unless the decode timed out
    pub fn context(&self) -> Option<&ReplyContext> {
        match self {
            DecodeResult::Message { context, .. } | DecodeResult::Marker { context, .. } => {
                Some(context)
            }
            DecodeResult::Timeout => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum DecodeState {
    /// Skipping the echo line
    AwaitingLine,
    /// Next byte may be a fault sentinel
    AwaitingLead,
    /// Skipping the detail line after a sentinel
    DiscardingFaultLine { kind: FaultKind, detail: Vec<u8> },
    /// Collecting message bytes until a marker
    Accumulating,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum ByteClass {
    Newline,
    Marker(Marker),
    Other,
}

impl ByteClass {
    fn of(byte: u8) -> Self {
        if byte == b'\n' {
            ByteClass::Newline
        } else if let Some(marker) = Marker::from_byte(byte) {
            ByteClass::Marker(marker)
        } else {
            ByteClass::Other
        }
    }
}

/// Byte-at-a-time reply state machine
///
/// Markers are honoured in every state; the remaining byte classes are handled per state.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
    last_message: Option<String>,
    fault: Option<DeviceFault>,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    /// Decoder positioned at the start of the echo line
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingLine,
            buffer: Vec::new(),
            last_message: None,
            fault: None,
        }
    }

    /// True once a marker has been consumed
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Consume one byte; returns the result once a marker ends the reply
    pub fn feed(&mut self, byte: u8) -> Result<Option<DecodeResult>, PumpError> {
        if self.is_done() {
            return Err(PumpError::MalformedResponse(
                "decoder fed after reply was complete".to_string(),
            ));
        }

        let class = ByteClass::of(byte);
        if let ByteClass::Marker(marker) = class {
            return Ok(Some(self.finish(marker)));
        }

        match std::mem::replace(&mut self.state, DecodeState::Done) {
            DecodeState::AwaitingLine => {
                self.state = match class {
                    ByteClass::Newline => DecodeState::AwaitingLead,
                    _ => DecodeState::AwaitingLine,
                };
            }
            DecodeState::AwaitingLead => {
                // The lead byte always starts the message, sentinel or not
                self.buffer.push(byte);
                self.state = match FaultKind::from_byte(byte) {
                    Some(kind) => DecodeState::DiscardingFaultLine {
                        kind,
                        detail: vec![byte],
                    },
                    None => self.accumulate(class)?,
                };
            }
            DecodeState::DiscardingFaultLine { kind, mut detail } => {
                if let ByteClass::Newline = class {
                    let detail = String::from_utf8_lossy(&detail).trim().to_string();
                    warn!("Pump reported {}: {:?}", kind, detail);
                    self.fault = Some(DeviceFault { kind, detail });
                    self.state = DecodeState::Accumulating;
                } else {
                    detail.push(byte);
                    if detail.len() > MAX_REPLY_LEN {
                        return Err(overflow());
                    }
                    self.state = DecodeState::DiscardingFaultLine { kind, detail };
                }
            }
            DecodeState::Accumulating => {
                self.buffer.push(byte);
                self.state = self.accumulate(class)?;
            }
            DecodeState::Done => unreachable!("checked above"),
        }

        Ok(None)
    }

    /// Handle a byte already appended to the buffer
    fn accumulate(&mut self, class: ByteClass) -> Result<DecodeState, PumpError> {
        if let ByteClass::Newline = class {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            trace!("Completed line {:?}", line);
            self.last_message = Some(line);
            self.buffer.clear();
            self.buffer.push(b' ');
        } else if self.buffer.len() > MAX_REPLY_LEN {
            return Err(overflow());
        }
        Ok(DecodeState::Accumulating)
    }

    fn finish(&mut self, marker: Marker) -> DecodeResult {
        self.state = DecodeState::Done;
        let context = ReplyContext {
            trailing: String::from_utf8_lossy(&self.buffer).into_owned(),
            fault: self.fault.take(),
        };
        match self.last_message.take() {
            Some(text) => DecodeResult::Message {
                text,
                marker,
                context,
            },
            None => DecodeResult::Marker { marker, context },
        }
    }
}

fn overflow() -> PumpError {
    PumpError::MalformedResponse(format!(
        "reply line longer than {} bytes without a terminator",
        MAX_REPLY_LEN
    ))
}

/// Read one complete reply from `channel`
///
/// `budget` bounds the whole decode, not each read: reads that return nothing are
/// retried until the budget is spent, then `Timeout` is returned. The budget is checked
/// between reads, so a read started just before it runs out can still block for one
/// channel read timeout; the worst case is `budget` plus one read timeout.
/// Bytes after the marker in the same chunk belong to no exchange and are dropped.
pub fn decode<C>(channel: &mut C, budget: Duration) -> Result<DecodeResult, PumpError>
where
    C: PumpChannel + ?Sized,
{
    let mut decoder = ResponseDecoder::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    let start = Instant::now();

    loop {
        if start.elapsed() >= budget {
            debug!("No marker after {}ms", start.elapsed().as_millis());
            return Ok(DecodeResult::Timeout);
        }

        let n = channel.read(&mut chunk)?;
        if n == 0 {
            std::thread::sleep(IDLE_BACKOFF);
            continue;
        }
        trace!("Read {} bytes: {:?}", n, String::from_utf8_lossy(&chunk[..n]));

        for (i, &byte) in chunk[..n].iter().enumerate() {
            if let Some(result) = decoder.feed(byte)? {
                if i + 1 < n {
                    trace!(
                        "Dropping {} bytes after marker: {:?}",
                        n - i - 1,
                        String::from_utf8_lossy(&chunk[i + 1..n])
                    );
                }
                return Ok(result);
            }
        }
    }
}
