use pretty_assertions::assert_eq;
use pumpchain_core::protocol::{
    decode, DecodeResult, FaultKind, Marker, PumpChannel, PumpError, ReplyContext,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Mock serial port for testing
///
/// Each scripted chunk is returned by one `read`; an empty chunk is a read that timed out.
struct MockSerial {
    send_buffer: Vec<u8>,
    chunks: VecDeque<Vec<u8>>,
    fail_on_read: bool,
}

impl MockSerial {
    fn with_chunks(chunks: &[&[u8]]) -> Self {
        Self {
            send_buffer: Vec::new(),
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            fail_on_read: false,
        }
    }
}

impl PumpChannel for MockSerial {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PumpError> {
        self.send_buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PumpError> {
        if self.fail_on_read {
            return Err(PumpError::Transport("device unplugged".to_string()));
        }
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn flush_input(&mut self) -> Result<(), PumpError> {
        self.chunks.clear();
        Ok(())
    }

    fn flush_output(&mut self) -> Result<(), PumpError> {
        Ok(())
    }
}

const BUDGET: Duration = Duration::from_millis(200);

/// Channel whose every read blocks for a full read timeout and returns nothing
struct SilentChannel {
    read_timeout: Duration,
    reads: usize,
}

impl PumpChannel for SilentChannel {
    fn write_all(&mut self, _bytes: &[u8]) -> Result<(), PumpError> {
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, PumpError> {
        std::thread::sleep(self.read_timeout);
        self.reads += 1;
        Ok(0)
    }

    fn flush_input(&mut self) -> Result<(), PumpError> {
        Ok(())
    }

    fn flush_output(&mut self) -> Result<(), PumpError> {
        Ok(())
    }
}

#[test]
fn test_two_lines_then_stall_marker() {
    let mut mock = MockSerial::with_chunks(&[b"\r\n", b"first line\r\n", b"second line\r\n", b"04*"]);
    let result = decode(&mut mock, BUDGET).unwrap();

    assert_eq!(
        result,
        DecodeResult::Message {
            text: " second line\r\n".to_string(),
            marker: Marker::Stalled,
            context: ReplyContext {
                trailing: " 04".to_string(),
                fault: None,
            },
        }
    );
}

#[test]
fn test_marker_in_same_read_as_message() {
    let mut mock = MockSerial::with_chunks(&[b"\r\n1500.0 ul/h\r\n00>trailing junk"]);
    let result = decode(&mut mock, BUDGET).unwrap();

    assert_eq!(result.message(), Some("1500.0 ul/h\r\n"));
    assert_eq!(result.marker(), Some(Marker::Forward));
}

#[test]
fn test_idle_reads_do_not_end_decode() {
    let mut mock = MockSerial::with_chunks(&[b"\r\n", b"", b"", b"12", b"", b".5 ml/h\r\n", b"", b"01<"]);
    let result = decode(&mut mock, BUDGET).unwrap();

    assert_eq!(result.message(), Some("12.5 ml/h\r\n"));
    assert_eq!(result.marker(), Some(Marker::Backward));
}

#[test]
fn test_single_byte_reads() {
    let stream = b"\r\n14.60\r\n02:";
    let chunks: Vec<&[u8]> = stream.chunks(1).collect();
    let mut mock = MockSerial::with_chunks(&chunks);
    let result = decode(&mut mock, BUDGET).unwrap();

    assert_eq!(result.message(), Some("14.60\r\n"));
    assert_eq!(result.marker(), Some(Marker::Stopped));
}

#[test]
fn test_no_marker_is_timeout_not_empty_message() {
    let mut mock = MockSerial::with_chunks(&[b"\r\n1500.0 ul/h\r\n"]);
    let start = Instant::now();
    let result = decode(&mut mock, BUDGET).unwrap();

    assert_eq!(result, DecodeResult::Timeout);
    assert!(start.elapsed() >= BUDGET);
}

#[test]
fn test_silence_is_timeout() {
    let mut mock = MockSerial::with_chunks(&[]);
    assert_eq!(decode(&mut mock, BUDGET).unwrap(), DecodeResult::Timeout);
}

#[test]
fn test_fault_sentinel_reported_in_context() {
    let mut mock = MockSerial::with_chunks(&[b"\r\n?\r\n00:"]);
    let result = decode(&mut mock, BUDGET).unwrap();

    let fault = result.context().and_then(|c| c.fault.clone()).unwrap();
    assert_eq!(fault.kind, FaultKind::Unrecognized);
    assert_eq!(fault.detail, "?");
    assert_eq!(result.marker(), Some(Marker::Stopped));
}

#[test]
fn test_read_failure_propagates() {
    let mut mock = MockSerial::with_chunks(&[b"\r\n"]);
    mock.fail_on_read = true;
    let result = decode(&mut mock, BUDGET);
    assert!(matches!(result, Err(PumpError::Transport(_))));
}

#[test]
fn test_mock_records_writes() {
    let mut mock = MockSerial::with_chunks(&[]);
    mock.write_all(b"00STP\r").unwrap();
    assert_eq!(mock.send_buffer, b"00STP\r".to_vec());
}

#[test]
fn test_protocol_error_display() {
    let err = PumpError::Timeout {
        command: "01RAT".to_string(),
        waited_ms: 3000,
    };
    assert_eq!(
        err.to_string(),
        "Timed out after 3000ms waiting for reply to \"01RAT\""
    );
    assert!(err.is_timeout());
    assert!(!err.is_malformed());
}

#[test]
fn test_budget_overrun_bounded_by_one_read() {
    let read_timeout = Duration::from_millis(40);
    let budget = Duration::from_millis(100);
    let mut channel = SilentChannel {
        read_timeout,
        reads: 0,
    };

    let start = Instant::now();
    let result = decode(&mut channel, budget).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result, DecodeResult::Timeout);
    assert!(elapsed >= budget);
    // One read may start just before the budget runs out; no second one does
    assert!(
        elapsed < budget + read_timeout + Duration::from_millis(40),
        "decode took {:?}",
        elapsed
    );
    assert!(channel.reads <= 3, "{} reads", channel.reads);
}
