//! Synchronous identity rendezvous over a duplex byte stream.
//!
//! The channel itself (socket connect/bind/accept, timeouts) belongs to the
//! caller; this module only needs a blocking `Read + Write` pair. Both peers
//! must call [`exchange`] before either can drive its queue pair past INIT.

use crate::error::{IblinkError, Result};
use crate::wire::{EndpointIdentity, WIRE_SIZE};
use std::io::{ErrorKind, Read, Write};

/// Exchange endpoint identities with the peer.
///
/// Writes the full local record first, then reads exactly [`WIRE_SIZE`]
/// bytes of the peer's record, looping on partial reads. A write that
/// accepts fewer bytes than the record holds is fatal; the exchange cannot
/// be recovered from a half-sent record.
pub fn exchange<C: Read + Write>(
    channel: &mut C,
    local: &EndpointIdentity,
) -> Result<EndpointIdentity> {
    let out = local.to_bytes();
    let written = channel
        .write(&out)
        .map_err(|e| IblinkError::ControlChannelWriteFailed {
            reason: e.to_string(),
        })?;
    if written < WIRE_SIZE {
        return Err(IblinkError::ControlChannelWriteFailed {
            reason: format!("short write: {written} of {WIRE_SIZE} bytes accepted"),
        });
    }
    channel
        .flush()
        .map_err(|e| IblinkError::ControlChannelWriteFailed {
            reason: format!("flush: {e}"),
        })?;

    let mut buf = [0u8; WIRE_SIZE];
    let mut received = 0usize;
    while received < WIRE_SIZE {
        match channel.read(&mut buf[received..]) {
            Ok(0) => {
                return Err(IblinkError::ControlChannelClosed {
                    received,
                    expected: WIRE_SIZE,
                })
            }
            Ok(n) => received += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(IblinkError::ControlChannelReadFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    let remote = EndpointIdentity::from_bytes(&buf);
    tracing::debug!(local = %local, remote = %remote, "identity rendezvous complete");
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    fn identity(tag: u8) -> EndpointIdentity {
        EndpointIdentity {
            addr: 0x1000 + tag as u64,
            rkey: 0x20 + tag as u32,
            qp_num: 0x30 + tag as u32,
            lid: 0x40 + tag as u16,
        }
    }

    /// Scripted duplex channel: hands out inbound bytes in caller-chosen
    /// chunk sizes and caps how many bytes a single write accepts.
    struct ScriptedChannel {
        inbound: VecDeque<u8>,
        read_chunk: usize,
        write_cap: usize,
        written: Vec<u8>,
    }

    impl ScriptedChannel {
        fn new(inbound: &[u8]) -> Self {
            Self {
                inbound: inbound.iter().copied().collect(),
                read_chunk: usize::MAX,
                write_cap: usize::MAX,
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Ok(0);
            }
            let n = buf.len().min(self.read_chunk).min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.write_cap);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn exchange_roundtrip() {
        let remote = identity(2);
        let mut chan = ScriptedChannel::new(&remote.to_bytes());
        let local = identity(1);

        let got = exchange(&mut chan, &local).unwrap();
        assert_eq!(got, remote);
        assert_eq!(chan.written, local.to_bytes());
    }

    #[test]
    fn fragmented_reads_are_assembled() {
        let remote = identity(7);
        let mut chan = ScriptedChannel::new(&remote.to_bytes());
        chan.read_chunk = 5; // 18 bytes arrive as 5+5+5+3

        let got = exchange(&mut chan, &identity(1)).unwrap();
        assert_eq!(got, remote);
    }

    #[test]
    fn short_write_is_fatal() {
        let mut chan = ScriptedChannel::new(&identity(2).to_bytes());
        chan.write_cap = 10;

        let err = exchange(&mut chan, &identity(1)).unwrap_err();
        match err {
            IblinkError::ControlChannelWriteFailed { reason } => {
                assert!(reason.contains("10 of 18"), "unexpected reason: {reason}");
            }
            other => panic!("expected write failure, got {other}"),
        }
    }

    #[test]
    fn eof_mid_record_reports_closed() {
        let remote_bytes = identity(2).to_bytes();
        let mut chan = ScriptedChannel::new(&remote_bytes[..11]);

        let err = exchange(&mut chan, &identity(1)).unwrap_err();
        match err {
            IblinkError::ControlChannelClosed { received, expected } => {
                assert_eq!(received, 11);
                assert_eq!(expected, WIRE_SIZE);
            }
            other => panic!("expected closed channel, got {other}"),
        }
    }

    #[test]
    fn read_error_reports_read_failed() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            }
        }
        impl Write for FailingReader {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let err = exchange(&mut FailingReader, &identity(1)).unwrap_err();
        assert!(matches!(err, IblinkError::ControlChannelReadFailed { .. }));
    }
}
