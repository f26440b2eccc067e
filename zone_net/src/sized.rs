//! Sized ("large file") transfer state machines, §4.5.

use crate::error::PacketError;

/// Pulls slices from a caller-supplied data source on demand, so the pump
/// doesn't have to hold an entire file in memory. `state` is opaque caller
/// data (e.g. a file handle or buffer position) threaded through each call.
pub trait SizedDataSource: Send {
    /// Writes up to `buf.len()` bytes at `offset` into `buf`, returning how
    /// many bytes were written (less than `buf.len()` only at end of
    /// stream).
    fn request_data(&mut self, offset: u32, buf: &mut [u8]) -> usize;
}

pub struct SizedSend {
    total_length: u32,
    offset: u32,
    source: Box<dyn SizedDataSource>,
    cancelled: bool,
}

impl SizedSend {
    pub fn new(total_length: u32, source: Box<dyn SizedDataSource>) -> Self {
        Self {
            total_length,
            offset: 0,
            source,
            cancelled: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cancelled || self.offset >= self.total_length
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Pulls the next chunk, or `None` once the stream is complete/cancelled
    /// (caller should then invoke the completion callback with an empty
    /// buffer so state can be freed, per §4.5).
    pub fn next_chunk(&mut self, max_chunk: usize) -> Option<(u32, u32, Vec<u8>)> {
        if self.is_complete() {
            return None;
        }
        let remaining = (self.total_length - self.offset) as usize;
        let want = remaining.min(max_chunk);
        let mut buf = vec![0u8; want];
        let got = self.source.request_data(self.offset, &mut buf);
        buf.truncate(got);
        let offset = self.offset;
        self.offset += got as u32;
        if got == 0 {
            self.cancelled = true;
        }
        Some((self.total_length, offset, buf))
    }
}

/// Receiver-side accumulation of a sized transfer by offset. The total
/// length is fixed at stream start; any mismatch aborts the transfer
/// (§4.5: "mismatches abort the transfer").
pub struct SizedRecv {
    total_length: u32,
    received: Vec<u8>,
}

impl SizedRecv {
    pub fn new(total_length: u32) -> Self {
        Self {
            total_length,
            received: vec![0u8; total_length as usize],
        }
    }

    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    /// Writes `chunk` at `offset`, verifying it against the length the
    /// stream started with.
    pub fn accept(
        &mut self,
        total_length: u32,
        offset: u32,
        chunk: &[u8],
    ) -> Result<(), PacketError> {
        if total_length != self.total_length {
            return Err(PacketError::SizedLengthMismatch {
                started: self.total_length,
                seen: total_length,
            });
        }
        let start = offset as usize;
        let end = start.saturating_add(chunk.len());
        if end > self.received.len() {
            return Err(PacketError::TooShort {
                need: end,
                got: self.received.len(),
            });
        }
        self.received[start..end].copy_from_slice(chunk);
        Ok(())
    }

    pub fn is_complete(&self, highest_offset_seen_plus_len: u32) -> bool {
        highest_offset_seen_plus_len >= self.total_length
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSource(Vec<u8>);
    impl SizedDataSource for VecSource {
        fn request_data(&mut self, offset: u32, buf: &mut [u8]) -> usize {
            let start = offset as usize;
            if start >= self.0.len() {
                return 0;
            }
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            n
        }
    }

    #[test]
    fn send_splits_into_chunks_and_completes() {
        let data = (0..20u8).collect::<Vec<_>>();
        let mut send = SizedSend::new(20, Box::new(VecSource(data.clone())));
        let mut reassembled = Vec::new();
        while let Some((total, _offset, chunk)) = send.next_chunk(7) {
            assert_eq!(total, 20);
            reassembled.extend_from_slice(&chunk);
        }
        assert_eq!(reassembled, data);
        assert!(send.is_complete());
    }

    #[test]
    fn recv_rejects_length_mismatch() {
        let mut recv = SizedRecv::new(10);
        assert!(recv.accept(10, 0, b"hello").is_ok());
        assert!(recv.accept(999, 5, b"world").is_err());
    }

    #[test]
    fn recv_accumulates_by_offset() {
        let mut recv = SizedRecv::new(10);
        recv.accept(10, 5, b"world").unwrap();
        recv.accept(10, 0, b"hello").unwrap();
        assert_eq!(recv.into_bytes(), b"helloworld");
    }
}
