//! Length-prefixed record framing for the subscription event stream.
//!
//! The agent delivers events as a chunked HTTP response framed as records,
//! each record being the decimal byte length, a newline, and the record
//! payload:
//!
//! ```text
//! 121\n{"type":"SUBSCRIBED",...}18\n{"type":"SHUTDOWN"}
//! ```
//!
//! The decoder is incremental: network chunks are fed in as they arrive and
//! complete records are drained out, independent of chunk boundaries.

use bytes::{Buf, Bytes, BytesMut};

use crate::ProtoError;

/// Upper bound on a single record, to fail fast on corrupt prefixes.
const MAX_RECORD_LENGTH: usize = 4 * 1024 * 1024;

/// Incremental record decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,

    /// Length of the record currently being accumulated, once its prefix
    /// has been fully read.
    pending: Option<usize>,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a network chunk to the internal buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Drains the next complete record, if one is buffered.
    pub fn next_record(&mut self) -> Result<Option<Bytes>, ProtoError> {
        loop {
            match self.pending {
                Some(length) => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }

                    self.pending = None;
                    return Ok(Some(self.buffer.split_to(length).freeze()));
                }
                None => {
                    let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                        return Ok(None);
                    };

                    let prefix = self.buffer.split_to(newline);
                    self.buffer.advance(1); // the newline itself

                    let text = std::str::from_utf8(&prefix)
                        .map_err(|_| ProtoError::InvalidLengthPrefix(format!("{:?}", prefix)))?;
                    let length: usize = text
                        .parse()
                        .map_err(|_| ProtoError::InvalidLengthPrefix(text.to_string()))?;

                    if length > MAX_RECORD_LENGTH {
                        return Err(ProtoError::RecordTooLarge {
                            length,
                            max: MAX_RECORD_LENGTH,
                        });
                    }

                    self.pending = Some(length);
                }
            }
        }
    }
}

/// Frames a single record for the wire.
#[must_use]
pub fn encode(record: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(record.len() + 12);
    framed.extend_from_slice(record.len().to_string().as_bytes());
    framed.push(b'\n');
    framed.extend_from_slice(record);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut decoder = Decoder::new();
        decoder.feed(&encode(b"hello"));

        let record = decoder.next_record().unwrap().unwrap();
        assert_eq!(&record[..], b"hello");
        assert!(decoder.next_record().unwrap().is_none());
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let mut decoder = Decoder::new();
        let framed = encode(b"{\"type\":\"SHUTDOWN\"}");

        // Feed one byte at a time.
        for byte in &framed {
            decoder.feed(std::slice::from_ref(byte));
        }

        let record = decoder.next_record().unwrap().unwrap();
        assert_eq!(&record[..], b"{\"type\":\"SHUTDOWN\"}");
    }

    #[test]
    fn test_decode_multiple_records_in_one_chunk() {
        let mut decoder = Decoder::new();
        let mut wire = encode(b"first");
        wire.extend_from_slice(&encode(b"second"));
        decoder.feed(&wire);

        assert_eq!(&decoder.next_record().unwrap().unwrap()[..], b"first");
        assert_eq!(&decoder.next_record().unwrap().unwrap()[..], b"second");
        assert!(decoder.next_record().unwrap().is_none());
    }

    #[test]
    fn test_decode_empty_record() {
        let mut decoder = Decoder::new();
        decoder.feed(&encode(b""));

        let record = decoder.next_record().unwrap().unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn test_invalid_length_prefix() {
        let mut decoder = Decoder::new();
        decoder.feed(b"abc\npayload");

        assert!(matches!(
            decoder.next_record(),
            Err(ProtoError::InvalidLengthPrefix(_))
        ));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut decoder = Decoder::new();
        decoder.feed(b"999999999999\n");

        assert!(matches!(
            decoder.next_record(),
            Err(ProtoError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_incomplete_record_returns_none() {
        let mut decoder = Decoder::new();
        decoder.feed(b"10\npart");

        assert!(decoder.next_record().unwrap().is_none());

        decoder.feed(b"ialrec");
        let record = decoder.next_record().unwrap().unwrap();
        assert_eq!(&record[..], b"partialrec");
    }
}
