//! Newline-delimited framing for the bank protocol

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest line accepted from a peer, terminator excluded
pub const MAX_LINE_LENGTH: usize = 4096;

/// Codec for newline-terminated ASCII lines.
///
/// Decoded lines have the terminator (`\n` or `\r\n`) and surrounding
/// whitespace removed; encoded lines get a single `\n` appended. Invalid
/// UTF-8 is replaced rather than rejected, so a garbled line still reaches
/// the parser. A line longer than [`MAX_LINE_LENGTH`] is dropped up to its
/// terminator and yields an empty line; [`LineCodec::take_oversized`] reports
/// it.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes of the buffer already scanned for a newline
    scanned: usize,
    // Dropping the rest of an oversized line
    discarding: bool,
    oversized: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of oversized lines dropped since the last call
    pub fn take_oversized(&mut self) -> usize {
        std::mem::take(&mut self.oversized)
    }

    fn take_line(buf: &[u8]) -> String {
        String::from_utf8_lossy(buf).trim().to_string()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let end = self.scanned + offset;
                self.scanned = 0;
                let line = src.split_to(end + 1);
                if std::mem::take(&mut self.discarding) || end > MAX_LINE_LENGTH {
                    self.oversized += 1;
                    return Ok(Some(String::new()));
                }
                Ok(Some(Self::take_line(&line[..end])))
            }
            None if src.len() > MAX_LINE_LENGTH => {
                src.clear();
                self.scanned = 0;
                self.discarding = true;
                Ok(None)
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Final line without a terminator
        self.scanned = 0;
        let rest = src.split_to(src.len());
        if std::mem::take(&mut self.discarding) {
            self.oversized += 1;
            return Ok(Some(String::new()));
        }
        Ok(Some(Self::take_line(&rest)))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_codec() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("AD 1/10.0.0.1 5".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"AD 1/10.0.0.1 5\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, "AD 1/10.0.0.1 5");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_and_crlf_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"BA"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" 300\r\nBN\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "BA 300");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "BN");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unterminated_line_at_eof() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"AC"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap(), "AC");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_line_dropped() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE_LENGTH + 1].as_slice());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"AAAA\nBN\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "");
        assert_eq!(codec.take_oversized(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "BN");
        assert_eq!(codec.take_oversized(), 0);
    }

    #[test]
    fn test_long_line_in_one_chunk_dropped() {
        let mut codec = LineCodec::new();
        let mut bytes = vec![b'A'; MAX_LINE_LENGTH + 10];
        bytes.push(b'\n');
        let mut buf = BytesMut::from(bytes.as_slice());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "");
        assert_eq!(codec.take_oversized(), 1);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"AB \xff\xfe\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "AB \u{fffd}\u{fffd}");
    }
}
