//! Line framing for the core's streaming log endpoint.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

/// Longest accepted log line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Newline-delimited frames, decoded lossily.
///
/// Unlike `LinesCodec`, an over-long line or invalid UTF-8 never ends the
/// stream: the long line is skipped and invalid bytes are replaced.
#[derive(Debug)]
pub struct LogLineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline.
    scanned: usize,
    /// Inside an over-long line; drop everything up to the next newline.
    discarding: bool,
}

impl LogLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
            discarding: false,
        }
    }

    fn take_line(buf: &mut BytesMut, newline: usize) -> String {
        let line = buf.split_to(newline + 1);
        let line = &line[..line.len() - 1];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Default for LogLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LogLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let newline = buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);

            match (self.discarding, newline) {
                (true, Some(at)) => {
                    buf.advance(at + 1);
                    self.scanned = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.advance(buf.len());
                    self.scanned = 0;
                    return Ok(None);
                }
                (false, Some(at)) => {
                    self.scanned = 0;
                    if at > self.max_length {
                        warn!(length = at, "Dropping over-long log line");
                        buf.advance(at + 1);
                        continue;
                    }
                    return Ok(Some(Self::take_line(buf, at)));
                }
                (false, None) if buf.len() > self.max_length => {
                    warn!(length = buf.len(), "Dropping over-long log line");
                    buf.advance(buf.len());
                    self.scanned = 0;
                    self.discarding = true;
                    return Ok(None);
                }
                (false, None) => {
                    self.scanned = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding || buf.is_empty() {
            buf.clear();
            self.scanned = 0;
            self.discarding = false;
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        self.scanned = 0;
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut LogLineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut codec = LogLineCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"info\",\"pay"[..]);
        assert!(drain(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"load\":\"a\"}\r\n{}\n");
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec!["{\"type\":\"info\",\"payload\":\"a\"}".to_string(), "{}".to_string()]
        );
    }

    #[test]
    fn test_over_long_line_is_skipped() {
        let mut codec = LogLineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abc"[..]);
        assert!(drain(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"def\nshort\n");
        assert_eq!(drain(&mut codec, &mut buf), vec!["short".to_string()]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = LogLineCodec::new();
        let mut buf = BytesMut::from(&b"ok \xff\n"[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec!["ok \u{fffd}".to_string()]);
    }

    #[test]
    fn test_trailing_line_at_eof() {
        let mut codec = LogLineCodec::new();
        let mut buf = BytesMut::from(&b"last"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("last".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
