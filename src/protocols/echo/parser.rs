//! Echo protocol header parser.

use bytes::{BufMut, BytesMut};

/// Parsed echo header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Echo `length` payload bytes following a header of `header_len` bytes
    /// (length line + \r\n).
    Echo { length: usize, header_len: usize },
    /// Quit command.
    Quit,
    /// No complete header line yet.
    Incomplete,
    /// Not a length, or a length above the allowed maximum.
    Invalid(&'static str),
}

/// Parse an echo header from the start of `input`.
pub fn parse(input: &[u8], max_length: usize) -> Header {
    let Some(line_end) = find_crlf(input) else {
        return Header::Incomplete;
    };
    let line = &input[..line_end];

    if line.eq_ignore_ascii_case(b"QUIT") {
        return Header::Quit;
    }

    let Some(length) = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    else {
        return Header::Invalid("invalid length");
    };
    if length > max_length {
        return Header::Invalid("payload too large");
    }

    Header::Echo {
        length,
        header_len: line_end + 2,
    }
}

/// Append an echo response header for `length` payload bytes.
pub fn put_header(length: usize, output: &mut BytesMut) {
    output.put_slice(length.to_string().as_bytes());
    output.put_slice(b"\r\n");
}

/// Position of the first \r\n, pointing at the \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn test_parse_echo() {
        assert_eq!(
            parse(b"100\r\nabc", MAX),
            Header::Echo {
                length: 100,
                header_len: 5
            }
        );
    }

    #[test]
    fn test_parse_quit() {
        assert_eq!(parse(b"quit\r\n", MAX), Header::Quit);
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(parse(b"100", MAX), Header::Incomplete);
        assert_eq!(parse(b"100\r", MAX), Header::Incomplete);
    }

    #[test]
    fn test_invalid_length() {
        assert_eq!(parse(b"abc\r\n", MAX), Header::Invalid("invalid length"));
        assert_eq!(parse(b"-1\r\n", MAX), Header::Invalid("invalid length"));
        assert_eq!(parse(b"1025\r\n", MAX), Header::Invalid("payload too large"));
    }

    #[test]
    fn test_put_header() {
        let mut buf = BytesMut::new();
        put_header(12345, &mut buf);
        assert_eq!(&buf[..], b"12345\r\n");
    }
}
