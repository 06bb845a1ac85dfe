//! Memcached text protocol response line parser.
//!
//! Recognizes the server lines a `get` / `set` client can receive:
//! - `VALUE <key> <flags> <bytes> [<cas>]`
//! - `END`
//! - `STORED`, `NOT_STORED`, `EXISTS`, `NOT_FOUND`
//! - `ERROR`, `CLIENT_ERROR <msg>`, `SERVER_ERROR <msg>`

use crate::protocols::ProtocolError;
use std::str;

/// One parsed response line (without its CRLF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine<'a> {
    Value {
        key: &'a [u8],
        flags: u32,
        bytes: usize,
    },
    End,
    Stored,
    NotStored,
    Exists,
    NotFound,
    Error,
    ClientError(&'a [u8]),
    ServerError(&'a [u8]),
}

/// Parse a response line
pub fn parse_line(line: &[u8]) -> Result<ResponseLine<'_>, ProtocolError> {
    match line {
        b"END" => return Ok(ResponseLine::End),
        b"STORED" => return Ok(ResponseLine::Stored),
        b"NOT_STORED" => return Ok(ResponseLine::NotStored),
        b"EXISTS" => return Ok(ResponseLine::Exists),
        b"NOT_FOUND" => return Ok(ResponseLine::NotFound),
        b"ERROR" => return Ok(ResponseLine::Error),
        _ => {}
    }

    if let Some(msg) = error_message(line, b"CLIENT_ERROR") {
        return Ok(ResponseLine::ClientError(msg));
    }
    if let Some(msg) = error_message(line, b"SERVER_ERROR") {
        return Ok(ResponseLine::ServerError(msg));
    }
    if line.starts_with(b"VALUE ") {
        return parse_value(line);
    }

    Err(ProtocolError::UnexpectedLine(
        String::from_utf8_lossy(line).into_owned(),
    ))
}

/// Message of `<word>` or `<word> <message>`.
fn error_message<'a>(line: &'a [u8], word: &[u8]) -> Option<&'a [u8]> {
    match line.strip_prefix(word)? {
        [] => Some(&[]),
        [b' ', msg @ ..] => Some(msg.trim_ascii_start()),
        _ => None,
    }
}

fn parse_value(line: &[u8]) -> Result<ResponseLine<'_>, ProtocolError> {
    let invalid = || ProtocolError::InvalidValueHeader(String::from_utf8_lossy(line).into_owned());

    let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
    let _value = parts.next();
    let key = parts.next().ok_or_else(invalid)?;
    let flags = parse_number::<u32>(parts.next()).ok_or_else(invalid)?;
    let bytes = parse_number::<usize>(parts.next()).ok_or_else(invalid)?;

    // Optional CAS unique; anything beyond it is malformed.
    if let Some(cas) = parts.next() {
        parse_number::<u64>(Some(cas)).ok_or_else(invalid)?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }

    Ok(ResponseLine::Value { key, flags, bytes })
}

fn parse_number<T: str::FromStr>(part: Option<&[u8]>) -> Option<T> {
    str::from_utf8(part?).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        match parse_line(b"VALUE foo 5 3") {
            Ok(ResponseLine::Value { key, flags, bytes }) => {
                assert_eq!(key, b"foo");
                assert_eq!(flags, 5);
                assert_eq!(bytes, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_value_with_cas() {
        assert!(matches!(
            parse_line(b"VALUE foo 0 10 99"),
            Ok(ResponseLine::Value { bytes: 10, .. })
        ));
    }

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(parse_line(b"END").unwrap(), ResponseLine::End);
        assert_eq!(parse_line(b"STORED").unwrap(), ResponseLine::Stored);
        assert_eq!(parse_line(b"NOT_STORED").unwrap(), ResponseLine::NotStored);
        assert_eq!(parse_line(b"EXISTS").unwrap(), ResponseLine::Exists);
        assert_eq!(parse_line(b"NOT_FOUND").unwrap(), ResponseLine::NotFound);
        assert_eq!(parse_line(b"ERROR").unwrap(), ResponseLine::Error);
        assert_eq!(
            parse_line(b"SERVER_ERROR out of memory").unwrap(),
            ResponseLine::ServerError(b"out of memory")
        );
        assert_eq!(
            parse_line(b"CLIENT_ERROR bad data chunk").unwrap(),
            ResponseLine::ClientError(b"bad data chunk")
        );
        assert_eq!(
            parse_line(b"SERVER_ERROR").unwrap(),
            ResponseLine::ServerError(b"")
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_line(b"VALUE foo x 3"),
            Err(ProtocolError::InvalidValueHeader(_))
        ));
        assert!(matches!(
            parse_line(b"VALUE foo 0"),
            Err(ProtocolError::InvalidValueHeader(_))
        ));
        assert!(matches!(
            parse_line(b"VALUE foo 0 3 1 extra"),
            Err(ProtocolError::InvalidValueHeader(_))
        ));
        assert!(matches!(
            parse_line(b"STORED!"),
            Err(ProtocolError::UnexpectedLine(_))
        ));
        assert!(matches!(
            parse_line(b"CLIENT_ERRORX bad"),
            Err(ProtocolError::UnexpectedLine(_))
        ));
        assert!(matches!(
            parse_line(b"SERVER_ERRORS"),
            Err(ProtocolError::UnexpectedLine(_))
        ));
        assert!(matches!(
            parse_line(b"end"),
            Err(ProtocolError::UnexpectedLine(_))
        ));
    }
}
