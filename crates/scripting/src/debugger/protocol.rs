//! Debugger wire protocol.
//!
//! Inbound frames are RESP arrays of bulk strings parsed by a deliberately
//! tolerant parser: at most [`DEBUG_MAX_ARGS`] bulks of at most
//! [`DEBUG_MAX_ARG_LEN`] bytes each. Outbound frames are multi-bulk arrays
//! of simple strings; a session closes with the `+<endsession>` sentinel.

use crate::config::{DEBUG_MAX_ARGS, DEBUG_MAX_ARG_LEN};

/// Sentinel frame terminating a debugger session.
pub const END_SESSION_FRAME: &[u8] = b"+<endsession>\r\n";

/// Result of scanning the inbound buffer for one command.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// One full command was parsed; `consumed` bytes can be drained.
    Complete {
        argv: Vec<Vec<u8>>,
        consumed: usize,
    },
    /// More bytes are needed.
    Incomplete,
    /// The buffer does not hold a well-formed command; the session must
    /// close.
    Corrupt(&'static str),
}

fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[pos..];
    let newline = rest.iter().position(|&b| b == b'\n')?;
    let line = &rest[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, pos + newline + 1))
}

fn parse_len(line: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(line).ok()?;
    text.parse::<i64>().ok()
}

/// Scans `buf` for one inbound command.
pub fn parse_command(buf: &[u8]) -> ParseOutcome {
    if buf.is_empty() {
        return ParseOutcome::Incomplete;
    }
    if buf[0] != b'*' {
        return ParseOutcome::Corrupt("expected array header");
    }
    let Some((header, mut pos)) = read_line(buf, 1) else {
        return ParseOutcome::Incomplete;
    };
    let Some(count) = parse_len(header) else {
        return ParseOutcome::Corrupt("bad array length");
    };
    if count < 0 || count as usize > DEBUG_MAX_ARGS {
        return ParseOutcome::Corrupt("array length out of range");
    }

    let mut argv = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return ParseOutcome::Incomplete;
        }
        if buf[pos] != b'$' {
            return ParseOutcome::Corrupt("expected bulk header");
        }
        let Some((header, body_start)) = read_line(buf, pos + 1) else {
            return ParseOutcome::Incomplete;
        };
        let Some(len) = parse_len(header) else {
            return ParseOutcome::Corrupt("bad bulk length");
        };
        if len < 0 || len as usize > DEBUG_MAX_ARG_LEN {
            return ParseOutcome::Corrupt("bulk length out of range");
        }
        let len = len as usize;
        if buf.len() < body_start + len {
            return ParseOutcome::Incomplete;
        }
        argv.push(buf[body_start..body_start + len].to_vec());

        // Tolerant framing: accept a missing or partial trailing CRLF.
        pos = body_start + len;
        if buf.get(pos) == Some(&b'\r') {
            pos += 1;
        }
        if buf.get(pos) == Some(&b'\n') {
            pos += 1;
        }
    }
    ParseOutcome::Complete {
        argv,
        consumed: pos,
    }
}

/// Encodes buffered log lines as one multi-bulk of simple strings.
/// Embedded CR/LF bytes are replaced by spaces.
pub fn encode_log_frame(logs: &[String], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("*{}\r\n", logs.len()).as_bytes());
    for line in logs {
        out.push(b'+');
        for byte in line.bytes() {
            out.push(match byte {
                b'\r' | b'\n' => b' ',
                other => other,
            });
        }
        out.extend_from_slice(b"\r\n");
    }
}
