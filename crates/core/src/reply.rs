//! Reply values produced by commands and scripts.
//!
//! `ReplyValue` is the in-memory form of everything a command or a script
//! can answer with. The server's wire codec turns it into RESP on the way
//! out; inside the process it is passed around as a plain value tree.

/// A reply produced by a command or a script call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    /// Null reply (RESP nil)
    Null,
    /// Integer reply
    Integer(i64),
    /// Simple (status) string reply
    Simple(String),
    /// Bulk string reply
    Bulk(Vec<u8>),
    /// Array reply
    Array(Vec<ReplyValue>),
    /// Error reply; the string carries the full error line including its code
    Error(String),
}

impl ReplyValue {
    /// The canonical `+OK` status reply.
    pub fn ok() -> Self {
        ReplyValue::Simple("OK".to_string())
    }

    /// Builds a bulk reply from a string slice.
    pub fn bulk<S: AsRef<[u8]>>(data: S) -> Self {
        ReplyValue::Bulk(data.as_ref().to_vec())
    }

    /// Builds an error reply.
    pub fn error<S: Into<String>>(message: S) -> Self {
        ReplyValue::Error(message.into())
    }

    /// Returns `true` when the reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, ReplyValue::Error(_))
    }

    /// Serializes the reply in RESP2 framing.
    ///
    /// The server's outbound codec owns client serialization; this encoder
    /// exists for the debugger wire protocol and for tests.
    pub fn resp_encode(&self, out: &mut Vec<u8>) {
        match self {
            ReplyValue::Null => out.extend_from_slice(b"$-1\r\n"),
            ReplyValue::Integer(n) => {
                out.extend_from_slice(format!(":{n}\r\n").as_bytes());
            }
            ReplyValue::Simple(s) => {
                out.extend_from_slice(b"+");
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            ReplyValue::Bulk(data) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            ReplyValue::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.resp_encode(out);
                }
            }
            ReplyValue::Error(message) => {
                out.extend_from_slice(b"-");
                out.extend_from_slice(message.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
    }
}
