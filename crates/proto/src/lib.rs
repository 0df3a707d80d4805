//! Line-framed wire protocol for dkvs.
//!
//! One frame is everything up to and including the next `\n`. Integer
//! fields are ASCII decimals; keys and values are length-prefixed byte
//! strings (`<len> <bytes>`), so any byte except the frame-terminating
//! newline can appear in them.
//!
//! Client commands:
//!
//! ```text
//! PING\n
//! GET <key_len> <key>\n
//! DEL <key_len> <key>\n
//! SET <key_len> <key> <val_len> <value>\n
//! ```
//!
//! Internal commands:
//!
//! ```text
//! FWD <hops_remaining> <inner_line>\n
//! RSET <key_len> <key> <val_len> <value> <timestamp_ms> <node_id>\n
//! RDEL <key_len> <key> <timestamp_ms> <node_id>\n
//! RGET <key_len> <key>\n
//! ```

use dkvs_common::Version;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A parsed request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Get {
        key: Vec<u8>,
    },
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Del {
        key: Vec<u8>,
    },
    /// Forwarded request: TTL plus the inner command line without its newline.
    Fwd {
        hops_remaining: u32,
        inner_line: Vec<u8>,
    },
    /// Replica write carrying the coordinator-minted version.
    RSet {
        key: Vec<u8>,
        value: Vec<u8>,
        version: Version,
    },
    /// Replica delete carrying the coordinator-minted version.
    RDel {
        key: Vec<u8>,
        version: Version,
    },
    /// Replica read; answered with a `$V` versioned value.
    RGet {
        key: Vec<u8>,
    },
}

/// Outcome of one [`parse_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    /// A complete frame was parsed. `consumed` includes the newline.
    Frame { command: Command, consumed: usize },
    /// No `\n` in the buffer yet; nothing was consumed.
    Incomplete,
    /// Malformed frame. `consumed` covers the whole frame so the caller
    /// can skip past it and keep the connection alive.
    Error { message: String, consumed: usize },
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Field reader over a single frame (newline excluded).
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    /// The bytes remaining after the cursor.
    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn space(&mut self, context: &str) -> Result<(), String> {
        if self.pos >= self.data.len() || self.data[self.pos] != b' ' {
            return Err(format!("expected space after {}", context));
        }
        self.pos += 1;
        Ok(())
    }

    /// ASCII unsigned decimal, terminated by a space or end-of-frame.
    fn uint(&mut self, field: &str) -> Result<u64, String> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(format!("invalid {}", field));
        }
        let mut v: u64 = 0;
        for &b in &self.data[start..self.pos] {
            v = v
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(b - b'0')))
                .ok_or_else(|| format!("invalid {}", field))?;
        }
        Ok(v)
    }

    fn u32_field(&mut self, field: &str) -> Result<u32, String> {
        let v = self.uint(field)?;
        u32::try_from(v).map_err(|_| format!("invalid {}", field))
    }

    fn bytes(&mut self, count: usize, what: &str) -> Result<Vec<u8>, String> {
        if self.pos + count > self.data.len() {
            return Err(format!("{} shorter than declared length", what));
        }
        let out = self.data[self.pos..self.pos + count].to_vec();
        self.pos += count;
        Ok(out)
    }

    fn end(&self, context: &str) -> Result<(), String> {
        if !self.at_end() {
            return Err(format!("trailing data after {}", context));
        }
        Ok(())
    }
}

/// A length-prefixed byte string: `<len> <bytes>`.
fn parse_blob(cur: &mut Cursor<'_>, what: &str) -> Result<Vec<u8>, String> {
    let len = cur.u32_field(&format!("{}_len", what))?;
    cur.space(&format!("{}_len", what))?;
    cur.bytes(len as usize, what)
}

/// Try to parse exactly one frame from the front of `buf`.
///
/// Residual bytes after the frame are left for the next call.
pub fn parse_frame(buf: &[u8]) -> Parse {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return Parse::Incomplete;
    };
    let frame = &buf[..nl];
    let consumed = nl + 1;

    match parse_inner(frame) {
        Ok(command) => Parse::Frame { command, consumed },
        Err(message) => Parse::Error { message, consumed },
    }
}

fn parse_inner(frame: &[u8]) -> Result<Command, String> {
    let word_end = frame
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(frame.len());
    let word = &frame[..word_end];

    let mut cur = Cursor::new(frame);
    cur.pos = word_end;

    match word {
        b"PING" => {
            if !cur.at_end() {
                return Err("PING takes no arguments".into());
            }
            Ok(Command::Ping)
        }

        b"GET" | b"DEL" | b"RGET" => {
            cur.space("command")?;
            let key = parse_blob(&mut cur, "key")?;
            cur.end("key")?;
            Ok(match word {
                b"GET" => Command::Get { key },
                b"DEL" => Command::Del { key },
                _ => Command::RGet { key },
            })
        }

        b"SET" => {
            cur.space("command")?;
            let key = parse_blob(&mut cur, "key")?;
            cur.space("key")?;
            let value = parse_blob(&mut cur, "value")?;
            cur.end("value")?;
            Ok(Command::Set { key, value })
        }

        b"RSET" => {
            cur.space("command")?;
            let key = parse_blob(&mut cur, "key")?;
            cur.space("key")?;
            let value = parse_blob(&mut cur, "value")?;
            cur.space("value")?;
            let timestamp_ms = cur.uint("timestamp_ms")?;
            cur.space("timestamp_ms")?;
            let node_id = cur.u32_field("node_id")?;
            cur.end("node_id")?;
            Ok(Command::RSet {
                key,
                value,
                version: Version::new(timestamp_ms, node_id),
            })
        }

        b"RDEL" => {
            cur.space("command")?;
            let key = parse_blob(&mut cur, "key")?;
            cur.space("key")?;
            let timestamp_ms = cur.uint("timestamp_ms")?;
            cur.space("timestamp_ms")?;
            let node_id = cur.u32_field("node_id")?;
            cur.end("node_id")?;
            Ok(Command::RDel {
                key,
                version: Version::new(timestamp_ms, node_id),
            })
        }

        b"FWD" => {
            cur.space("command")?;
            let hops_remaining = cur.u32_field("hop count")?;
            cur.space("hop count")?;
            // Everything to the end of the frame is the inner command line.
            let inner_line = cur.rest().to_vec();
            Ok(Command::Fwd {
                hops_remaining,
                inner_line,
            })
        }

        _ => Err("unknown command".into()),
    }
}

// ---------------------------------------------------------------------------
// Response formatters
// ---------------------------------------------------------------------------

pub fn format_ok() -> Vec<u8> {
    b"+OK\n".to_vec()
}

pub fn format_pong() -> Vec<u8> {
    b"+PONG\n".to_vec()
}

pub fn format_not_found() -> Vec<u8> {
    b"-NOT_FOUND\n".to_vec()
}

/// `-ERR <message>\n`
pub fn format_error(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + message.len() + 1);
    out.extend_from_slice(b"-ERR ");
    out.extend_from_slice(message.as_bytes());
    out.push(b'\n');
    out
}

/// `$<val_len> <value>\n`
pub fn format_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 16);
    out.push(b'$');
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(value);
    out.push(b'\n');
    out
}

/// `$V <val_len> <value> <timestamp_ms> <node_id>\n`
pub fn format_versioned_value(value: &[u8], version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 40);
    out.extend_from_slice(b"$V ");
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(value);
    out.push(b' ');
    out.extend_from_slice(version.timestamp_ms.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.node_id.to_string().as_bytes());
    out.push(b'\n');
    out
}

// ---------------------------------------------------------------------------
// Request encoders (coordinator -> replica)
// ---------------------------------------------------------------------------

fn push_blob(out: &mut Vec<u8>, blob: &[u8]) {
    out.extend_from_slice(blob.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(blob);
}

pub fn encode_ping() -> Vec<u8> {
    b"PING\n".to_vec()
}

pub fn encode_rget(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 16);
    out.extend_from_slice(b"RGET ");
    push_blob(&mut out, key);
    out.push(b'\n');
    out
}

pub fn encode_rset(key: &[u8], value: &[u8], version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + value.len() + 48);
    out.extend_from_slice(b"RSET ");
    push_blob(&mut out, key);
    out.push(b' ');
    push_blob(&mut out, value);
    out.push(b' ');
    out.extend_from_slice(version.timestamp_ms.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.node_id.to_string().as_bytes());
    out.push(b'\n');
    out
}

pub fn encode_rdel(key: &[u8], version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 40);
    out.extend_from_slice(b"RDEL ");
    push_blob(&mut out, key);
    out.push(b' ');
    out.extend_from_slice(version.timestamp_ms.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.node_id.to_string().as_bytes());
    out.push(b'\n');
    out
}

/// `FWD <hops> <inner_line>\n`
pub fn format_forward(hops: u32, inner_line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(inner_line.len() + 16);
    out.extend_from_slice(b"FWD ");
    out.extend_from_slice(hops.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(inner_line);
    out.push(b'\n');
    out
}

/// Serialize a client command as a single line without the trailing
/// newline, for embedding in a `FWD` frame. Internal commands are not
/// forwardable and yield `None`.
pub fn encode_command_line(cmd: &Command) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match cmd {
        Command::Ping => out.extend_from_slice(b"PING"),
        Command::Get { key } => {
            out.extend_from_slice(b"GET ");
            push_blob(&mut out, key);
        }
        Command::Del { key } => {
            out.extend_from_slice(b"DEL ");
            push_blob(&mut out, key);
        }
        Command::Set { key, value } => {
            out.extend_from_slice(b"SET ");
            push_blob(&mut out, key);
            out.push(b' ');
            push_blob(&mut out, value);
        }
        _ => return None,
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Versioned reply parser (coordinator side of RGET)
// ---------------------------------------------------------------------------

/// Decoded `$V` response. `found == false` for `-NOT_FOUND` and anything
/// else that is not a well-formed `$V` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedReply {
    pub found: bool,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Parse one `RGET` response line (trailing newline optional).
///
/// Tolerant by design: replies that are not a complete `$V` frame —
/// `-NOT_FOUND`, errors, torn lines — come back as not-found rather
/// than a hard failure, and the quorum read treats the replica as
/// having no value.
pub fn parse_versioned_reply(line: &[u8]) -> VersionedReply {
    let line = match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    };

    let Some(rest) = line.strip_prefix(b"$V ") else {
        return VersionedReply::default();
    };

    let mut cur = Cursor::new(rest);
    let parsed = (|| -> Result<VersionedReply, String> {
        let value = parse_blob(&mut cur, "value")?;
        cur.space("value")?;
        let timestamp_ms = cur.uint("timestamp_ms")?;
        cur.space("timestamp_ms")?;
        let node_id = cur.u32_field("node_id")?;
        cur.end("node_id")?;
        Ok(VersionedReply {
            found: true,
            value,
            version: Version::new(timestamp_ms, node_id),
        })
    })();

    parsed.unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &[u8]) -> (Command, usize) {
        match parse_frame(input) {
            Parse::Frame { command, consumed } => (command, consumed),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    fn parse_err(input: &[u8]) -> (String, usize) {
        match parse_frame(input) {
            Parse::Error { message, consumed } => (message, consumed),
            other => panic!("expected error, got {:?}", other),
        }
    }

    // -- framing ------------------------------------------------------------

    #[test]
    fn test_incomplete_without_newline() {
        assert_eq!(parse_frame(b""), Parse::Incomplete);
        assert_eq!(parse_frame(b"PING"), Parse::Incomplete);
        assert_eq!(parse_frame(b"SET 5 mykey 7 myval"), Parse::Incomplete);
    }

    #[test]
    fn test_consumes_exactly_one_frame() {
        let input = b"PING\nGET 1 k\n";
        let (cmd, consumed) = parse_ok(input);
        assert_eq!(cmd, Command::Ping);
        assert_eq!(consumed, 5);

        let (cmd, consumed) = parse_ok(&input[5..]);
        assert_eq!(cmd, Command::Get { key: b"k".to_vec() });
        assert_eq!(consumed, input.len() - 5);
    }

    #[test]
    fn test_error_consumes_full_frame() {
        let input = b"BOGUS stuff here\nPING\n";
        let (msg, consumed) = parse_err(input);
        assert_eq!(msg, "unknown command");
        assert_eq!(consumed, 17);
        // The next frame is intact.
        let (cmd, _) = parse_ok(&input[consumed..]);
        assert_eq!(cmd, Command::Ping);
    }

    // -- client commands ----------------------------------------------------

    #[test]
    fn test_parse_ping() {
        let (cmd, consumed) = parse_ok(b"PING\n");
        assert_eq!(cmd, Command::Ping);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_ping_takes_no_arguments() {
        let (msg, consumed) = parse_err(b"PING extra\n");
        assert_eq!(msg, "PING takes no arguments");
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_parse_set() {
        let (cmd, consumed) = parse_ok(b"SET 5 mykey 7 myvalue\n");
        assert_eq!(
            cmd,
            Command::Set {
                key: b"mykey".to_vec(),
                value: b"myvalue".to_vec(),
            }
        );
        assert_eq!(consumed, 22);
    }

    #[test]
    fn test_parse_get_and_del() {
        let (cmd, _) = parse_ok(b"GET 5 mykey\n");
        assert_eq!(cmd, Command::Get { key: b"mykey".to_vec() });

        let (cmd, _) = parse_ok(b"DEL 5 mykey\n");
        assert_eq!(cmd, Command::Del { key: b"mykey".to_vec() });
    }

    #[test]
    fn test_binary_safe_keys_and_values() {
        // Keys and values may contain spaces, digits, '\r', NUL...
        let key = b"a key\rwith \x00junk";
        let value = b"12 34";
        let mut frame = Vec::new();
        frame.extend_from_slice(b"SET ");
        frame.extend_from_slice(key.len().to_string().as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(key);
        frame.push(b' ');
        frame.extend_from_slice(value.len().to_string().as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(value);
        frame.push(b'\n');

        let (cmd, consumed) = parse_ok(&frame);
        assert_eq!(consumed, frame.len());
        assert_eq!(
            cmd,
            Command::Set {
                key: key.to_vec(),
                value: value.to_vec(),
            }
        );
    }

    #[test]
    fn test_empty_value_allowed() {
        let (cmd, _) = parse_ok(b"SET 1 k 0 \n");
        assert_eq!(
            cmd,
            Command::Set {
                key: b"k".to_vec(),
                value: Vec::new(),
            }
        );
    }

    #[test]
    fn test_key_shorter_than_declared() {
        let (msg, _) = parse_err(b"GET 10 short\n");
        assert_eq!(msg, "key shorter than declared length");
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let (msg, _) = parse_err(b"GET 3 key extra\n");
        assert_eq!(msg, "trailing data after key");
    }

    #[test]
    fn test_missing_length_rejected() {
        let (msg, _) = parse_err(b"SET mykey 7 myvalue\n");
        assert_eq!(msg, "invalid key_len");
    }

    // -- internal commands --------------------------------------------------

    #[test]
    fn test_parse_rset() {
        let (cmd, _) = parse_ok(b"RSET 3 foo 3 bar 1000000 99\n");
        assert_eq!(
            cmd,
            Command::RSet {
                key: b"foo".to_vec(),
                value: b"bar".to_vec(),
                version: Version::new(1_000_000, 99),
            }
        );
    }

    #[test]
    fn test_parse_rdel() {
        let (cmd, _) = parse_ok(b"RDEL 3 foo 42 7\n");
        assert_eq!(
            cmd,
            Command::RDel {
                key: b"foo".to_vec(),
                version: Version::new(42, 7),
            }
        );
    }

    #[test]
    fn test_parse_rget() {
        let (cmd, _) = parse_ok(b"RGET 3 foo\n");
        assert_eq!(cmd, Command::RGet { key: b"foo".to_vec() });
    }

    #[test]
    fn test_parse_fwd_preserves_inner_line() {
        let (cmd, _) = parse_ok(b"FWD 2 SET 1 k 2 vv\n");
        assert_eq!(
            cmd,
            Command::Fwd {
                hops_remaining: 2,
                inner_line: b"SET 1 k 2 vv".to_vec(),
            }
        );
    }

    #[test]
    fn test_rset_missing_version_rejected() {
        let (msg, _) = parse_err(b"RSET 3 foo 3 bar\n");
        assert_eq!(msg, "expected space after value");
    }

    // -- round trips --------------------------------------------------------

    #[test]
    fn test_encoder_parser_round_trip() {
        let v = Version::new(123_456, 4);
        let cases: Vec<(Vec<u8>, Command)> = vec![
            (encode_ping(), Command::Ping),
            (
                encode_rget(b"some key"),
                Command::RGet {
                    key: b"some key".to_vec(),
                },
            ),
            (
                encode_rset(b"k", b"v v", v),
                Command::RSet {
                    key: b"k".to_vec(),
                    value: b"v v".to_vec(),
                    version: v,
                },
            ),
            (
                encode_rdel(b"k", v),
                Command::RDel {
                    key: b"k".to_vec(),
                    version: v,
                },
            ),
        ];

        for (wire, expected) in cases {
            let (cmd, consumed) = parse_ok(&wire);
            assert_eq!(consumed, wire.len());
            assert_eq!(cmd, expected);
        }
    }

    #[test]
    fn test_command_line_fwd_round_trip() {
        let original = Command::Set {
            key: b"mykey".to_vec(),
            value: b"my value".to_vec(),
        };
        let line = encode_command_line(&original).unwrap();
        let frame = format_forward(2, &line);

        let (cmd, _) = parse_ok(&frame);
        let Command::Fwd {
            hops_remaining,
            inner_line,
        } = cmd
        else {
            panic!("expected FWD");
        };
        assert_eq!(hops_remaining, 2);

        // Re-parsing the inner line recovers the original command.
        let mut inner = inner_line;
        inner.push(b'\n');
        let (inner_cmd, _) = parse_ok(&inner);
        assert_eq!(inner_cmd, original);
    }

    #[test]
    fn test_internal_commands_not_forwardable() {
        assert!(encode_command_line(&Command::RGet { key: b"k".to_vec() }).is_none());
    }

    // -- responses ----------------------------------------------------------

    #[test]
    fn test_format_responses() {
        assert_eq!(format_ok(), b"+OK\n");
        assert_eq!(format_pong(), b"+PONG\n");
        assert_eq!(format_not_found(), b"-NOT_FOUND\n");
        assert_eq!(format_error("QUORUM_FAILED"), b"-ERR QUORUM_FAILED\n");
        assert_eq!(format_value(b"myvalue"), b"$7 myvalue\n");
        assert_eq!(
            format_versioned_value(b"repval", Version::new(1_000_000, 99)),
            b"$V 6 repval 1000000 99\n"
        );
    }

    #[test]
    fn test_versioned_reply_round_trip() {
        let wire = format_versioned_value(b"some value", Version::new(555, 3));
        let reply = parse_versioned_reply(&wire);
        assert!(reply.found);
        assert_eq!(reply.value, b"some value");
        assert_eq!(reply.version, Version::new(555, 3));
    }

    #[test]
    fn test_versioned_reply_tolerates_not_found() {
        let reply = parse_versioned_reply(b"-NOT_FOUND\n");
        assert!(!reply.found);
    }

    #[test]
    fn test_versioned_reply_tolerates_garbage() {
        assert!(!parse_versioned_reply(b"").found);
        assert!(!parse_versioned_reply(b"+OK\n").found);
        assert!(!parse_versioned_reply(b"$V 99 short 1 1\n").found);
        assert!(!parse_versioned_reply(b"$V x\n").found);
    }

    #[test]
    fn test_versioned_reply_value_with_spaces() {
        let wire = format_versioned_value(b"a b c", Version::new(10, 2));
        let reply = parse_versioned_reply(&wire);
        assert!(reply.found);
        assert_eq!(reply.value, b"a b c");
    }
}
