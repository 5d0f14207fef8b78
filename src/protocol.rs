//! clamd wire format: command literals, chunk framing and reply interpretation.
//!
//! All protocol text is US-ASCII. Commands use the `z` prefix, so every
//! reply from the daemon is terminated by a NUL byte.

/// Liveness check command.
pub const PING_COMMAND: &[u8] = b"zPING\0";

/// Streaming scan command. Followed by length-prefixed chunks.
pub const INSTREAM_COMMAND: &[u8] = b"zINSTREAM\0";

/// Daemon version query.
pub const VERSION_COMMAND: &[u8] = b"zVERSION\0";

/// Length of the reply to [`PING_COMMAND`].
pub const PONG_REPLY_LEN: usize = 4;

/// Expected reply to [`PING_COMMAND`].
pub const PONG_REPLY: &[u8; PONG_REPLY_LEN] = b"PONG";

/// Zero-length chunk that ends an INSTREAM session.
pub const STREAM_TERMINATOR: [u8; 4] = [0, 0, 0, 0];

/// Reply sent by clamd when the stream exceeds its `StreamMaxLength`.
pub const SIZE_LIMIT_REPLY: &str = "INSTREAM size limit exceeded.";

/// Size of each read while collecting a reply.
pub const REPLY_READ_SIZE: usize = 2000;

/// Size of the chunk length prefix.
pub const CHUNK_HEADER_LEN: usize = 4;

/// Result of an INSTREAM scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanVerdict {
    /// Daemon reported no signature match.
    Clean,
    /// Daemon reported a match, or replied with something we do not recognise.
    Infected,
    /// The scan could not be completed (connection, timeout, early reply).
    Failed,
}

impl ScanVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanVerdict::Clean)
    }

    pub fn is_infected(&self) -> bool {
        matches!(self, ScanVerdict::Infected)
    }
}

impl std::fmt::Display for ScanVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanVerdict::Clean => write!(f, "clean"),
            ScanVerdict::Infected => write!(f, "infected"),
            ScanVerdict::Failed => write!(f, "failed"),
        }
    }
}

/// Encode a chunk length as a 4-byte big-endian prefix.
///
/// Returns `None` if the length does not fit in 32 bits.
pub fn encode_chunk_len(len: usize) -> Option<[u8; 4]> {
    u32::try_from(len).ok().map(u32::to_be_bytes)
}

/// Decode reply bytes as US-ASCII, independent of the host locale.
///
/// Bytes outside the ASCII range become U+FFFD.
pub fn as_ascii_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect()
}

/// Reply text for logs and error messages, without the trailing delimiter.
pub fn display_reply(bytes: &[u8]) -> String {
    as_ascii_string(bytes)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Whether a scan reply means no virus was found.
///
/// The reply must mention `OK` and must not mention `FOUND`.
pub fn is_clean_reply(reply: &[u8]) -> bool {
    let text = as_ascii_string(reply);
    text.contains("OK") && !text.contains("FOUND")
}

/// Classify a complete scan reply.
///
/// Anything that is not a clean reply counts as infected, including an empty
/// or unrecognised reply.
pub fn classify_reply(reply: &[u8]) -> ScanVerdict {
    if is_clean_reply(reply) {
        ScanVerdict::Clean
    } else {
        ScanVerdict::Infected
    }
}

/// Whether the daemon rejected the stream for exceeding its size limit.
pub fn is_size_limit_reply(reply: &[u8]) -> bool {
    as_ascii_string(reply).starts_with(SIZE_LIMIT_REPLY)
}
