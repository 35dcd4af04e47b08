//! Client wire protocol.
//!
//! Any bytes a client writes count as a heartbeat. The very first bytes may
//! instead open with a deadline request terminated by a newline:
//!
//! ```text
//! deadline=<seconds>\n
//! ```
//!
//! The line may be split over several writes and must end within
//! [`MAX_CONTROL_LEN`] bytes. Everything after it, and every later write, is
//! ignored beyond its arrival.

/// Prefix of the only control message.
pub const DEADLINE_PREFIX: &[u8] = b"deadline=";

/// Longest control line accepted, newline included.
pub const MAX_CONTROL_LEN: usize = 64;

/// Outcome of inspecting a client's first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstMessage {
    /// No control message; the bytes are a plain heartbeat.
    Heartbeat,
    /// Deadline request in whole seconds.
    SetDeadline(u64),
    /// Starts like a control message but does not parse.
    Malformed(String),
}

/// Inspect the leading bytes a client sent so far.
///
/// Returns `None` while the bytes could still become a control message that
/// has not reached its newline yet.
#[must_use]
pub fn parse_first_chunk(chunk: &[u8]) -> Option<FirstMessage> {
    if DEADLINE_PREFIX.starts_with(chunk) {
        return None;
    }
    let Some(rest) = chunk.strip_prefix(DEADLINE_PREFIX) else {
        return Some(FirstMessage::Heartbeat);
    };
    let Some(end) = memchr::memchr(b'\n', rest) else {
        if chunk.len() >= MAX_CONTROL_LEN {
            return Some(FirstMessage::Malformed(format!(
                "no newline within {MAX_CONTROL_LEN} bytes"
            )));
        }
        return None;
    };
    let Ok(text) = std::str::from_utf8(&rest[..end]) else {
        return Some(FirstMessage::Malformed(
            "deadline is not valid UTF-8".to_string(),
        ));
    };
    let text = text.trim();
    Some(match text.parse::<u64>() {
        Ok(0) => FirstMessage::Malformed("deadline must be positive".to_string()),
        Ok(seconds) => FirstMessage::SetDeadline(seconds),
        Err(err) => FirstMessage::Malformed(format!("deadline {text:?}: {err}")),
    })
}

/// Leading bytes of one client, kept until they resolve to a [`FirstMessage`].
///
/// A control line may arrive split over several reads; at most
/// [`MAX_CONTROL_LEN`] bytes are buffered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlWindow {
    buf: Vec<u8>,
}

impl ControlWindow {
    /// Append `bytes` and try to resolve the first message.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<FirstMessage> {
        let room = MAX_CONTROL_LEN.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
        parse_first_chunk(&self.buf)
    }

    /// Bytes buffered so far.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Encode a deadline request, for clients and tests.
#[must_use]
pub fn deadline_request(seconds: u64) -> Vec<u8> {
    format!("deadline={seconds}\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitrary_payload_is_a_heartbeat() {
        assert_eq!(parse_first_chunk(b"."), Some(FirstMessage::Heartbeat));
        assert_eq!(parse_first_chunk(b"V"), Some(FirstMessage::Heartbeat));
        assert_eq!(parse_first_chunk(b"deaf"), Some(FirstMessage::Heartbeat));
    }

    #[test]
    fn deadline_line_is_parsed() {
        assert_eq!(
            parse_first_chunk(&deadline_request(45)),
            Some(FirstMessage::SetDeadline(45))
        );
        assert_eq!(
            parse_first_chunk(b"deadline=5\r\nextra heartbeat bytes"),
            Some(FirstMessage::SetDeadline(5))
        );
    }

    #[test]
    fn unterminated_line_waits_for_more() {
        assert_eq!(parse_first_chunk(b"dead"), None);
        assert_eq!(parse_first_chunk(b"deadline="), None);
        assert_eq!(parse_first_chunk(b"deadline=12"), None);
    }

    #[test]
    fn bad_deadlines_are_malformed() {
        for line in [
            &b"deadline=0\n"[..],
            b"deadline=-3\n",
            b"deadline=\n",
            b"deadline=\xff\n",
        ] {
            assert!(
                matches!(parse_first_chunk(line), Some(FirstMessage::Malformed(_))),
                "{line:?}"
            );
        }
    }

    #[test]
    fn window_joins_split_reads() {
        let mut window = ControlWindow::default();
        assert_eq!(window.feed(b"dead"), None);
        assert_eq!(window.feed(b"line=3"), None);
        assert_eq!(window.feed(b"0\nping"), Some(FirstMessage::SetDeadline(30)));
    }

    #[test]
    fn window_gives_up_without_newline() {
        let mut window = ControlWindow::default();
        assert_eq!(window.feed(b"deadline=1"), None);
        let filler = vec![b'0'; 200];
        assert!(matches!(window.feed(&filler), Some(FirstMessage::Malformed(_))));
        assert_eq!(window.buffered(), MAX_CONTROL_LEN);
    }
}
