use std::fmt;

/// Fixed-capacity byte buffer used for command payloads and log messages so
/// the protocol → rpc → log hot path performs no heap allocation.
///
/// Content beyond `N` bytes is truncated and `truncated` is set so callers
/// can render a marker instead of silently losing data.
#[derive(Clone, Copy)]
pub struct InlineBytes<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> InlineBytes<N> {
    pub const fn empty() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn from_str(s: &str) -> Self {
        let bytes = s.as_bytes();
        let len = bytes.len().min(N);
        let mut buf = [0u8; N];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            buf,
            len,
            truncated: bytes.len() > N,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Constructed only from `&str`, so the retained prefix is always
        // valid UTF-8 unless truncation split a multibyte character; fall
        // back to the largest valid prefix in that case.
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&self.as_bytes()[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for InlineBytes<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for InlineBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineBytes")
            .field("content", &self.as_str())
            .field("truncated", &self.truncated)
            .finish()
    }
}

impl<const N: usize> fmt::Display for InlineBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())?;
        if self.truncated {
            f.write_str("...<truncated>")?;
        }
        Ok(())
    }
}

impl<const N: usize> PartialEq for InlineBytes<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<const N: usize> Eq for InlineBytes<N> {}

/// Argument payload cap: ≤256 bytes serialized (§3 Data Model, Command).
pub const COMMAND_ARG_CAP: usize = 256;
/// Log message / fault message cap (§9 Design Notes, hot-path allocations).
pub const MESSAGE_CAP: usize = 128;

pub type ArgPayload = InlineBytes<COMMAND_ARG_CAP>;
pub type Message = InlineBytes<MESSAGE_CAP>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_short_strings() {
        let b: Message = InlineBytes::from_str("hello");
        assert_eq!(b.as_str(), "hello");
        assert!(!b.is_truncated());
    }

    #[test]
    fn truncates_oversize_content() {
        let long = "x".repeat(MESSAGE_CAP + 16);
        let b: Message = InlineBytes::from_str(&long);
        assert_eq!(b.len(), MESSAGE_CAP);
        assert!(b.is_truncated());
    }
}
