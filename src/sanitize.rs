//! # Sanitize — UTF-8 Cleanup and Bounded Truncation
//!
//! Captured process output and forward-HTTP response bodies are arbitrary
//! bytes, but everything that crosses the control connection must be valid
//! UTF-8 and bounded. Invalid byte sequences are replaced with U+FFFD;
//! oversized captures are cut at [`MAX_CAPTURE_BYTES`] with a marker suffix.

use std::borrow::Cow;

/// Maximum bytes of stdout/stderr/response-body carried in a status report.
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024;

/// Marker appended to truncated captures.
pub const TRUNCATION_MARKER: &str = "... (truncated)";

/// Replace invalid UTF-8 sequences with U+FFFD.
///
/// Idempotent: applying it to already-valid UTF-8 returns the input bytes
/// unchanged.
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(s) => s.to_string(),
        Cow::Owned(s) => s,
    }
}

/// Truncate `s` to at most `max` bytes of content, appending
/// [`TRUNCATION_MARKER`] when anything was cut. The cut backs off to the
/// nearest character boundary so the result is always valid UTF-8.
pub fn truncate_with_marker(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&s[..cut]);
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Sanitize raw captured bytes for a status report: lossy UTF-8 conversion
/// followed by truncation to [`MAX_CAPTURE_BYTES`].
pub fn capture(bytes: &[u8]) -> String {
    truncate_with_marker(&sanitize_utf8(bytes), MAX_CAPTURE_BYTES)
}
