//! Shared hard limits and compliance warnings.

use std::fmt;

use tracing::warn;

use crate::error::CodecError;

/// Maximum accepted binary frame in bytes (64 MiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Byte length of a marker-prefixed frame of `words` words.
///
/// Computed with overflow checks so a corrupted sample count cannot make the
/// transport allocate an unbounded buffer.
pub fn frame_len(words: usize, word_width: usize) -> Result<usize, CodecError> {
    let too_large = CodecError::FrameTooLarge {
        words,
        word_width,
        max_bytes: MAX_FRAME_BYTES,
    };
    let len = words
        .checked_mul(word_width)
        .and_then(|payload| payload.checked_add(1))
        .ok_or_else(|| too_large.clone())?;
    if len > MAX_FRAME_BYTES {
        return Err(too_large);
    }
    Ok(len)
}

/// A requested value was outside the permitted range and has been clamped.
///
/// This is a warning, not an error: the operation proceeds with `applied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitWarning {
    /// What the caller asked for
    pub requested: i64,
    /// What was actually sent to the instrument
    pub applied: i64,
    /// Lower bound
    pub min: i64,
    /// Upper bound
    pub max: i64,
}

impl fmt::Display for LimitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requested {} outside [{}, {}], clamped to {}",
            self.requested, self.min, self.max, self.applied
        )
    }
}

/// Clamp `requested` into `[min, max]`, reporting when it had to be moved.
pub fn clamp_to_limits(what: &str, requested: i64, min: i64, max: i64) -> (i64, Option<LimitWarning>) {
    let applied = requested.clamp(min, max);
    if applied == requested {
        return (applied, None);
    }
    let warning = LimitWarning {
        requested,
        applied,
        min,
        max,
    };
    warn!(parameter = what, %warning, "Value out of limits");
    (applied, Some(warning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(1, 3).unwrap(), 4);
        assert_eq!(frame_len(10_000, 3).unwrap(), 30_001);
        assert_eq!(frame_len(0, 3).unwrap(), 1);
    }

    #[test]
    fn test_frame_len_overflow() {
        assert!(matches!(
            frame_len(usize::MAX, 3),
            Err(CodecError::FrameTooLarge { .. })
        ));
        assert!(frame_len(MAX_FRAME_BYTES, 1).is_err());
    }

    #[test]
    fn test_clamp_within_limits() {
        assert_eq!(clamp_to_limits("period", 50, 1, 100), (50, None));
    }

    #[traced_test]
    #[test]
    fn test_clamp_reports_warning() {
        let (applied, warning) = clamp_to_limits("period", 500, 1, 100);
        assert_eq!(applied, 100);
        let warning = warning.unwrap();
        assert_eq!(warning.requested, 500);
        assert!(warning.to_string().contains("clamped to 100"));
        assert!(logs_contain("Value out of limits"));
    }
}
