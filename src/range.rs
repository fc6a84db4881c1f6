//! HTTP `Range:` header values and their resolution against a file size.

use std::cmp::{max, min};
use std::fmt;

/// One end of a byte range. `None` means the client left that side out.
pub type Bound = Option<i64>;

/// Why a `Range:` header could not be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Something other than `bytes=` was asked for.
    UnsupportedUnit,
    /// The value does not follow `N-M`, `N-` or `-M`.
    Malformed,
    /// `N-M` with `M < N`, or a resolved range that ends before it begins.
    Backward,
    /// The first byte lies at or beyond the end of the resource.
    OutsideFile,
}

impl RangeError {
    /// Human readable explanation used in the 416 error page.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedUnit => "You requested a range in an unsupported unit.",
            Self::Malformed => "You requested a range the server couldn't understand.",
            Self::Backward => "You requested a backward range.",
            Self::OutsideFile => "You requested a range outside of the file.",
        }
    }
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for RangeError {}

/// A byte range as written by the client: `bytes=begin-end`, both ends inclusive.
///
/// A range with only `end` given is a suffix range: "the last `end` bytes".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub begin: Bound,
    pub end: Bound,
}

impl ByteRange {
    /// Parse the value of a `Range:` header. Only the first range of a list is used.
    pub fn parse(value: &str) -> Result<Self, RangeError> {
        let (unit, spec) = value.trim().split_once('=').ok_or(RangeError::Malformed)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(RangeError::UnsupportedUnit);
        }
        // Additional ranges in a list are ignored.
        let spec = spec.split(',').next().unwrap_or("").trim();
        let (begin, end) = spec.split_once('-').ok_or(RangeError::Malformed)?;
        let begin = parse_offset(begin)?;
        let end = parse_offset(end)?;
        match (begin, end) {
            (None, None) => Err(RangeError::Malformed),
            (Some(begin), Some(end)) if end < begin => Err(RangeError::Backward),
            (begin, end) => Ok(Self { begin, end }),
        }
    }

    /// Resolve against a resource of `size` bytes.
    ///
    /// The result has both bounds given, or neither when no range was requested. An
    /// empty resource resolves to an `end` of -1, which `satisfiable` rejects.
    pub fn canonical(&self, size: i64) -> Self {
        let last = size - 1;
        let (begin, end) = match (self.begin, self.end) {
            // eg. 100-200
            (Some(from), Some(to)) => (from, min(to, last)),
            // eg. 100- :: yields 100 to end
            (Some(from), None) => (from, last),
            // eg. -200 :: yields last 200
            (None, Some(count)) => (max(last - count + 1, 0), last),
            (None, None) => return Self::default(),
        };
        Self {
            begin: Some(begin),
            end: Some(end),
        }
    }

    /// Resolve against `size` and check that at least one byte can be sent.
    ///
    /// Returns `Ok(None)` when no range was requested.
    pub fn satisfiable(&self, size: i64) -> Result<Option<(i64, i64)>, RangeError> {
        if !self.is_given() {
            return Ok(None);
        }
        match self.canonical(size) {
            Self {
                begin: Some(from),
                end: Some(to),
            } => {
                if from >= size {
                    Err(RangeError::OutsideFile)
                } else if to < from {
                    Err(RangeError::Backward)
                } else {
                    Ok(Some((from, to)))
                }
            }
            _ => Ok(None),
        }
    }

    /// Was either bound written?
    pub fn is_given(&self) -> bool {
        self.begin.is_some() || self.end.is_some()
    }
}

/// Parse an optional decimal offset. Empty input is an absent bound.
fn parse_offset(digits: &str) -> Result<Bound, RangeError> {
    let digits = digits.trim();
    if digits.is_empty() {
        return Ok(None);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    digits.parse().map(Some).map_err(|_| RangeError::Malformed)
}

/// Bytes of a block that still have to go out, as the half-open span `[begin, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendRange {
    pub begin: u64,
    pub end: u64,
}

impl SendRange {
    pub fn new(begin: u64, len: u64) -> Self {
        Self {
            begin,
            end: begin + len,
        }
    }

    /// Span covering the inclusive range `first..=last`.
    pub fn inclusive(first: i64, last: i64) -> Self {
        debug_assert!(0 <= first && first <= last);
        Self {
            begin: first as u64,
            end: last as u64 + 1,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// Record that `sent` more bytes left the building.
    pub fn advance(&mut self, sent: u64) {
        self.begin = min(self.begin + sent, self.end);
    }

    pub fn is_done(&self) -> bool {
        self.begin >= self.end
    }
}
