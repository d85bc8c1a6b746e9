//! Single byte-range requests, as sent by devices resuming a download.

use std::ops::Range;

use crate::error::{FirmwareError, Result};

/// One `bytes=` range as written by the client, before the size is known
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`, inclusive
    Bounded { first: u64, last: u64 },
    /// `bytes=a-`
    From { first: u64 },
    /// `bytes=-n`, the final n bytes
    Suffix { len: u64 },
}

impl ByteRange {
    /// Parse a `Range` header value.
    ///
    /// Returns `None` for anything that is not a single well-formed byte
    /// range; such headers are ignored and the whole file is served.
    pub fn parse(header: &str) -> Option<Self> {
        let value = header.trim().strip_prefix("bytes=")?.trim();
        if value.contains(',') {
            return None;
        }

        let (first, last) = value.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        match (first.is_empty(), last.is_empty()) {
            (true, true) => None,
            (true, false) => Some(ByteRange::Suffix {
                len: last.parse().ok()?,
            }),
            (false, true) => Some(ByteRange::From {
                first: first.parse().ok()?,
            }),
            (false, false) => {
                let first = first.parse().ok()?;
                let last = last.parse().ok()?;
                if last < first {
                    return None;
                }
                Some(ByteRange::Bounded { first, last })
            }
        }
    }

    /// Resolve against an object of `size` bytes into a half-open range
    pub fn to_range(self, size: u64) -> Result<Range<u64>> {
        let range = match self {
            ByteRange::Bounded { first, last } => first..last.saturating_add(1).min(size),
            ByteRange::From { first } => first..size,
            ByteRange::Suffix { len } => size.saturating_sub(len)..size,
        };

        if range.start >= range.end {
            return Err(FirmwareError::RangeNotSatisfiable { size });
        }
        Ok(range)
    }
}

/// A range request plus its optional `If-Range` validator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRequest {
    pub range: ByteRange,
    pub if_range: Option<String>,
}

impl RangeRequest {
    pub fn new(range: ByteRange) -> Self {
        Self {
            range,
            if_range: None,
        }
    }

    /// Whether the range still applies to the entity tagged `etag`. A stale
    /// or date-based validator means the client gets the whole file.
    pub fn applies_to(&self, etag: &str) -> bool {
        match &self.if_range {
            None => true,
            Some(validator) => {
                let validator = validator.trim();
                !validator.starts_with("W/") && validator.trim_matches('"') == etag
            }
        }
    }
}

/// `Content-Range` value for a served range
pub fn content_range(range: &Range<u64>, size: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end - 1, size)
}
