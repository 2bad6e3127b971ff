//! HTTP range headers
//!
//! Strict parsers for the Range and Content-Range headers. Invalid
//! headers fail the request instead of being ignored; an ignored range
//! header would make the server return the wrong bytes, corrupting the
//! transferred image.

use vmio_common::{Error, Result};

/// A parsed Range request header (RFC 7233). Only a single range is
/// supported; multiple ranges fail the whole request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Range {
    /// `bytes=first-[last]`; `last` is inclusive.
    FromTo { first: u64, last: Option<u64> },
    /// `bytes=-n`, the last `n` bytes of the resource.
    Suffix { last: u64 },
}

impl Range {
    pub fn parse(header: &str) -> Result<Self> {
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| invalid_range(header))?;

        let (first, last) = spec.split_once('-').ok_or_else(|| invalid_range(header))?;

        if first.is_empty() {
            if last.is_empty() {
                // "bytes=-"
                return Err(invalid_range(header));
            }
            let last = parse_int(last).ok_or_else(|| invalid_range(header))?;
            return Ok(Self::Suffix { last });
        }

        let first_value = parse_int(first).ok_or_else(|| invalid_range(header))?;
        if last.is_empty() {
            // "bytes=0-"
            return Ok(Self::FromTo {
                first: first_value,
                last: None,
            });
        }

        let last_value = parse_int(last).ok_or_else(|| invalid_range(header))?;
        if first_value > last_value {
            return Err(invalid_range(header));
        }

        Ok(Self::FromTo {
            first: first_value,
            last: Some(last_value),
        })
    }

    /// Resolve against the resource size, returning (offset, length).
    pub fn resolve(&self, size: u64) -> Result<(u64, u64)> {
        match *self {
            Self::FromTo { first, last } => {
                if first >= size {
                    return Err(Error::RangeNotSatisfiable(format!(
                        "range starts after the last byte {}",
                        size.saturating_sub(1)
                    )));
                }
                let end = match last {
                    Some(last) if last >= size => {
                        return Err(Error::RangeNotSatisfiable(format!(
                            "range ends after the last byte {}",
                            size - 1
                        )));
                    }
                    Some(last) => last + 1,
                    None => size,
                };
                Ok((first, end - first))
            }
            Self::Suffix { last } => {
                if last > size {
                    return Err(Error::RangeNotSatisfiable(format!(
                        "suffix longer than the resource size {size}"
                    )));
                }
                Ok((size - last, last))
            }
        }
    }
}

/// A parsed Content-Range request header: `bytes first-last/(complete|*)`.
/// The unsatisfied-range form (`*/complete`) is not accepted in a PUT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub first: u64,
    pub last: Option<u64>,
    pub complete: Option<u64>,
}

impl ContentRange {
    pub fn parse(header: &str) -> Result<Self> {
        let spec = header
            .strip_prefix("bytes ")
            .ok_or_else(|| invalid_content_range(header))?;

        let (range, complete) = spec
            .split_once('/')
            .ok_or_else(|| invalid_content_range(header))?;
        let (first, last) = range
            .split_once('-')
            .ok_or_else(|| invalid_content_range(header))?;

        let first = parse_int(first).ok_or_else(|| invalid_content_range(header))?;

        let last = if last == "*" {
            None
        } else {
            let last = parse_int(last).ok_or_else(|| invalid_content_range(header))?;
            if last < first {
                return Err(invalid_content_range(header));
            }
            Some(last)
        };

        let complete = if complete == "*" {
            None
        } else {
            let complete = parse_int(complete).ok_or_else(|| invalid_content_range(header))?;
            if let Some(last) = last {
                if last >= complete {
                    return Err(invalid_content_range(header));
                }
            }
            Some(complete)
        };

        Ok(Self {
            first,
            last,
            complete,
        })
    }
}

/// Parse a decimal integer, rejecting signs and junk.
fn parse_int(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn invalid_range(header: &str) -> Error {
    Error::RangeNotSatisfiable(format!(
        "cannot satisfy range {header:?}, invalid range or multiple ranges"
    ))
}

fn invalid_content_range(header: &str) -> Error {
    Error::invalid_argument(format!("invalid content-range {header:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(
            Range::parse("bytes=0-99").unwrap(),
            Range::FromTo {
                first: 0,
                last: Some(99)
            }
        );
        assert_eq!(
            Range::parse("bytes=100-").unwrap(),
            Range::FromTo {
                first: 100,
                last: None
            }
        );
        assert_eq!(Range::parse("bytes=-13").unwrap(), Range::Suffix { last: 13 });
    }

    #[test]
    fn test_parse_range_invalid() {
        for header in [
            "bytes=-",
            "bytes=2-1",
            "bytes=a-b",
            "bytes=0-99,200-299",
            "BYTES=0-99",
            "bytes=+1-5",
            "0-99",
        ] {
            let err = Range::parse(header).unwrap_err();
            assert!(
                matches!(err, Error::RangeNotSatisfiable(_)),
                "unexpected error for {header:?}: {err}"
            );
        }
    }

    #[test]
    fn test_resolve_range() {
        // 16 byte resource with content at offset 3, fetched with a
        // suffix range.
        let range = Range::parse("bytes=-13").unwrap();
        assert_eq!(range.resolve(16).unwrap(), (3, 13));

        let range = Range::parse("bytes=3-15").unwrap();
        assert_eq!(range.resolve(16).unwrap(), (3, 13));

        let range = Range::parse("bytes=3-").unwrap();
        assert_eq!(range.resolve(16).unwrap(), (3, 13));
    }

    #[test]
    fn test_resolve_range_unsatisfiable() {
        let range = Range::parse("bytes=0-100").unwrap();
        assert!(range.resolve(16).is_err());

        let range = Range::parse("bytes=16-").unwrap();
        assert!(range.resolve(16).is_err());

        let range = Range::parse("bytes=-17").unwrap();
        assert!(range.resolve(16).is_err());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            ContentRange::parse("bytes 0-99/200").unwrap(),
            ContentRange {
                first: 0,
                last: Some(99),
                complete: Some(200)
            }
        );
        assert_eq!(
            ContentRange::parse("bytes 100-199/*").unwrap(),
            ContentRange {
                first: 100,
                last: Some(199),
                complete: None
            }
        );
        assert_eq!(
            ContentRange::parse("bytes 3-*/*").unwrap(),
            ContentRange {
                first: 3,
                last: None,
                complete: None
            }
        );
    }

    #[test]
    fn test_parse_content_range_invalid() {
        for header in [
            "bytes 99-0/200",
            "bytes 0-199/100",
            "bytes */200",
            "bytes 0-99",
            "0-99/200",
        ] {
            assert!(
                ContentRange::parse(header).is_err(),
                "expected error for {header:?}"
            );
        }
    }
}
