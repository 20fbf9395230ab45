//! Streaming HTTP/1.1 request-header parsing.
//!
//! [`HeaderParser`] consumes byte slices as they arrive off a socket and
//! accumulates until the end of the header block — the first empty line,
//! whether delimited `\r\n\r\n`, `\n\n`, or a mix. It then exposes the
//! request line (verbatim and parsed), the ordered header list, and a
//! case-insensitive multimap lookup, and reports where the body starts
//! within the final chunk.
//!
//! Folded continuation lines (starting with SP or HT) are joined to the
//! previous header's value with a single space. Header names are validated
//! against the RFC 9110 token grammar. The accumulator is capped (64 KiB
//! by default); an oversized or malformed block is fatal to the stream.

use std::fmt;

/// Default header-block cap.
const DEFAULT_MAX_HEADER_BLOCK: usize = 64 * 1024;

/// Header parse errors. All of them are fatal to the containing stream.
#[derive(Debug, PartialEq, Eq)]
pub enum HttpError {
    /// Header block exceeds the configured limit.
    HeadersTooLarge,
    /// The request line is malformed.
    BadRequestLine,
    /// The HTTP version is not `HTTP/<digit>.<digit>`.
    BadVersion,
    /// A header line has no colon or an empty/invalid name.
    InvalidHeaderName,
    /// A continuation line arrived before any header.
    BadContinuation,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeadersTooLarge => write!(f, "header block too large"),
            Self::BadRequestLine => write!(f, "malformed request line"),
            Self::BadVersion => write!(f, "malformed HTTP version"),
            Self::InvalidHeaderName => write!(f, "invalid header name"),
            Self::BadContinuation => write!(f, "continuation line before first header"),
        }
    }
}

impl std::error::Error for HttpError {}

/// Outcome of feeding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// The header block is still incomplete.
    Partial,
    /// The header block completed within this chunk; `body_offset` is the
    /// index of the first body byte in the chunk just fed.
    Complete {
        /// Offset of the first body byte within the fed chunk.
        body_offset: usize,
    },
}

/// Streaming parser for one request's header block.
pub struct HeaderParser {
    buf: Vec<u8>,
    /// Resume point for the terminator scan.
    scan_pos: usize,
    max_block: usize,
    complete: bool,
    start_line: String,
    method: String,
    target: String,
    version: (u8, u8),
    headers: Vec<(String, String)>,
}

impl HeaderParser {
    /// Creates a parser with the default 64 KiB header-block cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_HEADER_BLOCK)
    }

    /// Creates a parser with an explicit header-block cap.
    #[must_use]
    pub fn with_limit(max_block: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan_pos: 0,
            max_block,
            complete: false,
            start_line: String::new(),
            method: String::new(),
            target: String::new(),
            version: (0, 0),
            headers: Vec::new(),
        }
    }

    /// Feeds the next received chunk.
    ///
    /// Once `Complete` is returned the parser must not be fed again; the
    /// caller routes `chunk[body_offset..]` (and everything after) to the
    /// body consumer.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the stream: the accumulated block is either
    /// over the cap or malformed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Progress, HttpError> {
        debug_assert!(!self.complete, "feed after completion");
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_block {
            return Err(HttpError::HeadersTooLarge);
        }

        let Some(body_start) = self.find_terminator() else {
            return Ok(Progress::Partial);
        };

        let block = std::mem::take(&mut self.buf);
        self.parse_block(&block[..body_start])?;
        self.complete = true;

        let chunk_start = block.len() - chunk.len();
        Ok(Progress::Complete {
            body_offset: body_start - chunk_start,
        })
    }

    /// Scans for the first empty line; returns the index just past it.
    fn find_terminator(&mut self) -> Option<usize> {
        let buf = &self.buf;
        let mut i = self.scan_pos;
        while i < buf.len() {
            if buf[i] == b'\n' {
                if i + 1 < buf.len() && buf[i + 1] == b'\n' {
                    return Some(i + 2);
                }
                if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                    return Some(i + 3);
                }
            }
            i += 1;
        }
        // Keep enough lookback to catch a terminator split across chunks.
        self.scan_pos = buf.len().saturating_sub(2);
        None
    }

    fn parse_block(&mut self, block: &[u8]) -> Result<(), HttpError> {
        let mut lines = block
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let request_line = lines.next().ok_or(HttpError::BadRequestLine)?;
        self.parse_request_line(request_line)?;

        for line in lines {
            if line.is_empty() {
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // RFC 7230 obs-fold: continuation of the previous value.
                let folded = String::from_utf8_lossy(trim_ows(line)).into_owned();
                let last = self
                    .headers
                    .last_mut()
                    .ok_or(HttpError::BadContinuation)?;
                if !folded.is_empty() {
                    last.1.push(' ');
                    last.1.push_str(&folded);
                }
                continue;
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(HttpError::InvalidHeaderName)?;
            let name = &line[..colon];
            if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
                return Err(HttpError::InvalidHeaderName);
            }
            let value = String::from_utf8_lossy(trim_ows(&line[colon + 1..])).into_owned();
            self.headers
                .push((String::from_utf8_lossy(name).into_owned(), value));
        }
        Ok(())
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        let text = String::from_utf8_lossy(line).into_owned();
        {
            let mut parts = text.split(' ').filter(|p| !p.is_empty());
            let method = parts.next().ok_or(HttpError::BadRequestLine)?;
            let target = parts.next().ok_or(HttpError::BadRequestLine)?;
            let version = parts.next().ok_or(HttpError::BadRequestLine)?;
            if parts.next().is_some() {
                return Err(HttpError::BadRequestLine);
            }

            let digits = version
                .strip_prefix("HTTP/")
                .ok_or(HttpError::BadVersion)?;
            let (major, minor) = digits.split_once('.').ok_or(HttpError::BadVersion)?;
            self.version = (
                major.parse().map_err(|_| HttpError::BadVersion)?,
                minor.parse().map_err(|_| HttpError::BadVersion)?,
            );
            self.method = method.to_owned();
            self.target = target.to_owned();
        }
        self.start_line = text;
        Ok(())
    }

    /// True once the header block has fully arrived and parsed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The request line, verbatim (line terminator stripped).
    #[must_use]
    pub fn request_line(&self) -> &str {
        &self.start_line
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// HTTP version as `(major, minor)`.
    #[must_use]
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    /// The parsed headers in arrival order, names in original case.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive lookup. Multiple values are joined with `", "`,
    /// except `Set-Cookie`, whose first value is returned un-joined (use
    /// [`header_values`](Self::header_values) for the full list).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        let mut values = self.header_values(name);
        if values.is_empty() {
            return None;
        }
        if name.eq_ignore_ascii_case("set-cookie") {
            return Some(values.remove(0).to_owned());
        }
        Some(values.join(", "))
    }

    /// All values for `name`, case-insensitively, in arrival order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeaderParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderParser")
            .field("complete", &self.complete)
            .field("buffered", &self.buf.len())
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// RFC 9110 `tchar`.
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Trims optional whitespace (SP / HT) from both ends.
fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
