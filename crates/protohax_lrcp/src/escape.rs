//! Escaping of `/` and `\` inside DATA payloads.
//!
//! Payload bytes travel inside a `/`-delimited frame, so the two bytes that
//! would break framing are sent as two-byte escape pairs: `/` as `\/` and
//! `\` as `\\`. Every other byte passes through untouched.

/// Error when unescaping a DATA payload that violates the escaping rules.
///
/// A datagram whose payload fails to unescape must be dropped whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnescapeError {
    /// A `/` appeared outside an escape pair.
    #[error("unescaped `/` in payload")]
    BareSlash,
    /// A `\` was followed by a byte other than `/` or `\`, or nothing at
    /// all.
    #[error("invalid escape sequence")]
    BadEscape,
}

/// Escapes a raw payload for transmission, appending to `dst`.
///
/// The output never contains a `/` or `\` outside an escape pair, so it can
/// be embedded directly between the frame delimiters.
///
/// # Example
///
/// ```
/// # use protohax_lrcp::escape::escape_into;
/// let mut dst = Vec::new();
/// escape_into(br"foo/bar\baz", &mut dst);
/// assert_eq!(&dst[..], br"foo\/bar\\baz");
/// ```
pub fn escape_into(raw: &[u8], dst: &mut Vec<u8>) {
    dst.reserve(raw.len());
    for &b in raw {
        if b == b'/' || b == b'\\' {
            dst.push(b'\\');
        }
        dst.push(b);
    }
}

/// Checks that `escaped` follows the escaping rules without unescaping it.
///
/// # Errors
///
/// Errors if the payload contains an unescaped `/`, a `\` followed by a
/// byte other than `/` or `\`, or a trailing lone `\`.
pub fn validate(escaped: &[u8]) -> Result<(), UnescapeError> {
    unescape_after(escaped, escaped.len()).map(|_| ())
}

/// Reverses [`escape_into`], validating the escaping rules as it goes.
///
/// # Errors
///
/// Errors if the payload contains an unescaped `/`, a `\` followed by a
/// byte other than `/` or `\`, or a trailing lone `\`.
///
/// # Example
///
/// ```
/// # use protohax_lrcp::escape::unescape;
/// assert_eq!(unescape(br"foo\/bar\\baz").unwrap(), br"foo/bar\baz");
/// assert!(unescape(br"foo/bar").is_err());
/// assert!(unescape(br"foo\").is_err());
/// ```
pub fn unescape(escaped: &[u8]) -> Result<Vec<u8>, UnescapeError> {
    unescape_after(escaped, 0)
}

/// Like [`unescape`], but drops the raw bytes of every escape unit starting
/// before byte offset `skip` of the escaped form.
///
/// Positions in the receive stream count escaped (wire-form) bytes, so when
/// a payload partially overlaps what was already acknowledged, the fresh
/// suffix is carved out of the escaped form. A unit straddling `skip` counts
/// as already consumed. The whole payload is still validated.
///
/// # Errors
///
/// Same as [`unescape`].
pub fn unescape_after(escaped: &[u8], skip: usize) -> Result<Vec<u8>, UnescapeError> {
    let mut out = Vec::with_capacity(escaped.len().saturating_sub(skip));
    let mut at = 0;
    while at < escaped.len() {
        let (raw, width) = match escaped[at] {
            b'/' => return Err(UnescapeError::BareSlash),
            b'\\' => match escaped.get(at + 1) {
                Some(&next @ (b'/' | b'\\')) => (next, 2),
                _ => return Err(UnescapeError::BadEscape),
            },
            b => (b, 1),
        };
        if at >= skip {
            out.push(raw);
        }
        at += width;
    }
    Ok(out)
}
