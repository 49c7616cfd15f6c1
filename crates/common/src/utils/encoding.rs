use crate::constants::DEFAULT_CHARSET;
use encoding_rs::Encoding;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use thiserror::Error;

/// Everything except the RFC 3986 unreserved set: `ALPHA / DIGIT / "-" / "." / "_" / "~"`
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Errors while decoding a response body into text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CharsetError {
    #[error("unsupported charset {0}")]
    Unsupported(String),

    #[error("malformed {0} data")]
    Malformed(&'static str),
}

impl CharsetError {
    /// Charset label the error refers to
    pub fn charset(&self) -> &str {
        match self {
            Self::Unsupported(label) => label,
            Self::Malformed(name) => name,
        }
    }
}

/// Percent-encode a string so it can be used as a single URL path segment
///
/// Only unreserved characters stay as-is; `:`, `/`, `?`, `&` and everything
/// else are escaped.
pub fn percent_encode_component(input: &str) -> String {
    utf8_percent_encode(input, UNRESERVED).to_string()
}

/// Decode a percent-encoded string back into UTF-8 text
pub fn percent_decode_component(input: &str) -> Result<String, std::str::Utf8Error> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
}

/// Extract the `charset` parameter from a `Content-Type` header value
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    let parsed: mime::Mime = content_type.parse().ok()?;
    parsed
        .get_param(mime::CHARSET)
        .map(|charset| charset.as_str().to_string())
}

/// Decode a body using the declared charset, or UTF-8 when none is declared
///
/// Returns the text and the canonical encoding name. Unknown labels and
/// malformed byte sequences are errors rather than lossy replacements.
pub fn decode_text(
    body: &[u8],
    charset: Option<&str>,
) -> Result<(String, &'static str), CharsetError> {
    let label = charset.map(str::trim).unwrap_or(DEFAULT_CHARSET);
    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| CharsetError::Unsupported(label.to_string()))?;

    let text = encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or(CharsetError::Malformed(encoding.name()))?;

    Ok((text.into_owned(), encoding.name()))
}
