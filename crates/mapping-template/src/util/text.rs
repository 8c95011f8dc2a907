use base64::{engine::general_purpose::STANDARD, Engine};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::RenderError;

/// Characters left untouched by `application/x-www-form-urlencoded` encoding.
const FORM: &AsciiSet = &NON_ALPHANUMERIC.remove(b'*').remove(b'-').remove(b'.').remove(b'_');

pub(super) fn escape_javascript(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' | '\'' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

pub(super) fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, FORM).to_string().replace("%20", "+")
}

pub(super) fn url_decode(value: &str) -> Result<String, RenderError> {
    percent_decode_str(&value.replace('+', " "))
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|error| RenderError::evaluation(format!("urlDecode: {error}")))
}

pub(super) fn base64_encode(value: &str) -> String {
    STANDARD.encode(value)
}

pub(super) fn base64_decode(value: &str) -> Result<String, RenderError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|error| RenderError::evaluation(format!("base64Decode: {error}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
