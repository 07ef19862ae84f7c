//! Text-entry encoding for the Selendroid keyboard.
//!
//! With the `unicodeKeyboard` capability the device runs a custom IME that
//! decodes IMAP modified UTF-7 (RFC 3501 §5.1.3). Text is only re-encoded
//! when it contains something the stock keyboard would mangle: a non-ASCII
//! character or a literal `&`. Characters in the WebDriver key range
//! (U+E000..=U+E040) are key sentinels such as Enter or Backspace and do not
//! trigger encoding on their own.

use std::ops::RangeInclusive;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::Engine;
use serde_json::Value;

use crate::error::ApiError;

/// Code points WebDriver reserves for special keys.
pub const KEY_SENTINEL_RANGE: RangeInclusive<u32> = 0xE000..=0xE040;

/// Modified base64: `,` instead of `/`, no padding.
const MUTF7: GeneralPurpose = GeneralPurpose::new(&alphabet::IMAP_MUTF7, NO_PAD);

/// Flatten a WebDriver `value` payload into one string.
///
/// Clients send either a plain string or an array of strings (often one
/// character each). Numbers and booleans in the array are stringified.
pub fn join_value(value: &Value) -> Result<String, ApiError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(parts) => {
            let mut joined = String::new();
            for part in parts {
                match part {
                    Value::String(s) => joined.push_str(s),
                    Value::Number(n) => joined.push_str(&n.to_string()),
                    Value::Bool(b) => joined.push_str(if *b { "true" } else { "false" }),
                    Value::Null => {}
                    other => {
                        return Err(ApiError::validation(format!(
                            "Text value entries must be strings, got {}",
                            other
                        )))
                    }
                }
            }
            Ok(joined)
        }
        Value::Null => Err(ApiError::validation("Missing text value")),
        other => Err(ApiError::validation(format!(
            "Text value must be a string or an array of strings, got {}",
            other
        ))),
    }
}

/// Whether `text` has to go through the unicode IME encoding.
pub fn needs_encoding(text: &str) -> bool {
    text.chars().any(|c| {
        let code = c as u32;
        (code > 127 || c == '&') && !KEY_SENTINEL_RANGE.contains(&code)
    })
}

/// Prepare text for entry on the device.
///
/// Passes `text` through untouched unless `unicode_keyboard` is set and
/// [`needs_encoding`] says so, in which case the whole string is encoded.
pub fn encode_string(text: &str, unicode_keyboard: bool) -> String {
    if unicode_keyboard && needs_encoding(text) {
        imap_utf7_encode(text)
    } else {
        text.to_string()
    }
}

/// Encode `text` as IMAP modified UTF-7.
///
/// Printable ASCII is copied, `&` becomes `&-`, and every run of other
/// characters becomes `&` + base64(UTF-16BE) + `-`.
pub fn imap_utf7_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run: Vec<u16> = Vec::new();

    for c in text.chars() {
        if is_direct(c) {
            flush_run(&mut out, &mut run);
            if c == '&' {
                out.push_str("&-");
            } else {
                out.push(c);
            }
        } else {
            let mut buf = [0u16; 2];
            run.extend_from_slice(c.encode_utf16(&mut buf));
        }
    }
    flush_run(&mut out, &mut run);
    out
}

fn is_direct(c: char) -> bool {
    matches!(c as u32, 0x20..=0x7e)
}

fn flush_run(out: &mut String, run: &mut Vec<u16>) {
    if run.is_empty() {
        return;
    }
    let bytes: Vec<u8> = run.iter().flat_map(|unit| unit.to_be_bytes()).collect();
    out.push('&');
    out.push_str(&MUTF7.encode(bytes));
    out.push('-');
    run.clear();
}
