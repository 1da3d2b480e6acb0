//! JSON helpers for text produced by loosely typed upstream collaborators.

use std::io;

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::Formatter;

/// Strips markdown code fences and extracts the first JSON object or array embedded in `text`.
///
/// Returns the trimmed input when no object or array start can be found, so plain scalars are
/// left for the caller to interpret.
pub fn clean_json_text(text: &str) -> &str {
    let mut text = text.trim();

    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string of the opening fence (```json).
        let rest = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }

    let Some(start) = text.find(['{', '[']) else {
        return text;
    };

    let open = text.as_bytes()[start];
    let close = if open == b'{' { '}' } else { ']' };
    match text.rfind(close) {
        Some(end) if end > start => &text[start..=end],
        _ => text,
    }
}

/// Serializes `value` with `", "` and `": "` separators and ASCII-only string escapes.
///
/// Key order is preserved as given.
pub fn to_canonical_string(value: &Value) -> String {
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);

    match value.serialize(&mut serializer) {
        // The formatter only emits ASCII.
        Ok(()) => String::from_utf8(buffer).unwrap_or_else(|err| {
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }),
        Err(_) => value.to_string(),
    }
}

/// Compact formatter with a space after each separator.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }

        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_json_text_strips_fences_and_prose() {
        assert_eq!(
            clean_json_text("```json\n{\"a\": 1}\n```"),
            "{\"a\": 1}"
        );
        assert_eq!(
            clean_json_text("Here you go: [1, 2] hope it helps"),
            "[1, 2]"
        );
        assert_eq!(clean_json_text("  plain text  "), "plain text");
    }

    #[test]
    fn canonical_string_uses_spaced_separators() {
        assert_eq!(to_canonical_string(&json!({"a": 1})), r#"{"a": 1}"#);
        assert_eq!(
            to_canonical_string(&json!({"k": ["x", {"n": null}]})),
            r#"{"k": ["x", {"n": null}]}"#
        );
    }

    #[test]
    fn canonical_string_escapes_non_ascii() {
        assert_eq!(to_canonical_string(&json!("café")), r#""caf\u00e9""#);
        assert_eq!(to_canonical_string(&json!("😀")), r#""\ud83d\ude00""#);
    }
}
