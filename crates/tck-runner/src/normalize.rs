use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use tck_core::{access_nested, HarnessError, ANY_AUTHORITY_MARKER, ANY_TYPE_PREFIX};
use tracing::debug;

use crate::{AgentKind, ResponseEnvelope};

/// How one implementation kind renders byte-valued fields on the wire.
/// Selected once per exchange from the reporting agent's kind; there is a
/// closed set of renderings, not per-call string checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeStrategy {
    /// JSON field holding base64 (or plain UTF-8) text.
    Structured,
    /// Debug-style textual rendering of the byte array, with quotes,
    /// braces and literal `\xNN` octet markers.
    DebugRendered,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    strategy: NormalizeStrategy,
}

impl Normalizer {
    pub fn for_kind(reporter: AgentKind) -> Self {
        let strategy = match reporter {
            AgentKind::Rust => NormalizeStrategy::DebugRendered,
            _ => NormalizeStrategy::Structured,
        };
        Self { strategy }
    }

    pub fn strategy(&self) -> NormalizeStrategy {
        self.strategy
    }

    /// Reduces a wire-reported field value to its canonical byte sequence.
    ///
    /// Structured reporters: strict base64 first, raw UTF-8 text on decode
    /// failure. Debug reporters: strip the rendering and reify the octet
    /// markers. `extra_decode` is the envelope's single-shot tag: the
    /// sender's framing lags one decode layer behind, so the well-known
    /// URI-prefixed value is rebuilt from the fragment after its authority.
    pub fn canonical_bytes(&self, raw: &str, extra_decode: bool) -> Vec<u8> {
        match self.strategy {
            NormalizeStrategy::DebugRendered => strip_debug_rendering(raw),
            NormalizeStrategy::Structured => {
                let bytes = match BASE64_STANDARD.decode(raw) {
                    Ok(decoded) => decoded,
                    Err(_) => raw.as_bytes().to_vec(),
                };
                if extra_decode {
                    rebuild_any_prefix(&bytes)
                } else {
                    bytes
                }
            }
        }
    }
}

/// Strips the debug-style byte-array rendering one implementation emits in
/// place of structured JSON: drops the `value` label and the surrounding
/// quotes/braces/colons, then reifies literal `\xNN` markers into octets.
pub fn strip_debug_rendering(raw: &str) -> Vec<u8> {
    let tail = raw.split_once("value").map(|(_, t)| t).unwrap_or(raw);
    let mut cleaned = String::with_capacity(tail.len());
    for ch in tail.chars() {
        if !matches!(ch, '"' | '{' | '}' | ':') {
            cleaned.push(ch);
        }
    }
    decode_hex_escapes(cleaned.trim())
}

/// Turns literal `\xNN` two-digit hex markers into the octets they name.
/// Everything else passes through as its UTF-8 bytes.
pub fn decode_hex_escapes(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let hi = (bytes[i + 2] as char).to_digit(16);
            let lo = (bytes[i + 3] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn rebuild_any_prefix(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    match text.split_once(".com/") {
        Some((_, fragment)) => format!("{ANY_TYPE_PREFIX}{fragment}").into_bytes(),
        None => bytes.to_vec(),
    }
}

fn suffix_after<'a>(haystack: &'a [u8], marker: &[u8]) -> Option<&'a [u8]> {
    haystack
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|idx| &haystack[idx + marker.len()..])
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).escape_debug().to_string()
}

/// Compares canonical actual vs. expected from the authority marker
/// onward. Prefix differences are tolerated by design; a missing marker
/// on either side means normalization failed to reach canonical form.
pub fn assert_suffix_eq(actual: &[u8], expected: &[u8]) -> Result<(), HarnessError> {
    let marker = ANY_AUTHORITY_MARKER.as_bytes();
    let actual_suffix = suffix_after(actual, marker);
    let expected_suffix = suffix_after(expected, marker);
    match (actual_suffix, expected_suffix) {
        (Some(a), Some(e)) if a == e => Ok(()),
        (Some(_), Some(_)) => Err(HarnessError::AssertionFailure {
            expected: printable(expected),
            actual: printable(actual),
        }),
        _ => Err(HarnessError::NormalizationMismatch {
            marker: ANY_AUTHORITY_MARKER.to_string(),
            expected: printable(expected),
            actual: printable(actual),
        }),
    }
}

/// Normalizes a byte-valued response field and checks it against the
/// scenario's expected literal. Both sides are canonicalized before the
/// marker-anchored comparison.
pub fn verify_bytes_field(
    envelope: &ResponseEnvelope,
    reporter: AgentKind,
    field: &str,
    expected: &str,
) -> Result<(), HarnessError> {
    let raw_value = access_nested(&envelope.data, field)?;
    let raw = match raw_value.as_str() {
        Some(s) => s.to_string(),
        None => raw_value.to_string(),
    };
    let normalizer = Normalizer::for_kind(reporter);
    let actual = normalizer.canonical_bytes(&raw, envelope.extra_decode);
    let expected_bytes = decode_hex_escapes(expected.trim());
    debug!(field, actual = %printable(&actual), "normalized bytes field");
    assert_suffix_eq(&actual, &expected_bytes)
}

pub fn bytes_to_base64_str(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn base64_str_to_bytes(encoded: &str) -> Result<Vec<u8>, HarnessError> {
    BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| HarnessError::TypeMismatch {
            value: encoded.to_string(),
            expected: "base64".to_string(),
        })
}

/// Binary payloads cross the JSON-only transport as latin-1 text: one
/// char per octet, lossless in both directions for codepoints < 0x100.
pub fn bytes_to_latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn latin1_string_to_bytes(text: &str) -> Result<Vec<u8>, HarnessError> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| HarnessError::TypeMismatch {
                value: text.to_string(),
                expected: "latin-1 string".to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_values_decode_base64_first() {
        let normalizer = Normalizer::for_kind(AgentKind::Python);
        assert_eq!(
            normalizer.canonical_bytes("AAECAw==", false),
            vec![0u8, 1, 2, 3]
        );
    }

    #[test]
    fn invalid_base64_falls_back_to_raw_utf8() {
        let normalizer = Normalizer::for_kind(AgentKind::Java);
        assert_eq!(
            normalizer.canonical_bytes("not base64!!", false),
            b"not base64!!".to_vec()
        );
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let normalizer = Normalizer::for_kind(AgentKind::Python);
        let canonical = "type.googleapis.com/google.protobuf.Int32Value";
        let once = normalizer.canonical_bytes(canonical, false);
        let twice = normalizer.canonical_bytes(&String::from_utf8(once.clone()).unwrap(), false);
        assert_eq!(once, twice);
        assert_eq!(once, canonical.as_bytes());
    }

    #[test]
    fn debug_rendering_is_stripped_to_octets() {
        let raw = r#"{ value: "\x12\x10type.googleapis.com/abc" }"#;
        let stripped = strip_debug_rendering(raw);
        let mut expected = vec![0x12u8, 0x10];
        expected.extend_from_slice(b"type.googleapis.com/abc");
        assert_eq!(stripped, expected);
    }

    #[test]
    fn hex_escape_decoding_leaves_plain_text_alone() {
        assert_eq!(decode_hex_escapes("abc"), b"abc".to_vec());
        assert_eq!(decode_hex_escapes(r"\x00\xff"), vec![0u8, 255]);
        // malformed marker passes through byte-for-byte
        assert_eq!(decode_hex_escapes(r"\xzz"), br"\xzz".to_vec());
    }

    #[test]
    fn suffix_comparison_ignores_prefix_differences() {
        assert_suffix_eq(
            b"\x12\x10type.googleapis.com/abc",
            b"prefix-from-elsewhere googleapis.com/abc",
        )
        .unwrap();

        let err = assert_suffix_eq(b"type.googleapis.com/abc", b"type.googleapis.com/def")
            .expect_err("different suffixes must fail");
        assert!(matches!(err, HarnessError::AssertionFailure { .. }));
    }

    #[test]
    fn missing_marker_is_a_normalization_mismatch() {
        let err = assert_suffix_eq(b"no marker here", b"googleapis.com/abc")
            .expect_err("marker-free actual must fail");
        assert!(matches!(err, HarnessError::NormalizationMismatch { .. }));
    }

    #[test]
    fn extra_decode_rebuilds_the_type_url() {
        let normalizer = Normalizer::for_kind(AgentKind::Python);
        // sender framing left one decode layer behind: the fragment after
        // the authority survives, the prefix does not
        let partially_decoded = "mangled-prefix.com/google.protobuf.Int32Value";
        let rebuilt = normalizer.canonical_bytes(partially_decoded, true);
        assert_eq!(
            rebuilt,
            b"type.googleapis.com/google.protobuf.Int32Value".to_vec()
        );
    }

    #[test]
    fn verify_bytes_field_end_to_end() {
        let payload = bytes_to_base64_str(b"type.googleapis.com/google.protobuf.Int32Value");
        let envelope = ResponseEnvelope {
            data: json!({"payload": payload}),
            extra_decode: false,
        };
        verify_bytes_field(
            &envelope,
            AgentKind::Python,
            "payload",
            "type.googleapis.com/google.protobuf.Int32Value",
        )
        .unwrap();

        let err = verify_bytes_field(
            &envelope,
            AgentKind::Python,
            "payload",
            "type.googleapis.com/google.protobuf.StringValue",
        )
        .expect_err("wrong expected value must fail");
        assert!(matches!(err, HarnessError::AssertionFailure { .. }));
    }

    #[test]
    fn verify_bytes_field_handles_debug_reporter() {
        let envelope = ResponseEnvelope {
            data: json!({"payload": r#"{ value: "\x12\x10type.googleapis.com/abc" }"#}),
            extra_decode: false,
        };
        verify_bytes_field(
            &envelope,
            AgentKind::Rust,
            "payload",
            r"\x12\x10type.googleapis.com/abc",
        )
        .unwrap();
    }

    #[test]
    fn latin1_and_base64_round_trips() {
        let bytes = vec![0u8, 0x7f, 0x80, 0xff];
        let latin = bytes_to_latin1_string(&bytes);
        assert_eq!(latin1_string_to_bytes(&latin).unwrap(), bytes);

        let encoded = bytes_to_base64_str(&bytes);
        assert_eq!(base64_str_to_bytes(&encoded).unwrap(), bytes);
        assert!(base64_str_to_bytes("///not-base64").is_err());

        assert!(latin1_string_to_bytes("snowman \u{2603}").is_err());
    }
}
