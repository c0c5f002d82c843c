//! Text encodings for decoding captured process output

use std::fmt;
use std::str::FromStr;

use crate::error::SubprocessError;

const REPLACEMENT: char = '\u{FFFD}';

/// Encodings supported for string-valued calls.
///
/// Decoding is lossy: byte sequences that are not valid in the encoding are
/// replaced with U+FFFD rather than failing the call. Encoding input text
/// replaces unmappable characters with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// 7-bit US-ASCII
    Ascii,
    /// ISO-8859-1, one byte per code point
    Latin1,
}

impl TextEncoding {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Ascii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
        }
    }

    /// Decode bytes into a string, replacing invalid sequences.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { REPLACEMENT })
                .collect(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encode text into bytes, replacing characters the encoding cannot hold.
    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextEncoding {
    type Err = SubprocessError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "us-ascii" | "ascii" => Ok(Self::Ascii),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            _ => Err(SubprocessError::UnsupportedEncoding {
                name: name.to_string(),
            }),
        }
    }
}

/// Decode captured stderr for a failure report.
///
/// Strict UTF-8 first; when the bytes are not valid UTF-8 they are read as
/// ASCII with non-ASCII bytes replaced.
#[must_use]
pub fn decode_diagnostic(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => TextEncoding::Ascii.decode(bytes),
    }
}
