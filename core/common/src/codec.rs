//! Text-safe encoding of photo payloads.
//!
//! Photos are persisted as data URLs (`data:<mime>;base64,<payload>`), the
//! same form a browser produces from `FileReader.readAsDataURL`, so records
//! written by either client stay interchangeable.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;

use crate::{Error, Result};

/// MIME type assumed when a payload carries none.
pub const DEFAULT_PHOTO_MIME: &str = "image/jpeg";

/// Whether `mime` is a bare `type/subtype` that survives the data URL form.
///
/// Both halves must be non-empty RFC 6838 restricted names; parameters
/// (`;`) and separators such as `,` are rejected.
pub fn is_valid_mime(mime: &str) -> bool {
    fn is_name(part: &str) -> bool {
        !part.is_empty()
            && part.len() <= 127
            && part.chars().all(|c| {
                c.is_ascii_alphanumeric()
                    || matches!(c, '!' | '#' | '$' | '&' | '-' | '^' | '_' | '.' | '+')
            })
    }

    match mime.split_once('/') {
        Some((kind, subtype)) => is_name(kind) && is_name(subtype),
        None => false,
    }
}

/// A binary photo together with its MIME type.
#[derive(Clone, PartialEq, Eq)]
pub struct Photo {
    mime: String,
    bytes: Vec<u8>,
}

impl Photo {
    /// Create a photo from raw bytes.
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }

    /// Create a JPEG photo.
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new(DEFAULT_PHOTO_MIME, bytes)
    }

    /// Guess the MIME type from a file extension, defaulting to JPEG.
    pub fn from_extension(ext: Option<&str>, bytes: Vec<u8>) -> Self {
        let mime = match ext.map(|e| e.to_ascii_lowercase()).as_deref() {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            Some("heic") => "image/heic",
            Some("gif") => "image/gif",
            _ => DEFAULT_PHOTO_MIME,
        };
        Self::new(mime, bytes)
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// Whether the MIME type can be stored and decoded again.
    pub fn has_valid_mime(&self) -> bool {
        is_valid_mime(&self.mime)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File name used for the multipart upload part.
    pub fn file_name(&self) -> &'static str {
        match self.mime.as_str() {
            "image/png" => "photo.png",
            "image/webp" => "photo.webp",
            "image/heic" => "photo.heic",
            "image/gif" => "photo.gif",
            _ => "photo.jpg",
        }
    }
}

impl fmt::Debug for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Photo({}, {} bytes)", self.mime, self.bytes.len())
    }
}

/// Encode a photo into its storage-safe text form.
pub fn encode_photo(photo: &Photo) -> String {
    format!("data:{};base64,{}", photo.mime, STANDARD.encode(&photo.bytes))
}

/// Decode a stored photo back to binary.
///
/// Accepts a data URL or a bare base64 payload.
///
/// # Errors
/// - Data URL without the `;base64,` marker
/// - Payload that is not valid base64
pub fn decode_photo(encoded: &str) -> Result<Photo> {
    let encoded = encoded.trim();

    let (mime, payload) = match encoded.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| Error::Codec("Data URL has no payload".to_string()))?;
            let mime = header.strip_suffix(";base64").ok_or_else(|| {
                Error::Codec(format!("Unsupported data URL encoding: {}", header))
            })?;
            let mime = if mime.is_empty() {
                DEFAULT_PHOTO_MIME
            } else {
                mime
            };
            (mime, payload)
        }
        None => (DEFAULT_PHOTO_MIME, encoded),
    };

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| Error::Codec(format!("Invalid base64 payload: {}", e)))?;

    Ok(Photo::new(mime, bytes))
}
