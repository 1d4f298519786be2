//! Turn requests — validated caller input for one chat turn.

use base64::Engine;
use lunavilla_core::error::{Error, Result};
use lunavilla_core::message::{Attachment, UserInput};

/// Mime type assumed for images sent without a data-URL header.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// A validated chat turn: the new input plus an optional hour override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnRequest {
    pub input: UserInput,

    /// Hour to compose the context for; `None` uses the wall clock.
    pub hour_override: Option<u32>,
}

impl TurnRequest {
    pub fn new(input: UserInput) -> Self {
        Self {
            input,
            hour_override: None,
        }
    }

    pub fn with_hour(mut self, hour: u32) -> Self {
        self.hour_override = Some(hour);
        self
    }

    /// Validate raw caller input.
    ///
    /// `images` are base64 payloads, each optionally prefixed with a
    /// `data:<mime>;base64,` header. `hour` of `-1` means "use the wall
    /// clock"; any other value must be a valid hour.
    pub fn parse(message: &str, images: &[String], hour: Option<i32>) -> Result<Self> {
        if message.trim().is_empty() && images.is_empty() {
            return Err(Error::InvalidInput(
                "message must not be empty".into(),
            ));
        }

        let hour_override = match hour {
            None | Some(-1) => None,
            Some(h @ 0..=23) => Some(h as u32),
            Some(h) => {
                return Err(Error::InvalidInput(format!(
                    "current_hour must be between 0 and 23 (or -1), got {h}"
                )))
            }
        };

        let mut input = UserInput::text(message);
        for (i, raw) in images.iter().enumerate() {
            let attachment = decode_image(raw)
                .map_err(|reason| Error::InvalidInput(format!("image_data[{i}]: {reason}")))?;
            input = input.with_attachment(attachment);
        }

        Ok(Self {
            input,
            hour_override,
        })
    }
}

/// Decode one inline image, honoring an optional data-URL header.
pub fn decode_image(raw: &str) -> std::result::Result<Attachment, String> {
    let raw = raw.trim();

    let (mime_type, payload) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| "malformed data URL".to_string())?;
            let mut params = header.split(';');
            let mime = params
                .next()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_IMAGE_MIME);
            if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
                return Err("data URL must be base64-encoded".into());
            }
            (mime.to_ascii_lowercase(), payload)
        }
        None => (DEFAULT_IMAGE_MIME.to_string(), raw),
    };

    if !mime_type.starts_with("image/") {
        return Err(format!("unsupported mime type '{mime_type}'"));
    }

    let compact: String = payload.split_whitespace().collect();
    let data = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| format!("invalid base64: {e}"))?;

    if data.is_empty() {
        return Err("image is empty".into());
    }

    Ok(Attachment::new(mime_type, data))
}
