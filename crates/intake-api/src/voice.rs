use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const ALLOWED_AUDIO_EXTENSIONS: [&str; 6] = ["wav", "mp3", "webm", "ogg", "m4a", "flac"];

pub const UNKNOWN_FIELD: &str = "Unknown";
pub const DEFAULT_DEPARTMENT: &str = "General Administration";
pub const DEFAULT_URGENCY: &str = "Medium";

/// Turns recorded audio into text.
pub trait Transcriber: Send + Sync {
    /// # Errors
    /// Returns an error when the audio cannot be transcribed. The submission is abandoned.
    fn transcribe(&self, audio: &Path) -> Result<String>;
}

/// Pulls complaint fields out of a free-form transcript.
pub trait FieldExtractor: Send + Sync {
    /// # Errors
    /// Returns an error when extraction fails. The submission continues with default fields.
    fn extract_fields(&self, transcript: &str) -> Result<ExtractedFields>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedFields {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
}

/// Caller supplied values that win over extracted ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceOverrides {
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[must_use]
pub fn is_allowed_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .is_some_and(|ext| ALLOWED_AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TVOICE-001
    #[test]
    fn audio_extension_check_is_case_insensitive() {
        assert!(is_allowed_audio(Path::new("uploads/note.WAV")));
        assert!(is_allowed_audio(Path::new("clip.m4a")));
        assert!(!is_allowed_audio(Path::new("clip.exe")));
        assert!(!is_allowed_audio(Path::new("clip")));
    }

    // Test IDs: TVOICE-002
    #[test]
    fn extracted_fields_tolerate_missing_keys() -> Result<()> {
        let fields: ExtractedFields = serde_json::from_str(r#"{"location": "Sector 9"}"#)?;
        assert_eq!(fields.location.as_deref(), Some("Sector 9"));
        assert_eq!(fields.department, None);
        assert_eq!(non_blank(Some("  ".to_string())), None);
        Ok(())
    }
}
