use serde::{Deserialize, Serialize};
use validator::Validate;

use super::answer::{AnswerRecord, OFFLINE_ANSWER_SCHEMA_VERSION};

/// File written by an offline export and accepted back by import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportFile {
    pub activity: String,
    pub filename: String,
    pub version: u32,
    pub answers: Vec<AnswerRecord>,
}

/// Import payload before validation: every field is optional so a malformed
/// file is reported through `validate` instead of a parse panic.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ImportFile {
    #[validate(
        required(message = "activity is required"),
        length(min = 1, message = "activity must not be empty")
    )]
    pub activity: Option<String>,

    #[serde(default)]
    pub filename: Option<String>,

    #[validate(
        required(message = "version is required"),
        range(min = 1, message = "version must be positive")
    )]
    pub version: Option<u32>,

    #[serde(default)]
    pub answers: Vec<AnswerRecord>,
}

impl ImportFile {
    /// Parses and validates raw file content, returning why it was rejected.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let file: ImportFile =
            serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))?;
        file.validate().map_err(|e| e.to_string())?;
        match file.version {
            Some(version) if version > OFFLINE_ANSWER_SCHEMA_VERSION => Err(format!(
                "version {} is newer than supported version {}",
                version, OFFLINE_ANSWER_SCHEMA_VERSION
            )),
            _ => Ok(file),
        }
    }
}
