/// Payloads exchanged with the management broker.
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::ledger::FailureReason;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstructionError {
    #[error("instruction is not valid JSON: {0}")]
    Malformed(String),
    #[error("instruction has no otaUrl")]
    MissingUrl,
    #[error("instruction has no otaId")]
    MissingId,
}

/// Update instruction as received, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpdateCommand {
    #[serde(rename = "otaUrl", default)]
    pub ota_url: Option<String>,
    #[serde(rename = "otaId", default, deserialize_with = "opaque_id")]
    pub ota_id: Option<String>,
    #[serde(rename = "otaVersion", default)]
    pub ota_version: Option<String>,
}

impl UpdateCommand {
    pub fn from_json(payload: &[u8]) -> Result<Self, InstructionError> {
        serde_json::from_slice(payload).map_err(|e| InstructionError::Malformed(e.to_string()))
    }
}

// Operators send ids both as "33" and 33; both mean the same correlation id.
fn opaque_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A validated update instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInstruction {
    pub id: String,
    pub source_url: String,
    /// Informational only.
    pub version: Option<String>,
}

impl TryFrom<UpdateCommand> for UpdateInstruction {
    type Error = InstructionError;

    fn try_from(cmd: UpdateCommand) -> Result<Self, Self::Error> {
        let source_url = cmd
            .ota_url
            .filter(|u| !u.trim().is_empty())
            .ok_or(InstructionError::MissingUrl)?;
        let id = cmd
            .ota_id
            .filter(|i| !i.trim().is_empty())
            .ok_or(InstructionError::MissingId)?;
        Ok(Self {
            id,
            source_url,
            version: cmd.ota_version,
        })
    }
}

impl UpdateInstruction {
    pub fn parse(payload: &[u8]) -> Result<Self, InstructionError> {
        UpdateCommand::from_json(payload)?.try_into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Completed,
    Failed,
}

/// Outcome of an update attempt: `{"status":"completed","otaId":"33"}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport<'a> {
    pub status: ReportStatus,
    #[serde(rename = "otaId")]
    pub ota_id: &'a str,
}

impl<'a> StatusReport<'a> {
    pub fn completed(ota_id: &'a str) -> Self {
        Self {
            status: ReportStatus::Completed,
            ota_id,
        }
    }

    pub fn failed(ota_id: &'a str) -> Self {
        Self {
            status: ReportStatus::Failed,
            ota_id,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Reason a previous boot rolled back:
/// `{"status":"failed","reason":"connection_unstable","otaId":"33"}`.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport<'a> {
    pub status: ReportStatus,
    pub reason: &'static str,
    #[serde(rename = "otaId")]
    pub ota_id: &'a str,
}

impl<'a> FailureReport<'a> {
    pub fn new(reason: FailureReason, ota_id: &'a str) -> Self {
        Self {
            status: ReportStatus::Failed,
            reason: reason.report_str(),
            ota_id,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_instruction() {
        let payload = br#"{"otaUrl":"https://fw.example.com/v2.bin","otaId":"33","otaVersion":"2.0.1"}"#;
        let instr = UpdateInstruction::parse(payload).unwrap();
        assert_eq!(instr.id, "33");
        assert_eq!(instr.source_url, "https://fw.example.com/v2.bin");
        assert_eq!(instr.version.as_deref(), Some("2.0.1"));
    }

    #[test]
    fn test_version_is_optional_and_extra_fields_ignored() {
        let payload = br#"{"otaUrl":"https://fw/a.bin","otaId":"7","led":"on"}"#;
        let instr = UpdateInstruction::parse(payload).unwrap();
        assert_eq!(instr.version, None);
    }

    #[test]
    fn test_numeric_id_accepted() {
        let instr = UpdateInstruction::parse(br#"{"otaUrl":"https://fw/a.bin","otaId":33}"#).unwrap();
        assert_eq!(instr.id, "33");
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert_eq!(
            UpdateInstruction::parse(br#"{"otaId":"33"}"#),
            Err(InstructionError::MissingUrl)
        );
        assert_eq!(
            UpdateInstruction::parse(br#"{"otaUrl":"https://fw/a.bin"}"#),
            Err(InstructionError::MissingId)
        );
        assert_eq!(
            UpdateInstruction::parse(br#"{"otaUrl":"https://fw/a.bin","otaId":""}"#),
            Err(InstructionError::MissingId)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            UpdateInstruction::parse(b"reboot now"),
            Err(InstructionError::Malformed(_))
        ));
    }

    #[test]
    fn test_status_report_shape() {
        let json = String::from_utf8(StatusReport::completed("33").to_payload()).unwrap();
        assert_eq!(json, r#"{"status":"completed","otaId":"33"}"#);
        let json = String::from_utf8(StatusReport::failed("33").to_payload()).unwrap();
        assert_eq!(json, r#"{"status":"failed","otaId":"33"}"#);
    }

    #[test]
    fn test_failure_report_shape() {
        let report = FailureReport::new(FailureReason::Unstable, "33");
        let json = String::from_utf8(report.to_payload()).unwrap();
        assert_eq!(
            json,
            r#"{"status":"failed","reason":"connection_unstable","otaId":"33"}"#
        );
    }
}
