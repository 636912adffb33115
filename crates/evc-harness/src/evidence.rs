//! Artifact index and evidence checks for scenario runs.
//!
//! Every JSONL decision log a run writes is listed in an [`ArtifactIndex`]
//! with its SHA-256. [`check_evidence`] fails when an indexed file is
//! missing, its digest drifted, or a log line breaks the schema.

use std::path::Path;

use evc_control::structured_log::{now_utc, validate_log_file};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the index root.
    pub path: String,
    pub kind: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index_version: u32,
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            index_version: 1,
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    /// Hash `root/relative` and add it to the index.
    pub fn add_file(
        &mut self,
        root: &Path,
        relative: &str,
        kind: impl Into<String>,
    ) -> Result<&mut Self, HarnessError> {
        let full = root.join(relative);
        let data = std::fs::read(&full).map_err(|e| HarnessError::io(&full, e))?;
        self.artifacts.push(ArtifactEntry {
            path: relative.to_string(),
            kind: kind.into(),
            sha256: sha256_hex(&data),
            size_bytes: Some(data.len() as u64),
        });
        Ok(self)
    }

    pub fn to_json(&self) -> Result<String, HarnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, HarnessError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceViolation {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceReport {
    pub ok: bool,
    /// Log lines checked across all indexed logs.
    pub log_lines: usize,
    pub violations: Vec<EvidenceViolation>,
}

impl EvidenceReport {
    fn push(&mut self, v: EvidenceViolation) {
        self.ok = false;
        self.violations.push(v);
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    use std::fmt::Write;
    let digest = sha2::Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Re-hash every indexed artifact under `root` and validate its logs.
#[must_use]
pub fn check_evidence(root: &Path, index: &ArtifactIndex) -> EvidenceReport {
    let mut report = EvidenceReport {
        ok: true,
        log_lines: 0,
        violations: Vec::new(),
    };
    if index.index_version != 1 {
        report.push(EvidenceViolation {
            code: "index.version".into(),
            message: format!("unsupported index_version {}", index.index_version),
            path: None,
            line_number: None,
        });
    }

    for artifact in &index.artifacts {
        let full = root.join(&artifact.path);
        let data = match std::fs::read(&full) {
            Ok(data) => data,
            Err(e) => {
                report.push(EvidenceViolation {
                    code: "artifact.missing".into(),
                    message: format!("cannot read '{}': {e}", full.display()),
                    path: Some(artifact.path.clone()),
                    line_number: None,
                });
                continue;
            }
        };
        let actual = sha256_hex(&data);
        if actual != artifact.sha256 {
            report.push(EvidenceViolation {
                code: "artifact.sha256_mismatch".into(),
                message: format!("expected {}, found {actual}", artifact.sha256),
                path: Some(artifact.path.clone()),
                line_number: None,
            });
        }
        if artifact.kind != "log" {
            continue;
        }
        match validate_log_file(&full) {
            Ok((lines, errors)) => {
                report.log_lines += lines;
                for err in errors {
                    report.push(EvidenceViolation {
                        code: "log.schema".into(),
                        message: format!("{}: {}", err.field, err.message),
                        path: Some(artifact.path.clone()),
                        line_number: Some(err.line_number),
                    });
                }
            }
            Err(e) => report.push(EvidenceViolation {
                code: "log.unreadable".into(),
                message: e.to_string(),
                path: Some(artifact.path.clone()),
                line_number: None,
            }),
        }
    }
    report.violations.sort_by(|a, b| {
        a.code
            .cmp(&b.code)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line_number.cmp(&b.line_number))
    });
    report
}
