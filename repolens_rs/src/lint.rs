//! Auxiliary lint pass support.
//!
//! The lint tool writes a JSON report; the quality gate only ingests its own
//! "generic external issue" format, so the report is rewritten before the
//! main scan picks it up. Files owned by the lint tool are excluded from the
//! main scan, which is why their line counts are taken here instead.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{AnalysisError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Lint tool report (input)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LintReport {
    #[serde(default)]
    pub files: Vec<LintFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LintFile {
    pub filename: String,
    #[serde(default)]
    pub violations: Vec<LintViolation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LintViolation {
    pub beginline: u32,
    #[serde(default)]
    pub endline: Option<u32>,
    #[serde(default)]
    pub description: String,
    pub rule: String,
    #[serde(default)]
    pub ruleset: Option<String>,
    /// 1 (highest) ..= 5
    pub priority: u8,
}

// ─────────────────────────────────────────────────────────────────────────────
// Quality-gate generic issue format (output)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIssueReport {
    pub issues: Vec<ExternalIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIssue {
    pub engine_id: String,
    pub rule_id: String,
    pub severity: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub primary_location: IssueLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueLocation {
    pub message: String,
    pub file_path: String,
    pub text_range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRange {
    pub start_line: u32,
    pub end_line: u32,
}

/// Lint priority (1..=5) to quality-gate severity.
pub fn severity_for_priority(priority: u8) -> &'static str {
    match priority {
        1 => "BLOCKER",
        2 => "CRITICAL",
        3 => "MAJOR",
        4 => "MINOR",
        _ => "INFO",
    }
}

fn issue_type(ruleset: Option<&str>) -> &'static str {
    match ruleset.map(str::to_ascii_lowercase).as_deref() {
        Some("security") => "VULNERABILITY",
        Some("error prone") | Some("errorprone") | Some("multithreading") => "BUG",
        _ => "CODE_SMELL",
    }
}

/// Rewrite a lint report into the external-issue format.
///
/// File paths are made relative to `base_dir` because the scanner resolves
/// them against the project base directory.
pub fn convert_report(report: &LintReport, engine_id: &str, base_dir: &Path) -> ExternalIssueReport {
    let issues = report
        .files
        .iter()
        .flat_map(|file| {
            let rel = Path::new(&file.filename)
                .strip_prefix(base_dir)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| file.filename.clone());
            file.violations.iter().map(move |v| {
                let start = v.beginline.max(1);
                ExternalIssue {
                    engine_id: engine_id.to_string(),
                    rule_id: v.rule.clone(),
                    severity: severity_for_priority(v.priority).to_string(),
                    kind: issue_type(v.ruleset.as_deref()).to_string(),
                    primary_location: IssueLocation {
                        message: v.description.trim().to_string(),
                        file_path: rel.clone(),
                        text_range: TextRange {
                            start_line: start,
                            end_line: v.endline.unwrap_or(start).max(start),
                        },
                    },
                }
            })
        })
        .collect();
    ExternalIssueReport { issues }
}

/// Read the lint report at `input`, convert it, write the result to `output`.
pub fn convert_report_file(
    input: &Path,
    output: &Path,
    engine_id: &str,
    base_dir: &Path,
) -> Result<usize> {
    let raw = fs::read_to_string(input)?;
    let report: LintReport = serde_json::from_str(&raw)
        .map_err(|e| AnalysisError::Parsing(format!("lint report {}: {e}", input.display())))?;
    let converted = convert_report(&report, engine_id, base_dir);
    let count = converted.issues.len();
    fs::write(output, serde_json::to_vec_pretty(&converted)?)?;
    debug!(issues = count, path = %output.display(), "converted lint report");
    Ok(count)
}

/// Total line count of files with one of `extensions` under `root`.
///
/// Hidden directories (`.git` and friends) are not descended into.
pub fn count_lines(root: &Path, extensions: &[String]) -> u64 {
    if !root.is_dir() || extensions.is_empty() {
        return 0;
    }
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| extensions.iter().any(|want| want.eq_ignore_ascii_case(x)))
        })
        .map(|e| {
            fs::File::open(e.path())
                .map(|f| BufReader::new(f).lines().count() as u64)
                .unwrap_or(0)
        })
        .sum()
}
