//! Score arithmetic for a single repository.
//!
//! Three independent signals are combined here:
//! - the quality-gate conditions, weighted into a base score floored at 0,
//! - per-language metric values, turned into unfloored quality scores,
//! - externally linted issues, whose severity penalty is subtracted last.
//!
//! Everything is pure so the numbers can be checked without any service.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::quality_gate::{GateCondition, Issue};

pub const DEFAULT_CONDITION_WEIGHT: f64 = 10.0;
pub const UNKNOWN_SEVERITY_PENALTY: f64 = 5.0;

pub fn condition_weight(metric_key: &str) -> f64 {
    match metric_key {
        "coverage" => 20.0,
        "bugs" => 40.0,
        "code_smells" => 30.0,
        "vulnerabilities" => 50.0,
        "duplicated_lines_density" => 10.0,
        _ => DEFAULT_CONDITION_WEIGHT,
    }
}

/// Penalty for one gate condition; only failing (`ERROR`) conditions count.
pub fn condition_penalty(condition: &GateCondition) -> f64 {
    if !condition.status.eq_ignore_ascii_case("ERROR") {
        return 0.0;
    }
    let weight = condition_weight(&condition.metric_key);
    let actual = parse_number(condition.actual_value.as_deref());
    let threshold = parse_number(condition.error_threshold.as_deref());
    match (actual, threshold) {
        (Some(actual), Some(threshold)) => {
            let ratio = actual / threshold;
            // 0/0 and friends: treat like an unparsable value
            if ratio.is_nan() {
                weight
            } else {
                weight * ratio.min(1.0)
            }
        }
        _ => weight,
    }
}

fn parse_number(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseScore {
    pub penalty: f64,
    /// `max(0, 100 - penalty)`, truncated
    pub score: u32,
}

pub fn base_score(conditions: &[GateCondition]) -> BaseScore {
    let penalty: f64 = conditions.iter().map(condition_penalty).sum();
    let score = (100.0 - penalty).max(0.0) as u32;
    BaseScore { penalty, score }
}

/// Quality score per language from `metric:language` measure keys.
///
/// `coverage - (bugs*2 + code_smells*0.5 + vulnerabilities*5 + duplicated_lines_density)`.
/// Not floored: heavily penalised languages go negative. Unparsable values
/// count as 0 and keys without a language suffix are ignored.
pub fn language_quality_scores(measures: &BTreeMap<String, String>) -> BTreeMap<String, f64> {
    let mut per_language: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for (key, raw) in measures {
        let mut parts = key.split(':');
        let (Some(metric), Some(language), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let value = raw.trim().parse::<f64>().unwrap_or(0.0);
        per_language.entry(language).or_default().insert(metric, value);
    }

    per_language
        .into_iter()
        .map(|(language, metrics)| {
            let get = |m: &str| metrics.get(m).copied().unwrap_or(0.0);
            let score = get("coverage")
                - (get("bugs") * 2.0
                    + get("code_smells") * 0.5
                    + get("vulnerabilities") * 5.0
                    + get("duplicated_lines_density"));
            (language.to_string(), score)
        })
        .collect()
}

pub fn severity_penalty(severity: Option<&str>) -> f64 {
    match severity {
        Some("BLOCKER") => 10.0,
        Some("CRITICAL") => 8.0,
        Some("MAJOR") => 6.0,
        Some("MINOR") => 4.0,
        Some("INFO") => 2.0,
        _ => UNKNOWN_SEVERITY_PENALTY,
    }
}

/// Issue counts per severity plus the summed penalty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeverityTally {
    pub blocker: u32,
    pub critical: u32,
    pub major: u32,
    pub minor: u32,
    pub info: u32,
    pub unknown: u32,
    pub penalty: f64,
}

impl SeverityTally {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut tally = Self::default();
        for issue in issues {
            let severity = issue.severity.as_deref();
            match severity {
                Some("BLOCKER") => tally.blocker += 1,
                Some("CRITICAL") => tally.critical += 1,
                Some("MAJOR") => tally.major += 1,
                Some("MINOR") => tally.minor += 1,
                Some("INFO") => tally.info += 1,
                _ => tally.unknown += 1,
            }
            tally.penalty += severity_penalty(severity);
        }
        tally
    }

    /// `max(0, 100 - penalty)`, the lint-language quality score.
    pub fn quality(&self) -> f64 {
        (100.0 - self.penalty).max(0.0)
    }
}

/// Everything scored for one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryScore {
    pub score: u32,
    pub languages: BTreeMap<String, u64>,
    pub language_quality: BTreeMap<String, f64>,
    pub narrative: String,
}

/// Combine the three signals into the final repository score.
///
/// `lint_language` names the language the lint tool covers; its quality
/// score comes from the issue tally and replaces whatever the gate reported.
pub fn score_repository(
    base: BaseScore,
    tally: SeverityTally,
    mut languages: BTreeMap<String, u64>,
    mut language_quality: BTreeMap<String, f64>,
    lint: Option<(&str, u64)>,
) -> RepositoryScore {
    let score = (f64::from(base.score) - tally.penalty).max(0.0) as u32;

    let lint_language = lint.map(|(lang, _)| lang);
    if let Some((lang, lines)) = lint {
        if lines > 0 {
            languages.insert(lang.to_string(), lines);
        }
        language_quality.insert(lang.to_string(), tally.quality());
    }

    let narrative = narrative(base, &tally, score, lint_language, &languages, &language_quality);
    RepositoryScore {
        score,
        languages,
        language_quality,
        narrative,
    }
}

fn narrative(
    base: BaseScore,
    tally: &SeverityTally,
    score: u32,
    lint_language: Option<&str>,
    languages: &BTreeMap<String, u64>,
    language_quality: &BTreeMap<String, f64>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Base score (quality gate): 100 - total penalty ({:.2}) = {}",
        base.penalty, base.score
    );
    let label = lint_language.unwrap_or("lint");
    let _ = writeln!(
        out,
        "Lint issues ({label}): BLOCKER {}, CRITICAL {}, MAJOR {}, MINOR {}, INFO {}, other {}",
        tally.blocker, tally.critical, tally.major, tally.minor, tally.info, tally.unknown
    );
    let _ = writeln!(
        out,
        "Lint penalty: {:.2} => {label} quality score: 100 - penalty = {:.2}",
        tally.penalty,
        tally.quality()
    );
    let _ = writeln!(
        out,
        "Overall score: base ({}) - lint penalty ({:.2}) = {score}",
        base.score, tally.penalty
    );
    let _ = writeln!(
        out,
        "Language distribution (LOC): {}",
        join_map(languages.iter().map(|(k, v)| format!("{k}={v}")))
    );
    let _ = writeln!(
        out,
        "Language quality scores: {}",
        join_map(language_quality.iter().map(|(k, v)| format!("{k}={v:.2}")))
    );
    out
}

fn join_map(items: impl Iterator<Item = String>) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined
    }
}
