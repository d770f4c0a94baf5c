//! Aggregation across the repositories of a selection.
//!
//! All functions take the finished per-repository results, so merging only
//! ever happens after every repository has been processed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use repolens_common::{ActivityTotals, PerRepositoryResult};

/// Sum line counts per language over all repositories.
pub fn merge_languages<'a, I>(results: I) -> BTreeMap<String, u64>
where
    I: IntoIterator<Item = &'a PerRepositoryResult>,
{
    let mut merged = BTreeMap::new();
    for result in results {
        for (language, lines) in &result.languages {
            *merged.entry(language.clone()).or_insert(0u64) += lines;
        }
    }
    merged
}

/// Convert line totals into percentages of the grand total.
///
/// Empty when there are no lines at all.
pub fn language_ratios(totals: &BTreeMap<String, u64>) -> BTreeMap<String, f64> {
    let grand_total: u64 = totals.values().sum();
    if grand_total == 0 {
        return BTreeMap::new();
    }
    totals
        .iter()
        .map(|(language, lines)| {
            (
                language.clone(),
                *lines as f64 * 100.0 / grand_total as f64,
            )
        })
        .collect()
}

/// Rounded mean of the per-repository scores; 0 for an empty selection.
pub fn overall_score(results: &[PerRepositoryResult]) -> u32 {
    if results.is_empty() {
        return 0;
    }
    let sum: u64 = results.iter().map(|r| u64::from(r.score)).sum();
    let mean = sum as f64 / results.len() as f64;
    mean.round().clamp(0.0, 100.0) as u32
}

pub fn activity_totals(results: &[PerRepositoryResult]) -> ActivityTotals {
    let mut totals = ActivityTotals::default();
    for result in results {
        totals.add(&result.activity);
    }
    totals
}

/// Commits per day between the oldest and newest commit.
///
/// The span is at least one day, so a history whose commits all share a
/// day yields the commit count itself.
pub fn commit_frequency(commit_dates: &[DateTime<Utc>]) -> f64 {
    let (Some(oldest), Some(newest)) = (commit_dates.iter().min(), commit_dates.iter().max())
    else {
        return 0.0;
    };
    let days = (*newest - *oldest).num_days().max(1);
    commit_dates.len() as f64 / days as f64
}

/// Mean language-quality score per language over all repositories.
pub fn average_language_quality(results: &[PerRepositoryResult]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<&str, (f64, u32)> = BTreeMap::new();
    for result in results {
        for (language, score) in &result.language_quality {
            let entry = sums.entry(language.as_str()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(language, (sum, n))| (language.to_string(), sum / f64::from(n)))
        .collect()
}
