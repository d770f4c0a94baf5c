//! Score ladders used when presenting finished analyses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Letter grade derived from an overall score.
///
/// Lower bounds are exclusive: a score of exactly 90 is an `A`, not an `A+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D")]
    D,
}

impl Grade {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s > 90 => Grade::APlus,
            s if s > 80 => Grade::A,
            s if s > 70 => Grade::BPlus,
            s if s > 60 => Grade::B,
            s if s > 50 => Grade::CPlus,
            s if s > 40 => Grade::C,
            _ => Grade::D,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::D => "D",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an averaged language-quality score onto a 0..=10 level.
///
/// Same exclusive-lower-bound rule as [`Grade`]; anything at or below zero
/// (quality scores are unbounded below) is level 0.
pub fn language_level(average_quality: f64) -> u8 {
    if average_quality.is_nan() || average_quality <= 0.0 {
        return 0;
    }
    // (0, 10] -> 1, (10, 20] -> 2, ... (90, ..) -> 10
    let rung = (average_quality / 10.0).ceil();
    rung.clamp(1.0, 10.0) as u8
}
