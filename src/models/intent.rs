use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Confidence below this value marks an intent as unreliable.
pub const CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Analytical intent categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentCategory {
    Statistic,
    Aggregation,
    Trend,
    Comparison,
    Filter,
    Ranking,
    Distribution,
    Anomaly,
    Exploratory,
}

impl IntentCategory {
    /// Tie-break order, highest priority first. Exploratory is the fallback.
    pub const PRIORITY: [IntentCategory; 9] = [
        IntentCategory::Statistic,
        IntentCategory::Aggregation,
        IntentCategory::Trend,
        IntentCategory::Comparison,
        IntentCategory::Filter,
        IntentCategory::Ranking,
        IntentCategory::Distribution,
        IntentCategory::Anomaly,
        IntentCategory::Exploratory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::Statistic => "statistic",
            IntentCategory::Aggregation => "aggregation",
            IntentCategory::Trend => "trend",
            IntentCategory::Comparison => "comparison",
            IntentCategory::Filter => "filter",
            IntentCategory::Ranking => "ranking",
            IntentCategory::Distribution => "distribution",
            IntentCategory::Anomaly => "anomaly",
            IntentCategory::Exploratory => "exploratory",
        }
    }

    /// Short description used in LLM prompts
    pub fn description(&self) -> &'static str {
        match self {
            IntentCategory::Statistic => "counts and totals of records",
            IntentCategory::Aggregation => "grouped sums, averages or counts",
            IntentCategory::Trend => "how a metric changes over time",
            IntentCategory::Comparison => "differences between groups or periods",
            IntentCategory::Filter => "records matching conditions",
            IntentCategory::Ranking => "top or bottom entries by a metric",
            IntentCategory::Distribution => "share or proportion of a whole",
            IntentCategory::Anomaly => "outliers, spikes and drops",
            IntentCategory::Exploratory => "open-ended exploration",
        }
    }
}

impl FromStr for IntentCategory {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "statistic" | "statistics" | "count" => Ok(IntentCategory::Statistic),
            "aggregation" | "aggregate" => Ok(IntentCategory::Aggregation),
            "trend" => Ok(IntentCategory::Trend),
            "comparison" | "compare" => Ok(IntentCategory::Comparison),
            "filter" => Ok(IntentCategory::Filter),
            "ranking" | "rank" => Ok(IntentCategory::Ranking),
            "distribution" => Ok(IntentCategory::Distribution),
            "anomaly" => Ok(IntentCategory::Anomaly),
            "exploratory" | "explore" => Ok(IntentCategory::Exploratory),
            _ => Err(PipelineError::Analysis(format!("Unknown intent category '{}'", s))),
        }
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loose parameters picked out of the question while matching keywords
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

/// Recognised intent of a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub category: IntentCategory,
    pub confidence: f64,
    pub raw_text: String,
    #[serde(default)]
    pub hints: IntentHints,
}

impl Intent {
    pub fn new(category: IntentCategory, confidence: f64, raw_text: impl Into<String>) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            category,
            confidence,
            raw_text: raw_text.into(),
            hints: IntentHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: IntentHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn is_confident(&self) -> bool {
        self.confidence >= CONFIDENCE_THRESHOLD
    }
}
