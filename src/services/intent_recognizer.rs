use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::models::{Intent, IntentCategory, IntentHints};
use crate::services::text::{contains_term, find_term, TextScan};

/// Confidence given to questions that match no keyword
pub const UNRECOGNIZED_CONFIDENCE: f64 = 0.3;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

const TIME_PHRASES: &[&str] = &[
    "今天", "昨天", "前天", "本周", "上周", "本月", "上月", "上个月", "今年", "去年", "最近",
    "过去", "today", "yesterday", "this week", "last week", "this month", "last month",
    "this year", "last year",
];

const AGGREGATION_PHRASES: &[&str] = &[
    "总数", "数量", "总和", "求和", "平均", "最大", "最小", "count", "sum", "average", "max",
    "min",
];

const ENTITY_HINTS: &[(&str, &str)] = &[
    ("用户", "user"),
    ("user", "user"),
    ("订单", "order"),
    ("order", "order"),
    ("商品", "product"),
    ("产品", "product"),
    ("product", "product"),
    ("日志", "log"),
    ("log", "log"),
];

#[derive(Debug, Clone)]
pub struct WeightedKeyword {
    pub phrase: String,
    pub weight: f64,
}

/// Keyword table per intent category
#[derive(Debug, Clone)]
pub struct KeywordTable {
    entries: Vec<(IntentCategory, Vec<WeightedKeyword>)>,
}

impl KeywordTable {
    pub fn new(entries: Vec<(IntentCategory, Vec<WeightedKeyword>)>) -> Self {
        Self { entries }
    }

    fn keywords(&self, category: IntentCategory) -> &[WeightedKeyword] {
        self.entries
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, k)| k.as_slice())
            .unwrap_or(&[])
    }
}

fn kw(pairs: &[(&str, f64)]) -> Vec<WeightedKeyword> {
    pairs
        .iter()
        .map(|(phrase, weight)| WeightedKeyword {
            phrase: phrase.to_string(),
            weight: *weight,
        })
        .collect()
}

impl Default for KeywordTable {
    fn default() -> Self {
        Self::new(vec![
            (
                IntentCategory::Statistic,
                kw(&[
                    ("统计", 1.0),
                    ("总数", 1.0),
                    ("数量", 1.0),
                    ("多少", 1.0),
                    ("计数", 1.0),
                    ("count", 1.0),
                    ("how many", 1.0),
                    ("total", 0.5),
                ]),
            ),
            (
                IntentCategory::Aggregation,
                kw(&[
                    ("聚合", 1.0),
                    ("汇总", 1.0),
                    ("分组", 1.0),
                    ("按", 0.5),
                    ("group by", 1.0),
                    ("求和", 1.0),
                    ("sum", 0.5),
                    ("per", 0.5),
                ]),
            ),
            (
                IntentCategory::Trend,
                kw(&[
                    ("趋势", 1.0),
                    ("走势", 1.0),
                    ("变化", 0.5),
                    ("每天", 0.5),
                    ("每月", 0.5),
                    ("按天", 1.0),
                    ("按月", 1.0),
                    ("trend", 1.0),
                    ("over time", 1.0),
                    ("daily", 0.5),
                    ("monthly", 0.5),
                ]),
            ),
            (
                IntentCategory::Comparison,
                kw(&[
                    ("对比", 1.0),
                    ("比较", 1.0),
                    ("差异", 1.0),
                    ("差距", 1.0),
                    ("相比", 1.0),
                    ("compare", 1.0),
                    ("versus", 1.0),
                    ("vs", 0.5),
                ]),
            ),
            (
                IntentCategory::Filter,
                kw(&[
                    ("筛选", 1.0),
                    ("过滤", 1.0),
                    ("查找", 0.5),
                    ("查询", 0.5),
                    ("where", 1.0),
                    ("filter", 1.0),
                    ("大于", 0.5),
                    ("小于", 0.5),
                    ("等于", 0.5),
                ]),
            ),
            (
                IntentCategory::Ranking,
                kw(&[
                    ("排名", 1.0),
                    ("排行", 1.0),
                    ("排序", 1.0),
                    ("top", 1.0),
                    ("rank", 1.0),
                    ("最高", 0.5),
                    ("最多", 0.5),
                ]),
            ),
            (
                IntentCategory::Distribution,
                kw(&[
                    ("分布", 1.0),
                    ("占比", 1.0),
                    ("比例", 1.0),
                    ("构成", 1.0),
                    ("distribution", 1.0),
                    ("proportion", 1.0),
                    ("share", 0.5),
                ]),
            ),
            (
                IntentCategory::Anomaly,
                kw(&[
                    ("异常", 1.0),
                    ("突增", 1.0),
                    ("突降", 1.0),
                    ("离群", 1.0),
                    ("anomaly", 1.0),
                    ("outlier", 1.0),
                    ("spike", 1.0),
                ]),
            ),
        ])
    }
}

/// Keyword-scoring intent classifier. Total: every input yields an intent.
pub struct IntentRecognizer {
    keywords: KeywordTable,
}

impl IntentRecognizer {
    pub fn new(keywords: KeywordTable) -> Self {
        Self { keywords }
    }

    /// Weighted keyword score per category, in priority order
    pub fn scores(&self, text: &str) -> Vec<(IntentCategory, f64)> {
        let scan = TextScan::new(text);
        IntentCategory::PRIORITY
            .iter()
            .map(|&category| {
                let score = self
                    .keywords
                    .keywords(category)
                    .iter()
                    .filter(|k| contains_term(scan.lower(), &k.phrase))
                    .map(|k| k.weight)
                    .sum::<f64>();
                (category, score)
            })
            .collect()
    }

    pub fn recognize(&self, text: &str) -> Intent {
        if text.trim().is_empty() {
            return Intent::new(IntentCategory::Exploratory, 0.0, text);
        }

        // Strictly greater replaces, so ties keep the higher-priority category
        let mut best: Option<(IntentCategory, f64)> = None;
        for (category, score) in self.scores(text) {
            if score > best.map(|(_, s)| s).unwrap_or(0.0) {
                best = Some((category, score));
            }
        }

        let intent = match best {
            Some((category, score)) => {
                Intent::new(category, (0.5 + 0.25 * score).min(1.0), text)
            }
            None => Intent::new(IntentCategory::Exploratory, UNRECOGNIZED_CONFIDENCE, text),
        };
        debug!(
            "Recognised intent {} ({:.2}) for '{}'",
            intent.category, intent.confidence, text
        );
        intent.with_hints(extract_hints(text))
    }
}

impl Default for IntentRecognizer {
    fn default() -> Self {
        Self::new(KeywordTable::default())
    }
}

fn extract_hints(text: &str) -> IntentHints {
    let scan = TextScan::new(text);
    let lower = scan.lower();
    let first_of = |phrases: &[&str]| {
        phrases
            .iter()
            .filter_map(|p| find_term(lower, p).first().map(|&i| (i, *p)))
            .min_by_key(|(i, p)| (*i, usize::MAX - p.len()))
            .map(|(_, p)| p.to_string())
    };

    IntentHints {
        time_phrase: first_of(TIME_PHRASES),
        aggregation_phrase: first_of(AGGREGATION_PHRASES),
        number: NUMBER
            .find(lower)
            .and_then(|m| m.as_str().parse::<u64>().ok()),
        entity: ENTITY_HINTS
            .iter()
            .filter_map(|(term, entity)| find_term(lower, term).first().map(|&i| (i, *entity)))
            .min_by_key(|(i, _)| *i)
            .map(|(_, e)| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognize(text: &str) -> Intent {
        IntentRecognizer::default().recognize(text)
    }

    #[test]
    fn test_statistic_intent() {
        let intent = recognize("统计昨天用户注册数");
        assert_eq!(intent.category, IntentCategory::Statistic);
        assert!(intent.is_confident());
        assert_eq!(intent.hints.time_phrase.as_deref(), Some("昨天"));
        assert_eq!(intent.hints.entity.as_deref(), Some("user"));
    }

    #[test]
    fn test_tie_prefers_higher_priority() {
        // 统计 (statistic, 1.0) against 分组 (aggregation, 1.0) plus 按 (0.5)
        let intent = recognize("按省份分组统计订单数");
        assert_eq!(intent.category, IntentCategory::Aggregation);

        // 1.0 each: statistic wins over trend
        let intent = recognize("统计趋势");
        assert_eq!(intent.category, IntentCategory::Statistic);
    }

    #[test]
    fn test_trend_and_ranking() {
        assert_eq!(recognize("最近30天订单金额的趋势").category, IntentCategory::Trend);
        assert_eq!(recognize("销售额排名前10的城市").category, IntentCategory::Ranking);
        assert_eq!(recognize("各类别商品的占比").category, IntentCategory::Distribution);
        assert_eq!(recognize("show the spike in logs").category, IntentCategory::Anomaly);
    }

    #[test]
    fn test_unmatched_text_is_exploratory() {
        let intent = recognize("帮我看看情况");
        assert_eq!(intent.category, IntentCategory::Exploratory);
        assert!(!intent.is_confident());
    }

    #[test]
    fn test_recognizer_is_total() {
        for text in ["", "   ", "?", "1234", "😀😀", "top", "统计统计统计统计统计"] {
            let intent = recognize(text);
            assert!((0.0..=1.0).contains(&intent.confidence));
        }
    }

    #[test]
    fn test_hints_number() {
        assert_eq!(recognize("销售额前10的省份").hints.number, Some(10));
    }
}
