use chrono::{Local, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::models::{
    AggregateFunction, Column, ColumnType, Dimension, Filter, FilterOperator, Intent,
    IntentCategory, Measure, OrderBy, QuerySpec, SchemaCatalog, SqlValue, Table, TableRef,
    TimeGranularity, TimeRange, UnresolvedEntity,
};
use crate::services::text::{
    contains_term, find_term, first_term, is_cjk, leading_word, skip_filler, starts_with_term,
    TextScan,
};
use crate::services::time_range;

const MEASURE_WORDS: &[(AggregateFunction, &[&str])] = &[
    (
        AggregateFunction::Count,
        &["个数", "数量", "总数", "多少", "计数", "人数", "次数", "count", "how many", "number of"],
    ),
    (
        AggregateFunction::Sum,
        &["总和", "求和", "总额", "合计", "总计", "sum", "total"],
    ),
    (AggregateFunction::Avg, &["平均", "均值", "average", "avg", "mean"]),
    (AggregateFunction::Max, &["最大", "最高", "maximum", "max", "highest"]),
    (AggregateFunction::Min, &["最小", "最低", "minimum", "min", "lowest"]),
];

/// Measure words that are dropped when no numeric column goes with them
const WEAK_MEASURE_WORDS: &[&str] = &["total", "最高", "最低", "highest", "lowest"];

/// Under a ranking intent these order rows instead of aggregating
const RANKING_ORDER_WORDS: &[&str] = &["最高", "最低", "highest", "lowest"];

const ASCENDING_WORDS: &[&str] = &[
    "最少", "最低", "倒数", "升序", "从低到高", "从小到大", "bottom", "lowest", "least",
    "ascending", "asc",
];

const DIMENSION_MARKERS: &[&str] = &[
    "按照", "按", "根据", "各个", "各", "每个", "group by", "by", "per",
];

const TIME_BUCKET_MARKERS: &[(TimeGranularity, &[&str])] = &[
    (
        TimeGranularity::Hour,
        &["按小时", "每小时", "hourly", "by hour", "per hour"],
    ),
    (
        TimeGranularity::Day,
        &["按天", "按日", "每天", "每日", "逐日", "daily", "by day", "per day"],
    ),
    (
        TimeGranularity::Week,
        &["按周", "每周", "weekly", "by week", "per week"],
    ),
    (
        TimeGranularity::Month,
        &["按月", "每月", "逐月", "monthly", "by month", "per month"],
    ),
    (
        TimeGranularity::Year,
        &["按年", "每年", "yearly", "by year", "per year"],
    ),
];

const SORT_WORDS: &[&str] = &[
    "排序", "排列", "降序", "升序", "从高到低", "从低到高", "sort", "order",
];

const OPERATORS: &[(&str, FilterOperator)] = &[
    ("大于或等于", FilterOperator::Ge),
    ("大于等于", FilterOperator::Ge),
    ("不少于", FilterOperator::Ge),
    ("不低于", FilterOperator::Ge),
    ("至少", FilterOperator::Ge),
    (">=", FilterOperator::Ge),
    ("at least", FilterOperator::Ge),
    ("小于或等于", FilterOperator::Le),
    ("小于等于", FilterOperator::Le),
    ("不超过", FilterOperator::Le),
    ("不高于", FilterOperator::Le),
    ("至多", FilterOperator::Le),
    ("<=", FilterOperator::Le),
    ("at most", FilterOperator::Le),
    ("不等于", FilterOperator::Ne),
    ("不是", FilterOperator::Ne),
    ("!=", FilterOperator::Ne),
    ("<>", FilterOperator::Ne),
    ("is not", FilterOperator::Ne),
    ("大于", FilterOperator::Gt),
    ("超过", FilterOperator::Gt),
    ("高于", FilterOperator::Gt),
    ("多于", FilterOperator::Gt),
    (">", FilterOperator::Gt),
    ("greater than", FilterOperator::Gt),
    ("more than", FilterOperator::Gt),
    ("above", FilterOperator::Gt),
    ("over", FilterOperator::Gt),
    ("小于", FilterOperator::Lt),
    ("低于", FilterOperator::Lt),
    ("少于", FilterOperator::Lt),
    ("<", FilterOperator::Lt),
    ("less than", FilterOperator::Lt),
    ("below", FilterOperator::Lt),
    ("under", FilterOperator::Lt),
    ("包含", FilterOperator::Like),
    ("contains", FilterOperator::Like),
    ("like", FilterOperator::Like),
    ("等于", FilterOperator::Eq),
    ("为", FilterOperator::Eq),
    ("是", FilterOperator::Eq),
    ("=", FilterOperator::Eq),
    ("equals", FilterOperator::Eq),
    ("is", FilterOperator::Eq),
];

const WORD_STOPS: &[&str] = &[
    "的", "分组", "统计", "汇总", "排序", "计算", "查询", "和", "与", "且", "或", "并且",
];

const TIME_UNIT_WORDS: &[&str] = &["天", "日", "周", "月", "年", "小时", "day", "week", "month", "year"];

const QUOTES: &[char] = &['\'', '"', '“', '”', '‘', '’', '「', '」'];

const NOISE_CJK: &[&str] = &[
    "统计", "查询", "查看", "分析", "计算", "显示", "列出", "给我", "帮我", "请", "一下",
    "所有", "全部", "总数", "数量", "个数", "多少", "计数", "平均", "总和", "求和", "总额",
    "最大", "最小", "最高", "最低", "按照", "按", "各个", "各", "每个", "分组", "排名",
    "排行", "排序", "趋势", "分布", "占比", "对比", "比较", "筛选", "过滤", "大于", "小于",
    "等于", "前", "的", "是", "为", "有", "和", "与",
];

const NOISE_EN: &[&str] = &[
    "count", "show", "list", "all", "the", "of", "how", "many", "what", "is", "are", "me",
    "get", "find", "number", "total", "sum", "average", "avg", "by", "per", "group", "top",
    "in", "for", "a", "an", "and", "with", "from", "yesterday", "today", "last", "this",
    "week", "month", "year", "days", "day", "trend", "distribution", "compare", "daily",
    "monthly", "were", "was", "did", "there", "registered",
];

static LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:前|top|limit|倒数|bottom|最多|最少)\s*(\d+)|(\d+)\s*(?:条|名|行)")
        .expect("valid regex")
});

static CN_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"前([一二三四五六七八九十])").expect("valid regex"));

static NUMBER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+(?:\.\d+)?").expect("valid regex"));

static DATE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{1,2}-\d{1,2}").expect("valid regex"));

/// Reference instant for relative time expressions
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext {
    pub now: NaiveDateTime,
}

impl AnalysisContext {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now }
    }

    pub fn current() -> Self {
        Self::new(Local::now().naive_local())
    }
}

/// Query shape proposed by the LLM, validated against the catalog before use
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryDraft {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub measures: Vec<DraftMeasure>,
    #[serde(default)]
    pub dimensions: Vec<DraftDimension>,
    #[serde(default)]
    pub filters: Vec<DraftFilter>,
    #[serde(default)]
    pub time_range: Option<DraftTimeRange>,
    #[serde(default)]
    pub order_by: Vec<DraftOrder>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftMeasure {
    pub function: AggregateFunction,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftDimension {
    pub column: String,
    #[serde(default)]
    pub granularity: Option<TimeGranularity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftFilter {
    pub column: String,
    pub operator: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftTimeRange {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub relative: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftOrder {
    pub key: String,
    #[serde(default)]
    pub descending: bool,
}

struct ColumnTerm<'c> {
    term: String,
    column: &'c Column,
}

/// Catalog terms of a table's columns, longest first
fn column_terms(table: &Table) -> Vec<ColumnTerm<'_>> {
    let mut terms: Vec<ColumnTerm<'_>> = table
        .columns
        .iter()
        .flat_map(|column| {
            column
                .terms()
                .into_iter()
                .map(move |term| ColumnTerm { term, column })
        })
        .collect();
    terms.sort_by_key(|t| std::cmp::Reverse(t.term.len()));
    terms
}

fn overlaps(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|&(a, b)| start < b && a < end)
}

/// Non-overlapping column mentions in text order
fn mentions<'c>(lower: &str, terms: &[ColumnTerm<'c>]) -> Vec<(usize, usize, &'c Column)> {
    let mut taken: Vec<(usize, usize)> = Vec::new();
    let mut found = Vec::new();
    for term in terms {
        for pos in find_term(lower, &term.term) {
            let end = pos + term.term.len();
            if overlaps(&taken, pos, end) {
                continue;
            }
            taken.push((pos, end));
            found.push((pos, end, term.column));
        }
    }
    found.sort_by_key(|(pos, _, _)| *pos);
    found
}

fn leading_column<'c>(text: &str, terms: &[ColumnTerm<'c>]) -> Option<(&'c Column, usize)> {
    terms
        .iter()
        .find(|t| starts_with_term(text, &t.term))
        .map(|t| (t.column, t.term.len()))
}

fn leading_operator(text: &str) -> Option<(usize, FilterOperator)> {
    OPERATORS
        .iter()
        .filter(|(op, _)| starts_with_term(text, op))
        .max_by_key(|(op, _)| op.len())
        .map(|(op, operator)| (op.len(), *operator))
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(midnight))
}

fn chinese_numeral(s: &str) -> Option<u64> {
    let value = match s {
        "一" => 1,
        "二" => 2,
        "三" => 3,
        "四" => 4,
        "五" => 5,
        "六" => 6,
        "七" => 7,
        "八" => 8,
        "九" => 9,
        "十" => 10,
        _ => return None,
    };
    Some(value)
}

fn extract_limit(lower: &str) -> Option<u64> {
    let numeric = LIMIT.captures(lower).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    });
    numeric
        .or_else(|| {
            CN_LIMIT
                .captures(lower)
                .and_then(|caps| chinese_numeral(&caps[1]))
        })
        .filter(|n| *n > 0)
}

/// Best guess at the entity a question is about when no table matched
fn residual_entity(lower: &str, time_span: Option<(usize, usize)>) -> String {
    let mut text = lower.to_string();
    if let Some((start, end)) = time_span {
        text.replace_range(start..end, " ");
    }

    let mut noise: Vec<&str> = NOISE_CJK.to_vec();
    noise.sort_by_key(|w| std::cmp::Reverse(w.len()));

    for segment in text.split(|c: char| !(is_cjk(c) || c.is_ascii_alphanumeric() || c == '_')) {
        if segment.is_empty() {
            continue;
        }
        if segment.is_ascii() {
            if !NOISE_EN.contains(&segment) && !segment.chars().all(|c| c.is_ascii_digit()) {
                return segment.to_string();
            }
            continue;
        }
        let mut stripped = segment.to_string();
        for word in &noise {
            stripped = stripped.replace(word, "|");
        }
        for piece in stripped.split('|') {
            let piece = piece
                .trim_matches(|c: char| c.is_ascii_digit())
                .trim_end_matches('数');
            if piece.chars().count() >= 2 {
                return piece.to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Rule-based question → QuerySpec analysis against a schema catalog
pub struct QueryAnalyzer {
    catalog: Arc<SchemaCatalog>,
}

impl QueryAnalyzer {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Table whose name or alias is mentioned. More column mentions win,
    /// then the earlier mention, then the longer alias.
    fn resolve_table(&self, lower: &str) -> Option<&Table> {
        let mut best: Option<(&Table, usize, usize, usize)> = None;
        for table in &self.catalog.tables {
            let first = table
                .terms()
                .iter()
                .filter_map(|t| first_term(lower, t).map(|p| (p, t.len())))
                .min_by_key(|(p, len)| (*p, std::cmp::Reverse(*len)));
            let Some((pos, len)) = first else {
                continue;
            };
            let hits = mentions(lower, &column_terms(table)).len();
            let better = match best {
                None => true,
                Some((_, best_hits, best_pos, best_len)) => {
                    (hits, std::cmp::Reverse(pos), len)
                        > (best_hits, std::cmp::Reverse(best_pos), best_len)
                }
            };
            if better {
                best = Some((table, hits, pos, len));
            }
        }
        best.map(|(table, _, _, _)| table)
    }

    fn lookup_table(&self, name: &str) -> Option<&Table> {
        let name = name.trim().to_lowercase();
        self.catalog
            .tables
            .iter()
            .find(|t| t.terms().iter().any(|term| *term == name))
    }

    pub fn analyze(
        &self,
        text: &str,
        intent: &Intent,
        ctx: &AnalysisContext,
    ) -> Result<QuerySpec, PipelineError> {
        let scan = TextScan::new(text);
        let lower = scan.lower();
        let resolved_time = time_range::resolve(lower, ctx.now)?;
        let table = self.resolve_table(lower);
        let terms = table.map(column_terms).unwrap_or_default();
        let all_mentions = mentions(lower, &terms);

        let mut unresolved = Vec::new();
        if table.is_none() {
            let name = residual_entity(lower, resolved_time.as_ref().map(|t| t.span));
            unresolved.push(UnresolvedEntity::table(name));
        }

        let mut consumed: Vec<(usize, usize)> = resolved_time.iter().map(|t| t.span).collect();

        // Time buckets: 按天, 每月, daily
        let mut buckets: Vec<(usize, TimeGranularity)> = Vec::new();
        for (granularity, markers) in TIME_BUCKET_MARKERS {
            for marker in *markers {
                for pos in find_term(lower, marker) {
                    let end = pos + marker.len();
                    if overlaps(&consumed, pos, end) {
                        continue;
                    }
                    consumed.push((pos, end));
                    if !buckets.iter().any(|(_, g)| g == granularity) {
                        buckets.push((pos, *granularity));
                    }
                }
            }
        }

        // Grouping and explicit ordering: 按省份, 各城市, by city, 按金额排序
        let mut dimensions: Vec<(usize, Dimension)> = Vec::new();
        let mut sort_column: Option<&Column> = None;
        let mut markers: Vec<(usize, &str)> = DIMENSION_MARKERS
            .iter()
            .flat_map(|m| find_term(lower, m).into_iter().map(move |p| (p, *m)))
            .collect();
        markers.sort_by_key(|(p, m)| (*p, std::cmp::Reverse(m.len())));

        for (pos, marker) in markers {
            let end = pos + marker.len();
            if overlaps(&consumed, pos, end) {
                continue;
            }
            consumed.push((pos, end));
            let rest = skip_filler(&lower[end..]);
            let rest_offset = lower.len() - rest.len();

            if let Some((column, len)) = leading_column(rest, &terms) {
                consumed.push((rest_offset, rest_offset + len));
                let after = skip_filler(&rest[len..]);
                let before = lower[..pos].trim_end();
                let sort_by = marker == "by" && (before.ends_with("order") || before.ends_with("sort"));
                if sort_by || SORT_WORDS.iter().any(|w| after.starts_with(w)) {
                    sort_column = Some(column);
                } else if column.data_type.is_temporal() {
                    dimensions.push((pos, Dimension::time_bucket(&column.name, TimeGranularity::Day)));
                } else {
                    dimensions.push((pos, Dimension::column(&column.name)));
                }
                continue;
            }

            let names_table = self
                .catalog
                .tables
                .iter()
                .flat_map(|t| t.terms())
                .any(|term| starts_with_term(rest, &term));
            if names_table {
                continue;
            }

            let word = leading_word(rest, WORD_STOPS);
            let meaningful = word.chars().count() >= 2
                && !TIME_UNIT_WORDS.contains(&word)
                && !word.chars().all(|c| c.is_ascii_digit());
            if meaningful {
                unresolved.push(UnresolvedEntity::column(word, "dimension"));
            }
        }

        // Filters: <column><operator><value>
        let mut filters: Vec<(usize, Filter)> = Vec::new();
        for (pos, end, column) in &all_mentions {
            if overlaps(&consumed, *pos, *end) {
                continue;
            }
            let rest = skip_filler(&lower[*end..]);
            let Some((op_len, operator)) = leading_operator(rest) else {
                continue;
            };
            let value_text = rest[op_len..].trim_start().trim_start_matches(QUOTES);
            let value_offset = lower.len() - value_text.len();
            if let Some(value) = filter_value(value_text, value_offset, column, operator, &scan) {
                filters.push((
                    *pos,
                    Filter {
                        column: column.name.clone(),
                        operator,
                        value,
                    },
                ));
            }
        }

        // Measures
        let ranking = intent.category == IntentCategory::Ranking;
        let numeric_mentions: Vec<(usize, &Column)> = all_mentions
            .iter()
            .filter(|(_, _, c)| c.data_type.is_numeric())
            .map(|(p, _, c)| (*p, *c))
            .collect();
        let sole_decimal = table.and_then(|t| {
            let mut decimals = t.columns.iter().filter(|c| c.data_type == ColumnType::Decimal);
            match (decimals.next(), decimals.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        });

        let mut measures: Vec<(usize, Measure)> = Vec::new();
        let mut first_count: Option<usize> = None;
        for hit in measure_hits(lower) {
            if hit.function == AggregateFunction::Count {
                first_count.get_or_insert(hit.pos);
                continue;
            }
            if ranking && RANKING_ORDER_WORDS.contains(&hit.word) {
                continue;
            }
            let rest = skip_filler(&lower[hit.end..]);
            let column = leading_column(rest, &terms)
                .map(|(c, _)| c)
                .filter(|c| c.data_type.is_numeric())
                .or_else(|| {
                    numeric_mentions
                        .iter()
                        .min_by_key(|(p, _)| p.abs_diff(hit.pos))
                        .map(|(_, c)| *c)
                });
            let weak = WEAK_MEASURE_WORDS.contains(&hit.word);
            match column.or(if weak { None } else { sole_decimal }) {
                Some(c) => push_measure(&mut measures, hit.pos, Measure::new(hit.function, Some(c.name.clone()))),
                None if weak => {}
                None => {
                    let word = leading_word(rest, WORD_STOPS);
                    let name = if word.is_empty() { hit.word } else { word };
                    unresolved.push(UnresolvedEntity::column(name, "measure"));
                }
            }
        }
        if let Some(pos) = first_count {
            let target = table.and_then(|t| counted_key(lower, t));
            push_measure(&mut measures, pos, Measure::new(AggregateFunction::Count, target));
        }

        // Columns named only as filter or grouping targets are not aggregated
        let free_mention = |wanted: fn(&ColumnType) -> bool| {
            all_mentions
                .iter()
                .filter(|(p, e, c)| wanted(&c.data_type) && !overlaps(&consumed, *p, *e))
                .find(|(p, _, _)| !filters.iter().any(|(fp, _)| fp == p))
                .map(|(p, _, c)| (*p, *c))
        };

        if measures.is_empty() && table.is_some() {
            let is_key = |c: &Column| table.and_then(|t| t.key_column.as_deref()) == Some(c.name.as_str());
            if let Some((pos, column)) =
                free_mention(ColumnType::is_numeric).filter(|(_, c)| !is_key(*c))
            {
                measures.push((pos, Measure::new(AggregateFunction::Sum, Some(column.name.clone()))));
            } else if intent.category != IntentCategory::Exploratory || !dimensions.is_empty() {
                measures.push((usize::MAX, Measure::new(AggregateFunction::Count, None)));
            }
        }
        measures.sort_by_key(|(p, _)| *p);

        // 销售额前10的城市: the ranked entity is the grouping key
        if ranking && dimensions.is_empty() {
            if let Some((pos, column)) = free_mention(|t| *t == ColumnType::Text) {
                dimensions.push((pos, Dimension::column(&column.name)));
            }
        }

        // Time column
        let needs_time = resolved_time.is_some()
            || !buckets.is_empty()
            || intent.category == IntentCategory::Trend;
        let time_column = match table {
            Some(t) if needs_time => {
                let mentioned = all_mentions
                    .iter()
                    .find(|(_, _, c)| c.data_type.is_temporal())
                    .map(|(_, _, c)| c.name.clone());
                let column = mentioned.or_else(|| t.time_column.clone());
                if column.is_none() {
                    unresolved.push(UnresolvedEntity::column("time", "time range"));
                }
                column
            }
            _ => None,
        };

        if let Some(column) = &time_column {
            for (pos, granularity) in &buckets {
                dimensions.push((*pos, Dimension::time_bucket(column, *granularity)));
            }
        }
        dimensions.sort_by_key(|(p, _)| *p);
        let mut dimensions: Vec<Dimension> = dimensions.into_iter().map(|(_, d)| d).collect();
        dedup_dimensions(&mut dimensions);
        let time_range = resolved_time.map(|t| t.range);
        ensure_trend_bucket(intent.category, &mut dimensions, time_column.as_deref(), time_range.as_ref());

        let measures: Vec<Measure> = measures.into_iter().map(|(_, m)| m).collect();
        let limit = extract_limit(lower);
        let ascending = ASCENDING_WORDS.iter().any(|w| contains_term(lower, w));

        let mut order_by = Vec::new();
        if let Some(column) = sort_column {
            let key = measures
                .iter()
                .find(|m| m.column.as_deref() == Some(column.name.as_str()))
                .map(|m| m.alias.clone())
                .or_else(|| {
                    dimensions
                        .iter()
                        .find(|d| d.column == column.name)
                        .map(Dimension::output_name)
                })
                .unwrap_or_else(|| {
                    dimensions.push(Dimension::column(&column.name));
                    column.name.clone()
                });
            order_by.push(OrderBy {
                key,
                descending: !ascending,
            });
        } else if (ranking || limit.is_some()) && !dimensions.is_empty() {
            if let Some(first) = measures.first() {
                order_by.push(OrderBy {
                    key: first.alias.clone(),
                    descending: !ascending,
                });
            }
        }
        if order_by.is_empty() {
            if let Some(bucket) = dimensions.iter().find(|d| d.granularity.is_some()) {
                order_by.push(OrderBy {
                    key: bucket.output_name(),
                    descending: false,
                });
            }
        }

        let spec = QuerySpec {
            intent: intent.category,
            table: table.map(|t| TableRef {
                name: t.name.clone(),
                database: t.database.clone(),
            }),
            measures,
            dimensions,
            filters: {
                filters.sort_by_key(|(p, _)| *p);
                filters.into_iter().map(|(_, f)| f).collect()
            },
            time_column,
            time_range,
            order_by,
            limit,
            unresolved_entities: unresolved,
        };
        finish(spec, text)
    }

    /// Validate an LLM-proposed draft against the catalog
    pub fn analyze_draft(
        &self,
        draft: &QueryDraft,
        intent: &Intent,
        ctx: &AnalysisContext,
    ) -> Result<QuerySpec, PipelineError> {
        let mut unresolved = Vec::new();
        let table = match draft.table.as_deref() {
            Some(name) => {
                let table = self.lookup_table(name);
                if table.is_none() {
                    unresolved.push(UnresolvedEntity::table(name));
                }
                table
            }
            None => {
                unresolved.push(UnresolvedEntity::table("unspecified"));
                None
            }
        };

        let mut measures = Vec::new();
        for m in &draft.measures {
            let column = match m.column.as_deref().map(str::trim) {
                None | Some("*") | Some("") if m.function == AggregateFunction::Count => None,
                None | Some("*") | Some("") => {
                    return Err(PipelineError::PromptResponseMalformed(format!(
                        "{} measure has no column",
                        m.function.sql_name()
                    )))
                }
                Some(name) => Some(resolve_column(table, name, "measure", &mut unresolved)),
            };
            let measure = Measure::new(m.function, column);
            if !measures.contains(&measure) {
                measures.push(measure);
            }
        }

        let mut dimensions: Vec<Dimension> = draft
            .dimensions
            .iter()
            .map(|d| Dimension {
                column: resolve_column(table, &d.column, "dimension", &mut unresolved),
                granularity: d.granularity,
            })
            .collect();
        dedup_dimensions(&mut dimensions);

        let mut filters = Vec::new();
        for f in &draft.filters {
            let operator = FilterOperator::parse(&f.operator).ok_or_else(|| {
                PipelineError::PromptResponseMalformed(format!("Unknown operator '{}'", f.operator))
            })?;
            let column = resolve_column(table, &f.column, "filter", &mut unresolved);
            let column_type = table.and_then(|t| t.column(&column)).map(|c| &c.data_type);
            filters.push(Filter {
                column,
                operator,
                value: json_value(&f.value, column_type)?,
            });
        }

        let time_range = match &draft.time_range {
            None => None,
            Some(tr) => Some(draft_time_range(tr, ctx)?),
        };
        let needs_time = time_range.is_some()
            || dimensions.iter().any(|d| d.granularity.is_some())
            || intent.category == IntentCategory::Trend;
        let time_column = match table {
            Some(t) if needs_time => {
                let named = draft
                    .time_range
                    .as_ref()
                    .and_then(|tr| tr.column.as_deref())
                    .map(|c| resolve_column(table, c, "time range", &mut unresolved));
                let column = named.or_else(|| t.time_column.clone());
                if column.is_none() {
                    unresolved.push(UnresolvedEntity::column("time", "time range"));
                }
                column
            }
            _ => None,
        };
        ensure_trend_bucket(intent.category, &mut dimensions, time_column.as_deref(), time_range.as_ref());

        let mut order_by = Vec::new();
        for order in &draft.order_by {
            let known = measures.iter().any(|m| m.alias == order.key)
                || dimensions.iter().any(|d| d.output_name() == order.key);
            if known {
                order_by.push(OrderBy {
                    key: order.key.clone(),
                    descending: order.descending,
                });
            } else {
                warn!("Dropping ordering on unknown output '{}'", order.key);
            }
        }

        let spec = QuerySpec {
            intent: intent.category,
            table: table.map(|t| TableRef {
                name: t.name.clone(),
                database: t.database.clone(),
            }),
            measures,
            dimensions,
            filters,
            time_column,
            time_range,
            order_by,
            limit: draft.limit.filter(|n| *n > 0),
            unresolved_entities: unresolved,
        };
        finish(spec, &intent.raw_text)
    }
}

struct MeasureHit {
    pos: usize,
    end: usize,
    function: AggregateFunction,
    word: &'static str,
}

fn measure_hits(lower: &str) -> Vec<MeasureHit> {
    let mut hits = Vec::new();
    for (function, words) in MEASURE_WORDS {
        for word in *words {
            for pos in find_term(lower, word) {
                hits.push(MeasureHit {
                    pos,
                    end: pos + word.len(),
                    function: *function,
                    word: *word,
                });
            }
        }
    }
    hits.sort_by_key(|h| (h.pos, std::cmp::Reverse(h.end - h.pos)));

    let mut kept: Vec<MeasureHit> = Vec::new();
    for hit in hits {
        if kept.iter().any(|k| hit.pos < k.end && k.pos < hit.end) {
            continue;
        }
        kept.push(hit);
    }

    // <noun>数 counts: 订单数, 注册数
    let mut prev: Option<char> = None;
    let mut chars = lower.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let next = chars.peek().map(|(_, n)| *n);
        if c == '数'
            && prev.is_some_and(is_cjk)
            && !next.is_some_and(|n| matches!(n, '据' | '字' | '值' | '学' | '组'))
            && !kept.iter().any(|k| i < k.end && k.pos < i + c.len_utf8())
        {
            kept.push(MeasureHit {
                pos: i,
                end: i + c.len_utf8(),
                function: AggregateFunction::Count,
                word: "数",
            });
        }
        prev = Some(c);
    }
    kept.sort_by_key(|h| h.pos);
    kept
}

fn push_measure(measures: &mut Vec<(usize, Measure)>, pos: usize, measure: Measure) {
    if !measures.iter().any(|(_, m)| *m == measure) {
        measures.push((pos, measure));
    }
}

/// Key column when the question counts the entity itself, e.g. 订单数
fn counted_key(lower: &str, table: &Table) -> Option<String> {
    let counted = table.terms().iter().any(|term| {
        ["数", "数量", "个数", "总数"]
            .iter()
            .any(|suffix| lower.contains(&format!("{}{}", term, suffix)))
            || contains_term(lower, &format!("number of {}", term))
            || contains_term(lower, &format!("count of {}", term))
            || contains_term(lower, &format!("{} count", term))
    });
    if counted {
        table.key_column.clone()
    } else {
        None
    }
}

fn filter_value(
    text: &str,
    offset: usize,
    column: &Column,
    operator: FilterOperator,
    scan: &TextScan<'_>,
) -> Option<SqlValue> {
    if column.data_type.is_temporal() {
        let date = DATE_PREFIX.find(text)?;
        let date = NaiveDate::parse_from_str(date.as_str(), "%Y-%m-%d").ok()?;
        return Some(SqlValue::Timestamp(midnight(date)));
    }

    if let Some(number) = NUMBER_PREFIX.find(text) {
        let raw = number.as_str();
        let value = match (&column.data_type, operator) {
            (_, FilterOperator::Like) => SqlValue::Text(format!("%{}%", raw)),
            (ColumnType::Integer, _) if !raw.contains('.') => SqlValue::Integer(raw.parse().ok()?),
            (t, _) if t.is_numeric() => SqlValue::Float(raw.parse().ok()?),
            _ => SqlValue::Text(raw.to_string()),
        };
        return Some(value);
    }

    let word = leading_word(text, WORD_STOPS);
    if word.is_empty() {
        return None;
    }
    let original = scan.original_slice(offset, offset + word.len()).to_string();
    let value = match (&column.data_type, operator) {
        (_, FilterOperator::Like) => SqlValue::Text(format!("%{}%", original)),
        (ColumnType::Boolean, _) => match word {
            "true" | "是" | "yes" => SqlValue::Boolean(true),
            "false" | "否" | "no" => SqlValue::Boolean(false),
            _ => return None,
        },
        (t, _) if t.is_numeric() => return None,
        _ => SqlValue::Text(original),
    };
    Some(value)
}

fn resolve_column(
    table: Option<&Table>,
    name: &str,
    role: &str,
    unresolved: &mut Vec<UnresolvedEntity>,
) -> String {
    let lowered = name.trim().to_lowercase();
    let found = table.and_then(|t| {
        t.columns
            .iter()
            .find(|c| c.terms().iter().any(|term| *term == lowered))
    });
    match found {
        Some(column) => column.name.clone(),
        None => {
            if table.is_some() {
                unresolved.push(UnresolvedEntity::column(name, role));
            }
            name.to_string()
        }
    }
}

fn json_value(value: &Value, column_type: Option<&ColumnType>) -> Result<SqlValue, PipelineError> {
    let temporal = column_type.is_some_and(ColumnType::is_temporal);
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Float))
            .ok_or_else(|| PipelineError::PromptResponseMalformed(format!("Bad number {}", n))),
        Value::String(s) if temporal => parse_timestamp(s).map(SqlValue::Timestamp).ok_or_else(|| {
            PipelineError::PromptResponseMalformed(format!("Bad timestamp '{}'", s))
        }),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Bool(b) => Ok(SqlValue::Boolean(*b)),
        other => Err(PipelineError::PromptResponseMalformed(format!(
            "Unsupported filter value {}",
            other
        ))),
    }
}

fn draft_time_range(
    draft: &DraftTimeRange,
    ctx: &AnalysisContext,
) -> Result<TimeRange, PipelineError> {
    if let Some(expr) = draft.relative.as_deref().filter(|e| !e.trim().is_empty()) {
        return time_range::resolve_expression(expr, ctx.now);
    }
    let (Some(start), Some(end)) = (draft.start.as_deref(), draft.end.as_deref()) else {
        return Err(PipelineError::PromptResponseMalformed(
            "time_range needs either relative or start and end".to_string(),
        ));
    };
    let parse = |s: &str| {
        parse_timestamp(s).ok_or_else(|| {
            PipelineError::PromptResponseMalformed(format!("Bad timestamp '{}'", s))
        })
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if start > end {
        return Err(PipelineError::Analysis(format!(
            "Time range ends ({}) before it starts ({})",
            end, start
        )));
    }
    let granularity = if (end - start).num_days() > 31 {
        TimeGranularity::Month
    } else {
        TimeGranularity::Day
    };
    Ok(TimeRange {
        start,
        end,
        granularity,
        relative: None,
    })
}

fn dedup_dimensions(dimensions: &mut Vec<Dimension>) {
    let mut seen = std::collections::HashSet::new();
    dimensions.retain(|d| seen.insert(d.output_name()));
}

/// Trend questions always group by a time bucket
fn ensure_trend_bucket(
    intent: IntentCategory,
    dimensions: &mut Vec<Dimension>,
    time_column: Option<&str>,
    time_range: Option<&TimeRange>,
) {
    if intent != IntentCategory::Trend || dimensions.iter().any(|d| d.granularity.is_some()) {
        return;
    }
    let Some(column) = time_column else {
        return;
    };
    let granularity = match time_range {
        Some(range) if range.days() > 31 => TimeGranularity::Month,
        _ => TimeGranularity::Day,
    };
    dimensions.insert(0, Dimension::time_bucket(column, granularity));
}

fn finish(spec: QuerySpec, text: &str) -> Result<QuerySpec, PipelineError> {
    if spec.measures.is_empty() && spec.dimensions.is_empty() {
        return Err(PipelineError::Analysis(format!(
            "No measure or dimension could be derived from '{}'",
            text
        )));
    }
    debug!(
        "Analysed '{}': table={:?} measures={} dimensions={} filters={} unresolved={}",
        text,
        spec.table.as_ref().map(|t| t.name.as_str()),
        spec.measures.len(),
        spec.dimensions.len(),
        spec.filters.len(),
        spec.unresolved_entities.len()
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::intent_recognizer::IntentRecognizer;

    fn ctx() -> AnalysisContext {
        AnalysisContext::new(
            NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        )
    }

    fn analyzer() -> QueryAnalyzer {
        QueryAnalyzer::new(Arc::new(SchemaCatalog::builtin()))
    }

    fn analyze(text: &str) -> Result<QuerySpec, PipelineError> {
        let intent = IntentRecognizer::default().recognize(text);
        analyzer().analyze(text, &intent, &ctx())
    }

    fn at(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_yesterday_user_registrations() {
        let spec = analyze("统计昨天用户注册数").unwrap();
        assert_eq!(spec.intent, IntentCategory::Statistic);
        assert_eq!(spec.table.as_ref().unwrap().name, "users");
        assert_eq!(spec.measures, vec![Measure::new(AggregateFunction::Count, None)]);
        assert!(spec.dimensions.is_empty());
        assert_eq!(spec.time_column.as_deref(), Some("registered_at"));
        let range = spec.time_range.unwrap();
        assert_eq!((range.start, range.end), (at(14), at(15)));
        assert!(spec.unresolved_entities.is_empty());
    }

    #[test]
    fn test_group_orders_by_province() {
        let spec = analyze("按省份分组统计订单数").unwrap();
        assert_eq!(spec.table.as_ref().unwrap().name, "orders");
        assert_eq!(spec.dimensions, vec![Dimension::column("province")]);
        assert_eq!(
            spec.measures,
            vec![Measure::new(AggregateFunction::Count, Some("order_id".into()))]
        );
        assert!(spec.time_range.is_none());
    }

    #[test]
    fn test_trend_gets_time_bucket() {
        let spec = analyze("最近30天订单金额的趋势").unwrap();
        assert_eq!(spec.intent, IntentCategory::Trend);
        assert_eq!(
            spec.measures,
            vec![Measure::new(AggregateFunction::Sum, Some("amount".into()))]
        );
        assert_eq!(
            spec.dimensions,
            vec![Dimension::time_bucket("created_at", TimeGranularity::Day)]
        );
        assert_eq!(spec.order_by[0].key, "created_at_day");
        assert!(!spec.order_by[0].descending);
    }

    #[test]
    fn test_explicit_time_bucket() {
        let spec = analyze("按月统计今年的订单总额").unwrap();
        assert_eq!(
            spec.dimensions,
            vec![Dimension::time_bucket("created_at", TimeGranularity::Month)]
        );
        assert_eq!(
            spec.measures,
            vec![Measure::new(AggregateFunction::Sum, Some("amount".into()))]
        );
    }

    #[test]
    fn test_ranking_with_limit() {
        let spec = analyze("销售额排名前10的城市").unwrap();
        assert_eq!(spec.intent, IntentCategory::Ranking);
        assert_eq!(spec.limit, Some(10));
        assert_eq!(spec.dimensions, vec![Dimension::column("city")]);
        assert_eq!(spec.order_by[0].key, "sum_amount");

        let spec = analyze("各城市销售额排名前5").unwrap();
        assert_eq!(spec.dimensions, vec![Dimension::column("city")]);
        assert_eq!(
            spec.measures,
            vec![Measure::new(AggregateFunction::Sum, Some("amount".into()))]
        );
        assert_eq!(
            spec.order_by,
            vec![OrderBy {
                key: "sum_amount".into(),
                descending: true
            }]
        );
        assert_eq!(spec.limit, Some(5));
    }

    #[test]
    fn test_filters_keep_text_order() {
        let spec = analyze("统计年龄大于30且省份为浙江的用户数").unwrap();
        assert_eq!(spec.filters.len(), 2);
        assert_eq!(spec.filters[0].column, "age");
        assert_eq!(spec.filters[0].operator, FilterOperator::Gt);
        assert_eq!(spec.filters[0].value, SqlValue::Integer(30));
        assert_eq!(spec.filters[1].column, "province");
        assert_eq!(spec.filters[1].value, SqlValue::Text("浙江".into()));
        assert_eq!(
            spec.measures,
            vec![Measure::new(AggregateFunction::Count, Some("user_id".into()))]
        );
    }

    #[test]
    fn test_english_question() {
        let spec = analyze("count orders by city where amount greater than 100").unwrap();
        assert_eq!(spec.table.as_ref().unwrap().name, "orders");
        assert_eq!(spec.dimensions, vec![Dimension::column("city")]);
        assert_eq!(spec.filters[0].column, "amount");
        assert_eq!(spec.filters[0].value, SqlValue::Float(100.0));
    }

    #[test]
    fn test_unknown_table_is_reported() {
        let spec = analyze("统计昨天货运单数").unwrap();
        assert!(spec.table.is_none());
        assert_eq!(spec.unresolved_entities, vec![UnresolvedEntity::table("货运单")]);
    }

    #[test]
    fn test_unknown_dimension_is_reported() {
        let spec = analyze("按职业统计用户数").unwrap();
        assert_eq!(
            spec.unresolved_entities,
            vec![UnresolvedEntity::column("职业", "dimension")]
        );
    }

    #[test]
    fn test_reversed_range_fails() {
        let err = analyze("统计2024-03-10到2024-03-01的订单数").unwrap_err();
        assert_eq!(err.code(), "ANALYSIS_ERROR");
    }

    #[test]
    fn test_nothing_derivable_fails() {
        let err = analyze("帮我看看情况").unwrap_err();
        assert_eq!(err.code(), "ANALYSIS_ERROR");
    }

    #[test]
    fn test_draft_is_validated_against_catalog() {
        let draft: QueryDraft = serde_json::from_str(
            r#"{"table":"orders","measures":[{"function":"sum","column":"amount"}],
                "dimensions":[{"column":"省份"}],
                "filters":[{"column":"status","operator":"=","value":"paid"}],
                "time_range":{"relative":"上个月"},
                "order_by":[{"key":"sum_amount","descending":true},{"key":"nope"}],
                "limit":3}"#,
        )
        .unwrap();
        let intent = Intent::new(IntentCategory::Ranking, 0.9, "上个月各省销售额前三");
        let spec = analyzer().analyze_draft(&draft, &intent, &ctx()).unwrap();
        assert_eq!(spec.dimensions, vec![Dimension::column("province")]);
        assert_eq!(spec.filters[0].value, SqlValue::Text("paid".into()));
        assert_eq!(spec.time_column.as_deref(), Some("created_at"));
        assert_eq!(spec.order_by.len(), 1);
        assert_eq!(spec.limit, Some(3));
        assert!(spec.is_resolved());
    }

    #[test]
    fn test_draft_with_unknown_column() {
        let draft = QueryDraft {
            table: Some("users".into()),
            dimensions: vec![DraftDimension {
                column: "vip_level".into(),
                granularity: None,
            }],
            ..Default::default()
        };
        let intent = Intent::new(IntentCategory::Aggregation, 0.8, "q");
        let spec = analyzer().analyze_draft(&draft, &intent, &ctx()).unwrap();
        assert_eq!(
            spec.unresolved_entities,
            vec![UnresolvedEntity::column("vip_level", "dimension")]
        );
    }

    #[test]
    fn test_draft_sum_without_column_is_malformed() {
        let draft: QueryDraft =
            serde_json::from_str(r#"{"table":"orders","measures":[{"function":"sum"}]}"#).unwrap();
        let intent = Intent::new(IntentCategory::Statistic, 0.8, "q");
        let err = analyzer().analyze_draft(&draft, &intent, &ctx()).unwrap_err();
        assert_eq!(err.code(), "PROMPT_RESPONSE_MALFORMED");
    }
}
