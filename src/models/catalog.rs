use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::PipelineError;

/// Column type as understood by the analyser and the result processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    Integer,
    Float,
    Decimal,
    Text,
    Boolean,
    Date,
    Timestamp,
    Other(String),
}

impl ColumnType {
    /// Map an engine or catalog type name onto a column type.
    /// Handles Spark (`long`, `decimal(10,2)`), Hive (`BIGINT_TYPE`) and plain SQL names.
    pub fn parse(type_name: &str) -> Self {
        let lowered = type_name.trim().to_lowercase();
        let base = lowered.trim_end_matches("_type");
        let base = base.split(['(', '<']).next().unwrap_or(base).trim();
        match base {
            "integer" | "int" | "bigint" | "smallint" | "tinyint" | "long" | "short" | "byte" => {
                ColumnType::Integer
            }
            "float" | "double" | "real" => ColumnType::Float,
            "decimal" | "numeric" => ColumnType::Decimal,
            "string" | "varchar" | "char" | "text" => ColumnType::Text,
            "boolean" | "bool" => ColumnType::Boolean,
            "date" => ColumnType::Date,
            "timestamp" | "timestamp_ntz" | "timestamp_ltz" | "datetime" => ColumnType::Timestamp,
            _ => ColumnType::Other(lowered),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float | ColumnType::Decimal)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Timestamp)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Decimal => "decimal",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Other(name) => name,
        }
    }
}

impl From<String> for ColumnType {
    fn from(value: String) -> Self {
        ColumnType::parse(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
    /// Words that refer to this column in a question
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Column counted by "<entity>数" style questions
    #[serde(default)]
    pub key_column: Option<String>,
    /// Column used for time ranges when the question names none
    #[serde(default)]
    pub time_column: Option<String>,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Table name plus aliases, lowercased
    pub fn terms(&self) -> Vec<String> {
        std::iter::once(self.name.to_lowercase())
            .chain(self.aliases.iter().map(|a| a.to_lowercase()))
            .collect()
    }
}

impl Column {
    /// Column name plus aliases, lowercased
    pub fn terms(&self) -> Vec<String> {
        std::iter::once(self.name.to_lowercase())
            .chain(self.aliases.iter().map(|a| a.to_lowercase()))
            .collect()
    }
}

/// Tables and columns the analyser may resolve against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub tables: Vec<Table>,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    /// Load a catalog from a JSON document
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        let catalog: SchemaCatalog = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("Invalid catalog {}: {}", path.display(), e))
        })?;
        if catalog.tables.is_empty() {
            return Err(PipelineError::Config(format!(
                "Catalog {} defines no tables",
                path.display()
            )));
        }
        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Built-in sample warehouse: users, orders, products and access logs
    pub fn builtin() -> Self {
        Self::new(vec![
            Table {
                name: "users".to_string(),
                database: None,
                aliases: strings(&["用户", "会员", "user", "users"]),
                key_column: Some("user_id".to_string()),
                time_column: Some("registered_at".to_string()),
                columns: vec![
                    column("user_id", ColumnType::Integer, &["用户id", "user id"]),
                    column("user_name", ColumnType::Text, &["用户名", "username"]),
                    column("gender", ColumnType::Text, &["性别", "gender"]),
                    column("age", ColumnType::Integer, &["年龄", "age"]),
                    column("province", ColumnType::Text, &["省份", "province"]),
                    column("city", ColumnType::Text, &["城市", "city"]),
                    column("channel", ColumnType::Text, &["渠道", "来源", "channel"]),
                    column(
                        "registered_at",
                        ColumnType::Timestamp,
                        &["注册时间", "注册", "registered", "registration"],
                    ),
                ],
                description: Some("Registered users".to_string()),
            },
            Table {
                name: "orders".to_string(),
                database: None,
                aliases: strings(&["订单", "销售", "order", "orders"]),
                key_column: Some("order_id".to_string()),
                time_column: Some("created_at".to_string()),
                columns: vec![
                    column("order_id", ColumnType::Integer, &["订单号", "订单id", "order id"]),
                    column("user_id", ColumnType::Integer, &["用户id", "user id"]),
                    column("product_id", ColumnType::Integer, &["商品id", "product id"]),
                    column("province", ColumnType::Text, &["省份", "province"]),
                    column("city", ColumnType::Text, &["城市", "city"]),
                    column(
                        "amount",
                        ColumnType::Decimal,
                        &["订单金额", "销售额", "交易额", "金额", "amount", "revenue", "sales"],
                    ),
                    column("quantity", ColumnType::Integer, &["件数", "quantity"]),
                    column("status", ColumnType::Text, &["状态", "status"]),
                    column(
                        "created_at",
                        ColumnType::Timestamp,
                        &["下单时间", "下单", "创建时间", "order date"],
                    ),
                ],
                description: Some("Orders placed by users".to_string()),
            },
            Table {
                name: "products".to_string(),
                database: None,
                aliases: strings(&["商品", "产品", "product", "products"]),
                key_column: Some("product_id".to_string()),
                time_column: Some("created_at".to_string()),
                columns: vec![
                    column("product_id", ColumnType::Integer, &["商品id", "product id"]),
                    column("product_name", ColumnType::Text, &["商品名", "名称", "product name"]),
                    column("category", ColumnType::Text, &["类别", "品类", "分类", "category"]),
                    column("price", ColumnType::Decimal, &["价格", "单价", "price"]),
                    column("stock", ColumnType::Integer, &["库存", "stock"]),
                    column("created_at", ColumnType::Timestamp, &["上架时间", "上架"]),
                ],
                description: Some("Product catalogue".to_string()),
            },
            Table {
                name: "user_logs".to_string(),
                database: None,
                aliases: strings(&["日志", "访问", "log", "logs"]),
                key_column: Some("log_id".to_string()),
                time_column: Some("event_time".to_string()),
                columns: vec![
                    column("log_id", ColumnType::Integer, &["日志id", "log id"]),
                    column("user_id", ColumnType::Integer, &["用户id", "user id"]),
                    column("event_type", ColumnType::Text, &["事件类型", "行为", "event type"]),
                    column("page", ColumnType::Text, &["页面", "page"]),
                    column("duration_ms", ColumnType::Integer, &["停留时长", "时长", "duration"]),
                    column("event_time", ColumnType::Timestamp, &["访问时间", "event time"]),
                ],
                description: Some("User behaviour logs".to_string()),
            },
        ])
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn column(name: &str, data_type: ColumnType, aliases: &[&str]) -> Column {
    Column {
        name: name.to_string(),
        data_type,
        aliases: strings(aliases),
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_column_type_parsing() {
        assert_eq!(ColumnType::parse("BIGINT_TYPE"), ColumnType::Integer);
        assert_eq!(ColumnType::parse("long"), ColumnType::Integer);
        assert_eq!(ColumnType::parse("decimal(10,2)"), ColumnType::Decimal);
        assert_eq!(ColumnType::parse("STRING_TYPE"), ColumnType::Text);
        assert_eq!(ColumnType::parse("timestamp"), ColumnType::Timestamp);
        assert_eq!(
            ColumnType::parse("array<int>"),
            ColumnType::Other("array<int>".to_string())
        );
    }

    #[test]
    fn test_builtin_catalog_lookup() {
        let catalog = SchemaCatalog::builtin();
        let users = catalog.table("USERS").unwrap();
        assert_eq!(users.time_column.as_deref(), Some("registered_at"));
        assert!(users.column("province").is_some());
        assert!(catalog.table("missing").is_none());
    }

    #[test]
    fn test_catalog_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tables":[{{"name":"events","database":"dw","aliases":["事件"],
                "columns":[{{"name":"ts","data_type":"timestamp"}},{{"name":"kind","data_type":"string"}}]}}]}}"#
        )
        .unwrap();

        let catalog = SchemaCatalog::from_json_file(file.path()).unwrap();
        let events = catalog.table("events").unwrap();
        assert_eq!(events.database.as_deref(), Some("dw"));
        assert_eq!(events.column("ts").unwrap().data_type, ColumnType::Timestamp);
        assert_eq!(events.column("kind").unwrap().data_type, ColumnType::Text);
    }

    #[test]
    fn test_empty_catalog_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tables":[]}}"#).unwrap();
        assert!(SchemaCatalog::from_json_file(file.path()).is_err());
    }
}
