// Client-side binding of `?` placeholders.
// The Livy and HiveServer2 REST gateways take plain statement text.

use crate::models::{SqlDialect, SqlValue};
use crate::services::dialect::{rules_for, SqlFeature};

use super::adapter::EngineError;

fn quote_text(value: &str, dialect: SqlDialect) -> String {
    let escaped = if rules_for(dialect).supports_feature(SqlFeature::BackslashEscapes) {
        value.replace('\\', "\\\\").replace('\'', "\\'")
    } else {
        value.replace('\'', "''")
    };
    format!("'{}'", escaped)
}

/// SQL literal for one bound value
pub fn literal(value: &SqlValue, dialect: SqlDialect) -> Result<String, EngineError> {
    let rendered = match value {
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Float(v) if v.is_finite() => v.to_string(),
        SqlValue::Float(v) => {
            return Err(EngineError::Protocol(format!("Cannot bind non-finite number {}", v)))
        }
        SqlValue::Boolean(true) => "TRUE".to_string(),
        SqlValue::Boolean(false) => "FALSE".to_string(),
        SqlValue::Text(v) => quote_text(v, dialect),
        SqlValue::Date(_) | SqlValue::Timestamp(_) => quote_text(&value.to_string(), dialect),
    };
    Ok(rendered)
}

/// Replace each `?` outside quotes with the next parameter
pub fn render(sql: &str, params: &[SqlValue], dialect: SqlDialect) -> Result<String, EngineError> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut params_iter = params.iter();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' && q == '\'' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == q {
                    // Doubled quote stays inside the literal
                    if chars.peek() == Some(&q) {
                        out.push(q);
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    let value = params_iter.next().ok_or_else(|| {
                        EngineError::Protocol("More placeholders than parameters".to_string())
                    })?;
                    out.push_str(&literal(value, dialect)?);
                }
                _ => out.push(c),
            },
        }
    }

    if params_iter.next().is_some() {
        return Err(EngineError::Protocol(
            "More parameters than placeholders".to_string(),
        ));
    }
    Ok(out)
}
