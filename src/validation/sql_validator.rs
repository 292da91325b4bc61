use sqlparser::ast::Statement;
use sqlparser::dialect::{AnsiDialect, Dialect, GenericDialect};
use sqlparser::parser::Parser;

use crate::error::PipelineError;
use crate::models::{SqlDialect, SqlStatement};
use crate::services::dialect::rules_for;
use crate::services::engine::bind;

/// SQL validation for generated statements
pub struct SqlValidator;

impl SqlValidator {
    /// Parser dialect for a target dialect. Hive and Spark take backticks and
    /// backslash escapes, which the generic dialect accepts.
    fn parser_dialect(dialect: SqlDialect) -> Box<dyn Dialect> {
        match dialect {
            SqlDialect::Hive | SqlDialect::SparkSql => Box::new(GenericDialect {}),
            SqlDialect::Presto => Box::new(AnsiDialect {}),
        }
    }

    /// Parse with parameters bound, so placeholders never reach the tokenizer
    fn parse(stmt: &SqlStatement) -> Result<Vec<Statement>, PipelineError> {
        let rendered = bind::render(&stmt.text, &stmt.params, stmt.dialect)
            .map_err(|e| PipelineError::InvalidSql(e.to_string()))?;

        let dialect = Self::parser_dialect(stmt.dialect);
        let mut parser = Parser::new(dialect.as_ref())
            .try_with_sql(&rendered)
            .map_err(|e| PipelineError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        let ast = parser
            .parse_statements()
            .map_err(|e| PipelineError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        if ast.is_empty() {
            return Err(PipelineError::InvalidSql("Empty SQL query".to_string()));
        }
        Ok(ast)
    }

    /// Ensure the statement is exactly one SELECT
    pub fn validate_select_only(stmt: &SqlStatement) -> Result<(), PipelineError> {
        let ast = Self::parse(stmt)?;

        if ast.len() > 1 {
            return Err(PipelineError::InvalidSql(format!(
                "Expected a single statement, found {}",
                ast.len()
            )));
        }

        match &ast[0] {
            Statement::Query(_) => Ok(()),
            other => Err(PipelineError::InvalidSql(format!(
                "Only SELECT queries are permitted. Found: {}",
                statement_keyword(other)
            ))),
        }
    }

    /// Check for a LIMIT or FETCH clause using the AST
    pub fn has_limit(stmt: &SqlStatement) -> Result<bool, PipelineError> {
        let ast = Self::parse(stmt)?;
        Ok(Self::check_limit_in_statement(&ast[0]))
    }

    fn check_limit_in_statement(stmt: &Statement) -> bool {
        match stmt {
            Statement::Query(query) => query.limit_clause.is_some() || query.fetch.is_some(),
            _ => false,
        }
    }

    /// Statement returning at most `max_rows` rows.
    /// An existing limit is kept inside a subquery so the bound always wins.
    pub fn bound_rows(stmt: &SqlStatement, max_rows: u64) -> Result<SqlStatement, PipelineError> {
        let rules = rules_for(stmt.dialect);
        let trimmed = stmt.text.trim().trim_end_matches(';').trim_end();

        let text = if Self::has_limit(stmt)? {
            format!(
                "SELECT * FROM ({}) preview_sample {}",
                trimmed,
                rules.limit_clause(max_rows)
            )
        } else {
            format!("{} {}", trimmed, rules.limit_clause(max_rows))
        };

        Ok(SqlStatement {
            dialect: stmt.dialect,
            text,
            params: stmt.params.clone(),
            complexity: stmt.complexity,
        })
    }
}

fn statement_keyword(stmt: &Statement) -> String {
    let rendered = stmt.to_string();
    rendered
        .split_whitespace()
        .next()
        .unwrap_or("unknown statement")
        .to_uppercase()
}
