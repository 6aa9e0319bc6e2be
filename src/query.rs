use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::LoadError;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Value bound to a `?` placeholder.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SqlParam {
    Int(i64),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlQuery {
    sql: String,
    params: Vec<SqlParam>,
}

impl SqlQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, param: SqlParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    /// Stable key identifying both the statement and its bound values.
    pub fn cache_key(&self) -> String {
        let mut key = self.sql.clone();
        for param in &self.params {
            match param {
                SqlParam::Int(v) => write!(key, "|i:{v}"),
                SqlParam::Text(v) => write!(key, "|s:{}:{v}", v.len()),
            }
            .ok();
        }
        key
    }
}

/// Rejects anything that is not a bare table or column name.
pub fn check_identifier(name: &str) -> Result<&str, LoadError> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(LoadError::InvalidIdentifier(name.to_string()))
    }
}

/// Builds `SELECT ... WHERE ...` statements whose filter values are always bound.
///
/// An absent filter puts no restriction on the result; a present one becomes an
/// inclusive range or an `IN` membership test.
#[derive(Debug)]
pub struct QueryBuilder {
    table: String,
    columns: Vec<String>,
    conditions: Vec<String>,
    params: Vec<SqlParam>,
    order: Vec<(String, bool)>,
    limit: Option<usize>,
    error: Option<LoadError>,
}

impl QueryBuilder {
    pub fn from_table(table: &str) -> Self {
        let mut builder = Self {
            table: table.to_string(),
            columns: Vec::new(),
            conditions: Vec::new(),
            params: Vec::new(),
            order: Vec::new(),
            limit: None,
            error: None,
        };
        builder.check(table);
        builder
    }

    fn check(&mut self, name: &str) {
        if self.error.is_none() {
            if let Err(err) = check_identifier(name) {
                self.error = Some(err);
            }
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        for column in columns {
            self.check(column);
            self.columns.push(column.to_string());
        }
        self
    }

    pub fn year_range(mut self, column: &str, start: Option<i32>, end: Option<i32>) -> Self {
        self.check(column);
        if let (Some(s), Some(e)) = (start, end) {
            if s > e && self.error.is_none() {
                self.error = Some(LoadError::InvalidFilter(format!(
                    "start year {s} is after end year {e}"
                )));
            }
        }
        if let Some(s) = start {
            self.conditions.push(format!("{column} >= ?"));
            self.params.push(SqlParam::Int(i64::from(s)));
        }
        if let Some(e) = end {
            self.conditions.push(format!("{column} <= ?"));
            self.params.push(SqlParam::Int(i64::from(e)));
        }
        self
    }

    pub fn any_of<S: AsRef<str>>(mut self, column: &str, values: &[S]) -> Self {
        self.check(column);
        if values.is_empty() {
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.conditions.push(format!("{column} IN ({placeholders})"));
        self.params.extend(
            values
                .iter()
                .map(|v| SqlParam::Text(v.as_ref().to_string())),
        );
        self
    }

    pub fn any_of_subquery(mut self, column: &str, subquery: SqlQuery) -> Self {
        self.check(column);
        self.conditions.push(format!("{column} IN ({})", subquery.sql));
        self.params.extend(subquery.params);
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.check(column);
        self.order.push((column.to_string(), descending));
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn build(self) -> Result<SqlQuery, LoadError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let where_clause = if self.conditions.is_empty() {
            "1=1".to_string()
        } else {
            self.conditions.join(" AND ")
        };
        let mut sql = format!("SELECT {columns} FROM {} WHERE {where_clause}", self.table);
        if !self.order.is_empty() {
            let keys: Vec<String> = self
                .order
                .iter()
                .map(|(c, desc)| if *desc { format!("{c} DESC") } else { c.clone() })
                .collect();
            write!(sql, " ORDER BY {}", keys.join(", ")).ok();
        }
        if let Some(limit) = self.limit {
            write!(sql, " LIMIT {limit}").ok();
        }
        Ok(SqlQuery {
            sql,
            params: self.params,
        })
    }
}
