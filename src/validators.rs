//! Data quality checks over loaded frames.
//!
//! A check that runs to completion always yields a [`ValidationResult`], pass or
//! fail; [`ValidationError`] is reserved for checks that cannot be evaluated.

use std::collections::{BTreeMap, HashSet};

use polars::prelude::*;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use ukgeo::{CensusYear, CodeKind};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("outlier detection method `{0}` is not implemented")]
    UnsupportedMethod(String),
    #[error("column `{column}` must be numeric, got {dtype}")]
    NonNumeric { column: String, dtype: String },
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub message: String,
    pub details: Map<String, Value>,
}

impl ValidationResult {
    fn pass(message: impl Into<String>, details: Value) -> Self {
        Self::new(true, message, details)
    }

    fn fail(message: impl Into<String>, details: Value) -> Self {
        Self::new(false, message, details)
    }

    fn new(passed: bool, message: impl Into<String>, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            passed,
            message: message.into(),
            details,
        }
    }

    fn column_not_found(column: &str) -> Self {
        Self::fail(format!("Column '{column}' not found in DataFrame"), Value::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Str,
    Bool,
}

impl ColumnKind {
    fn matches(self, dtype: &DataType) -> bool {
        match self {
            ColumnKind::Int => dtype.is_integer(),
            ColumnKind::Float => dtype.is_float(),
            ColumnKind::Str => matches!(dtype, DataType::String),
            ColumnKind::Bool => matches!(dtype, DataType::Boolean),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ColumnKind::Int => "int",
            ColumnKind::Float => "float",
            ColumnKind::Str => "str",
            ColumnKind::Bool => "bool",
        }
    }
}

fn has_column(df: &DataFrame, column: &str) -> bool {
    df.get_column_names().contains(&column)
}

/// Checks that every expected column exists with a compatible type, and with
/// `allow_extra == false` that nothing else does.
pub fn validate_schema(
    df: &DataFrame,
    expected: &[(&str, ColumnKind)],
    allow_extra: bool,
) -> ValidationResult {
    let mut issues = Vec::new();

    let mut missing: Vec<&str> = expected
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !has_column(df, name))
        .collect();
    missing.sort_unstable();
    if !missing.is_empty() {
        issues.push(format!("Missing columns: {}", missing.join(", ")));
    }

    if !allow_extra {
        let mut extra: Vec<&str> = df
            .get_column_names()
            .into_iter()
            .filter(|c| !expected.iter().any(|(name, _)| name == c))
            .collect();
        extra.sort_unstable();
        if !extra.is_empty() {
            issues.push(format!("Unexpected columns: {}", extra.join(", ")));
        }
    }

    let mut mismatches = Map::new();
    for (name, kind) in expected {
        if let Ok(series) = df.column(name) {
            if !kind.matches(series.dtype()) {
                mismatches.insert(
                    name.to_string(),
                    json!({ "expected": kind.name(), "actual": series.dtype().to_string() }),
                );
            }
        }
    }
    if !mismatches.is_empty() {
        let names: Vec<&str> = mismatches.keys().map(String::as_str).collect();
        issues.push(format!("Type mismatches: {}", names.join(", ")));
    }

    if issues.is_empty() {
        ValidationResult::pass(
            "Schema validation passed",
            json!({ "column_count": df.width() }),
        )
    } else {
        ValidationResult::fail(
            "Schema validation failed",
            json!({
                "issues": issues,
                "type_mismatches": mismatches,
                "column_count": df.width(),
            }),
        )
    }
}

/// Counts nulls in `columns` (all columns when `None`); nulls in
/// `allow_null_columns` are tolerated.
pub fn check_nulls(
    df: &DataFrame,
    columns: Option<&[&str]>,
    allow_null_columns: &[&str],
) -> ValidationResult {
    let all = df.get_column_names();
    let columns = columns.unwrap_or(&all);

    let mut null_counts = Map::new();
    let mut null_columns = Vec::new();
    let mut total = 0;
    for column in columns {
        if allow_null_columns.contains(column) {
            continue;
        }
        let Ok(series) = df.column(column) else {
            continue;
        };
        let nulls = series.null_count();
        if nulls > 0 {
            null_counts.insert(column.to_string(), json!(nulls));
            null_columns.push(column.to_string());
            total += nulls;
        }
    }

    if null_columns.is_empty() {
        ValidationResult::pass(
            "No unexpected null values found",
            json!({ "checked_columns": columns.len(), "total_rows": df.height() }),
        )
    } else {
        ValidationResult::fail(
            format!(
                "Found {total} null values in {} columns",
                null_columns.len()
            ),
            json!({
                "null_columns": null_columns,
                "null_counts": null_counts,
                "total_rows": df.height(),
            }),
        )
    }
}

/// Checks that a year column stays within `[min, max]`; either bound may be open.
pub fn check_date_range(
    df: &DataFrame,
    column: &str,
    min: Option<i64>,
    max: Option<i64>,
) -> Result<ValidationResult, ValidationError> {
    if !has_column(df, column) {
        return Ok(ValidationResult::column_not_found(column));
    }
    let years = df.column(column)?.cast(&DataType::Int64)?;
    let years = years.i64()?;
    let (actual_min, actual_max) = (years.min(), years.max());

    let mut issues = Vec::new();
    if let (Some(bound), Some(actual)) = (min, actual_min) {
        if actual < bound {
            issues.push(format!(
                "Minimum date {actual} is before allowed minimum {bound}"
            ));
        }
    }
    if let (Some(bound), Some(actual)) = (max, actual_max) {
        if actual > bound {
            issues.push(format!("Maximum date {actual} is after allowed maximum {bound}"));
        }
    }

    let mut details = json!({
        "actual_min": actual_min,
        "actual_max": actual_max,
        "expected_min": min,
        "expected_max": max,
    });
    if issues.is_empty() {
        Ok(ValidationResult::pass("Date range validation passed", details))
    } else {
        details["issues"] = json!(issues);
        Ok(ValidationResult::fail("Date range validation failed", details))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutlierMethod {
    /// Values beyond `threshold` interquartile ranges outside Q1..Q3.
    Iqr { threshold: f64 },
}

impl Default for OutlierMethod {
    fn default() -> Self {
        OutlierMethod::Iqr { threshold: 1.5 }
    }
}

impl OutlierMethod {
    pub fn parse(name: &str, threshold: f64) -> Result<Self, ValidationError> {
        match name {
            "iqr" => Ok(OutlierMethod::Iqr { threshold }),
            other => Err(ValidationError::UnsupportedMethod(other.to_string())),
        }
    }
}

pub fn check_outliers(
    df: &DataFrame,
    column: &str,
    method: OutlierMethod,
) -> Result<ValidationResult, ValidationError> {
    if !has_column(df, column) {
        return Ok(ValidationResult::column_not_found(column));
    }
    let series = df.column(column)?;
    if !series.dtype().is_numeric() {
        return Err(ValidationError::NonNumeric {
            column: column.to_string(),
            dtype: series.dtype().to_string(),
        });
    }
    let values = series.cast(&DataType::Float64)?;
    let values = values.f64()?;

    let OutlierMethod::Iqr { threshold } = method;
    let q1 = values.quantile(0.25, QuantileInterpolOptions::Nearest)?;
    let q3 = values.quantile(0.75, QuantileInterpolOptions::Nearest)?;
    let (Some(q1), Some(q3)) = (q1, q3) else {
        return Ok(ValidationResult::pass(
            "No values to check for outliers",
            json!({ "total_rows": df.height() }),
        ));
    };
    let iqr = q3 - q1;
    let lower = q1 - threshold * iqr;
    let upper = q3 + threshold * iqr;
    let outliers = values
        .into_iter()
        .flatten()
        .filter(|v| *v < lower || *v > upper)
        .count();

    let mut details = json!({
        "total_rows": df.height(),
        "lower_bound": lower,
        "upper_bound": upper,
        "q1": q1,
        "q3": q3,
        "iqr": iqr,
    });
    if outliers == 0 {
        return Ok(ValidationResult::pass(
            "No outliers found using IQR method",
            details,
        ));
    }
    details["outlier_count"] = json!(outliers);
    details["outlier_percentage"] = json!(outliers as f64 / df.height() as f64 * 100.0);
    Ok(ValidationResult::fail(
        format!("Found {outliers} outliers using IQR method"),
        details,
    ))
}

/// Validates the distinct codes in `column`; nulls are left to [`check_nulls`].
pub fn check_geographic_codes(
    df: &DataFrame,
    column: &str,
    kind: CodeKind,
    year: Option<CensusYear>,
) -> Result<ValidationResult, ValidationError> {
    if !has_column(df, column) {
        return Ok(ValidationResult::column_not_found(column));
    }
    let year = year.unwrap_or_default();
    let codes = df.column(column)?.cast(&DataType::String)?;
    let codes = codes.str()?;

    let mut seen = HashSet::new();
    let mut invalid = Vec::new();
    for code in codes.into_iter().flatten() {
        if seen.insert(code) && !kind.is_valid(code, year) {
            invalid.push(code);
        }
    }
    let unique = seen.len() + usize::from(codes.null_count() > 0);

    if invalid.is_empty() {
        return Ok(ValidationResult::pass(
            format!("All {} codes are valid", kind.label()),
            json!({ "total_unique_codes": unique, "total_rows": df.height() }),
        ));
    }

    let bad: HashSet<&str> = invalid.iter().copied().collect();
    let invalid_rows = codes
        .into_iter()
        .flatten()
        .filter(|c| bad.contains(c))
        .count();
    Ok(ValidationResult::fail(
        format!("Found {} invalid {} codes", invalid.len(), kind.label()),
        json!({
            "invalid_codes": invalid.iter().take(10).collect::<Vec<_>>(),
            "invalid_count": invalid.len(),
            "invalid_rows": invalid_rows,
            "total_unique_codes": unique,
            "total_rows": df.height(),
        }),
    ))
}

#[derive(Clone, Debug)]
pub enum Check {
    Schema {
        expected: Vec<(String, ColumnKind)>,
        allow_extra: bool,
    },
    Nulls {
        columns: Option<Vec<String>>,
        allow_null_columns: Vec<String>,
    },
    DateRange {
        column: String,
        min: Option<i64>,
        max: Option<i64>,
    },
    Outliers {
        column: String,
        method: OutlierMethod,
    },
    GeographicCodes {
        column: String,
        kind: CodeKind,
        year: Option<CensusYear>,
    },
}

impl Check {
    pub fn type_name(&self) -> &'static str {
        match self {
            Check::Schema { .. } => "schema",
            Check::Nulls { .. } => "nulls",
            Check::DateRange { .. } => "date_range",
            Check::Outliers { .. } => "outliers",
            Check::GeographicCodes { .. } => "geographic_codes",
        }
    }
}

/// A check plus the name its result is reported under.
#[derive(Clone, Debug)]
pub struct ValidationCheck {
    pub name: Option<String>,
    pub check: Check,
}

impl From<Check> for ValidationCheck {
    fn from(check: Check) -> Self {
        Self { name: None, check }
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

/// Runs each check in turn. Unnamed checks are reported as `{type}_{index}`.
pub fn run_all_validations(
    df: &DataFrame,
    checks: &[ValidationCheck],
) -> Result<BTreeMap<String, ValidationResult>, ValidationError> {
    let mut results = BTreeMap::new();
    for (i, ValidationCheck { name, check }) in checks.iter().enumerate() {
        let name = name
            .clone()
            .unwrap_or_else(|| format!("{}_{i}", check.type_name()));
        let result = match check {
            Check::Schema {
                expected,
                allow_extra,
            } => {
                let expected: Vec<(&str, ColumnKind)> =
                    expected.iter().map(|(c, k)| (c.as_str(), *k)).collect();
                validate_schema(df, &expected, *allow_extra)
            }
            Check::Nulls {
                columns,
                allow_null_columns,
            } => {
                let columns = columns.as_deref().map(as_strs);
                check_nulls(df, columns.as_deref(), &as_strs(allow_null_columns))
            }
            Check::DateRange { column, min, max } => check_date_range(df, column, *min, *max)?,
            Check::Outliers { column, method } => check_outliers(df, column, *method)?,
            Check::GeographicCodes { column, kind, year } => {
                check_geographic_codes(df, column, *kind, *year)?
            }
        };
        results.insert(name, result);
    }
    Ok(results)
}
