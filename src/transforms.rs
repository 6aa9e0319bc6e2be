//! Normalisation and aggregation of emissions frames.
//!
//! Every transform checks its preconditions up front and fails with a
//! [`TransformError`] naming the offending column instead of coercing bad data.

use std::collections::HashMap;
use std::str::FromStr;

use polars::prelude::*;
use thiserror::Error;

pub const PER_CAPITA_COLUMN: &str = "per_capita_emissions_t_co2e";
pub const PER_KM2_COLUMN: &str = "emissions_per_km2_kt_co2e";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{frame} frame missing required columns: {}", .columns.join(", "))]
    MissingColumns {
        frame: &'static str,
        columns: Vec<String>,
    },
    #[error("column `{column}` contains {rows} rows with zero or null values")]
    InvalidDenominator { column: String, rows: usize },
    #[error("column `{column}` must be numeric, got {dtype}")]
    NonNumeric { column: String, dtype: String },
    #[error(
        "{rows} rows could not be mapped to target geography; \
         check that all `{column}` values exist in the lookup table"
    )]
    UnmappedGeography { rows: usize, column: String },
    #[error("{frame} frame has {rows} duplicated keys on {}", .keys.join(", "))]
    DuplicateKeys {
        frame: &'static str,
        keys: Vec<String>,
        rows: usize,
    },
    #[error("unknown aggregation `{0}`, expected one of sum, mean, median, min, max, count, std")]
    UnknownAggregation(String),
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

/// Column names used when dividing emissions by a per-geography denominator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DenominatorColumns {
    pub emissions: String,
    pub denominator: String,
    pub geography: String,
    pub year: String,
}

impl DenominatorColumns {
    pub fn population() -> Self {
        Self {
            emissions: "territorial_emissions_kt_co2e".to_string(),
            denominator: "population".to_string(),
            geography: "local_authority_code".to_string(),
            year: "calendar_year".to_string(),
        }
    }

    pub fn area() -> Self {
        Self {
            denominator: "area_km2".to_string(),
            ..Self::population()
        }
    }
}

fn require_columns(
    df: &DataFrame,
    frame: &'static str,
    required: &[&str],
) -> Result<(), TransformError> {
    let present = df.get_column_names();
    let mut missing: Vec<String> = required
        .iter()
        .filter(|c| !present.contains(c))
        .map(|c| c.to_string())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    missing.dedup();
    Err(TransformError::MissingColumns {
        frame,
        columns: missing,
    })
}

fn require_numeric(df: &DataFrame, column: &str) -> Result<(), TransformError> {
    let dtype = df.column(column)?.dtype();
    if dtype.is_numeric() {
        Ok(())
    } else {
        Err(TransformError::NonNumeric {
            column: column.to_string(),
            dtype: dtype.to_string(),
        })
    }
}

pub(crate) fn reject_non_positive(df: &DataFrame, column: &str) -> Result<(), TransformError> {
    let rows = df
        .clone()
        .lazy()
        .filter(col(column).is_null().or(col(column).lt_eq(lit(0))))
        .collect()?
        .height();
    if rows > 0 {
        return Err(TransformError::InvalidDenominator {
            column: column.to_string(),
            rows,
        });
    }
    Ok(())
}

fn reject_duplicate_keys(
    df: &DataFrame,
    frame: &'static str,
    keys: &[&str],
) -> Result<(), TransformError> {
    let rows = df
        .clone()
        .lazy()
        .group_by(keys.iter().map(|k| col(k)).collect::<Vec<_>>())
        .agg([len().alias("__rows")])
        .filter(col("__rows").gt(lit(1)))
        .collect()?
        .height();
    if rows > 0 {
        return Err(TransformError::DuplicateKeys {
            frame,
            keys: keys.iter().map(|k| k.to_string()).collect(),
            rows,
        });
    }
    Ok(())
}

fn without_column(df: &DataFrame, column: &str) -> Result<DataFrame, TransformError> {
    if df.get_column_names().contains(&column) {
        Ok(df.drop(column)?)
    } else {
        Ok(df.clone())
    }
}

/// Left-joins `denominators` onto `primary` and divides, erroring on any unmatched row.
fn divide_by(
    primary: &DataFrame,
    denominators: &DataFrame,
    keys: &[&str],
    emissions: &str,
    denominator: &str,
    scale: f64,
    output: &str,
) -> Result<DataFrame, TransformError> {
    let mut projection: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
    projection.push(col(denominator));
    let key_exprs: Vec<Expr> = keys.iter().map(|k| col(k)).collect();

    let joined = without_column(primary, denominator)?
        .lazy()
        .join(
            denominators.clone().lazy().select(projection),
            key_exprs.clone(),
            key_exprs,
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;

    let unmatched = joined.column(denominator)?.null_count();
    if unmatched > 0 {
        return Err(TransformError::UnmappedGeography {
            rows: unmatched,
            column: keys[0].to_string(),
        });
    }

    Ok(joined
        .lazy()
        .with_columns([(col(emissions).cast(DataType::Float64) * lit(scale)
            / col(denominator).cast(DataType::Float64))
        .alias(output)])
        .collect()?)
}

/// Adds `per_capita_emissions_t_co2e` (tonnes per person) to the emissions frame.
///
/// Emissions are kt CO2e, so the value is `emissions * 1000 / population`.
pub fn per_capita_emissions(
    emissions: &DataFrame,
    population: &DataFrame,
    columns: &DenominatorColumns,
) -> Result<DataFrame, TransformError> {
    let keys = [columns.geography.as_str(), columns.year.as_str()];
    require_columns(emissions, "emissions", &[keys[0], keys[1], &columns.emissions])?;
    require_columns(population, "population", &[keys[0], keys[1], &columns.denominator])?;
    require_numeric(emissions, &columns.emissions)?;
    require_numeric(population, &columns.denominator)?;
    reject_non_positive(population, &columns.denominator)?;
    reject_duplicate_keys(population, "population", &keys)?;

    divide_by(
        emissions,
        population,
        &keys,
        &columns.emissions,
        &columns.denominator,
        1000.0,
        PER_CAPITA_COLUMN,
    )
}

/// Adds `emissions_per_km2_kt_co2e`; area is joined on geography alone.
pub fn emissions_per_km2(
    emissions: &DataFrame,
    area: &DataFrame,
    columns: &DenominatorColumns,
) -> Result<DataFrame, TransformError> {
    let keys = [columns.geography.as_str()];
    require_columns(
        emissions,
        "emissions",
        &[keys[0], &columns.year, &columns.emissions],
    )?;
    require_columns(area, "area", &[keys[0], &columns.denominator])?;
    require_numeric(emissions, &columns.emissions)?;
    require_numeric(area, &columns.denominator)?;
    reject_non_positive(area, &columns.denominator)?;
    reject_duplicate_keys(area, "area", &keys)?;

    divide_by(
        emissions,
        area,
        &keys,
        &columns.emissions,
        &columns.denominator,
        1.0,
        PER_KM2_COLUMN,
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Sum,
    Mean,
    Median,
    Min,
    Max,
    Count,
    Std,
}

pub const DEFAULT_AGGREGATIONS: [Aggregation; 5] = [
    Aggregation::Sum,
    Aggregation::Mean,
    Aggregation::Min,
    Aggregation::Max,
    Aggregation::Count,
];

impl Aggregation {
    pub fn name(self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Count => "count",
            Aggregation::Std => "std",
        }
    }

    fn expr(self, column: &str) -> Expr {
        let c = col(column);
        let e = match self {
            Aggregation::Sum => c.sum(),
            Aggregation::Mean => c.mean(),
            Aggregation::Median => c.median(),
            Aggregation::Min => c.min(),
            Aggregation::Max => c.max(),
            Aggregation::Count => c.count(),
            Aggregation::Std => c.std(1),
        };
        e.alias(&format!("{column}_{}", self.name()))
    }
}

impl FromStr for Aggregation {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Aggregation::Sum),
            "mean" => Ok(Aggregation::Mean),
            "median" => Ok(Aggregation::Median),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "count" => Ok(Aggregation::Count),
            "std" => Ok(Aggregation::Std),
            other => Err(TransformError::UnknownAggregation(other.to_string())),
        }
    }
}

/// Groups a time series and summarises `value_col`, adding the covered year span.
pub fn aggregate_time_series(
    df: &DataFrame,
    group_cols: &[&str],
    value_col: &str,
    year_col: &str,
    aggregations: &[Aggregation],
) -> Result<DataFrame, TransformError> {
    let mut required = group_cols.to_vec();
    required.extend([value_col, year_col]);
    require_columns(df, "time series", &required)?;
    require_numeric(df, value_col)?;

    let mut exprs: Vec<Expr> = aggregations.iter().map(|a| a.expr(value_col)).collect();
    exprs.extend([
        col(year_col).min().alias("year_start"),
        col(year_col).max().alias("year_end"),
        col(year_col).count().alias("year_count"),
    ]);
    let keys: Vec<Expr> = group_cols.iter().map(|c| col(c)).collect();

    Ok(df
        .clone()
        .lazy()
        .group_by(keys.clone())
        .agg(exprs)
        .sort_by_exprs(keys, SortMultipleOptions::default())
        .collect()?)
}

/// Rolls values up a geography hierarchy, e.g. LSOA to LA, using `lookup`.
///
/// Every source code must be present in the lookup; totals of `value_cols` are
/// preserved.
pub fn aggregate_geographic(
    df: &DataFrame,
    lookup: &DataFrame,
    from_col: &str,
    to_col: &str,
    value_cols: &[&str],
    year_col: &str,
) -> Result<DataFrame, TransformError> {
    let mut required = vec![from_col, year_col];
    required.extend(value_cols);
    require_columns(df, "data", &required)?;
    require_columns(lookup, "lookup", &[from_col, to_col])?;
    for column in value_cols {
        require_numeric(df, column)?;
    }
    reject_duplicate_keys(lookup, "lookup", &[from_col])?;

    let joined = without_column(df, to_col)?
        .lazy()
        .join(
            lookup.clone().lazy().select([col(from_col), col(to_col)]),
            [col(from_col)],
            [col(from_col)],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;

    let unmatched = joined.column(to_col)?.null_count();
    if unmatched > 0 {
        return Err(TransformError::UnmappedGeography {
            rows: unmatched,
            column: from_col.to_string(),
        });
    }

    let sums: Vec<Expr> = value_cols.iter().map(|c| col(c).sum().alias(c)).collect();
    Ok(joined
        .lazy()
        .group_by([col(to_col), col(year_col)])
        .agg(sums)
        .sort_by_exprs([col(year_col), col(to_col)], SortMultipleOptions::default())
        .collect()?)
}

/// Totals `value_col` per sector and year (plus any extra grouping columns).
pub fn aggregate_sectors(
    df: &DataFrame,
    sector_col: &str,
    value_col: &str,
    group_cols: &[&str],
    year_col: &str,
) -> Result<DataFrame, TransformError> {
    let mut required = vec![sector_col, value_col, year_col];
    required.extend(group_cols);
    require_columns(df, "sector", &required)?;
    require_numeric(df, value_col)?;

    let mut keys = vec![col(sector_col), col(year_col)];
    keys.extend(group_cols.iter().map(|c| col(c)));
    let mut order = vec![col(year_col), col(sector_col)];
    order.extend(group_cols.iter().map(|c| col(c)));

    Ok(df
        .clone()
        .lazy()
        .group_by(keys)
        .agg([
            col(value_col).sum().alias(&format!("{value_col}_total")),
            col(value_col).count().alias("record_count"),
        ])
        .sort_by_exprs(order, SortMultipleOptions::default())
        .collect()?)
}

/// Percentage difference of `value` from `baseline`; zero when the baseline is zero.
pub fn percent_difference(value: f64, baseline: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        (value - baseline) / baseline * 100.0
    }
}

/// Appends `{value_col}_yoy_pct`, the change against the previous year of the same
/// group. The first year of each group is null; a non-positive previous value gives 0.
pub fn year_on_year_change(
    df: &DataFrame,
    year_col: &str,
    value_col: &str,
    group_col: Option<&str>,
) -> Result<DataFrame, TransformError> {
    let mut required = vec![year_col, value_col];
    required.extend(group_col);
    require_columns(df, "time series", &required)?;
    require_numeric(df, value_col)?;

    let mut order = Vec::new();
    if let Some(g) = group_col {
        order.push(col(g));
    }
    order.push(col(year_col));
    let mut sorted = df
        .clone()
        .lazy()
        .sort_by_exprs(order, SortMultipleOptions::default())
        .collect()?;

    let values: Vec<Option<f64>> = sorted
        .column(value_col)?
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .collect();
    let groups: Vec<Option<String>> = match group_col {
        Some(g) => sorted
            .column(g)?
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect(),
        None => vec![None; values.len()],
    };

    let mut previous: HashMap<Option<String>, Option<f64>> = HashMap::new();
    let mut changes = Vec::with_capacity(values.len());
    for (group, value) in groups.into_iter().zip(values) {
        let change = match previous.get(&group) {
            None => None,
            Some(Some(prev)) if *prev > 0.0 => value.map(|v| percent_difference(v, *prev)),
            Some(_) => Some(0.0),
        };
        changes.push(change);
        previous.insert(group, value);
    }

    sorted.with_column(Series::new(&format!("{value_col}_yoy_pct"), changes))?;
    Ok(sorted)
}
