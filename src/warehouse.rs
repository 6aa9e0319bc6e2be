use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duckdb::arrow::datatypes::DataType as ArrowType;
use duckdb::types::Value;
use duckdb::{AccessMode, Config, Connection};
use polars::prelude::{DataFrame, NamedFrom, Series};
use tracing::{debug, info, warn};

use crate::config::WarehouseConfig;
use crate::error::LoadError;
use crate::query::{check_identifier, SqlParam, SqlQuery};

/// Executes SQL against the analytical warehouse and returns tabular results.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Runs a parameterised query.
    async fn query(&self, query: &SqlQuery) -> Result<DataFrame, LoadError>;

    /// True when a trivial `SELECT 1` round-trips.
    async fn ping(&self) -> bool {
        match self.query(&SqlQuery::new("SELECT 1 AS test")).await {
            Ok(df) => df
                .column("test")
                .ok()
                .and_then(|s| s.get(0).ok())
                .and_then(|v| v.extract::<i64>())
                == Some(1),
            Err(_) => false,
        }
    }

    /// Base tables of the `main` schema, sorted by name.
    async fn table_list(&self) -> Result<Vec<String>, LoadError> {
        let df = self
            .query(&SqlQuery::new(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'main' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
            ))
            .await?;
        string_column(&df, "table_name")
    }

    /// Column name → declared type, in ordinal order.
    async fn table_info(&self, table: &str) -> Result<Vec<(String, String)>, LoadError> {
        check_identifier(table)?;
        let query = SqlQuery::new(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = ? AND table_schema = 'main' ORDER BY ordinal_position",
        )
        .bind(SqlParam::Text(table.to_string()));
        let df = self.query(&query).await?;
        let names = string_column(&df, "column_name")?;
        let types = string_column(&df, "data_type")?;
        Ok(names.into_iter().zip(types).collect())
    }
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>, LoadError> {
    if df.height() == 0 {
        return Ok(Vec::new());
    }
    let fail = |e: polars::error::PolarsError| LoadError::QueryFailed {
        message: e.to_string(),
        sql: None,
    };
    let values = df.column(name).map_err(fail)?.str().map_err(fail)?;
    Ok(values.into_iter().flatten().map(str::to_string).collect())
}

/// DuckDB connection, either to MotherDuck or to a local database.
#[derive(Clone)]
pub struct DuckDbWarehouse {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbWarehouse {
    /// Opens a read-only MotherDuck connection.
    pub fn connect(config: &WarehouseConfig) -> Result<Self, LoadError> {
        let target = config.connection_string().ok_or(LoadError::MissingToken)?;
        let unavailable = |e: duckdb::Error| LoadError::Unavailable {
            database: config.database.clone(),
            message: e.to_string(),
        };
        let flags = Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(unavailable)?;
        let conn = Connection::open_with_flags(target, flags).map_err(unavailable)?;
        info!(database = %config.database, "connected to MotherDuck");
        Ok(Self {
            name: config.database.clone(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, LoadError> {
        let conn = Connection::open_in_memory().map_err(|e| LoadError::Unavailable {
            database: ":memory:".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name: ":memory:".to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn database(&self) -> &str {
        &self.name
    }

    /// Runs one or more statements without returning rows, e.g. to seed fixtures.
    pub fn execute_batch(&self, sql: &str) -> Result<(), LoadError> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| LoadError::query(e.to_string(), sql))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LoadError> {
        self.conn.lock().map_err(|_| LoadError::Unavailable {
            database: self.name.clone(),
            message: "connection lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl Warehouse for DuckDbWarehouse {
    async fn query(&self, query: &SqlQuery) -> Result<DataFrame, LoadError> {
        let this = self.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.lock()?;
            run_query(&conn, &query)
        })
        .await
        .map_err(|e| LoadError::QueryFailed {
            message: format!("query task failed: {e}"),
            sql: None,
        })?
    }
}

#[async_trait]
impl<T: Warehouse + ?Sized> Warehouse for Box<T> {
    async fn query(&self, query: &SqlQuery) -> Result<DataFrame, LoadError> {
        (**self).query(query).await
    }
}

/// Stands in for a warehouse that could not be reached; every query reports
/// the connection error it was created with.
pub struct OfflineWarehouse {
    error: LoadError,
}

impl OfflineWarehouse {
    pub fn new(error: LoadError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl Warehouse for OfflineWarehouse {
    async fn query(&self, _query: &SqlQuery) -> Result<DataFrame, LoadError> {
        Err(self.error.clone())
    }
}

/// Connects to MotherDuck, degrading to an [`OfflineWarehouse`] on failure so
/// that callers can decide whether to serve mock data.
pub fn connect_or_offline(config: &WarehouseConfig) -> Box<dyn Warehouse> {
    match DuckDbWarehouse::connect(config) {
        Ok(wh) => Box::new(wh),
        Err(err) => {
            warn!(error = %err, "warehouse unavailable");
            Box::new(OfflineWarehouse::new(err))
        }
    }
}

fn to_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Int(v) => Value::BigInt(*v),
        SqlParam::Text(v) => Value::Text(v.clone()),
    }
}

fn run_query(conn: &Connection, query: &SqlQuery) -> Result<DataFrame, LoadError> {
    let sql = query.sql();
    let fail = |e: duckdb::Error| LoadError::query(e.to_string(), sql);
    debug!(sql, params = query.params().len(), "executing query");

    let mut stmt = conn.prepare(sql).map_err(fail)?;
    let params: Vec<Value> = query.params().iter().map(to_value).collect();
    let mut rows = stmt
        .query(duckdb::params_from_iter(params.iter()))
        .map_err(fail)?;
    let (names, declared): (Vec<String>, Vec<Option<Kind>>) = match rows.as_ref() {
        Some(stmt) => {
            let names = stmt.column_names();
            let declared = (0..names.len())
                .map(|idx| declared_kind(&stmt.column_type(idx)))
                .collect();
            (names, declared)
        }
        None => (Vec::new(), Vec::new()),
    };

    let mut columns: Vec<ColumnBuilder> = declared.into_iter().map(ColumnBuilder::new).collect();
    while let Some(row) = rows.next().map_err(fail)? {
        for (idx, column) in columns.iter_mut().enumerate() {
            let value: Value = row.get(idx).map_err(fail)?;
            column.push(value);
        }
    }

    let series: Vec<Series> = names
        .iter()
        .zip(columns)
        .map(|(name, column)| column.finish(name))
        .collect();
    DataFrame::new(series).map_err(|e| LoadError::query(e.to_string(), sql))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Bool,
    Int,
    Float,
    Text,
}

enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Column kind DuckDB declares for a result, used when no value settles it.
fn declared_kind(dtype: &ArrowType) -> Option<Kind> {
    match dtype {
        ArrowType::Boolean => Some(Kind::Bool),
        ArrowType::Int8
        | ArrowType::Int16
        | ArrowType::Int32
        | ArrowType::Int64
        | ArrowType::UInt8
        | ArrowType::UInt16
        | ArrowType::UInt32
        | ArrowType::UInt64 => Some(Kind::Int),
        ArrowType::Float16
        | ArrowType::Float32
        | ArrowType::Float64
        | ArrowType::Decimal128(..)
        | ArrowType::Decimal256(..) => Some(Kind::Float),
        ArrowType::Utf8 | ArrowType::LargeUtf8 => Some(Kind::Text),
        _ => None,
    }
}

/// Accumulates one result column and settles on the widest type it has seen,
/// or on the declared type when every value is null.
#[derive(Default)]
struct ColumnBuilder {
    cells: Vec<Cell>,
    kinds: BTreeMap<Kind, usize>,
    declared: Option<Kind>,
}

impl ColumnBuilder {
    fn new(declared: Option<Kind>) -> Self {
        Self {
            declared,
            ..Self::default()
        }
    }

    fn push(&mut self, value: Value) {
        let cell = match value {
            Value::Null => Cell::Null,
            Value::Boolean(b) => Cell::Bool(b),
            Value::TinyInt(v) => Cell::Int(i64::from(v)),
            Value::SmallInt(v) => Cell::Int(i64::from(v)),
            Value::Int(v) => Cell::Int(i64::from(v)),
            Value::BigInt(v) => Cell::Int(v),
            Value::UTinyInt(v) => Cell::Int(i64::from(v)),
            Value::USmallInt(v) => Cell::Int(i64::from(v)),
            Value::UInt(v) => Cell::Int(i64::from(v)),
            Value::UBigInt(v) => match i64::try_from(v) {
                Ok(v) => Cell::Int(v),
                Err(_) => Cell::Float(v as f64),
            },
            Value::HugeInt(v) => match i64::try_from(v) {
                Ok(v) => Cell::Int(v),
                Err(_) => Cell::Float(v as f64),
            },
            Value::Float(v) => Cell::Float(f64::from(v)),
            Value::Double(v) => Cell::Float(v),
            Value::Decimal(d) => match d.to_string().parse::<f64>() {
                Ok(v) => Cell::Float(v),
                Err(_) => Cell::Text(d.to_string()),
            },
            Value::Text(s) => Cell::Text(s),
            Value::Enum(s) => Cell::Text(s),
            other => Cell::Text(format!("{other:?}")),
        };
        let kind = match &cell {
            Cell::Null => None,
            Cell::Bool(_) => Some(Kind::Bool),
            Cell::Int(_) => Some(Kind::Int),
            Cell::Float(_) => Some(Kind::Float),
            Cell::Text(_) => Some(Kind::Text),
        };
        if let Some(kind) = kind {
            *self.kinds.entry(kind).or_default() += 1;
        }
        self.cells.push(cell);
    }

    fn kind(&self) -> Kind {
        let has = |k| self.kinds.contains_key(&k);
        match self.kinds.len() {
            0 => self.declared.unwrap_or(Kind::Text),
            1 => *self.kinds.keys().next().unwrap_or(&Kind::Text),
            2 if has(Kind::Int) && has(Kind::Float) => Kind::Float,
            _ => Kind::Text,
        }
    }

    fn finish(self, name: &str) -> Series {
        match self.kind() {
            Kind::Bool => {
                let values: Vec<Option<bool>> = self
                    .cells
                    .into_iter()
                    .map(|c| match c {
                        Cell::Bool(b) => Some(b),
                        _ => None,
                    })
                    .collect();
                Series::new(name, values)
            }
            Kind::Int => {
                let values: Vec<Option<i64>> = self
                    .cells
                    .into_iter()
                    .map(|c| match c {
                        Cell::Int(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                Series::new(name, values)
            }
            Kind::Float => {
                let values: Vec<Option<f64>> = self
                    .cells
                    .into_iter()
                    .map(|c| match c {
                        Cell::Int(v) => Some(v as f64),
                        Cell::Float(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                Series::new(name, values)
            }
            Kind::Text => {
                let values: Vec<Option<String>> = self
                    .cells
                    .into_iter()
                    .map(|c| match c {
                        Cell::Null => None,
                        Cell::Bool(b) => Some(b.to_string()),
                        Cell::Int(v) => Some(v.to_string()),
                        Cell::Float(v) => Some(v.to_string()),
                        Cell::Text(s) => Some(s),
                    })
                    .collect();
                Series::new(name, values)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use polars::prelude::DataType;

    /// In-memory warehouse holding a small slice of the WECA tables.
    pub(crate) fn fixture_warehouse() -> DuckDbWarehouse {
        let wh = DuckDbWarehouse::open_in_memory().unwrap();
        wh.execute_batch(
            "CREATE TABLE ghg_emissions_tbl (
                 local_authority VARCHAR, local_authority_code VARCHAR, calendar_year BIGINT,
                 la_ghg_sector VARCHAR, territorial_emissions_kt_co2e DOUBLE,
                 mid_year_population_thousands DOUBLE, area_km2 DOUBLE, country VARCHAR);
             INSERT INTO ghg_emissions_tbl VALUES
                 ('Bristol', 'E06000023', 2022, 'Transport', 900.0, 472.4, 110.0, 'England'),
                 ('Bristol', 'E06000023', 2023, 'Transport', 880.0, 479.0, 110.0, 'England'),
                 ('Bristol', 'E06000023', 2023, 'Domestic', 700.0, 479.0, 110.0, 'England'),
                 ('Bath and North East Somerset', 'E06000022', 2023, 'Transport', 410.0, 195.6, 346.0, 'England'),
                 ('Bath and North East Somerset', 'E06000022', 2021, 'Domestic', 390.0, 193.4, 346.0, 'England'),
                 ('North Somerset', 'E06000024', 2023, 'Industry', 200.0, 217.2, 374.0, 'England'),
                 ('Cardiff', 'W06000015', 2023, 'Transport', 800.0, 372.1, 141.0, 'Wales');
             CREATE TABLE ca_la_tbl (ladcd VARCHAR, ladnm VARCHAR, cauthcd VARCHAR, cauthnm VARCHAR);
             INSERT INTO ca_la_tbl VALUES
                 ('E06000023', 'Bristol', 'E47000009', 'West of England'),
                 ('E06000022', 'Bath and North East Somerset', 'E47000009', 'West of England'),
                 ('E06000025', 'South Gloucestershire', 'E47000009', 'West of England');
             CREATE TABLE postcodes_tbl (pcds VARCHAR, lsoa21cd VARCHAR, msoa21cd VARCHAR,
                 lad25cd VARCHAR, lat DOUBLE, long DOUBLE, imd20ind BIGINT);
             INSERT INTO postcodes_tbl VALUES
                 ('BS1 1AA', 'E01014540', 'E02003043', 'E06000023', 51.45, -2.59, 10123),
                 ('BS1 2AB', 'E01014540', 'E02003043', 'E06000023', 51.46, -2.58, 10123),
                 ('BA1 1AA', 'E01014370', 'E02003005', 'E06000022', 51.38, -2.36, 25011);
             CREATE TABLE lsoa_poly_2021_tbl (FID BIGINT, LSOA2021CD VARCHAR, LSOA2021NM VARCHAR, geometry VARCHAR);
             INSERT INTO lsoa_poly_2021_tbl VALUES
                 (2, 'E01014540', 'Bristol 032A', '{\"type\":\"Polygon\",\"coordinates\":[[[-2.6,51.4],[-2.5,51.4],[-2.5,51.5],[-2.6,51.4]]]}'),
                 (1, 'E01014370', 'Bath 007A', '{\"type\":\"Polygon\",\"coordinates\":[[[-2.4,51.3],[-2.3,51.3],[-2.3,51.4],[-2.4,51.3]]]}');
             CREATE TABLE epc_domestic_vw (LMK_KEY VARCHAR, LOCAL_AUTHORITY VARCHAR, PROPERTY_TYPE VARCHAR,
                 CURRENT_ENERGY_RATING VARCHAR, LODGEMENT_DATETIME VARCHAR, LODGEMENT_YEAR BIGINT,
                 CO2_EMISSIONS_CURRENT DOUBLE, TOTAL_FLOOR_AREA DOUBLE);
             INSERT INTO epc_domestic_vw VALUES
                 ('k1', 'E06000023', 'House', 'D', '2024-03-01 10:00:00', 2024, 3.1, 85.0),
                 ('k2', 'E06000023', 'Flat', 'C', '2024-05-01 10:00:00', 2024, 1.9, 55.0),
                 ('k3', 'E06000022', 'House', 'E', '2023-01-01 10:00:00', 2023, 4.2, 120.0);
             CREATE TABLE epc_non_domestic_vw (LMK_KEY VARCHAR, LODGEMENT_YEAR BIGINT);
             INSERT INTO epc_non_domestic_vw VALUES ('n1', 2023), ('n2', NULL);",
        )
        .unwrap();
        wh
    }

    #[tokio::test]
    async fn rows_become_typed_columns() {
        let wh = fixture_warehouse();
        let df = wh
            .query(&SqlQuery::new(
                "SELECT local_authority_code, calendar_year, territorial_emissions_kt_co2e \
                 FROM ghg_emissions_tbl ORDER BY calendar_year",
            ))
            .await
            .unwrap();
        assert_eq!(df.height(), 7);
        assert_eq!(df.column("calendar_year").unwrap().dtype(), &DataType::Int64);
        assert_eq!(
            df.column("territorial_emissions_kt_co2e").unwrap().dtype(),
            &DataType::Float64
        );
        assert_eq!(df.column("local_authority_code").unwrap().dtype(), &DataType::String);
    }

    #[tokio::test]
    async fn ping_and_catalog() {
        let wh = fixture_warehouse();
        assert!(wh.ping().await);
        let tables = wh.table_list().await.unwrap();
        assert!(tables.contains(&"ghg_emissions_tbl".to_string()));
        let mut sorted = tables.clone();
        sorted.sort();
        assert_eq!(tables, sorted);

        let info = wh.table_info("ca_la_tbl").await.unwrap();
        assert_eq!(info[0], ("ladcd".to_string(), "VARCHAR".to_string()));
        assert_eq!(info.len(), 4);
        assert!(wh.table_info("nonexistent_tbl").await.unwrap().is_empty());
        assert!(matches!(
            wh.table_info("ca_la_tbl; DROP TABLE x").await,
            Err(LoadError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn bad_sql_is_a_query_failure() {
        let wh = fixture_warehouse();
        let err = wh.query(&SqlQuery::new("SELECT * FROM missing_tbl")).await.unwrap_err();
        assert!(!err.is_connection_failure());
        assert_eq!(err.sql(), Some("SELECT * FROM missing_tbl"));
    }

    #[test]
    fn missing_token_is_a_connection_failure() {
        let err = DuckDbWarehouse::connect(&WarehouseConfig::default()).err().unwrap();
        assert!(matches!(err, LoadError::MissingToken));
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn offline_warehouse_repeats_connection_error() {
        let wh = connect_or_offline(&WarehouseConfig::default());
        assert!(!wh.ping().await);
        let err = wh.query(&SqlQuery::new("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, LoadError::MissingToken));
    }

    #[tokio::test]
    async fn empty_results_keep_declared_types() {
        let wh = fixture_warehouse();
        let df = wh
            .query(&SqlQuery::new(
                "SELECT local_authority_code, calendar_year, territorial_emissions_kt_co2e \
                 FROM ghg_emissions_tbl WHERE la_ghg_sector = 'Nope'",
            ))
            .await
            .unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.column("calendar_year").unwrap().dtype(), &DataType::Int64);
        assert_eq!(
            df.column("territorial_emissions_kt_co2e").unwrap().dtype(),
            &DataType::Float64
        );
        assert_eq!(df.column("local_authority_code").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn all_null_column_uses_declared_kind() {
        let mut col = ColumnBuilder::new(Some(Kind::Float));
        col.push(Value::Null);
        assert_eq!(col.finish("v").dtype(), &DataType::Float64);
        assert_eq!(ColumnBuilder::default().finish("w").dtype(), &DataType::String);
    }

    #[test]
    fn mixed_numeric_columns_widen_to_float() {
        let mut col = ColumnBuilder::default();
        col.push(Value::Int(1));
        col.push(Value::Null);
        col.push(Value::Double(2.5));
        let s = col.finish("v");
        assert_eq!(s.dtype(), &DataType::Float64);
        assert_eq!(s.null_count(), 1);
    }
}
