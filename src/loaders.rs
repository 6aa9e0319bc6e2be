use std::time::{Duration, Instant};

use polars::prelude::{AnyValue, DataFrame};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ukgeo::CensusYear;

use crate::cache::QueryCache;
use crate::config::WarehouseConfig;
use crate::error::LoadError;
use crate::query::{QueryBuilder, SqlQuery};
use crate::transforms::reject_non_positive;
use crate::warehouse::Warehouse;

pub const EMISSIONS_TABLE: &str = "ghg_emissions_tbl";
pub const EPC_DOMESTIC_VIEW: &str = "epc_domestic_vw";
pub const EPC_NON_DOMESTIC_VIEW: &str = "epc_non_domestic_vw";
pub const LA_LOOKUP_TABLE: &str = "ca_la_tbl";
pub const POSTCODES_TABLE: &str = "postcodes_tbl";

/// Filters for [`Loader::emissions`]. Empty lists and `None` bounds do not restrict.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmissionsFilter {
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    /// LA codes, e.g. `E06000023`.
    pub local_authorities: Vec<String>,
    pub sectors: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EpcFilter {
    pub local_authorities: Vec<String>,
    pub property_types: Vec<String>,
    pub energy_ratings: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostcodeFilter {
    pub local_authorities: Vec<String>,
    pub limit: Option<usize>,
}

/// Most recent year present in each dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DataFreshness {
    pub emissions: Option<i32>,
    pub epc_domestic: Option<i32>,
    pub epc_non_domestic: Option<i32>,
}

/// Dataset loaders over a [`Warehouse`], with a shared TTL result cache.
pub struct Loader<W> {
    warehouse: W,
    config: WarehouseConfig,
    cache: Mutex<QueryCache>,
}

impl<W: Warehouse> Loader<W> {
    pub fn new(warehouse: W, config: WarehouseConfig) -> Self {
        let cache = QueryCache::new(config.cache_max_entries);
        Self {
            warehouse,
            config,
            cache: Mutex::new(cache),
        }
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    async fn fetch(
        &self,
        dataset: &'static str,
        query: SqlQuery,
        ttl: Duration,
    ) -> Result<DataFrame, LoadError> {
        let key = query.cache_key();
        if let Some(hit) = self.cache.lock().await.get(&key) {
            debug!(dataset, rows = hit.height(), "cache hit");
            return Ok(hit);
        }

        let started = Instant::now();
        let frame = self.warehouse.query(&query).await?;
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_query_threshold {
            warn!(
                dataset,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow query"
            );
        }
        info!(
            dataset,
            rows = frame.height(),
            elapsed_ms = elapsed.as_millis() as u64,
            "loaded"
        );
        self.cache.lock().await.insert(key, frame.clone(), ttl);
        Ok(frame)
    }

    /// GHG emissions by LA, year and sector, newest year first.
    pub async fn emissions(&self, filter: &EmissionsFilter) -> Result<DataFrame, LoadError> {
        let query = QueryBuilder::from_table(EMISSIONS_TABLE)
            .year_range("calendar_year", filter.start_year, filter.end_year)
            .any_of("local_authority_code", &filter.local_authorities)
            .any_of("la_ghg_sector", &filter.sectors)
            .order_by("calendar_year", true)
            .order_by("local_authority_code", false)
            .order_by("la_ghg_sector", false)
            .build()?;
        self.fetch("emissions", query, self.config.cache_ttl).await
    }

    /// Domestic energy performance certificates, most recent lodgement first.
    pub async fn epc_domestic(&self, filter: &EpcFilter) -> Result<DataFrame, LoadError> {
        let query = QueryBuilder::from_table(EPC_DOMESTIC_VIEW)
            .any_of("LOCAL_AUTHORITY", &filter.local_authorities)
            .any_of("PROPERTY_TYPE", &filter.property_types)
            .any_of("CURRENT_ENERGY_RATING", &filter.energy_ratings)
            .order_by("LODGEMENT_DATETIME", true)
            .limit(filter.limit)
            .build()?;
        self.fetch("epc_domestic", query, self.config.cache_ttl).await
    }

    /// LA to Combined Authority lookup (`ladcd`, `ladnm`, `cauthcd`, `cauthnm`).
    pub async fn local_authorities(&self) -> Result<DataFrame, LoadError> {
        let query = QueryBuilder::from_table(LA_LOOKUP_TABLE)
            .order_by("cauthnm", false)
            .order_by("ladnm", false)
            .build()?;
        self.fetch("local_authorities", query, self.config.cache_ttl)
            .await
    }

    pub async fn postcodes(&self, filter: &PostcodeFilter) -> Result<DataFrame, LoadError> {
        let query = QueryBuilder::from_table(POSTCODES_TABLE)
            .select(&["pcds", "lsoa21cd", "msoa21cd", "lad25cd", "lat", "long", "imd20ind"])
            .any_of("lad25cd", &filter.local_authorities)
            .limit(filter.limit)
            .build()?;
        self.fetch("postcodes", query, self.config.cache_ttl).await
    }

    /// LSOA polygons for mapping, ordered by LSOA code.
    ///
    /// Boundary tables carry no LA column, so an LA filter goes through the
    /// postcode lookup. That lookup uses 2021 LSOAs only.
    pub async fn lsoa_boundaries(
        &self,
        year: CensusYear,
        local_authorities: &[String],
    ) -> Result<DataFrame, LoadError> {
        let table = year.lsoa_boundary_table();
        let code_column = year.lsoa_code_column();
        let mut builder = QueryBuilder::from_table(&table);
        if !local_authorities.is_empty() {
            if year != CensusYear::Y2021 {
                return Err(LoadError::InvalidFilter(format!(
                    "local authority filtering is only available for 2021 boundaries, got {year}"
                )));
            }
            let lsoas = QueryBuilder::from_table(POSTCODES_TABLE)
                .select(&["lsoa21cd"])
                .any_of("lad25cd", local_authorities)
                .build()?;
            builder = builder.any_of_subquery(&code_column, lsoas);
        }
        let query = builder.order_by(&code_column, false).build()?;
        self.fetch("lsoa_boundaries", query, self.config.boundary_cache_ttl)
            .await
    }

    pub async fn data_freshness(&self) -> Result<DataFreshness, LoadError> {
        let emissions = self
            .max_year(EMISSIONS_TABLE, "SELECT MAX(calendar_year) AS max_year FROM ghg_emissions_tbl")
            .await?;
        let epc_domestic = self
            .max_year(EPC_DOMESTIC_VIEW, "SELECT MAX(LODGEMENT_YEAR) AS max_year FROM epc_domestic_vw")
            .await?;
        let epc_non_domestic = self
            .max_year(
                EPC_NON_DOMESTIC_VIEW,
                "SELECT MAX(LODGEMENT_YEAR) AS max_year FROM epc_non_domestic_vw",
            )
            .await?;
        Ok(DataFreshness {
            emissions,
            epc_domestic,
            epc_non_domestic,
        })
    }

    async fn max_year(&self, dataset: &'static str, sql: &str) -> Result<Option<i32>, LoadError> {
        let df = self
            .fetch(dataset, SqlQuery::new(sql), self.config.cache_ttl)
            .await?;
        let value = match df.column("max_year").and_then(|s| s.get(0)) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let year = match value {
            AnyValue::String(s) => s.trim().parse::<i64>().ok(),
            other => other.extract::<i64>(),
        };
        Ok(year.and_then(|y| i32::try_from(y).ok()))
    }

    /// Emissions and per-capita emissions per Combined Authority and year.
    ///
    /// A CA-year whose summed population is zero or null is an error.
    pub async fn ca_comparison(&self) -> Result<DataFrame, LoadError> {
        let query = SqlQuery::new(
            "WITH la_year AS (
                 SELECT local_authority_code, calendar_year,
                        SUM(territorial_emissions_kt_co2e) AS emissions,
                        MAX(mid_year_population_thousands) AS population_thousands
                 FROM ghg_emissions_tbl
                 GROUP BY local_authority_code, calendar_year)
             SELECT ca.cauthnm AS ca_name, l.calendar_year,
                    SUM(l.emissions) AS total_emissions,
                    SUM(l.population_thousands) AS population_thousands,
                    SUM(l.emissions) / NULLIF(SUM(l.population_thousands), 0) AS per_capita
             FROM la_year l
             JOIN ca_la_tbl ca ON l.local_authority_code = ca.ladcd
             GROUP BY ca.cauthnm, l.calendar_year
             ORDER BY l.calendar_year DESC, ca_name",
        );
        let df = self.fetch("ca_comparison", query, self.config.cache_ttl).await?;
        reject_non_positive(&df, "population_thousands")?;
        Ok(df)
    }

    /// England-wide totals per year with population-weighted per-capita emissions.
    pub async fn england_average(&self) -> Result<DataFrame, LoadError> {
        let query = SqlQuery::new(
            "WITH la_year AS (
                 SELECT local_authority_code, calendar_year,
                        SUM(territorial_emissions_kt_co2e) AS emissions,
                        MAX(mid_year_population_thousands) AS population_thousands
                 FROM ghg_emissions_tbl
                 WHERE country = 'England'
                 GROUP BY local_authority_code, calendar_year)
             SELECT 'England' AS region, calendar_year,
                    SUM(emissions) AS total_emissions,
                    SUM(population_thousands) AS population_thousands,
                    SUM(emissions) / NULLIF(SUM(population_thousands), 0) AS per_capita
             FROM la_year
             GROUP BY calendar_year
             ORDER BY calendar_year",
        );
        let df = self
            .fetch("england_average", query, self.config.cache_ttl)
            .await?;
        reject_non_positive(&df, "population_thousands")?;
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::warehouse::tests::fixture_warehouse;
    use crate::warehouse::DuckDbWarehouse;

    fn loader() -> Loader<DuckDbWarehouse> {
        Loader::new(fixture_warehouse(), WarehouseConfig::default())
    }

    fn strings(df: &DataFrame, column: &str) -> Vec<String> {
        df.column(column)
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect()
    }

    fn ints(df: &DataFrame, column: &str) -> Vec<i64> {
        df.column(column)
            .unwrap()
            .i64()
            .unwrap()
            .into_iter()
            .flatten()
            .collect()
    }

    struct CountingWarehouse {
        inner: DuckDbWarehouse,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Warehouse for CountingWarehouse {
        async fn query(&self, query: &SqlQuery) -> Result<DataFrame, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.query(query).await
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<StdMutex<Vec<u8>>>);

    struct BufferWriter(Arc<StdMutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedBuffer {
        type Writer = BufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            BufferWriter(Arc::clone(&self.0))
        }
    }

    impl io::Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_queries_are_logged_as_warnings() {
        let sink = SharedBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let config = WarehouseConfig {
            slow_query_threshold: Duration::ZERO,
            ..WarehouseConfig::default()
        };
        let loader = Loader::new(fixture_warehouse(), config);
        loader.emissions(&EmissionsFilter::default()).await.unwrap();

        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("slow query"), "log was: {text}");
        assert!(text.contains("dataset=\"emissions\""));
        assert!(!text.contains("loaded"));
    }

    #[tokio::test]
    async fn freshness_goes_through_the_cache() {
        let loader = Loader::new(
            CountingWarehouse {
                inner: fixture_warehouse(),
                calls: AtomicUsize::new(0),
            },
            WarehouseConfig::default(),
        );
        loader.data_freshness().await.unwrap();
        loader.data_freshness().await.unwrap();
        assert_eq!(loader.warehouse().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn emissions_without_filters_newest_first() {
        let df = loader().emissions(&EmissionsFilter::default()).await.unwrap();
        assert_eq!(df.height(), 7);
        let years = ints(&df, "calendar_year");
        assert!(years.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn la_filter_only_returns_members() {
        let wanted = vec!["E06000023".to_string(), "E06000024".to_string()];
        let df = loader()
            .emissions(&EmissionsFilter {
                local_authorities: wanted.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(df.height(), 4);
        assert!(strings(&df, "local_authority_code")
            .iter()
            .all(|c| wanted.contains(c)));
    }

    #[tokio::test]
    async fn year_and_sector_filters_combine() {
        let df = loader()
            .emissions(&EmissionsFilter {
                start_year: Some(2022),
                end_year: Some(2023),
                sectors: vec!["Domestic".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(strings(&df, "la_ghg_sector"), vec!["Domestic"]);
        assert_eq!(ints(&df, "calendar_year"), vec![2023]);
    }

    #[tokio::test]
    async fn inverted_year_range_is_rejected() {
        let err = loader()
            .emissions(&EmissionsFilter {
                start_year: Some(2023),
                end_year: Some(2019),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn repeated_loads_are_served_from_cache() {
        let loader = Loader::new(
            CountingWarehouse {
                inner: fixture_warehouse(),
                calls: AtomicUsize::new(0),
            },
            WarehouseConfig::default(),
        );
        let filter = EmissionsFilter {
            sectors: vec!["Transport".into()],
            ..Default::default()
        };
        loader.emissions(&filter).await.unwrap();
        loader.emissions(&filter).await.unwrap();
        assert_eq!(loader.warehouse().calls.load(Ordering::SeqCst), 1);

        loader.emissions(&EmissionsFilter::default()).await.unwrap();
        assert_eq!(loader.warehouse().calls.load(Ordering::SeqCst), 2);

        loader.clear_cache().await;
        loader.emissions(&filter).await.unwrap();
        assert_eq!(loader.warehouse().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn epc_filters_and_limit() {
        let l = loader();
        let df = l
            .epc_domestic(&EpcFilter {
                local_authorities: vec!["E06000023".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(strings(&df, "LMK_KEY"), vec!["k2", "k1"]);

        let df = l
            .epc_domestic(&EpcFilter {
                property_types: vec!["House".into()],
                energy_ratings: vec!["D".into(), "E".into()],
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(strings(&df, "LMK_KEY"), vec!["k1"]);
    }

    #[tokio::test]
    async fn local_authorities_sorted_by_name() {
        let df = loader().local_authorities().await.unwrap();
        assert_eq!(
            strings(&df, "ladnm"),
            vec!["Bath and North East Somerset", "Bristol", "South Gloucestershire"]
        );
    }

    #[tokio::test]
    async fn postcodes_projection_and_filter() {
        let df = loader()
            .postcodes(&PostcodeFilter {
                local_authorities: vec!["E06000022".into()],
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(df.width(), 7);
        assert_eq!(strings(&df, "pcds"), vec!["BA1 1AA"]);
    }

    #[tokio::test]
    async fn boundaries_by_year_and_la() {
        let l = loader();
        let all = l.lsoa_boundaries(CensusYear::Y2021, &[]).await.unwrap();
        assert_eq!(strings(&all, "LSOA2021CD"), vec!["E01014370", "E01014540"]);

        let bristol = l
            .lsoa_boundaries(CensusYear::Y2021, &["E06000023".to_string()])
            .await
            .unwrap();
        assert_eq!(strings(&bristol, "LSOA2021CD"), vec!["E01014540"]);

        let err = l
            .lsoa_boundaries(CensusYear::Y2011, &["E06000023".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidFilter(_)));

        let missing = l.lsoa_boundaries(CensusYear::Y2011, &[]).await.unwrap_err();
        assert!(!missing.is_connection_failure());
    }

    #[tokio::test]
    async fn freshness_reports_latest_years() {
        let freshness = loader().data_freshness().await.unwrap();
        assert_eq!(
            freshness,
            DataFreshness {
                emissions: Some(2023),
                epc_domestic: Some(2024),
                epc_non_domestic: Some(2023),
            }
        );
    }

    #[tokio::test]
    async fn combined_authority_rollup() {
        let df = loader().ca_comparison().await.unwrap();
        // Cardiff and North Somerset are not in the CA lookup.
        assert!(strings(&df, "ca_name").iter().all(|n| n == "West of England"));
        assert_eq!(ints(&df, "calendar_year"), vec![2023, 2022, 2021]);
        let totals: Vec<f64> = df
            .column("total_emissions")
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(totals, vec![1990.0, 900.0, 390.0]);
    }

    #[tokio::test]
    async fn england_average_excludes_other_nations() {
        let df = loader().england_average().await.unwrap();
        assert_eq!(ints(&df, "calendar_year"), vec![2021, 2022, 2023]);
        let totals: Vec<f64> = df
            .column("total_emissions")
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(totals, vec![390.0, 900.0, 2190.0]);
    }
}
