//! Sample data for offline use, and loaders that fall back to it.
//!
//! Mock frames mirror the standardised warehouse schema so that downstream
//! transforms and exports cannot tell them apart. Only connectivity failures
//! trigger a fallback; a broken query is still an error.

use std::collections::HashMap;

use chrono::Datelike;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;
use ukgeo::LocalAuthority;

use crate::error::LoadError;
use crate::loaders::{DataFreshness, EmissionsFilter, Loader};
use crate::transforms::reject_non_positive;
use crate::warehouse::Warehouse;

pub const SECTORS: [&str; 7] = [
    "Industry",
    "Commercial",
    "Public Sector",
    "Domestic",
    "Transport",
    "Agriculture",
    "LULUCF",
];

struct MockAuthority {
    name: &'static str,
    code: &'static str,
    population: f64,
    area_km2: f64,
    /// kt CO2e per sector in the base year, in [`SECTORS`] order.
    base: [f64; 7],
}

static WECA: [MockAuthority; 4] = [
    MockAuthority {
        name: "Bath and North East Somerset",
        code: "E06000022",
        population: 193_000.0,
        area_km2: 346.0,
        base: [150.0, 120.0, 45.0, 380.0, 420.0, 25.0, -15.0],
    },
    MockAuthority {
        name: "Bristol",
        code: "E06000023",
        population: 463_000.0,
        area_km2: 110.0,
        base: [580.0, 650.0, 180.0, 890.0, 920.0, 10.0, -35.0],
    },
    MockAuthority {
        name: "South Gloucestershire",
        code: "E06000025",
        population: 285_000.0,
        area_km2: 497.0,
        base: [420.0, 290.0, 95.0, 580.0, 680.0, 45.0, -25.0],
    },
    MockAuthority {
        name: "North Somerset",
        code: "E06000024",
        population: 215_000.0,
        area_km2: 374.0,
        base: [210.0, 180.0, 65.0, 450.0, 520.0, 55.0, -20.0],
    },
];

/// (name, base-year kt CO2e, population, area km²)
const COMBINED_AUTHORITIES: [(&str, f64, f64, f64); 10] = [
    ("West of England", 4200.0, 960_000.0, 953.0),
    ("Greater Manchester", 12_500.0, 2_850_000.0, 1276.0),
    ("West Midlands", 11_800.0, 2_920_000.0, 902.0),
    ("Liverpool City Region", 6800.0, 1_550_000.0, 725.0),
    ("South Yorkshire", 5900.0, 1_410_000.0, 1552.0),
    ("West Yorkshire", 9200.0, 2_350_000.0, 1772.0),
    ("Tees Valley", 4800.0, 680_000.0, 800.0),
    ("North East", 5200.0, 1_150_000.0, 2080.0),
    ("Cambridgeshire & Peterborough", 4500.0, 860_000.0, 3389.0),
    ("East Midlands", 8500.0, 2_200_000.0, 2900.0),
];

const ENGLAND_TOTAL: f64 = 320_000.0;
const ENGLAND_POPULATION: f64 = 56_500_000.0;
const ENGLAND_AREA_KM2: f64 = 130_279.0;

/// Floor on the mock emissions decline, so long ranges stay positive.
const MIN_YEAR_FACTOR: f64 = 0.1;

/// Fewer rows than this from the CA comparison query means the lookup is incomplete.
const MIN_CA_ROWS: usize = 10;

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Stable across toolchains: built from the year and table positions only.
fn seed_for(year: i32, la: usize, sector: usize) -> u64 {
    let year = u64::try_from(year).unwrap_or_default();
    year * 100 + la as u64 * SECTORS.len() as u64 + sector as u64
}

pub fn mock_local_authorities() -> PolarsResult<DataFrame> {
    df!(
        "la_code" => WECA.iter().map(|la| la.code).collect::<Vec<_>>(),
        "la_name" => WECA.iter().map(|la| la.name).collect::<Vec<_>>(),
        "region" => vec!["South West"; WECA.len()],
        "population" => WECA.iter().map(|la| la.population as i64).collect::<Vec<_>>(),
    )
}

/// Emissions for the four WECA authorities, declining 3 % a year towards
/// `end_year` with a deterministic ±5 % wobble per (year, LA, sector).
/// The decline bottoms out at a tenth of the base year.
///
/// `local_authorities` are names; empty lists do not restrict.
pub fn mock_emissions(
    start_year: i32,
    end_year: i32,
    local_authorities: &[String],
    sectors: &[String],
) -> PolarsResult<DataFrame> {
    let mut years = Vec::new();
    let mut names = Vec::new();
    let mut sector_names = Vec::new();
    let mut totals = Vec::new();
    let mut per_capita = Vec::new();
    let mut per_km2 = Vec::new();

    let las: Vec<(usize, &MockAuthority)> = WECA
        .iter()
        .enumerate()
        .filter(|(_, la)| {
            local_authorities.is_empty() || local_authorities.iter().any(|n| n == la.name)
        })
        .collect();
    let wanted: Vec<(usize, &str)> = SECTORS
        .iter()
        .enumerate()
        .filter(|(_, s)| sectors.is_empty() || sectors.iter().any(|w| w == *s))
        .map(|(i, s)| (i, *s))
        .collect();

    for year in start_year..=end_year {
        let year_factor = (1.0 - 0.03 * f64::from(end_year - year)).max(MIN_YEAR_FACTOR);
        for (la_idx, la) in &las {
            for (idx, sector) in &wanted {
                let mut rng = StdRng::seed_from_u64(seed_for(year, *la_idx, *idx));
                let total = la.base[*idx] * year_factor * rng.gen_range(0.95..=1.05);
                years.push(i64::from(year));
                names.push(la.name);
                sector_names.push(*sector);
                totals.push(round_to(total, 2));
                per_capita.push(round_to(total * 1000.0 / la.population, 2));
                per_km2.push(round_to(total * 1000.0 / la.area_km2, 2));
            }
        }
    }

    df!(
        "calendar_year" => years,
        "la_name" => names,
        "sector" => sector_names,
        "total_emissions" => totals,
        "per_capita" => per_capita,
        "per_km2" => per_km2,
    )
}

/// Typical publication lags: emissions two years behind, EPCs one.
pub fn mock_data_freshness(current_year: i32) -> DataFreshness {
    DataFreshness {
        emissions: Some(current_year - 2),
        epc_domestic: Some(current_year - 1),
        epc_non_domestic: Some(current_year - 1),
    }
}

/// West of England totals 2014-2023.
pub fn mock_ca_emissions() -> PolarsResult<DataFrame> {
    const BASE_YEAR: i32 = 2023;
    const BASE_TOTAL: f64 = 4200.0;
    const POPULATION: f64 = 941_000.0;

    let years: Vec<i32> = (2014..=BASE_YEAR).collect();
    let totals: Vec<f64> = years
        .iter()
        .map(|y| BASE_TOTAL * (1.0 - 0.03 * f64::from(BASE_YEAR - y)))
        .collect();
    df!(
        "calendar_year" => years.iter().map(|y| i64::from(*y)).collect::<Vec<_>>(),
        "ca_name" => vec!["West of England"; years.len()],
        "total_emissions" => totals.iter().map(|t| round_to(*t, 2)).collect::<Vec<_>>(),
        "per_capita" => totals.iter().map(|t| round_to(t * 1000.0 / POPULATION, 2)).collect::<Vec<_>>(),
    )
}

/// Ten Combined Authorities, higher emissions in earlier years.
pub fn mock_ca_comparison(min_year: i32, max_year: i32) -> PolarsResult<DataFrame> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut names = Vec::new();
    let mut years = Vec::new();
    let mut totals = Vec::new();
    let mut per_capita = Vec::new();
    let mut per_km2 = Vec::new();
    let mut populations = Vec::new();
    let mut areas = Vec::new();

    for (name, base, population, area) in COMBINED_AUTHORITIES {
        for year in min_year..=max_year {
            let year_factor = 1.0 + 0.03 * f64::from(max_year - year);
            let total = base * year_factor * rng.gen_range(0.97..=1.03);
            names.push(name);
            years.push(i64::from(year));
            totals.push(round_to(total, 1));
            per_capita.push(round_to(total * 1000.0 / population, 2));
            per_km2.push(round_to(total * 1000.0 / area, 1));
            populations.push(population as i64);
            areas.push(area);
        }
    }

    df!(
        "ca_name" => names,
        "calendar_year" => years,
        "total_emissions" => totals,
        "per_capita" => per_capita,
        "per_km2" => per_km2,
        "population" => populations,
        "area_km2" => areas,
    )
}

pub fn mock_england_average(min_year: i32, max_year: i32) -> PolarsResult<DataFrame> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut years = Vec::new();
    let mut totals = Vec::new();
    let mut per_capita = Vec::new();
    let mut per_km2 = Vec::new();

    for year in min_year..=max_year {
        let year_factor = 1.0 + 0.028 * f64::from(max_year - year);
        let total = ENGLAND_TOTAL * year_factor * rng.gen_range(0.98..=1.02);
        years.push(i64::from(year));
        totals.push(round_to(total, 1));
        per_capita.push(round_to(total * 1000.0 / ENGLAND_POPULATION, 2));
        per_km2.push(round_to(total * 1000.0 / ENGLAND_AREA_KM2, 1));
    }

    df!(
        "region" => vec!["England"; years.len()],
        "calendar_year" => years,
        "total_emissions" => totals,
        "per_capita" => per_capita,
        "per_km2" => per_km2,
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataSource {
    Warehouse,
    Mock { reason: String },
}

/// A loaded value tagged with where it came from.
#[derive(Clone, Debug)]
pub struct Loaded<T> {
    pub data: T,
    pub source: DataSource,
}

impl<T> Loaded<T> {
    fn warehouse(data: T) -> Self {
        Self {
            data,
            source: DataSource::Warehouse,
        }
    }

    fn mock(data: T, reason: impl Into<String>) -> Self {
        Self {
            data,
            source: DataSource::Mock {
                reason: reason.into(),
            },
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self.source, DataSource::Mock { .. })
    }

    /// Notice to show the user when sample data is being displayed.
    pub fn banner(&self) -> Option<String> {
        match &self.source {
            DataSource::Warehouse => None,
            DataSource::Mock { reason } => Some(format!(
                "Using mock data. Database connection failed: {reason}\n\
                 Showing sample West of England data. To use real data, make sure \
                 MotherDuck is reachable and MOTHERDUCK_TOKEN is set to a valid token."
            )),
        }
    }
}

/// Reads `ladcd`/`ladnm`/`cauthcd`/`cauthnm` rows from the LA lookup frame.
pub fn local_authorities_from_frame(df: &DataFrame) -> PolarsResult<Vec<LocalAuthority>> {
    let text = |name: &str| -> PolarsResult<Vec<Option<String>>> {
        if !df.get_column_names().contains(&name) {
            return Ok(vec![None; df.height()]);
        }
        Ok(df
            .column(name)?
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect())
    };
    let codes = text("ladcd")?;
    let names = text("ladnm")?;
    let ca_codes = text("cauthcd")?;
    let ca_names = text("cauthnm")?;

    Ok(codes
        .into_iter()
        .zip(names)
        .zip(ca_codes.into_iter().zip(ca_names))
        .filter_map(|((code, name), (ca_code, ca_name))| {
            Some(LocalAuthority {
                code: code?,
                name: name?,
                combined_authority_code: ca_code,
                combined_authority_name: ca_name,
            })
        })
        .collect())
}

/// Renames warehouse columns to the dashboard schema and derives the
/// `total_emissions`, `per_capita` and `per_km2` metrics.
///
/// A zero, negative or null population or area is an error, never `inf`.
fn standardise_emissions(mut df: DataFrame) -> Result<DataFrame, LoadError> {
    const EMISSIONS: &str = "territorial_emissions_kt_co2e";
    const POPULATION: &str = "mid_year_population_thousands";
    const AREA: &str = "area_km2";

    let has = |df: &DataFrame, name: &str| df.get_column_names().contains(&name);
    if has(&df, "local_authority") {
        df.rename("local_authority", "la_name")?;
    }
    if has(&df, "la_ghg_sector") {
        df.rename("la_ghg_sector", "sector")?;
    }
    if !has(&df, EMISSIONS) {
        return Ok(df);
    }

    let emissions = || col(EMISSIONS).cast(DataType::Float64);
    let mut derived = vec![emissions().alias("total_emissions")];
    if has(&df, POPULATION) {
        reject_non_positive(&df, POPULATION)?;
        derived.push(
            (emissions() * lit(1000.0)
                / (col(POPULATION).cast(DataType::Float64) * lit(1000.0)))
            .alias("per_capita"),
        );
    }
    if has(&df, AREA) {
        reject_non_positive(&df, AREA)?;
        derived.push(
            (emissions() * lit(1000.0) / col(AREA).cast(DataType::Float64)).alias("per_km2"),
        );
    }
    Ok(df.lazy().with_columns(derived).collect()?)
}

async fn load_emissions<W: Warehouse>(
    loader: &Loader<W>,
    filter: &EmissionsFilter,
) -> Result<DataFrame, LoadError> {
    let mut by_code = filter.clone();
    if !filter.local_authorities.is_empty() {
        let lookup = local_authorities_from_frame(&loader.local_authorities().await?)?;
        let codes: HashMap<&str, &str> = lookup
            .iter()
            .map(|la| (la.name.as_str(), la.code.as_str()))
            .collect();
        // Unknown names are passed through, so codes work too.
        by_code.local_authorities = filter
            .local_authorities
            .iter()
            .map(|n| codes.get(n.as_str()).map_or_else(|| n.clone(), |c| c.to_string()))
            .collect();
    }
    standardise_emissions(loader.emissions(&by_code).await?)
}

/// Emissions filtered by LA *names*, falling back to [`mock_emissions`] when
/// the warehouse is unreachable.
pub async fn emissions_with_fallback<W: Warehouse>(
    loader: &Loader<W>,
    filter: &EmissionsFilter,
) -> Result<Loaded<DataFrame>, LoadError> {
    if let (Some(start), Some(end)) = (filter.start_year, filter.end_year) {
        if start > end {
            return Err(LoadError::InvalidFilter(format!(
                "start year {start} is after end year {end}"
            )));
        }
    }
    match load_emissions(loader, filter).await {
        Ok(df) => Ok(Loaded::warehouse(df)),
        Err(err) if err.is_connection_failure() => {
            warn!(error = %err, "serving mock emissions");
            let df = mock_emissions(
                filter.start_year.unwrap_or(2014),
                filter.end_year.unwrap_or(2023),
                &filter.local_authorities,
                &filter.sectors,
            )?;
            Ok(Loaded::mock(df, err.to_string()))
        }
        Err(err) => Err(err),
    }
}

pub async fn local_authorities_with_fallback<W: Warehouse>(
    loader: &Loader<W>,
) -> Result<Loaded<DataFrame>, LoadError> {
    match loader.local_authorities().await {
        Ok(mut df) => {
            if df.get_column_names().contains(&"ladnm") {
                df.rename("ladnm", "la_name")?;
            }
            if df.get_column_names().contains(&"ladcd") {
                df.rename("ladcd", "la_code")?;
            }
            Ok(Loaded::warehouse(df))
        }
        Err(err) if err.is_connection_failure() => {
            warn!(error = %err, "serving mock local authorities");
            Ok(Loaded::mock(mock_local_authorities()?, err.to_string()))
        }
        Err(err) => Err(err),
    }
}

pub async fn data_freshness_with_fallback<W: Warehouse>(
    loader: &Loader<W>,
) -> Result<Loaded<DataFreshness>, LoadError> {
    match loader.data_freshness().await {
        Ok(freshness) => Ok(Loaded::warehouse(freshness)),
        Err(err) if err.is_connection_failure() => {
            warn!(error = %err, "serving mock data freshness");
            let year = chrono::Local::now().year();
            Ok(Loaded::mock(mock_data_freshness(year), err.to_string()))
        }
        Err(err) => Err(err),
    }
}

/// CA comparison; an unreachable warehouse or a lookup too sparse to compare
/// against both yield [`mock_ca_comparison`] for 2005-2023.
pub async fn ca_comparison_with_fallback<W: Warehouse>(
    loader: &Loader<W>,
) -> Result<Loaded<DataFrame>, LoadError> {
    let reason = match loader.ca_comparison().await {
        Ok(df) if df.height() >= MIN_CA_ROWS => return Ok(Loaded::warehouse(df)),
        Ok(df) => format!(
            "comparison query returned {} rows, at least {MIN_CA_ROWS} needed",
            df.height()
        ),
        Err(err) if err.is_connection_failure() => err.to_string(),
        Err(err) => return Err(err),
    };
    warn!(reason = %reason, "serving mock CA comparison");
    Ok(Loaded::mock(mock_ca_comparison(2005, 2023)?, reason))
}

pub async fn england_average_with_fallback<W: Warehouse>(
    loader: &Loader<W>,
    min_year: i32,
    max_year: i32,
) -> Result<Loaded<DataFrame>, LoadError> {
    let reason = match loader.england_average().await {
        Ok(df) if df.height() > 0 => return Ok(Loaded::warehouse(df)),
        Ok(_) => "no England rows in the emissions table".to_string(),
        Err(err) if err.is_connection_failure() => err.to_string(),
        Err(err) => return Err(err),
    };
    warn!(reason = %reason, "serving mock England average");
    Ok(Loaded::mock(mock_england_average(min_year, max_year)?, reason))
}
