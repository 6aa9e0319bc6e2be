use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use geojson::GeoJson;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ukgeo::{validate_postcode, CensusYear, CodeKind};

use mca_data::export::{export, ExportFormat};
use mca_data::fallback::{data_freshness_with_fallback, emissions_with_fallback};
use mca_data::geography::boundaries_to_features;
use mca_data::{connect_or_offline, DuckDbWarehouse, EmissionsFilter, Loader, Warehouse, WarehouseConfig};

#[derive(Parser)]
#[command(name = "mca-data")]
#[command(about = "Query West of England emissions, EPC and geography data")]
#[command(
    after_help = "Environment:\n  MOTHERDUCK_TOKEN     MotherDuck access token\n  MOTHERDUCK_DATABASE  Database name (default mca_data)\n  RUST_LOG             Log filter (default warn)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List warehouse tables.
    Tables,
    /// Emissions by local authority, year and sector.
    Emissions {
        #[arg(long)]
        start_year: Option<i32>,
        #[arg(long)]
        end_year: Option<i32>,
        /// Local authority name, e.g. "Bristol". Repeatable.
        #[arg(long = "la")]
        local_authorities: Vec<String>,
        #[arg(long = "sector")]
        sectors: Vec<String>,
        /// Report tonnes per person instead of kt totals.
        #[arg(long, default_value_t = false)]
        per_capita: bool,
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Latest year available in each dataset.
    Freshness,
    /// Check the format of a geography code or postcode.
    CheckCode {
        code: String,
        #[arg(long, value_enum, default_value_t = CodeArg::La)]
        kind: CodeArg,
        #[arg(long, default_value_t = 2021)]
        year: i32,
    },
    /// Export LSOA boundaries as GeoJSON.
    Boundaries {
        #[arg(long, default_value_t = 2021)]
        year: i32,
        /// Local authority code. Repeatable.
        #[arg(long = "la")]
        local_authorities: Vec<String>,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CodeArg {
    La,
    Lsoa,
    Msoa,
    Postcode,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = WarehouseConfig::from_env();

    match cli.command {
        Command::Tables => {
            let warehouse = DuckDbWarehouse::connect(&config)?;
            for table in warehouse.table_list().await? {
                println!("{table}");
            }
        }
        Command::Emissions {
            start_year,
            end_year,
            local_authorities,
            sectors,
            per_capita,
            format,
            output,
        } => {
            let loader = Loader::new(connect_or_offline(&config), config);
            let filter = EmissionsFilter {
                start_year,
                end_year,
                local_authorities,
                sectors,
            };
            let loaded = emissions_with_fallback(&loader, &filter).await?;
            if let Some(banner) = loaded.banner() {
                eprintln!("{banner}");
            }
            let metric = if per_capita { "per_capita" } else { "total_emissions" };
            let df = loaded
                .data
                .select(["calendar_year", "la_name", "sector", metric])
                .with_context(|| format!("emissions data has no `{metric}` column"))?;
            let file = export(&df, format, "emissions")?;
            write_output(&file.bytes, output.as_ref(), format)?;
        }
        Command::Freshness => {
            let loader = Loader::new(connect_or_offline(&config), config);
            let loaded = data_freshness_with_fallback(&loader).await?;
            if let Some(banner) = loaded.banner() {
                eprintln!("{banner}");
            }
            println!("{}", serde_json::to_string_pretty(&loaded.data)?);
        }
        Command::CheckCode { code, kind, year } => {
            let year = CensusYear::try_from(year)?;
            let (valid, label) = match kind {
                CodeArg::Postcode => (validate_postcode(&code), "postcode"),
                CodeArg::La => (CodeKind::La.is_valid(&code, year), CodeKind::La.label()),
                CodeArg::Lsoa => (CodeKind::Lsoa.is_valid(&code, year), CodeKind::Lsoa.label()),
                CodeArg::Msoa => (CodeKind::Msoa.is_valid(&code, year), CodeKind::Msoa.label()),
            };
            if !valid {
                bail!("{code} is not a valid {label} code");
            }
            println!("{code}: valid {label} code");
        }
        Command::Boundaries {
            year,
            local_authorities,
            output,
        } => {
            let year = CensusYear::try_from(year)?;
            let loader = Loader::new(DuckDbWarehouse::connect(&config)?, config);
            let boundaries = loader.lsoa_boundaries(year, &local_authorities).await?;
            let features = boundaries_to_features(
                &boundaries,
                &year.lsoa_code_column(),
                "geometry",
                None,
                "",
                &[],
            )?;
            let count = features.features.len();
            std::fs::write(&output, GeoJson::from(features).to_string())
                .with_context(|| format!("writing {}", output.display()))?;
            eprintln!("wrote {count} boundaries to {}", output.display());
        }
    }

    Ok(())
}

fn write_output(bytes: &[u8], output: Option<&PathBuf>, format: ExportFormat) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, bytes)
            .with_context(|| format!("writing {}", path.display()))?,
        None if matches!(format, ExportFormat::Csv | ExportFormat::Json) => {
            std::io::stdout().write_all(bytes)?;
        }
        None => bail!("--output is required for {} exports", format.label()),
    }
    Ok(())
}
