//! Data access for the West of England Combined Authority emissions dashboard.
//!
//! Loaders pull GHG emissions, EPC certificates, postcode lookups and LSOA
//! boundaries from a MotherDuck warehouse into polars frames, caching results
//! and falling back to sample data when the warehouse cannot be reached.
//! Transforms, validators and exporters operate on the loaded frames.

pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod fallback;
pub mod geography;
pub mod loaders;
pub mod query;
pub mod transforms;
pub mod validators;
pub mod warehouse;

pub use config::WarehouseConfig;
pub use error::LoadError;
pub use fallback::{DataSource, Loaded};
pub use loaders::{DataFreshness, EmissionsFilter, EpcFilter, Loader, PostcodeFilter};
pub use warehouse::{connect_or_offline, DuckDbWarehouse, OfflineWarehouse, Warehouse};
