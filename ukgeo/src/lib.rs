use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static LA_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[EWSN]\d{8}$").unwrap());
static LSOA_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([ESW]01\d{6}|N00\d{6})$").unwrap());
static MSOA_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([ESW]02\d{6}|N00\d{6})$").unwrap());
static POSTCODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,2}\d{1,2}[A-Z]?\d[A-Z]{2}$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeoError {
    #[error("year must be 2011 or 2021, got {0}")]
    InvalidCensusYear(i32),
    #[error("unknown code type `{0}`, expected one of la, lsoa, msoa")]
    UnknownCodeKind(String),
}

/// Census vintage of small-area geographies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CensusYear {
    Y2011,
    #[default]
    Y2021,
}

impl CensusYear {
    pub fn as_i32(self) -> i32 {
        match self {
            CensusYear::Y2011 => 2011,
            CensusYear::Y2021 => 2021,
        }
    }

    /// Warehouse table holding LSOA polygons for this vintage.
    pub fn lsoa_boundary_table(self) -> String {
        format!("lsoa_poly_{}_tbl", self.as_i32())
    }

    /// Code column of the boundary table, e.g. `LSOA2021CD`.
    pub fn lsoa_code_column(self) -> String {
        format!("LSOA{}CD", self.as_i32())
    }
}

impl TryFrom<i32> for CensusYear {
    type Error = GeoError;

    fn try_from(year: i32) -> Result<Self, Self::Error> {
        match year {
            2011 => Ok(CensusYear::Y2011),
            2021 => Ok(CensusYear::Y2021),
            other => Err(GeoError::InvalidCensusYear(other)),
        }
    }
}

impl fmt::Display for CensusYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Kinds of statistical geography code that can be format-checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeKind {
    La,
    Lsoa,
    Msoa,
}

impl CodeKind {
    pub fn is_valid(self, code: &str, year: CensusYear) -> bool {
        match self {
            CodeKind::La => validate_la_code(code),
            CodeKind::Lsoa => validate_lsoa_code(code, year),
            CodeKind::Msoa => validate_msoa_code(code, year),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CodeKind::La => "LA",
            CodeKind::Lsoa => "LSOA",
            CodeKind::Msoa => "MSOA",
        }
    }
}

impl FromStr for CodeKind {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "la" => Ok(CodeKind::La),
            "lsoa" => Ok(CodeKind::Lsoa),
            "msoa" => Ok(CodeKind::Msoa),
            _ => Err(GeoError::UnknownCodeKind(s.to_string())),
        }
    }
}

/// Levels of the LSOA → MSOA → LA → CA hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeographyLevel {
    Lsoa,
    Msoa,
    LocalAuthority,
    CombinedAuthority,
}

impl GeographyLevel {
    /// Column carrying this level's code in the postcode and CA lookups.
    pub fn code_column(self) -> &'static str {
        match self {
            GeographyLevel::Lsoa => "lsoa21cd",
            GeographyLevel::Msoa => "msoa21cd",
            GeographyLevel::LocalAuthority => "lad25cd",
            GeographyLevel::CombinedAuthority => "cauthcd",
        }
    }

    pub fn parent(self) -> Option<GeographyLevel> {
        match self {
            GeographyLevel::Lsoa => Some(GeographyLevel::Msoa),
            GeographyLevel::Msoa => Some(GeographyLevel::LocalAuthority),
            GeographyLevel::LocalAuthority => Some(GeographyLevel::CombinedAuthority),
            GeographyLevel::CombinedAuthority => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAuthority {
    // ladcd, e.g. E06000023 for Bristol
    pub code: String,
    pub name: String,
    pub combined_authority_code: Option<String>,
    pub combined_authority_name: Option<String>,
}

impl LocalAuthority {
    pub fn has_valid_code(&self) -> bool {
        validate_la_code(&self.code)
    }
}

/// One nation letter followed by exactly eight digits, e.g. `E06000023`.
pub fn validate_la_code(code: &str) -> bool {
    LA_CODE.is_match(code)
}

pub fn validate_lsoa_code(code: &str, year: CensusYear) -> bool {
    LSOA_CODE.is_match(code) && northern_ireland_allowed(code, year)
}

pub fn validate_msoa_code(code: &str, year: CensusYear) -> bool {
    MSOA_CODE.is_match(code) && northern_ireland_allowed(code, year)
}

// NI data zones (N00) were introduced with the 2021 census.
fn northern_ireland_allowed(code: &str, year: CensusYear) -> bool {
    !code.starts_with("N00") || year == CensusYear::Y2021
}

/// Checks the shape of a UK postcode; it does not check that it exists.
pub fn validate_postcode(postcode: &str) -> bool {
    let clean: String = postcode
        .chars()
        .filter(|c| *c != ' ')
        .collect::<String>()
        .to_ascii_uppercase();
    POSTCODE.is_match(&clean)
}
