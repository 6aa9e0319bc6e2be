use std::collections::HashMap;

use geojson::{feature, Feature, FeatureCollection, GeoJson, Geometry};
use polars::prelude::*;
use serde_json::Value;
use thiserror::Error;

use crate::export::column_values;

#[derive(Debug, Error)]
pub enum GeographyError {
    #[error("{frame} frame has no column `{column}`")]
    MissingColumn { frame: &'static str, column: String },
    #[error("invalid geometry for {code}: {message}")]
    InvalidGeometry { code: String, message: String },
    #[error("{code} appears more than once in the values frame")]
    DuplicateCode { code: String },
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

fn require(df: &DataFrame, frame: &'static str, column: &str) -> Result<(), GeographyError> {
    if df.get_column_names().contains(&column) {
        Ok(())
    } else {
        Err(GeographyError::MissingColumn {
            frame,
            column: column.to_string(),
        })
    }
}

fn strings(df: &DataFrame, column: &str) -> Result<Vec<Option<String>>, GeographyError> {
    Ok(df
        .column(column)?
        .cast(&DataType::String)?
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

fn parse_geometry(code: &str, text: &str) -> Result<Geometry, GeographyError> {
    let invalid = |message: String| GeographyError::InvalidGeometry {
        code: code.to_string(),
        message,
    };
    match text.parse::<GeoJson>().map_err(|e| invalid(e.to_string()))? {
        GeoJson::Geometry(geometry) => Ok(geometry),
        GeoJson::Feature(Feature {
            geometry: Some(geometry),
            ..
        }) => Ok(geometry),
        _ => Err(invalid("expected a GeoJSON geometry".to_string())),
    }
}

/// Turns boundary rows into map features, attaching `value_cols` from `values`
/// where `value_code_col` matches the boundary code.
///
/// Every boundary becomes exactly one feature; boundaries without a matching
/// value row get null properties.
pub fn boundaries_to_features(
    boundaries: &DataFrame,
    code_col: &str,
    geometry_col: &str,
    values: Option<&DataFrame>,
    value_code_col: &str,
    value_cols: &[&str],
) -> Result<FeatureCollection, GeographyError> {
    require(boundaries, "boundaries", code_col)?;
    require(boundaries, "boundaries", geometry_col)?;

    let mut lookup: HashMap<String, usize> = HashMap::new();
    let mut columns: Vec<(&str, Vec<Value>)> = Vec::new();
    if let Some(values) = values {
        require(values, "values", value_code_col)?;
        for column in value_cols {
            require(values, "values", column)?;
            columns.push((*column, column_values(values.column(column)?)));
        }
        for (row, code) in strings(values, value_code_col)?.into_iter().enumerate() {
            let Some(code) = code else { continue };
            if lookup.insert(code.clone(), row).is_some() {
                return Err(GeographyError::DuplicateCode { code });
            }
        }
    }

    let codes = strings(boundaries, code_col)?;
    let geometries = strings(boundaries, geometry_col)?;
    let mut features = Vec::with_capacity(codes.len());
    for (code, geometry) in codes.into_iter().zip(geometries) {
        let code = code.unwrap_or_default();
        let geometry = geometry
            .map(|text| parse_geometry(&code, &text))
            .transpose()?;
        let mut feature = Feature {
            bbox: None,
            geometry,
            id: Some(feature::Id::String(code.clone())),
            properties: None,
            foreign_members: None,
        };
        let row = lookup.get(&code).copied();
        feature.set_property(code_col, code);
        for (name, column) in &columns {
            let value = row.map_or(Value::Null, |r| column[r].clone());
            feature.set_property(*name, value);
        }
        features.push(feature);
    }

    Ok(features.into_iter().collect::<FeatureCollection>())
}
