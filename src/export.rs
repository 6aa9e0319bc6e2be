//! In-memory exports for download.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use polars::prelude::*;
use rust_xlsxwriter::{Workbook, XlsxError};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to export to {format}: {source}")]
    Frame {
        format: &'static str,
        source: PolarsError,
    },
    #[error("failed to export to excel: {0}")]
    Excel(#[from] XlsxError),
    #[error("failed to export to json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown export format `{0}`, expected csv, parquet, json or excel")]
    UnknownFormat(String),
    #[error("unknown parquet compression `{0}`")]
    UnknownCompression(String),
    #[error("invalid JSON orient `{0}`, must be records or columns")]
    UnknownOrient(String),
}

fn frame_error(format: &'static str) -> impl Fn(PolarsError) -> ExportError {
    move |source| ExportError::Frame { format, source }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Csv,
    Parquet,
    Json,
    Excel,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Csv,
        ExportFormat::Parquet,
        ExportFormat::Json,
        ExportFormat::Excel,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Parquet => "parquet",
            ExportFormat::Json => "json",
            ExportFormat::Excel => "xlsx",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExportFormat::Csv => "CSV",
            ExportFormat::Parquet => "Parquet",
            ExportFormat::Json => "JSON",
            ExportFormat::Excel => "Excel",
        }
    }

    pub fn mime_type(self) -> &'static str {
        mime_type_for(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "parquet" => Ok(ExportFormat::Parquet),
            "json" => Ok(ExportFormat::Json),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            _ => Err(ExportError::UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// MIME type from a file name's extension; unknown extensions are binary.
pub fn mime_type_for(filename: &str) -> &'static str {
    let extension = filename.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match extension.as_str() {
        "csv" => "text/csv",
        "json" => "application/json",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

pub fn to_csv(df: &DataFrame, include_header: bool) -> Result<Vec<u8>, ExportError> {
    let mut df = df.clone();
    let mut buf = Vec::new();
    CsvWriter::new(&mut buf)
        .include_header(include_header)
        .finish(&mut df)
        .map_err(frame_error("csv"))?;
    Ok(buf)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParquetCodec {
    #[default]
    Snappy,
    Gzip,
    Brotli,
    Lz4,
    Zstd,
    Uncompressed,
}

impl ParquetCodec {
    fn compression(self) -> ParquetCompression {
        match self {
            ParquetCodec::Snappy => ParquetCompression::Snappy,
            ParquetCodec::Gzip => ParquetCompression::Gzip(None),
            ParquetCodec::Brotli => ParquetCompression::Brotli(None),
            ParquetCodec::Lz4 => ParquetCompression::Lz4Raw,
            ParquetCodec::Zstd => ParquetCompression::Zstd(None),
            ParquetCodec::Uncompressed => ParquetCompression::Uncompressed,
        }
    }
}

impl FromStr for ParquetCodec {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snappy" => Ok(ParquetCodec::Snappy),
            "gzip" => Ok(ParquetCodec::Gzip),
            "brotli" => Ok(ParquetCodec::Brotli),
            "lz4" => Ok(ParquetCodec::Lz4),
            "zstd" => Ok(ParquetCodec::Zstd),
            "uncompressed" => Ok(ParquetCodec::Uncompressed),
            other => Err(ExportError::UnknownCompression(other.to_string())),
        }
    }
}

pub fn to_parquet(df: &DataFrame, codec: ParquetCodec) -> Result<Vec<u8>, ExportError> {
    let mut df = df.clone();
    let mut buf = Cursor::new(Vec::new());
    ParquetWriter::new(&mut buf)
        .with_compression(codec.compression())
        .finish(&mut df)
        .map_err(frame_error("parquet"))?;
    Ok(buf.into_inner())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JsonOrient {
    /// `[{"col": value, ...}, ...]`
    #[default]
    Records,
    /// `{"col": [values], ...}`
    Columns,
}

impl FromStr for JsonOrient {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "records" => Ok(JsonOrient::Records),
            "columns" => Ok(JsonOrient::Columns),
            other => Err(ExportError::UnknownOrient(other.to_string())),
        }
    }
}

pub(crate) fn json_value(value: AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::Int8(v) => v.into(),
        AnyValue::Int16(v) => v.into(),
        AnyValue::Int32(v) => v.into(),
        AnyValue::Int64(v) => v.into(),
        AnyValue::UInt8(v) => v.into(),
        AnyValue::UInt16(v) => v.into(),
        AnyValue::UInt32(v) => v.into(),
        AnyValue::UInt64(v) => v.into(),
        AnyValue::Float32(v) => f64::from(v).into(),
        AnyValue::Float64(v) => v.into(),
        other => Value::String(other.to_string()),
    }
}

pub(crate) fn column_values(series: &Series) -> Vec<Value> {
    series.rechunk().iter().map(json_value).collect()
}

pub fn to_json(df: &DataFrame, orient: JsonOrient, pretty: bool) -> Result<Vec<u8>, ExportError> {
    if orient == JsonOrient::Records && !pretty {
        let mut df = df.clone();
        let mut buf = Vec::new();
        JsonWriter::new(&mut buf)
            .with_json_format(JsonFormat::Json)
            .finish(&mut df)
            .map_err(frame_error("json"))?;
        return Ok(buf);
    }

    let columns: Vec<(String, Vec<Value>)> = df
        .get_columns()
        .iter()
        .map(|s| (s.name().to_string(), column_values(s)))
        .collect();
    let value = match orient {
        JsonOrient::Columns => Value::Object(
            columns
                .into_iter()
                .map(|(name, values)| (name, Value::Array(values)))
                .collect(),
        ),
        JsonOrient::Records => Value::Array(
            (0..df.height())
                .map(|row| {
                    let record: Map<String, Value> = columns
                        .iter()
                        .map(|(name, values)| (name.clone(), values[row].clone()))
                        .collect();
                    Value::Object(record)
                })
                .collect(),
        ),
    };
    let bytes = if pretty {
        serde_json::to_vec_pretty(&value)?
    } else {
        serde_json::to_vec(&value)?
    };
    Ok(bytes)
}

/// One worksheet per frame, header row first, columns autofitted.
pub fn to_excel(sheets: &[(&str, &DataFrame)]) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    for (name, df) in sheets {
        let sheet = workbook.add_worksheet();
        sheet.set_name(*name)?;
        for (idx, series) in df.get_columns().iter().enumerate() {
            let col = idx as u16;
            sheet.write_string(0, col, series.name())?;
            for (r, value) in series.rechunk().iter().enumerate() {
                let row = r as u32 + 1;
                match value {
                    AnyValue::Null => {}
                    AnyValue::Boolean(b) => {
                        sheet.write_boolean(row, col, b)?;
                    }
                    AnyValue::String(s) => {
                        sheet.write_string(row, col, s)?;
                    }
                    v if v.dtype().is_numeric() => {
                        if let Some(n) = v.extract::<f64>() {
                            sheet.write_number(row, col, n)?;
                        }
                    }
                    other => {
                        sheet.write_string(row, col, other.to_string())?;
                    }
                }
            }
        }
        sheet.autofit();
    }
    Ok(workbook.save_to_buffer()?)
}

/// Bytes ready for download with their file name and MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportFile {
    pub filename: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

/// Exports with each format's defaults: header row, snappy, compact records,
/// single `Data` sheet.
pub fn export(
    df: &DataFrame,
    format: ExportFormat,
    base_filename: &str,
) -> Result<ExportFile, ExportError> {
    let bytes = match format {
        ExportFormat::Csv => to_csv(df, true)?,
        ExportFormat::Parquet => to_parquet(df, ParquetCodec::default())?,
        ExportFormat::Json => to_json(df, JsonOrient::Records, false)?,
        ExportFormat::Excel => to_excel(&[("Data", df)])?,
    };
    Ok(ExportFile {
        filename: format!("{base_filename}.{}", format.extension()),
        mime: format.mime_type(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emissions() -> DataFrame {
        df!(
            "la_name" => ["Bristol", "Bath and North East Somerset"],
            "calendar_year" => [2023i64, 2023],
            "total_emissions" => [Some(880.5), None],
        )
        .unwrap()
    }

    #[test]
    fn csv_with_and_without_header() {
        let csv = String::from_utf8(to_csv(&emissions(), true).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("la_name,calendar_year,total_emissions"));
        assert_eq!(lines.next(), Some("Bristol,2023,880.5"));

        let bare = String::from_utf8(to_csv(&emissions(), false).unwrap()).unwrap();
        assert!(bare.starts_with("Bristol"));
        assert_eq!(bare.lines().count(), 2);
    }

    #[test]
    fn parquet_reads_back() {
        let bytes = to_parquet(&emissions(), ParquetCodec::Zstd).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");
        let back = ParquetReader::new(Cursor::new(bytes)).finish().unwrap();
        assert!(back.equals_missing(&emissions()));
    }

    #[test]
    fn compression_names() {
        assert_eq!("brotli".parse::<ParquetCodec>().unwrap(), ParquetCodec::Brotli);
        assert!(matches!(
            "lzo".parse::<ParquetCodec>(),
            Err(ExportError::UnknownCompression(_))
        ));
    }

    #[test]
    fn json_orientations() {
        let records: Value =
            serde_json::from_slice(&to_json(&emissions(), JsonOrient::Records, false).unwrap())
                .unwrap();
        assert_eq!(records.as_array().unwrap().len(), 2);
        assert_eq!(records[0]["la_name"], "Bristol");
        assert!(records[1]["total_emissions"].is_null());

        let columns = to_json(&emissions(), JsonOrient::Columns, false).unwrap();
        let text = String::from_utf8(columns).unwrap();
        assert!(text.starts_with("{\"la_name\":[\"Bristol\""));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["calendar_year"], serde_json::json!([2023, 2023]));

        let pretty = String::from_utf8(to_json(&emissions(), JsonOrient::Records, true).unwrap())
            .unwrap();
        assert!(pretty.contains("\n  {"));
        assert!("rows".parse::<JsonOrient>().is_err());
    }

    #[test]
    fn excel_workbook_is_a_zip() {
        let totals = df!("sector" => ["Transport"], "total" => [1290.0]).unwrap();
        let bytes = to_excel(&[("Emissions", &emissions()), ("Totals", &totals)]).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn export_names_and_mime_types() {
        let file = export(&emissions(), ExportFormat::Excel, "emissions_2023").unwrap();
        assert_eq!(file.filename, "emissions_2023.xlsx");
        assert_eq!(
            file.mime,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );

        for format in ExportFormat::ALL {
            let file = export(&emissions(), format, "out").unwrap();
            assert!(!file.bytes.is_empty(), "{} produced no bytes", format.label());
        }
        assert_eq!("XLSX".parse::<ExportFormat>().unwrap(), ExportFormat::Excel);
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_type_for("report.CSV"), "text/csv");
        assert_eq!(mime_type_for("map.htm"), "text/html");
        assert_eq!(mime_type_for("data.parquet"), "application/octet-stream");
        assert_eq!(mime_type_for("noextension"), "application/octet-stream");
    }
}
