use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn offline_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("mca-data");
    cmd.env_remove("MOTHERDUCK_TOKEN").env("RUST_LOG", "off");
    cmd
}

#[test]
fn check_code_accepts_bristol() {
    offline_cmd()
        .args(["check-code", "E06000023"])
        .assert()
        .success()
        .stdout(predicate::str::contains("E06000023: valid LA code"));
}

#[test]
fn check_code_rejects_malformed_codes() {
    offline_cmd()
        .args(["check-code", "E0600023"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a valid LA code"));

    offline_cmd()
        .args(["check-code", "N00000001", "--kind", "lsoa", "--year", "2011"])
        .assert()
        .failure();

    offline_cmd()
        .args(["check-code", "bs1 1aa", "--kind", "postcode"])
        .assert()
        .success();
}

#[test]
fn check_code_rejects_unknown_census_year() {
    offline_cmd()
        .args(["check-code", "E01014540", "--kind", "lsoa", "--year", "2001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("2011 or 2021"));
}

#[test]
fn emissions_fall_back_to_mock_data() {
    offline_cmd()
        .args(["emissions", "--start-year", "2022", "--end-year", "2023", "--la", "Bristol"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "calendar_year,la_name,sector,total_emissions",
        ))
        .stdout(predicate::str::contains("Bristol,Transport"))
        .stderr(predicate::str::contains("mock data"));
}

#[test]
fn emissions_per_capita_to_parquet_file() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("emissions.parquet");
    offline_cmd()
        .args(["emissions", "--per-capita", "--format", "parquet", "--output"])
        .arg(&out)
        .assert()
        .success();
    let bytes = std::fs::read(&out).unwrap();
    assert_eq!(&bytes[..4], b"PAR1");
}

#[test]
fn binary_formats_need_an_output_path() {
    offline_cmd()
        .args(["emissions", "--format", "excel"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--output is required"));
}

#[test]
fn inverted_year_range_is_not_masked_by_mock_data() {
    offline_cmd()
        .args(["emissions", "--start-year", "2023", "--end-year", "2019", "--la", "Bristol"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("start year 2023 is after end year 2019"));
}

#[test]
fn freshness_reports_mock_years_offline() {
    offline_cmd()
        .arg("freshness")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"emissions\""))
        .stderr(predicate::str::contains("MOTHERDUCK_TOKEN"));
}

#[test]
fn boundaries_require_a_connection() {
    let dir = TempDir::new().unwrap();
    offline_cmd()
        .args(["boundaries", "--output"])
        .arg(dir.path().join("lsoa.geojson"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("MOTHERDUCK_TOKEN"));
}
