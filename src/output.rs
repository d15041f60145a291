//! Result reports.
//!
//! One row per (region, device), ordered by thread index and then by region
//! definition order. Energy is in microjoules, time in microseconds.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::region::Region;
use crate::region_store::RegionStores;

pub const HEADER: [&str; 10] = [
    "thread",
    "region_idf",
    "file",
    "line",
    "function",
    "visits",
    "device_name",
    "device_type",
    "energy",
    "time",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => bail!("Unknown output format '{}', expected csv or json", other),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRow {
    pub thread: usize,
    pub region_idf: String,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub visits: u64,
    pub device_name: String,
    pub device_type: &'static str,
    pub energy: u64,
    pub time: u64,
}

/// Rows of a single region.
pub fn region_rows(thread: usize, region: &Region) -> Vec<OutputRow> {
    region.with_data(|data| {
        data.measurements
            .iter()
            .map(|m| OutputRow {
                thread,
                region_idf: data.idf.clone(),
                file: data.location.file.clone(),
                line: data.location.line,
                function: data.location.function.clone(),
                visits: data.visits,
                device_name: m.device.name().to_string(),
                device_type: m.device.kind().as_str(),
                energy: m.energy_result,
                time: m.time_result,
            })
            .collect()
    })
}

pub fn collect_rows(stores: &RegionStores) -> Vec<OutputRow> {
    let mut rows = Vec::new();
    // The closure never fails.
    let _ = stores.try_for_each(|thread, region| {
        rows.extend(region_rows(thread, region));
        Ok(())
    });
    rows
}

pub fn write_rows<W: Write>(rows: &[OutputRow], format: OutputFormat, writer: W) -> Result<()> {
    match format {
        OutputFormat::Csv => {
            let mut wtr = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(writer);
            wtr.write_record(HEADER)?;
            for row in rows {
                wtr.serialize(row)?;
            }
            wtr.flush()?;
        }
        OutputFormat::Json => {
            let mut writer = writer;
            serde_json::to_writer_pretty(&mut writer, rows)?;
            writeln!(writer)?;
            writer.flush()?;
        }
    }
    Ok(())
}

/// Path of the report for process `pid`.
pub fn results_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("output.EMA.{}", pid))
}

/// Write the report of all stores to `output.EMA.<pid>` in `dir`.
pub fn write_results(stores: &RegionStores, format: OutputFormat, dir: &Path) -> Result<PathBuf> {
    let path = results_path(dir, std::process::id());
    let file = File::create(&path)
        .with_context(|| format!("Failed to create results file {}", path.display()))?;
    write_rows(&collect_rows(stores), format, BufWriter::new(file))
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
    tracing::info!("Wrote results to {}", path.display());
    Ok(path)
}
