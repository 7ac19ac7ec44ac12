//! Per-zone (watershed) statistics over the CN raster.

use std::fs::File;
use std::io;
use std::path::Path;

use polars::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CnError, Result};
use crate::layer::{Feature, PolygonLayer};
use crate::raster::{read_geotiff, RasterGrid};
use crate::stats::{mean, percentile_linear, population_std, round2};

/// Statistics of the valid cells of one zone, rounded to 2 dp.
///
/// A zone with no valid cells has `count == 0` and every other field `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZonalRecord {
    pub zone: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>, // Population standard deviation
    pub count: usize,
    pub sum: Option<f64>,
    pub cv: Option<f64>, // std / mean * 100
    pub range: Option<f64>,
}

impl ZonalRecord {
    fn from_values(zone: String, mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return ZonalRecord {
                zone,
                min: None,
                max: None,
                mean: None,
                median: None,
                std: None,
                count: 0,
                sum: None,
                cv: None,
                range: None,
            };
        }
        values.sort_by(f64::total_cmp);
        let min = values[0];
        let max = values[values.len() - 1];
        let avg = mean(&values);
        let std = population_std(&values);
        let cv = match (std, avg) {
            (Some(s), Some(m)) if m != 0.0 => Some(s / m * 100.0),
            _ => None,
        };
        ZonalRecord {
            zone,
            min: Some(round2(min)),
            max: Some(round2(max)),
            mean: avg.map(round2),
            median: percentile_linear(&values, 50.0).map(round2),
            std: std.map(round2),
            count: values.len(),
            sum: Some(round2(values.iter().sum())),
            cv: cv.map(round2),
            range: Some(round2(max - min)),
        }
    }
}

// Valid cells whose centers the zone covers
fn zone_values(grid: &RasterGrid, zone: &Feature) -> Vec<f64> {
    let mut values = Vec::new();
    for (row, start, end) in grid.spans(&zone.geometry) {
        let cells = &grid.data[row * grid.width + start..row * grid.width + end];
        values.extend(cells.iter().filter(|&&v| v != grid.nodata).map(|&v| v as f64));
    }
    values
}

/// One record per zone, in zone-layer order.
///
/// Zones are reprojected to the raster CRS first. Cell attribution uses the
/// same half-open cell-center rule as rasterization, so adjacent zones never
/// share a cell. The raster no-data value is excluded.
pub fn zonal_statistics(
    grid: &RasterGrid,
    zones: &PolygonLayer,
    zone_field: &str,
    parallel: bool,
) -> Result<Vec<ZonalRecord>> {
    if zones.is_empty() {
        return Err(CnError::InvalidInput("watershed layer has no zones".into()));
    }
    if !zones.has_field(zone_field) {
        return Err(CnError::InvalidInput(format!(
            "watershed field '{zone_field}' not found in watershed layer"
        )));
    }
    info!("Calculating zonal statistics for watersheds...");
    let zones = if zones.crs.equivalent(&grid.crs) {
        zones.clone()
    } else {
        info!("Reprojecting watersheds from {} to {}", zones.crs, grid.crs);
        zones.reprojected(&grid.crs)?
    };

    let compute = |zone: &Feature| {
        ZonalRecord::from_values(zone.attr(zone_field).to_string(), zone_values(grid, zone))
    };
    let records: Vec<ZonalRecord> = if parallel {
        zones.features.par_iter().map(compute).collect()
    } else {
        zones.features.iter().map(compute).collect()
    };

    let empty = records.iter().filter(|r| r.count == 0).count();
    if empty > 0 {
        warn!("{} watersheds contain no valid raster cells", empty);
    }
    info!("Calculated statistics for {} watersheds", records.len());
    Ok(records)
}

pub fn zonal_statistics_from_path(
    raster_path: impl AsRef<Path>,
    zones: &PolygonLayer,
    zone_field: &str,
    parallel: bool,
) -> Result<Vec<ZonalRecord>> {
    let grid = read_geotiff(raster_path)?;
    zonal_statistics(&grid, zones, zone_field, parallel)
}

/// Zonal records as a table whose first column is named after the zone field.
pub fn zonal_table(records: &[ZonalRecord], zone_field: &str) -> Result<DataFrame> {
    let column = |f: fn(&ZonalRecord) -> Option<f64>| records.iter().map(f).collect::<Vec<_>>();
    df! {
        zone_field => records.iter().map(|r| r.zone.as_str()).collect::<Vec<_>>(),
        "min" => column(|r| r.min),
        "max" => column(|r| r.max),
        "mean" => column(|r| r.mean),
        "median" => column(|r| r.median),
        "std" => column(|r| r.std),
        "count" => records.iter().map(|r| r.count as u64).collect::<Vec<_>>(),
        "sum" => column(|r| r.sum),
        "cv" => column(|r| r.cv),
        "range" => column(|r| r.range),
    }
    .map_err(|e| CnError::InvalidInput(format!("cannot build zonal table: {e}")))
}

pub fn write_zonal_csv(path: impl AsRef<Path>, records: &[ZonalRecord], zone_field: &str) -> Result<()> {
    let path = path.as_ref();
    let mut df = zonal_table(records, zone_field)?;
    let mut file = File::create(path).map_err(|e| CnError::io(path, e))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)
        .map_err(|e| CnError::io(path, io::Error::other(e.to_string())))
}
