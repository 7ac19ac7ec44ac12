//! End-to-end curve number run: load, compute, write.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::assign::{assign_curve_numbers, AssignmentReport};
use crate::config::CnConfig;
use crate::crs::Crs;
use crate::dissolve::{dissolve_by_cn, DissolvedLayer};
use crate::error::{CnError, Result};
use crate::layer::{read_geojson, write_geojson, PolygonLayer};
use crate::lookup::{LookupSource, LookupTable};
use crate::overlay::{intersect_layers, IntersectionLayer};
use crate::preprocess::{preprocess_landuse, preprocess_soil, LandUseReport, SoilReport};
use crate::raster::{rasterize, write_color_ramp, write_geotiff, RasterGrid};
use crate::stats::{cn_distribution, global_statistics, DistributionRow, GlobalStatistics};
use crate::zonal::{write_zonal_csv, zonal_statistics, zonal_statistics_from_path, ZonalRecord};

pub const POLYGONS_FILE: &str = "cn_polygons.geojson";
pub const RASTER_FILE: &str = "cn_raster.tif";
pub const COLOR_RAMP_FILE: &str = "cn_raster.clr";
pub const STATISTICS_FILE: &str = "cn_statistics.json";
pub const WATERSHED_FILE: &str = "watershed_statistics.csv";

/// Where the curve numbers come from.
#[derive(Debug, Clone)]
pub enum LookupChoice {
    Nlcd,
    Csv(PathBuf),
    Table(LookupTable),
}

impl LookupChoice {
    fn load(&self) -> Result<LookupTable> {
        match self {
            LookupChoice::Nlcd => Ok(LookupTable::builtin()),
            LookupChoice::Csv(path) => LookupTable::from_csv(path),
            LookupChoice::Table(table) => Ok(table.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CnRequest {
    pub soil: Option<PathBuf>,
    pub landuse: Option<PathBuf>,
    pub lookup: Option<LookupChoice>,
    pub watersheds: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Non-fatal data-quality findings collected across stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub soil: SoilReport,
    pub landuse: LandUseReport,
    pub assignment: AssignmentReport,
}

impl Diagnostics {
    pub fn missing_hydgroup_count(&self) -> usize {
        self.soil.invalid_count
    }

    pub fn has_warnings(&self) -> bool {
        self.soil.invalid_count > 0 || self.landuse.uncoercible_count > 0 || self.assignment.unassigned > 0
    }
}

#[derive(Debug, Clone)]
pub struct CnResult {
    pub intersections: IntersectionLayer,
    pub dissolved: DissolvedLayer,
    pub raster: RasterGrid,
    pub statistics: GlobalStatistics,
    pub distribution: Vec<DistributionRow>,
    pub zonal: Option<Vec<ZonalRecord>>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CnOutputs {
    pub polygons: PathBuf,
    pub raster: PathBuf,
    pub color_ramp: PathBuf,
    pub statistics: PathBuf,
    pub watershed_statistics: Option<PathBuf>,
}

#[derive(Serialize)]
struct StatisticsDocument<'a> {
    crs: String,
    cell_size: f64,
    lookup: String,
    global: &'a GlobalStatistics,
    distribution: &'a [DistributionRow],
    diagnostics: &'a Diagnostics,
}

pub struct CnPipeline {
    config: CnConfig,
    crs: Crs,
}

impl CnPipeline {
    pub fn new(config: CnConfig) -> Result<Self> {
        config.validate()?;
        let crs = config.crs()?;
        Ok(CnPipeline { config, crs })
    }

    pub fn config(&self) -> &CnConfig {
        &self.config
    }

    /// Runs every stage on in-memory layers; nothing is written.
    pub fn compute(&self, soil: &PolygonLayer, landuse: &PolygonLayer, lookup: &LookupTable) -> Result<CnResult> {
        let hydgrp_field = self.config.hydgrp_field.as_str();
        let code_field = self.config.code_field.as_str();

        info!("Preprocessing soil data...");
        let (soil, soil_report) =
            preprocess_soil(soil, &self.crs, hydgrp_field, &self.config.replacements()?)?;
        info!("Preprocessing land use data...");
        let (landuse, landuse_report) = preprocess_landuse(landuse, &self.crs, code_field)?;

        let mut intersections = intersect_layers(&soil, &landuse, hydgrp_field, code_field)?;
        info!("Assigning curve numbers...");
        let assignment = assign_curve_numbers(&mut intersections, lookup, hydgrp_field, code_field);

        let dissolved = dissolve_by_cn(&intersections)?;
        info!("Creating CN raster...");
        let raster = rasterize(&dissolved, self.config.cell_size, None)?;

        let diagnostics = Diagnostics {
            soil: soil_report,
            landuse: landuse_report,
            assignment,
        };
        let statistics = global_statistics(&dissolved, diagnostics.missing_hydgroup_count());
        let distribution = cn_distribution(&dissolved);

        Ok(CnResult {
            intersections,
            dissolved,
            raster,
            statistics,
            distribution,
            zonal: None,
            diagnostics,
        })
    }

    fn watershed_field(&self) -> Result<&str> {
        self.config
            .watershed_field
            .as_deref()
            .ok_or_else(|| CnError::InvalidInput("watershed layer given without a watershed field".into()))
    }

    pub fn zonal_statistics(&self, raster: &RasterGrid, zones: &PolygonLayer) -> Result<Vec<ZonalRecord>> {
        zonal_statistics(raster, zones, self.watershed_field()?, self.config.use_parallel)
    }

    /// Loads the request's inputs, computes and writes the output bundle.
    ///
    /// Output files appear in `output_dir` only when every stage succeeded;
    /// on failure no file of this run is left behind.
    pub fn run(&self, request: &CnRequest) -> Result<(CnResult, CnOutputs)> {
        let soil_path = request
            .soil
            .as_ref()
            .ok_or_else(|| CnError::MissingInput("soil layer".into()))?;
        let landuse_path = request
            .landuse
            .as_ref()
            .ok_or_else(|| CnError::MissingInput("land use layer".into()))?;
        let lookup = request
            .lookup
            .as_ref()
            .ok_or_else(|| {
                CnError::InvalidLookup("use the built-in NLCD table or provide a custom lookup CSV".into())
            })?
            .load()?;
        let zones_field = match request.watersheds {
            Some(_) => Some(self.watershed_field()?),
            None => None,
        };

        info!("Loading soil data from {}", soil_path.display());
        let soil = read_geojson(soil_path)?;
        info!("Loading land use data from {}", landuse_path.display());
        let landuse = read_geojson(landuse_path)?;
        let zones = match &request.watersheds {
            Some(path) => {
                info!("Loading watershed boundaries from {}", path.display());
                Some(read_geojson(path)?)
            }
            None => None,
        };

        let mut result = self.compute(&soil, &landuse, &lookup)?;

        let dir = &request.output_dir;
        fs::create_dir_all(dir).map_err(|e| CnError::io(dir, e))?;
        let mut staging = Staging::default();

        let polygons = staging.stage(dir.join(POLYGONS_FILE));
        write_geojson(&polygons, &result.dissolved.to_polygon_layer())?;

        let raster = staging.stage(dir.join(RASTER_FILE));
        write_geotiff(&raster, &result.raster)?;
        let color_ramp = staging.stage(dir.join(COLOR_RAMP_FILE));
        write_color_ramp(&color_ramp, &result.raster.color_ramp)?;

        if let (Some(zones), Some(field)) = (&zones, zones_field) {
            let records = zonal_statistics_from_path(&raster, zones, field, self.config.use_parallel)?;
            let csv = staging.stage(dir.join(WATERSHED_FILE));
            write_zonal_csv(&csv, &records, field)?;
            result.zonal = Some(records);
        }

        let statistics = staging.stage(dir.join(STATISTICS_FILE));
        self.write_statistics(&statistics, &result, &lookup)?;

        staging.commit()?;
        if result.diagnostics.has_warnings() {
            warn!("Run finished with data-quality warnings; see {}", STATISTICS_FILE);
        }
        info!("Outputs written to {}", dir.display());

        let outputs = CnOutputs {
            polygons: dir.join(POLYGONS_FILE),
            raster: dir.join(RASTER_FILE),
            color_ramp: dir.join(COLOR_RAMP_FILE),
            statistics: dir.join(STATISTICS_FILE),
            watershed_statistics: result.zonal.as_ref().map(|_| dir.join(WATERSHED_FILE)),
        };
        Ok((result, outputs))
    }

    fn write_statistics(&self, path: &Path, result: &CnResult, lookup: &LookupTable) -> Result<()> {
        let document = StatisticsDocument {
            crs: self.crs.to_string(),
            cell_size: self.config.cell_size,
            lookup: match lookup.source() {
                LookupSource::Nlcd => "NLCD".to_string(),
                LookupSource::Csv(name) => name.clone(),
            },
            global: &result.statistics,
            distribution: &result.distribution,
            diagnostics: &result.diagnostics,
        };
        let file = File::create(path).map_err(|e| CnError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &document)
            .map_err(|e| CnError::io(path, e.into()))?;
        writer.flush().map_err(|e| CnError::io(path, e))
    }
}

// Output files written under a temporary name, renamed on commit
#[derive(Default)]
struct Staging {
    files: Vec<(PathBuf, PathBuf)>, // (staged, final)
    committed: bool,
}

impl Staging {
    fn stage(&mut self, target: PathBuf) -> PathBuf {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let staged = target.with_file_name(name);
        self.files.push((staged.clone(), target));
        staged
    }

    fn commit(mut self) -> Result<()> {
        for (i, (staged, target)) in self.files.iter().enumerate() {
            if let Err(e) = fs::rename(staged, target) {
                for (_, done) in &self.files[..i] {
                    let _ = fs::remove_file(done);
                }
                return Err(CnError::io(target, e));
            }
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (staged, _) in &self.files {
            let _ = fs::remove_file(staged);
        }
    }
}
