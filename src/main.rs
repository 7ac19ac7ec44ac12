//! Curve number CLI
//!
//! Overlays soil and land use polygons, assigns SCS curve numbers and writes
//! the dissolved layer, CN raster and statistics to an output directory.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use curve_number::{CnConfig, CnPipeline, CnRequest, LookupChoice};

#[derive(Parser)]
#[command(name = "curve_number", version)]
#[command(about = "Compute SCS curve numbers from soil and land use polygons", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline and write the output bundle
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Soil polygons (GeoJSON) with a hydrologic group field
    #[arg(long)]
    soil: PathBuf,

    /// Land use polygons (GeoJSON) with an integer land use code field
    #[arg(long)]
    landuse: PathBuf,

    /// Custom lookup table CSV (LUValue, A, B, C, D); built-in NLCD table if omitted
    #[arg(long)]
    lookup: Option<PathBuf>,

    /// TOML file with run parameters; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target CRS as an EPSG code
    #[arg(long)]
    crs: Option<u32>,

    /// Raster cell size in meters
    #[arg(long)]
    cell_size: Option<f64>,

    #[arg(long)]
    hydgrp_field: Option<String>,

    #[arg(long)]
    code_field: Option<String>,

    /// Replacement group for A/D soils
    #[arg(long)]
    replace_ad: Option<String>,

    /// Replacement group for B/D soils
    #[arg(long)]
    replace_bd: Option<String>,

    /// Replacement group for C/D soils
    #[arg(long)]
    replace_cd: Option<String>,

    /// Watershed polygons (GeoJSON) for zonal statistics
    #[arg(long, requires = "watershed_field")]
    watersheds: Option<PathBuf>,

    /// Field naming each watershed
    #[arg(long)]
    watershed_field: Option<String>,

    /// Compute zonal statistics sequentially
    #[arg(long)]
    no_parallel: bool,

    /// Output directory
    #[arg(long)]
    output: PathBuf,
}

impl RunArgs {
    fn config(&self) -> anyhow::Result<CnConfig> {
        let mut config = match &self.config {
            Some(path) => CnConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CnConfig::default(),
        };
        if let Some(crs) = self.crs {
            config.crs_epsg = crs;
        }
        if let Some(cell_size) = self.cell_size {
            config.cell_size = cell_size;
        }
        if let Some(field) = &self.hydgrp_field {
            config.hydgrp_field = field.clone();
        }
        if let Some(field) = &self.code_field {
            config.code_field = field.clone();
        }
        if let Some(letter) = &self.replace_ad {
            config.replacements.ad = letter.clone();
        }
        if let Some(letter) = &self.replace_bd {
            config.replacements.bd = letter.clone();
        }
        if let Some(letter) = &self.replace_cd {
            config.replacements.cd = letter.clone();
        }
        if self.watershed_field.is_some() {
            config.watershed_field = self.watershed_field.clone();
        }
        if self.no_parallel {
            config.use_parallel = false;
        }
        Ok(config)
    }

    fn request(&self) -> CnRequest {
        CnRequest {
            soil: Some(self.soil.clone()),
            landuse: Some(self.landuse.clone()),
            lookup: Some(match &self.lookup {
                Some(path) => LookupChoice::Csv(path.clone()),
                None => LookupChoice::Nlcd,
            }),
            watersheds: self.watersheds.clone(),
            output_dir: self.output.clone(),
        }
    }
}

fn run(args: &RunArgs) -> anyhow::Result<()> {
    let pipeline = CnPipeline::new(args.config()?)?;
    let (result, outputs) = pipeline.run(&args.request())?;

    let stats = &result.statistics;
    println!("Curve numbers computed");
    println!("  Unique CN values:   {}", stats.unique_values);
    if let (Some(min), Some(max)) = (stats.min, stats.max) {
        println!("  CN range:           {min:.0} - {max:.0}");
    }
    if let Some(mean) = stats.weighted_mean {
        println!("  Area-weighted CN:   {mean:.2}");
    }
    println!("  Total area:         {:.2} ha", stats.total_area_ha);
    if stats.missing_hydgroup_count > 0 {
        println!("  Invalid hydrologic groups: {}", stats.missing_hydgroup_count);
    }
    if result.diagnostics.assignment.unassigned > 0 {
        println!(
            "  Polygons without CN: {}",
            result.diagnostics.assignment.unassigned
        );
    }
    if let Some(zones) = &result.zonal {
        println!("  Watersheds:         {}", zones.len());
    }
    println!("Outputs:");
    println!("  {}", outputs.polygons.display());
    println!("  {}", outputs.raster.display());
    println!("  {}", outputs.color_ramp.display());
    println!("  {}", outputs.statistics.display());
    if let Some(path) = &outputs.watershed_statistics {
        println!("  {}", path.display());
    }
    Ok(())
}

fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Command::Run(args) => run(args),
    };
    if let Err(e) = outcome {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
