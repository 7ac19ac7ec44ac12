use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::crs::Crs;
use crate::error::{CnError, Result};
use crate::lookup::HydroGroup;
use crate::preprocess::DualGroupReplacements;

// Letters used for A/D, B/D and C/D soils
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Replacements {
    pub ad: String,
    pub bd: String,
    pub cd: String,
}

impl Default for Replacements {
    fn default() -> Self {
        Replacements {
            ad: "D".into(),
            bd: "D".into(),
            cd: "D".into(),
        }
    }
}

/// Run parameters, readable from TOML.
///
/// ```toml
/// crs_epsg = 32615
/// cell_size = 30.0
/// hydgrp_field = "hydgrpdcd"
/// code_field = "gridcode"
///
/// [replacements]
/// ad = "D"
/// bd = "C"
/// cd = "D"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CnConfig {
    pub crs_epsg: u32,
    pub cell_size: f64, // Meters; converted to degrees under a geographic CRS
    pub hydgrp_field: String,
    pub code_field: String,
    pub replacements: Replacements,
    pub use_parallel: bool, // Only per-zone statistics run in parallel
    pub watershed_field: Option<String>,
}

impl Default for CnConfig {
    fn default() -> Self {
        CnConfig {
            crs_epsg: 4326,
            cell_size: 30.0,
            hydgrp_field: "hydgrpdcd".into(),
            code_field: "gridcode".into(),
            replacements: Replacements::default(),
            use_parallel: true,
            watershed_field: None,
        }
    }
}

impl CnConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CnConfig = toml::from_str(text).map_err(|e| CnError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| CnError::io(path, e))?;
        CnConfig::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(CnError::InvalidInput(format!(
                "cell size must be a positive number, got {}",
                self.cell_size
            )));
        }
        if self.hydgrp_field.trim().is_empty() || self.code_field.trim().is_empty() {
            return Err(CnError::InvalidInput("attribute field names must not be empty".into()));
        }
        if matches!(&self.watershed_field, Some(f) if f.trim().is_empty()) {
            return Err(CnError::InvalidInput("watershed field name must not be empty".into()));
        }
        self.crs()?;
        self.replacements()?;
        Ok(())
    }

    pub fn crs(&self) -> Result<Crs> {
        Crs::from_epsg(self.crs_epsg)
    }

    pub fn replacements(&self) -> Result<DualGroupReplacements> {
        let letter = |code: &str, value: &str| {
            HydroGroup::parse(value).ok_or_else(|| {
                CnError::InvalidInput(format!("replacement for {code} must be one of A, B, C, D, got '{value}'"))
            })
        };
        Ok(DualGroupReplacements::new(
            letter("A/D", &self.replacements.ad)?,
            letter("B/D", &self.replacements.bd)?,
            letter("C/D", &self.replacements.cd)?,
        ))
    }
}
