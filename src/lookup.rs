/**
Curve number lookup tables.

Maps a (land-use code, hydrologic soil group) pair to an NRCS (formerly SCS)
runoff curve number for average antecedent moisture condition (AMC II).

Two sources are supported:
* the built-in NLCD table (HEC-HMS values for the 15 National Land Cover
  Database classes), and
* a user CSV with one row per land-use code: `LUValue,A,B,C,D` plus any
  extra columns (a `Description` column is kept when present).

A table is built once per run and never mutated afterwards.
*/
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use polars::prelude::*;
use tracing::info;

use crate::error::{CnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HydroGroup {
    A, // High infiltration
    B,
    C,
    D, // Low infiltration
}

impl HydroGroup {
    pub const ALL: [HydroGroup; 4] = [HydroGroup::A, HydroGroup::B, HydroGroup::C, HydroGroup::D];

    // Only the four single letters are valid; dual codes must be resolved first
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(HydroGroup::A),
            "B" => Some(HydroGroup::B),
            "C" => Some(HydroGroup::C),
            "D" => Some(HydroGroup::D),
            _ => None,
        }
    }

    pub fn letter(&self) -> &'static str {
        match self {
            HydroGroup::A => "A",
            HydroGroup::B => "B",
            HydroGroup::C => "C",
            HydroGroup::D => "D",
        }
    }
}

impl fmt::Display for HydroGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupSource {
    Nlcd,
    Csv(String),
}

#[derive(Debug, Clone)]
pub struct LookupTable {
    entries: BTreeMap<(i64, HydroGroup), u8>,
    descriptions: BTreeMap<i64, String>,
    source: LookupSource,
}

// NLCD class, description, CN for groups A..D
const NLCD_ROWS: [(i64, &str, [u8; 4]); 15] = [
    (11, "Open Water", [98, 98, 98, 98]),
    (21, "Developed, Open Space", [49, 69, 79, 84]),
    (22, "Developed, Low Intensity", [57, 72, 81, 86]),
    (23, "Developed, Medium Intensity", [61, 75, 83, 87]),
    (24, "Developed, High Intensity", [81, 88, 91, 93]),
    (31, "Barren Land (Rock/Sand/Clay)", [78, 86, 91, 93]),
    (41, "Deciduous Forest", [45, 66, 77, 83]),
    (42, "Evergreen Forest", [25, 55, 70, 77]),
    (43, "Mixed Forest", [36, 60, 73, 79]),
    (52, "Shrub/Scrub", [55, 72, 81, 86]),
    (71, "Grassland/Herbaceous", [50, 69, 79, 84]),
    (81, "Pasture/Hay", [49, 69, 79, 84]),
    (82, "Cultivated Crops", [67, 78, 85, 89]),
    (90, "Woody Wetlands", [30, 58, 71, 78]),
    (95, "Emergent Herbaceous Wetlands", [30, 58, 71, 78]),
];

impl LookupTable {
    pub fn builtin() -> Self {
        let mut entries = BTreeMap::new();
        let mut descriptions = BTreeMap::new();
        for (code, description, cns) in NLCD_ROWS {
            for (group, cn) in HydroGroup::ALL.into_iter().zip(cns) {
                entries.insert((code, group), cn);
            }
            descriptions.insert(code, description.to_string());
        }
        info!("Using NLCD (National Land Cover Database) lookup table");
        LookupTable {
            entries,
            descriptions,
            source: LookupSource::Nlcd,
        }
    }

    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))
            .and_then(|reader| reader.finish())
            .map_err(|e| {
                CnError::InvalidLookup(format!("cannot read {}: {e}", path.display()))
            })?;
        let table = Self::from_dataframe(&df, LookupSource::Csv(path.display().to_string()))?;
        info!("Loaded custom lookup table from {}", path.display());
        Ok(table)
    }

    pub(crate) fn from_dataframe(df: &DataFrame, source: LookupSource) -> Result<Self> {
        let codes = df
            .column("LUValue")
            .map_err(|_| CnError::InvalidLookup("lookup table has no 'LUValue' column".into()))?;
        let codes = whole_numbers(codes)?;

        let mut entries = BTreeMap::new();
        let mut group_columns = 0;
        for group in HydroGroup::ALL {
            let Ok(column) = df.column(group.letter()) else {
                continue;
            };
            group_columns += 1;
            let values = whole_numbers(column)?;
            for (row, (code, cn)) in codes.iter().zip(values).enumerate() {
                let (Some(code), Some(cn)) = (*code, cn) else {
                    continue;
                };
                if !(0..=100).contains(&cn) {
                    return Err(CnError::InvalidLookup(format!(
                        "row {}: CN {cn} for land use {code}, group {group} is outside 0-100",
                        row + 1
                    )));
                }
                entries.insert((code, group), cn as u8);
            }
        }
        if group_columns == 0 {
            return Err(CnError::InvalidLookup(
                "lookup table has none of the A, B, C, D columns".into(),
            ));
        }
        if entries.is_empty() {
            return Err(CnError::InvalidLookup("lookup table has no usable rows".into()));
        }

        let mut descriptions = BTreeMap::new();
        if let Ok(column) = df.column("Description") {
            if let Ok(text) = column.str() {
                for (code, description) in codes.iter().zip(text.into_iter()) {
                    if let (Some(code), Some(description)) = (*code, description) {
                        descriptions.insert(code, description.to_string());
                    }
                }
            }
        }

        Ok(LookupTable {
            entries,
            descriptions,
            source,
        })
    }

    pub fn get(&self, code: i64, group: HydroGroup) -> Option<u8> {
        self.entries.get(&(code, group)).copied()
    }

    pub fn description(&self, code: i64) -> Option<&str> {
        self.descriptions.get(&code).map(String::as_str)
    }

    pub fn source(&self) -> &LookupSource {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn land_use_codes(&self) -> BTreeSet<i64> {
        self.entries.keys().map(|(code, _)| *code).collect()
    }
}

// Integer view of a numeric column; fractional values are rejected, not truncated
fn whole_numbers(column: &Column) -> Result<Vec<Option<i64>>> {
    let invalid = |e: PolarsError| CnError::InvalidLookup(e.to_string());
    let floats = column.cast(&DataType::Float64).map_err(invalid)?;
    floats
        .f64()
        .map_err(invalid)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| match value {
            None => Ok(None),
            Some(v) if v.is_finite() && v.fract() == 0.0 => Ok(Some(v as i64)),
            Some(v) => Err(CnError::InvalidLookup(format!(
                "row {}: column {} value {v} is not a whole number",
                row + 1,
                column.name()
            ))),
        })
        .collect()
}
