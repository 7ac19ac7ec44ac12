pub mod assign;
pub mod config;
pub mod crs;
pub mod dissolve;
pub mod error;
pub mod layer;
pub mod lookup;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
pub mod raster;
pub mod stats;
pub mod zonal;

pub use config::CnConfig;
pub use crs::Crs;
pub use error::{CnError, ErrorKind, Result};
pub use layer::{read_geojson, write_geojson, AttrValue, Feature, PolygonLayer};
pub use lookup::{HydroGroup, LookupTable};
pub use pipeline::{CnOutputs, CnPipeline, CnRequest, CnResult, Diagnostics, LookupChoice};
pub use preprocess::DualGroupReplacements;
pub use raster::RasterGrid;
pub use stats::{GlobalStatistics, RunoffPotential};
pub use zonal::ZonalRecord;
