//! Rasterization of the dissolved curve number layer and GeoTIFF I/O.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use geo::{MultiPolygon, Rect};
use nalgebra::{Matrix3, Vector3};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tracing::{info, warn};

use crate::crs::Crs;
use crate::dissolve::DissolvedLayer;
use crate::error::{CnError, Result};

pub const NODATA: u8 = 0;
pub const METERS_PER_DEGREE: f64 = 111_000.0; // Fixed approximation, no latitude correction
const FALLBACK_DIMENSION: usize = 100;
const MAX_CELLS: usize = 500_000_000;
const GDAL_NODATA_TAG: u16 = 42113;

// GeoKey ids
const GT_MODEL_TYPE: u32 = 1024;
const GT_RASTER_TYPE: u32 = 1025;
const GEOGRAPHIC_TYPE: u32 = 2048;
const PROJECTED_CS_TYPE: u32 = 3072;

/// Affine pixel -> world mapping, north-up.
///
/// `(col, row, 1)` maps to `(x, y, 1)`; pixel (0, 0) is the top-left corner
/// of the top-left cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    matrix: Matrix3<f64>,
}

impl GeoTransform {
    #[rustfmt::skip]
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        GeoTransform {
            matrix: Matrix3::new(
                pixel_width, 0.0, origin_x,
                0.0, -pixel_height, origin_y,
                0.0, 0.0, 1.0,
            ),
        }
    }

    // Pixel size follows the extent, as rasterio's `from_bounds` does
    pub fn from_bounds(bounds: &Rect<f64>, width: usize, height: usize) -> Self {
        GeoTransform::new(
            bounds.min().x,
            bounds.max().y,
            bounds.width() / width as f64,
            bounds.height() / height as f64,
        )
    }

    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let w = self.matrix * Vector3::new(col, row, 1.0);
        (w.x, w.y)
    }

    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let inverse = self.matrix.try_inverse()?;
        let p = inverse * Vector3::new(x, y, 1.0);
        Some((p.x, p.y))
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.matrix[(0, 0)], -self.matrix[(1, 1)])
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.matrix[(0, 2)], self.matrix[(1, 2)])
    }
}

/// RGBA colors for CN classes; index is the cell value.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorRamp {
    colors: Vec<[u8; 4]>, // 0..=100
}

impl ColorRamp {
    pub fn cn_default() -> Self {
        let colors = (0..=100u8)
            .map(|cn| match cn {
                0 => [0, 0, 0, 0],
                1..=29 => [0, 0, 255, 255],
                30..=49 => [100, 150, 255, 255],
                50..=69 => [255, 255, 0, 255],
                70..=84 => [255, 165, 0, 255],
                _ => [255, 0, 0, 255],
            })
            .collect();
        ColorRamp { colors }
    }

    pub fn color_for(&self, value: u8) -> [u8; 4] {
        self.colors.get(value as usize).copied().unwrap_or([0, 0, 0, 0])
    }

    // Esri .clr text: "value R G B" for every non-transparent entry
    pub fn to_clr(&self) -> String {
        self.colors
            .iter()
            .enumerate()
            .filter(|(_, c)| c[3] > 0)
            .map(|(v, c)| format!("{} {} {} {}\n", v, c[0], c[1], c[2]))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RasterGrid {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>, // Row-major, row 0 at the top
    pub transform: GeoTransform,
    pub crs: Crs,
    pub nodata: u8,
    pub color_ramp: ColorRamp,
}

impl RasterGrid {
    pub fn get(&self, col: usize, row: usize) -> Option<u8> {
        (col < self.width && row < self.height).then(|| self.data[row * self.width + col])
    }

    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        self.transform.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5)
    }

    pub fn bounds(&self) -> Rect<f64> {
        let (x0, y0) = self.transform.pixel_to_world(0.0, 0.0);
        let (x1, y1) = self.transform.pixel_to_world(self.width as f64, self.height as f64);
        Rect::new((x0, y0), (x1, y1))
    }

    pub fn valid_cells(&self) -> usize {
        self.data.iter().filter(|&&v| v != self.nodata).count()
    }

    /// Cell runs covered by `geometry` as `(row, first col, end col)`, end exclusive.
    ///
    /// Scanline fill over the cell-center line of each row with the even-odd
    /// half-open crossing rule: a center lying on an edge shared by two
    /// polygons belongs to exactly one of them.
    pub(crate) fn spans(&self, geometry: &MultiPolygon<f64>) -> Vec<(usize, usize, usize)> {
        let (ox, oy) = self.transform.origin();
        let (px, py) = self.transform.pixel_size();
        if !(px > 0.0 && py > 0.0) || self.width == 0 || self.height == 0 {
            return Vec::new();
        }
        let last_row = self.height as f64 - 1.0;
        let row_y = |row: usize| oy - (row as f64 + 0.5) * py;

        // x of every edge crossing, bucketed by row
        let mut crossings: Vec<Vec<f64>> = vec![Vec::new(); self.height];
        let rings = geometry
            .0
            .iter()
            .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors()));
        for ring in rings {
            for line in ring.lines() {
                let (a, b) = (line.start, line.end);
                if a.y == b.y {
                    continue;
                }
                let lo = ((oy - a.y.max(b.y)) / py - 0.5).floor().max(0.0);
                let hi = ((oy - a.y.min(b.y)) / py - 0.5).ceil().min(last_row);
                if !(lo <= hi) {
                    continue;
                }
                for row in lo as usize..=hi as usize {
                    let y = row_y(row);
                    if (a.y > y) != (b.y > y) {
                        crossings[row].push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
                    }
                }
            }
        }

        let cols = self.width as f64;
        let mut spans = Vec::new();
        for (row, xs) in crossings.iter_mut().enumerate() {
            xs.sort_by(f64::total_cmp);
            for pair in xs.chunks_exact(2) {
                // Centers in [x0, x1)
                let start = ((pair[0] - ox) / px - 0.5).ceil().clamp(0.0, cols);
                let end = ((pair[1] - ox) / px - 0.5).ceil().clamp(0.0, cols);
                if start < end {
                    spans.push((row, start as usize, end as usize));
                }
            }
        }
        spans
    }
}

// Cell size in the layer's map units; callers give meters
pub fn effective_cell_size(cell_size: f64, crs: &Crs) -> f64 {
    if crs.is_geographic() {
        cell_size / METERS_PER_DEGREE
    } else {
        cell_size
    }
}

/// Grid width and height for an extent, plus the cell size actually fitting it.
pub fn grid_dimensions(extent_width: f64, extent_height: f64, cell_size: f64) -> (usize, usize, f64) {
    let cols = (extent_width / cell_size).floor();
    let rows = (extent_height / cell_size).floor();
    let degenerate = !(extent_width > 0.0 && extent_height > 0.0);
    if degenerate || !cols.is_finite() || !rows.is_finite() {
        warn!("Calculated dimensions too small. Using minimum size.");
        let cell = (extent_width / FALLBACK_DIMENSION as f64).min(extent_height / FALLBACK_DIMENSION as f64);
        return (FALLBACK_DIMENSION, FALLBACK_DIMENSION, cell);
    }
    ((cols as usize).max(1), (rows as usize).max(1), cell_size)
}

/// Burns the dissolved layer into a CN grid.
///
/// A cell takes the CN of the polygon covering its center (half-open rule,
/// see [`RasterGrid::spans`]); later features overwrite earlier ones.
/// Uncovered cells hold [`NODATA`]. A zero-width or zero-height extent falls
/// back to a 100 x 100 grid that stays all no-data.
pub fn rasterize(layer: &DissolvedLayer, cell_size: f64, bounds: Option<Rect<f64>>) -> Result<RasterGrid> {
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return Err(CnError::InvalidInput(format!("cell size must be positive, got {cell_size}")));
    }
    let bounds = match bounds.or_else(|| layer.bounds()) {
        Some(b) => b,
        None => return Err(CnError::Geometry("dissolved layer has no extent to rasterize".into())),
    };
    let cell = effective_cell_size(cell_size, &layer.crs);
    if layer.crs.is_geographic() {
        info!("Converted cell size from {}m to {:.6} degrees for {}", cell_size, cell, layer.crs);
    }
    let (width, height, actual_cell) = grid_dimensions(bounds.width(), bounds.height(), cell);
    if width.saturating_mul(height) > MAX_CELLS {
        return Err(CnError::InvalidInput(format!(
            "raster of {width} x {height} cells is too large; increase the cell size"
        )));
    }
    info!("Raster dimensions: {} x {} pixels", width, height);
    info!("Actual cell size: {:.6} map units", actual_cell);

    let mut grid = RasterGrid {
        width,
        height,
        data: vec![NODATA; width * height],
        transform: GeoTransform::from_bounds(&bounds, width, height),
        crs: layer.crs,
        nodata: NODATA,
        color_ramp: ColorRamp::cn_default(),
    };

    for feature in &layer.features {
        if feature.cn == NODATA {
            warn!("CN 0 coincides with the raster no-data value and will read as uncovered");
        }
        for (row, start, end) in grid.spans(&feature.geometry) {
            grid.data[row * width + start..row * width + end].fill(feature.cn);
        }
    }
    Ok(grid)
}

// EPSG codes above u16 (900913) are stored under their official alias
fn geokey_epsg(crs: &Crs) -> u32 {
    match crs {
        Crs::WebMercator { .. } => 3857,
        other => other.epsg(),
    }
}

fn geokey_directory(crs: &Crs) -> Vec<u16> {
    let (model, cs_key) = if crs.is_geographic() {
        (2, GEOGRAPHIC_TYPE)
    } else {
        (1, PROJECTED_CS_TYPE)
    };
    let keys: [(u32, u32); 3] = [(GT_MODEL_TYPE, model), (GT_RASTER_TYPE, 1), (cs_key, geokey_epsg(crs))];
    let mut directory = vec![1, 1, 0, keys.len() as u16];
    for (key, value) in keys {
        directory.extend([key as u16, 0, 1, value as u16]);
    }
    directory
}

fn tiff_write_error(path: &Path, e: tiff::TiffError) -> CnError {
    match e {
        tiff::TiffError::IoError(io) => CnError::io(path, io),
        other => CnError::io(path, io::Error::other(other.to_string())),
    }
}

/// Writes a single-band 8-bit GeoTIFF with GDAL_NODATA = 0.
pub fn write_geotiff(path: impl AsRef<Path>, grid: &RasterGrid) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| CnError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    {
        let mut encoder = TiffEncoder::new(&mut writer).map_err(|e| tiff_write_error(path, e))?;
        let mut image = encoder
            .new_image::<colortype::Gray8>(grid.width as u32, grid.height as u32)
            .map_err(|e| tiff_write_error(path, e))?;

        let (px, py) = grid.transform.pixel_size();
        let (ox, oy) = grid.transform.origin();
        let geokeys = geokey_directory(&grid.crs);
        let nodata = grid.nodata.to_string();
        let tag_error = |e| tiff_write_error(path, e);
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &[px, py, 0.0][..])
            .map_err(tag_error)?;
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, ox, oy, 0.0][..])
            .map_err(tag_error)?;
        image
            .encoder()
            .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])
            .map_err(tag_error)?;
        image
            .encoder()
            .write_tag(Tag::Unknown(GDAL_NODATA_TAG), nodata.as_str())
            .map_err(tag_error)?;

        image.write_data(&grid.data).map_err(tag_error)?;
    }
    writer.flush().map_err(|e| CnError::io(path, e))
}

pub fn write_color_ramp(path: impl AsRef<Path>, ramp: &ColorRamp) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, ramp.to_clr()).map_err(|e| CnError::io(path, e))
}

/// Reads a GeoTIFF written by [`write_geotiff`] (or any north-up 8-bit GeoTIFF).
pub fn read_geotiff(path: impl AsRef<Path>) -> Result<RasterGrid> {
    let path = path.as_ref();
    let unreadable = |e: tiff::TiffError| CnError::unreadable(path, e);

    let file = File::open(path).map_err(|e| CnError::unreadable(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(unreadable)?;
    let (width, height) = decoder.dimensions().map_err(unreadable)?;
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).map_err(unreadable)?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).map_err(unreadable)?;
    let keys = decoder.get_tag_u32_vec(Tag::GeoKeyDirectoryTag).map_err(unreadable)?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(CnError::unreadable(path, "incomplete GeoTIFF georeferencing"));
    }

    let epsg = keys
        .get(4..)
        .unwrap_or_default()
        .chunks_exact(4)
        .find(|k| k[0] == PROJECTED_CS_TYPE || k[0] == GEOGRAPHIC_TYPE)
        .map(|k| k[3])
        .ok_or_else(|| CnError::unreadable(path, "GeoTIFF has no EPSG code"))?;
    let crs = Crs::from_epsg(epsg)?;

    let data = match decoder.read_image().map_err(unreadable)? {
        DecodingResult::U8(data) => data,
        _ => return Err(CnError::unreadable(path, "expected an 8-bit single band raster")),
    };
    if data.len() != width as usize * height as usize {
        return Err(CnError::unreadable(path, "expected a single band raster"));
    }

    // Tiepoint maps raster (i, j) to model (x, y)
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];

    Ok(RasterGrid {
        width: width as usize,
        height: height as usize,
        data,
        transform: GeoTransform::new(origin_x, origin_y, scale[0], scale[1]),
        crs,
        nodata: NODATA,
        color_ramp: ColorRamp::cn_default(),
    })
}
