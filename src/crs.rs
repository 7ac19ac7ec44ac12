//! Coordinate reference systems and reprojection.
//!
//! Supports the systems soil and land cover deliveries actually arrive in:
//! geographic lon/lat, Web Mercator and UTM zones. Projections are the
//! closed-form WGS84 formulas (Snyder, USGS PP 1395); NAD83 and ETRS89
//! variants are treated as WGS84-equivalent.

use std::f64::consts::{FRAC_PI_4, PI};
use std::fmt;

use geo::{Coord, MapCoords, MultiPolygon};

use crate::error::{CnError, Result};

const WGS84_A: f64 = 6_378_137.0; // Semi-major axis [m]
const WGS84_F: f64 = 1.0 / 298.257_223_563; // Flattening [-]
const UTM_K0: f64 = 0.9996; // Central meridian scale factor [-]
const UTM_FALSE_EASTING: f64 = 500_000.0; // [m]
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0; // [m]
const MERCATOR_MAX_LAT: f64 = 85.051_128_78; // [deg]

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Degrees,
    Meters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    Geographic { epsg: u32 },
    WebMercator { epsg: u32 },
    Utm { epsg: u32, zone: u8, north: bool },
}

impl Crs {
    pub const WGS84: Crs = Crs::Geographic { epsg: 4326 };

    pub fn from_epsg(epsg: u32) -> Result<Self> {
        let crs = match epsg {
            4326 | 4269 | 4258 => Crs::Geographic { epsg },
            3857 | 900913 => Crs::WebMercator { epsg },
            32601..=32660 => Crs::Utm { epsg, zone: (epsg - 32600) as u8, north: true },
            32701..=32760 => Crs::Utm { epsg, zone: (epsg - 32700) as u8, north: false },
            26901..=26923 => Crs::Utm { epsg, zone: (epsg - 26900) as u8, north: true },
            25828..=25838 => Crs::Utm { epsg, zone: (epsg - 25800) as u8, north: true },
            _ => {
                return Err(CnError::Geometry(format!(
                    "unsupported CRS EPSG:{epsg} (expected geographic, Web Mercator or UTM)"
                )));
            }
        };
        Ok(crs)
    }

    // Parses "EPSG:3857", "urn:ogc:def:crs:EPSG::3857", "urn:ogc:def:crs:OGC:1.3:CRS84"
    pub fn from_name(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        if trimmed.ends_with("CRS84") {
            return Ok(Crs::WGS84);
        }
        let code = trimmed
            .rsplit(':')
            .next()
            .and_then(|c| c.trim().parse::<u32>().ok())
            .ok_or_else(|| CnError::Geometry(format!("unrecognised CRS name '{name}'")))?;
        Crs::from_epsg(code)
    }

    pub fn epsg(&self) -> u32 {
        match *self {
            Crs::Geographic { epsg } | Crs::WebMercator { epsg } | Crs::Utm { epsg, .. } => epsg,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Geographic { .. })
    }

    pub fn units(&self) -> Units {
        if self.is_geographic() {
            Units::Degrees
        } else {
            Units::Meters
        }
    }

    // Same coordinate space, regardless of datum alias
    pub fn equivalent(&self, other: &Crs) -> bool {
        match (self, other) {
            (Crs::Geographic { .. }, Crs::Geographic { .. }) => true,
            (Crs::WebMercator { .. }, Crs::WebMercator { .. }) => true,
            (
                Crs::Utm { zone: za, north: na, .. },
                Crs::Utm { zone: zb, north: nb, .. },
            ) => za == zb && na == nb,
            _ => false,
        }
    }

    fn to_lonlat(&self, c: Coord<f64>) -> Coord<f64> {
        match *self {
            Crs::Geographic { .. } => c,
            Crs::WebMercator { .. } => mercator_inverse(c),
            Crs::Utm { zone, north, .. } => utm_inverse(c, zone, north),
        }
    }

    fn from_lonlat(&self, c: Coord<f64>) -> Coord<f64> {
        match *self {
            Crs::Geographic { .. } => c,
            Crs::WebMercator { .. } => mercator_forward(c),
            Crs::Utm { zone, north, .. } => utm_forward(c, zone, north),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

pub fn transform_coord(from: &Crs, to: &Crs, c: Coord<f64>) -> Result<Coord<f64>> {
    if from.equivalent(to) {
        return Ok(c);
    }
    let out = to.from_lonlat(from.to_lonlat(c));
    if out.x.is_finite() && out.y.is_finite() {
        Ok(out)
    } else {
        Err(CnError::Geometry(format!(
            "coordinate ({}, {}) cannot be reprojected from {from} to {to}",
            c.x, c.y
        )))
    }
}

pub fn reproject_multipolygon(
    geometry: &MultiPolygon<f64>,
    from: &Crs,
    to: &Crs,
) -> Result<MultiPolygon<f64>> {
    if from.equivalent(to) {
        return Ok(geometry.clone());
    }
    geometry.try_map_coords(|c| transform_coord(from, to, c))
}

fn mercator_forward(c: Coord<f64>) -> Coord<f64> {
    let lat = c.y.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT).to_radians();
    Coord {
        x: WGS84_A * c.x.to_radians(),
        y: WGS84_A * (FRAC_PI_4 + lat / 2.0).tan().ln(),
    }
}

fn mercator_inverse(c: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (c.x / WGS84_A).to_degrees(),
        y: (2.0 * (c.y / WGS84_A).exp().atan() - PI / 2.0).to_degrees(),
    }
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

struct Ellipsoid {
    e2: f64,  // First eccentricity squared
    ep2: f64, // Second eccentricity squared
}

impl Ellipsoid {
    fn wgs84() -> Self {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        Ellipsoid {
            e2,
            ep2: e2 / (1.0 - e2),
        }
    }

    // Meridional arc length from the equator to latitude phi [m]
    fn meridian_arc(&self, phi: f64) -> f64 {
        let e2 = self.e2;
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        WGS84_A
            * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
                - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
                + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
                - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
    }
}

fn utm_forward(c: Coord<f64>, zone: u8, north: bool) -> Coord<f64> {
    let ell = Ellipsoid::wgs84();
    let phi = c.y.to_radians();
    let dlam = (c.x - central_meridian(zone)).to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();
    let n = WGS84_A / (1.0 - ell.e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let cc = ell.ep2 * cos_phi * cos_phi;
    let a = dlam * cos_phi;
    let m = ell.meridian_arc(phi);

    let x = UTM_K0
        * n
        * (a + (1.0 - t + cc) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * cc - 58.0 * ell.ep2) * a.powi(5) / 120.0)
        + UTM_FALSE_EASTING;
    let mut y = UTM_K0
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * cc + 4.0 * cc * cc) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * cc - 330.0 * ell.ep2) * a.powi(6) / 720.0));
    if !north {
        y += UTM_FALSE_NORTHING_SOUTH;
    }
    Coord { x, y }
}

fn utm_inverse(c: Coord<f64>, zone: u8, north: bool) -> Coord<f64> {
    let ell = Ellipsoid::wgs84();
    let e2 = ell.e2;
    let x = c.x - UTM_FALSE_EASTING;
    let y = if north { c.y } else { c.y - UTM_FALSE_NORTHING_SOUTH };

    let m = y / UTM_K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    // Footpoint latitude
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin1 = phi1.sin();
    let cos1 = phi1.cos();
    let tan1 = phi1.tan();
    let n1 = WGS84_A / (1.0 - e2 * sin1 * sin1).sqrt();
    let t1 = tan1 * tan1;
    let c1 = ell.ep2 * cos1 * cos1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let phi = phi1
        - (n1 * tan1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ell.ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ell.ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let dlam = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ell.ep2 + 24.0 * t1 * t1) * d.powi(5)
            / 120.0)
        / cos1;

    Coord {
        x: central_meridian(zone) + dlam.to_degrees(),
        y: phi.to_degrees(),
    }
}
