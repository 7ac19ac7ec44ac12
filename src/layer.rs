//! Polygon layers and their GeoJSON representation.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use geo::{BoundingRect, MultiPolygon, Rect};
use geojson::{FeatureCollection, GeoJson, JsonObject, JsonValue};
use tracing::{debug, warn};

use crate::crs::{reproject_multipolygon, Crs};
use crate::error::{CnError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    // Integer view used for land-use codes: 71, 71.0 and "71" all qualify
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            AttrValue::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite() && v.fract() == 0.0)
                        .map(|v| v as i64)
                })
            }
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => AttrValue::Null,
            JsonValue::Bool(b) => AttrValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::Int(i),
                None => n.as_f64().map(AttrValue::Float).unwrap_or(AttrValue::Null),
            },
            JsonValue::String(s) => AttrValue::Text(s.clone()),
            other => AttrValue::Text(other.to_string()),
        }
    }

    fn to_json(&self) -> JsonValue {
        match self {
            AttrValue::Null => JsonValue::Null,
            AttrValue::Bool(b) => JsonValue::Bool(*b),
            AttrValue::Int(i) => JsonValue::from(*i),
            AttrValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            AttrValue::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => Ok(()),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Text(s) => f.write_str(s),
        }
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: MultiPolygon<f64>,
    pub attributes: Attributes,
}

impl Feature {
    pub fn new(geometry: MultiPolygon<f64>, attributes: Attributes) -> Self {
        Feature {
            geometry,
            attributes,
        }
    }

    pub fn attr(&self, name: &str) -> &AttrValue {
        self.attributes.get(name).unwrap_or(&AttrValue::Null)
    }
}

// Ordered features sharing exactly one CRS
#[derive(Debug, Clone)]
pub struct PolygonLayer {
    pub crs: Crs,
    pub features: Vec<Feature>,
}

impl PolygonLayer {
    pub fn new(crs: Crs, features: Vec<Feature>) -> Self {
        PolygonLayer { crs, features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.attributes.contains_key(name))
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                    (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
                )
            })
    }

    // Returns a copy in `target`; the receiver is left untouched
    pub fn reprojected(&self, target: &Crs) -> Result<PolygonLayer> {
        if self.crs.equivalent(target) {
            return Ok(PolygonLayer::new(*target, self.features.clone()));
        }
        let features = self
            .features
            .iter()
            .map(|f| {
                Ok(Feature::new(
                    reproject_multipolygon(&f.geometry, &self.crs, target)?,
                    f.attributes.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PolygonLayer::new(*target, features))
    }
}

pub fn read_geojson(path: impl AsRef<Path>) -> Result<PolygonLayer> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| CnError::unreadable(path, e))?;
    parse_geojson(&text).map_err(|e| match e {
        CnError::InvalidInput(reason) => CnError::unreadable(path, reason),
        other => other,
    })
}

pub fn parse_geojson(text: &str) -> Result<PolygonLayer> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e: geojson::Error| CnError::InvalidInput(e.to_string()))?;
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        GeoJson::Feature(f) => FeatureCollection {
            bbox: None,
            features: vec![f],
            foreign_members: None,
        },
        GeoJson::Geometry(_) => {
            return Err(CnError::InvalidInput(
                "expected a Feature or FeatureCollection, found a bare geometry".into(),
            ));
        }
    };

    let crs = collection_crs(&collection)?;
    let mut features = Vec::with_capacity(collection.features.len());
    let mut skipped = 0usize;
    for feature in collection.features {
        let Some(geometry) = feature.geometry else {
            skipped += 1;
            continue;
        };
        let geometry = match geo::Geometry::<f64>::try_from(geometry) {
            Ok(geo::Geometry::Polygon(p)) => MultiPolygon(vec![p]),
            Ok(geo::Geometry::MultiPolygon(mp)) => mp,
            Ok(_) => {
                skipped += 1;
                continue;
            }
            Err(e) => return Err(CnError::InvalidInput(e.to_string())),
        };
        let attributes = feature
            .properties
            .unwrap_or_default()
            .iter()
            .map(|(k, v)| (k.clone(), AttrValue::from_json(v)))
            .collect();
        features.push(Feature::new(geometry, attributes));
    }
    if skipped > 0 {
        warn!("Skipped {} features without polygon geometry", skipped);
    }
    debug!("Parsed {} polygon features in {}", features.len(), crs);
    Ok(PolygonLayer::new(crs, features))
}

// Legacy `crs` member; RFC 7946 layers without one are lon/lat
fn collection_crs(collection: &FeatureCollection) -> Result<Crs> {
    let name = collection
        .foreign_members
        .as_ref()
        .and_then(|m| m.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str());
    match name {
        Some(name) => Crs::from_name(name),
        None => Ok(Crs::WGS84),
    }
}

pub fn to_feature_collection(layer: &PolygonLayer) -> FeatureCollection {
    let features = layer
        .features
        .iter()
        .map(|f| {
            let properties: JsonObject = f
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&f.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let foreign_members = (layer.crs.epsg() != 4326).then(|| {
        let mut members = JsonObject::new();
        members.insert(
            "crs".to_string(),
            serde_json::json!({
                "type": "name",
                "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", layer.crs.epsg()) }
            }),
        );
        members
    });

    FeatureCollection {
        bbox: None,
        features,
        foreign_members,
    }
}

pub fn write_geojson(path: impl AsRef<Path>, layer: &PolygonLayer) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| CnError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let collection = GeoJson::from(to_feature_collection(layer));
    writer
        .write_all(collection.to_string().as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|e| CnError::io(path, e))
}
