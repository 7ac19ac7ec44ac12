use std::collections::BTreeMap;

use geo::{Area, BooleanOps, BoundingRect, MultiPolygon, Rect};
use tracing::{info, warn};

use crate::crs::Crs;
use crate::error::{CnError, Result};
use crate::layer::{AttrValue, Attributes, Feature, PolygonLayer};
use crate::overlay::IntersectionLayer;
use crate::stats::RunoffPotential;

const SQ_METERS_PER_HECTARE: f64 = 10_000.0;

// Union of all intersections sharing one curve number
#[derive(Debug, Clone)]
pub struct DissolvedFeature {
    pub cn: u8,
    pub area_ha: f64,          // Summed intersection area [ha]; nominal under a geographic CRS
    pub polygon_count: usize,  // Intersection polygons merged into this feature
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct DissolvedLayer {
    pub crs: Crs,
    pub features: Vec<DissolvedFeature>, // Ascending, unique CN
}

impl DissolvedLayer {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn total_area_ha(&self) -> f64 {
        self.features.iter().map(|f| f.area_ha).sum()
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.to_polygon_layer().bounds()
    }

    pub fn cn_areas(&self) -> BTreeMap<u8, f64> {
        self.features.iter().map(|f| (f.cn, f.area_ha)).collect()
    }

    pub fn to_polygon_layer(&self) -> PolygonLayer {
        let features = self
            .features
            .iter()
            .map(|f| {
                let mut attributes = Attributes::new();
                attributes.insert("CN".into(), AttrValue::Int(f.cn as i64));
                attributes.insert("area_ha".into(), AttrValue::Float(f.area_ha));
                attributes.insert("polygon_count".into(), AttrValue::Int(f.polygon_count as i64));
                attributes.insert(
                    "runoff_potential".into(),
                    AttrValue::Text(RunoffPotential::classify(f.cn).label().to_string()),
                );
                Feature::new(f.geometry.clone(), attributes)
            })
            .collect();
        PolygonLayer::new(self.crs, features)
    }
}

struct Group {
    parts: Vec<MultiPolygon<f64>>,
    area_ha: f64,
}

/// Merges CN-assigned intersections into one multi-part feature per CN.
///
/// Features without a CN are discarded; if none remain the run cannot
/// produce output and `EmptyResult` is returned.
pub fn dissolve_by_cn(layer: &IntersectionLayer) -> Result<DissolvedLayer> {
    let mut groups: BTreeMap<u8, Group> = BTreeMap::new();
    for feature in &layer.features {
        let Some(cn) = feature.cn else {
            continue;
        };
        let group = groups.entry(cn).or_insert_with(|| Group {
            parts: Vec::new(),
            area_ha: 0.0,
        });
        group.area_ha += feature.geometry.unsigned_area() / SQ_METERS_PER_HECTARE;
        group.parts.push(feature.geometry.clone());
    }

    if groups.is_empty() {
        return Err(CnError::EmptyResult(format!(
            "none of the {} intersection polygons has a land use / soil group combination in the lookup table",
            layer.features.len()
        )));
    }
    if layer.crs.is_geographic() {
        warn!("Areas computed in {} are in squared degrees / 10000, not hectares", layer.crs);
    }

    info!("Dissolving polygons by curve number...");
    let features: Vec<DissolvedFeature> = groups
        .into_iter()
        .map(|(cn, group)| DissolvedFeature {
            cn,
            area_ha: group.area_ha,
            polygon_count: group.parts.len(),
            geometry: union_all(group.parts),
        })
        .collect();
    info!("Dissolved to {} unique curve number polygons", features.len());

    Ok(DissolvedLayer {
        crs: layer.crs,
        features,
    })
}

fn union_all(parts: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    let mut parts = parts.into_iter();
    let Some(first) = parts.next() else {
        return MultiPolygon(vec![]);
    };
    parts.fold(first, |acc, part| {
        // Disjoint parts need no boolean op
        let touching = match (acc.bounding_rect(), part.bounding_rect()) {
            (Some(a), Some(b)) => boxes_touch(&a, &b),
            _ => false,
        };
        if touching {
            acc.union(&part)
        } else {
            let mut merged = acc;
            merged.0.extend(part.0);
            merged
        }
    })
}

fn boxes_touch(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x
        && b.min().x <= a.max().x
        && a.min().y <= b.max().y
        && b.min().y <= a.max().y
}
