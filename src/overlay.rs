//! Polygon overlay of the soil and land-use layers.

use geo::{BooleanOps, BoundingRect, MultiPolygon};
use rstar::{RTree, RTreeObject, AABB};
use tracing::{debug, info};

use crate::crs::Crs;
use crate::error::{CnError, Result};
use crate::layer::{Attributes, PolygonLayer};

// Intersection of one soil polygon with one land-use polygon
#[derive(Debug, Clone)]
pub struct IntersectionFeature {
    pub geometry: MultiPolygon<f64>,
    pub attributes: Attributes,
    pub soil_index: usize,    // Position in the soil layer
    pub landuse_index: usize, // Position in the land use layer
    pub cn: Option<u8>,       // None until assigned, or when the lookup has no entry
}

#[derive(Debug, Clone)]
pub struct IntersectionLayer {
    pub crs: Crs,
    pub features: Vec<IntersectionFeature>,
}

impl IntersectionLayer {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

struct IndexedBox {
    index: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;
    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope_of(geometry: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    geometry
        .bounding_rect()
        .map(|r| AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]))
}

/// Intersects every soil polygon with every land-use polygon it overlaps.
///
/// Output is ordered by soil index, then land-use index. Pairs whose
/// intersection is empty produce nothing. The hydrologic group is taken from
/// the soil parent and the land-use code from the land-use parent; any other
/// attribute present on both sides is kept twice, suffixed `_1` (soil) and
/// `_2` (land use).
pub fn intersect_layers(
    soil: &PolygonLayer,
    landuse: &PolygonLayer,
    hydgrp_field: &str,
    code_field: &str,
) -> Result<IntersectionLayer> {
    if !soil.crs.equivalent(&landuse.crs) {
        return Err(CnError::Geometry(format!(
            "soil layer is in {} but land use layer is in {}",
            soil.crs, landuse.crs
        )));
    }
    info!("Computing spatial intersection (this may take a while for large datasets)...");

    let boxes: Vec<IndexedBox> = landuse
        .features
        .iter()
        .enumerate()
        .filter_map(|(index, f)| envelope_of(&f.geometry).map(|env| IndexedBox { index, env }))
        .collect();
    let tree = RTree::bulk_load(boxes);

    let mut features = Vec::new();
    for (soil_index, soil_feature) in soil.features.iter().enumerate() {
        let Some(env) = envelope_of(&soil_feature.geometry) else {
            continue;
        };
        let mut candidates: Vec<usize> = tree
            .locate_in_envelope_intersecting(&env)
            .map(|b| b.index)
            .collect();
        candidates.sort_unstable();

        for landuse_index in candidates {
            let landuse_feature = &landuse.features[landuse_index];
            let geometry = soil_feature.geometry.intersection(&landuse_feature.geometry);
            if geometry.0.is_empty() {
                continue;
            }
            debug!("soil {} x land use {}: {} parts", soil_index, landuse_index, geometry.0.len());
            features.push(IntersectionFeature {
                geometry,
                attributes: merge_attributes(
                    &soil_feature.attributes,
                    &landuse_feature.attributes,
                    hydgrp_field,
                    code_field,
                ),
                soil_index,
                landuse_index,
                cn: None,
            });
        }
    }

    info!("Created {} intersection polygons", features.len());
    Ok(IntersectionLayer {
        crs: soil.crs,
        features,
    })
}

fn merge_attributes(
    soil: &Attributes,
    landuse: &Attributes,
    hydgrp_field: &str,
    code_field: &str,
) -> Attributes {
    let mut merged = Attributes::new();
    for (key, value) in soil {
        if key == code_field && landuse.contains_key(key) {
            continue;
        }
        let name = if landuse.contains_key(key) && key != hydgrp_field {
            format!("{key}_1")
        } else {
            key.clone()
        };
        merged.insert(name, value.clone());
    }
    for (key, value) in landuse {
        if key == hydgrp_field && soil.contains_key(key) {
            continue;
        }
        let name = if soil.contains_key(key) && key != code_field {
            format!("{key}_2")
        } else {
            key.clone()
        };
        merged.insert(name, value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{AttrValue, Feature};
    use approx::assert_abs_diff_eq;
    use geo::{polygon, Area};

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0)
        ]])
    }

    fn feature(geometry: MultiPolygon<f64>, attrs: &[(&str, AttrValue)]) -> Feature {
        Feature::new(
            geometry,
            attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        )
    }

    fn utm() -> Crs {
        Crs::from_epsg(32615).unwrap()
    }

    #[test]
    fn one_feature_per_overlapping_pair() {
        let soil = PolygonLayer::new(
            utm(),
            vec![
                feature(rect(0.0, 0.0, 100.0, 100.0), &[("hydgrp", AttrValue::Text("B".into()))]),
                feature(rect(100.0, 0.0, 200.0, 100.0), &[("hydgrp", AttrValue::Text("C".into()))]),
            ],
        );
        let landuse = PolygonLayer::new(
            utm(),
            vec![
                feature(rect(50.0, 0.0, 150.0, 100.0), &[("gridcode", AttrValue::Int(71))]),
                feature(rect(500.0, 500.0, 600.0, 600.0), &[("gridcode", AttrValue::Int(82))]),
            ],
        );

        let out = intersect_layers(&soil, &landuse, "hydgrp", "gridcode").unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.features[0].soil_index, 0);
        assert_eq!(out.features[1].soil_index, 1);
        assert_abs_diff_eq!(out.features[0].geometry.unsigned_area(), 5_000.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out.features[1].geometry.unsigned_area(), 5_000.0, epsilon = 1e-6);
        assert_eq!(out.features[1].attributes.get("hydgrp"), Some(&AttrValue::Text("C".into())));
        assert_eq!(out.features[1].attributes.get("gridcode"), Some(&AttrValue::Int(71)));
        assert!(out.features.iter().all(|f| f.cn.is_none()));
    }

    #[test]
    fn disjoint_layers_produce_nothing() {
        let soil = PolygonLayer::new(utm(), vec![feature(rect(0.0, 0.0, 1.0, 1.0), &[])]);
        let landuse = PolygonLayer::new(utm(), vec![feature(rect(5.0, 5.0, 6.0, 6.0), &[])]);
        let out = intersect_layers(&soil, &landuse, "hydgrp", "gridcode").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn key_fields_stay_single_and_other_collisions_are_suffixed() {
        let soil = PolygonLayer::new(
            utm(),
            vec![feature(
                rect(0.0, 0.0, 10.0, 10.0),
                &[
                    ("hydgrp", AttrValue::Text("A".into())),
                    ("gridcode", AttrValue::Int(0)),
                    ("name", AttrValue::Text("Dailey".into())),
                ],
            )],
        );
        let landuse = PolygonLayer::new(
            utm(),
            vec![feature(
                rect(0.0, 0.0, 10.0, 10.0),
                &[
                    ("hydgrp", AttrValue::Text("Z".into())),
                    ("gridcode", AttrValue::Int(42)),
                    ("name", AttrValue::Text("forest".into())),
                ],
            )],
        );
        let out = intersect_layers(&soil, &landuse, "hydgrp", "gridcode").unwrap();
        let attrs = &out.features[0].attributes;
        assert_eq!(attrs.get("hydgrp"), Some(&AttrValue::Text("A".into())));
        assert_eq!(attrs.get("gridcode"), Some(&AttrValue::Int(42)));
        assert_eq!(attrs.get("name_1"), Some(&AttrValue::Text("Dailey".into())));
        assert_eq!(attrs.get("name_2"), Some(&AttrValue::Text("forest".into())));
        assert!(!attrs.contains_key("hydgrp_1"));
        assert!(!attrs.contains_key("gridcode_2"));
    }

    #[test]
    fn mismatched_crs_is_a_geometry_error() {
        let soil = PolygonLayer::new(utm(), vec![]);
        let landuse = PolygonLayer::new(Crs::WGS84, vec![]);
        let err = intersect_layers(&soil, &landuse, "hydgrp", "gridcode").unwrap_err();
        assert!(matches!(err, CnError::Geometry(_)));
    }
}
