//! Normalisation of the soil and land-use layers ahead of the overlay.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::crs::Crs;
use crate::error::{CnError, Result};
use crate::layer::{AttrValue, PolygonLayer};
use crate::lookup::HydroGroup;

// Dual hydrologic group codes as they appear in SSURGO `hydgrpdcd`
pub const DUAL_CODES: [&str; 3] = ["A/D", "B/D", "C/D"];

/// Resolution of dual hydrologic groups (A/D, B/D, C/D) to a single letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualGroupReplacements {
    map: BTreeMap<String, HydroGroup>,
}

impl DualGroupReplacements {
    pub fn new(ad: HydroGroup, bd: HydroGroup, cd: HydroGroup) -> Self {
        let map = DUAL_CODES
            .iter()
            .zip([ad, bd, cd])
            .map(|(code, group)| (code.to_string(), group))
            .collect();
        DualGroupReplacements { map }
    }

    pub fn none() -> Self {
        DualGroupReplacements {
            map: BTreeMap::new(),
        }
    }

    pub fn with(mut self, code: &str, group: HydroGroup) -> Self {
        self.map.insert(code.to_string(), group);
        self
    }

    pub fn get(&self, code: &str) -> Option<HydroGroup> {
        self.map.get(code).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, HydroGroup)> {
        self.map.iter().map(|(code, group)| (code.as_str(), *group))
    }
}

impl Default for DualGroupReplacements {
    // Dual-group soils treated as undrained
    fn default() -> Self {
        DualGroupReplacements::new(HydroGroup::D, HydroGroup::D, HydroGroup::D)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SoilReport {
    pub replaced: BTreeMap<String, usize>, // Dual code -> records rewritten
    pub invalid_count: usize,              // Records outside A-D after replacement
    pub invalid_values: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LandUseReport {
    pub coerced: usize,
    pub uncoercible_count: usize,
    pub uncoercible_values: BTreeSet<String>,
}

pub fn preprocess_soil(
    layer: &PolygonLayer,
    target: &Crs,
    hydgrp_field: &str,
    replacements: &DualGroupReplacements,
) -> Result<(PolygonLayer, SoilReport)> {
    if layer.is_empty() {
        return Err(CnError::InvalidInput("soil layer has no polygon features".into()));
    }
    if !layer.has_field(hydgrp_field) {
        return Err(CnError::InvalidInput(format!(
            "soil layer has no '{hydgrp_field}' field"
        )));
    }
    if !layer.crs.equivalent(target) {
        info!("Reprojecting soil data from {} to {}", layer.crs, target);
    }
    let mut soil = layer.reprojected(target)?;
    let mut report = SoilReport::default();

    for (dual, replacement) in replacements.iter() {
        let mut count = 0;
        for feature in soil.features.iter_mut() {
            let matches = feature
                .attributes
                .get(hydgrp_field)
                .and_then(AttrValue::as_text)
                .is_some_and(|v| v == dual);
            if matches {
                feature.attributes.insert(
                    hydgrp_field.to_string(),
                    AttrValue::Text(replacement.letter().to_string()),
                );
                count += 1;
            }
        }
        if count > 0 {
            info!("Replaced {} occurrences of '{}' with '{}'", count, dual, replacement);
            report.replaced.insert(dual.to_string(), count);
        }
    }

    for feature in &soil.features {
        let value = feature.attr(hydgrp_field);
        let valid = value.as_text().and_then(HydroGroup::parse).is_some();
        if !valid {
            report.invalid_count += 1;
            report.invalid_values.insert(display_value(value));
        }
    }
    if report.invalid_count > 0 {
        warn!(
            "{} features have invalid hydrologic groups: {:?}",
            report.invalid_count, report.invalid_values
        );
    }

    Ok((soil, report))
}

pub fn preprocess_landuse(
    layer: &PolygonLayer,
    target: &Crs,
    code_field: &str,
) -> Result<(PolygonLayer, LandUseReport)> {
    if layer.is_empty() {
        return Err(CnError::InvalidInput("land use layer has no polygon features".into()));
    }
    if !layer.has_field(code_field) {
        return Err(CnError::InvalidInput(format!(
            "land use layer has no '{code_field}' field"
        )));
    }
    if !layer.crs.equivalent(target) {
        info!("Reprojecting land use data from {} to {}", layer.crs, target);
    }
    let mut landuse = layer.reprojected(target)?;
    let mut report = LandUseReport::default();

    for feature in landuse.features.iter_mut() {
        let value = feature.attr(code_field).clone();
        match value.as_integer() {
            Some(code) => {
                feature
                    .attributes
                    .insert(code_field.to_string(), AttrValue::Int(code));
                report.coerced += 1;
            }
            None => {
                report.uncoercible_count += 1;
                report.uncoercible_values.insert(display_value(&value));
            }
        }
    }

    if report.coerced == 0 {
        return Err(CnError::InvalidInput(format!(
            "land use code field '{code_field}' is entirely non-numeric"
        )));
    }
    if report.uncoercible_count > 0 {
        warn!(
            "Could not convert {} land use codes to integers: {:?}",
            report.uncoercible_count, report.uncoercible_values
        );
    }

    Ok((landuse, report))
}

fn display_value(value: &AttrValue) -> String {
    match value {
        AttrValue::Null => "<null>".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Attributes, Feature};
    use geo::{polygon, MultiPolygon};

    fn unit_square() -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0)
        ]])
    }

    fn layer_of(field: &str, values: Vec<AttrValue>) -> PolygonLayer {
        let features = values
            .into_iter()
            .map(|v| {
                let mut attributes = Attributes::new();
                attributes.insert(field.to_string(), v);
                Feature::new(unit_square(), attributes)
            })
            .collect();
        PolygonLayer::new(Crs::WGS84, features)
    }

    fn text(s: &str) -> AttrValue {
        AttrValue::Text(s.to_string())
    }

    #[test]
    fn dual_groups_resolve_to_configured_letter() {
        let soil = layer_of("hydgrp", vec![text("A/D"), text("B/D"), text("C/D"), text("B"), text("A/D")]);
        let replacements = DualGroupReplacements::new(HydroGroup::D, HydroGroup::B, HydroGroup::C);

        let (out, report) = preprocess_soil(&soil, &Crs::WGS84, "hydgrp", &replacements).unwrap();
        let groups: Vec<_> = out.features.iter().map(|f| f.attr("hydgrp").clone()).collect();
        assert_eq!(groups, vec![text("D"), text("B"), text("C"), text("B"), text("D")]);
        assert_eq!(report.replaced.get("A/D"), Some(&2));
        assert_eq!(report.invalid_count, 0);
        assert!(out.features.iter().all(|f| !DUAL_CODES.contains(&f.attr("hydgrp").as_text().unwrap())));
    }

    #[test]
    fn input_layer_is_not_mutated() {
        let soil = layer_of("hydgrp", vec![text("A/D")]);
        let _ = preprocess_soil(&soil, &Crs::WGS84, "hydgrp", &DualGroupReplacements::default()).unwrap();
        assert_eq!(soil.features[0].attr("hydgrp"), &text("A/D"));
    }

    #[test]
    fn invalid_groups_are_counted_not_dropped() {
        let soil = layer_of("hydgrp", vec![text("B"), AttrValue::Null, text("X"), text("A/D")]);
        let (out, report) =
            preprocess_soil(&soil, &Crs::WGS84, "hydgrp", &DualGroupReplacements::none()).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(report.invalid_count, 3);
        assert!(report.invalid_values.contains("<null>"));
        assert!(report.invalid_values.contains("A/D"));
    }

    #[test]
    fn soil_without_group_field_is_an_input_error() {
        let soil = layer_of("musym", vec![text("B")]);
        let err = preprocess_soil(&soil, &Crs::WGS84, "hydgrp", &DualGroupReplacements::default());
        assert!(matches!(err, Err(CnError::InvalidInput(_))));
    }

    #[test]
    fn soil_is_reprojected_to_target() {
        let soil = layer_of("hydgrp", vec![text("B")]);
        let merc = Crs::from_epsg(3857).unwrap();
        let (out, _) = preprocess_soil(&soil, &merc, "hydgrp", &DualGroupReplacements::default()).unwrap();
        assert_eq!(out.crs, merc);
        let x = out.features[0].geometry.0[0].exterior().0[1].x;
        assert!((x - 111_319.49).abs() < 0.01);
    }

    #[test]
    fn land_use_codes_become_integers() {
        let landuse = layer_of(
            "gridcode",
            vec![AttrValue::Float(71.0), text("82"), text("forest"), AttrValue::Int(41)],
        );
        let (out, report) = preprocess_landuse(&landuse, &Crs::WGS84, "gridcode").unwrap();
        assert_eq!(out.features[0].attr("gridcode"), &AttrValue::Int(71));
        assert_eq!(out.features[1].attr("gridcode"), &AttrValue::Int(82));
        assert_eq!(out.features[2].attr("gridcode"), &text("forest"));
        assert_eq!(report.coerced, 3);
        assert_eq!(report.uncoercible_count, 1);
    }

    #[test]
    fn entirely_non_numeric_codes_are_fatal() {
        let landuse = layer_of("gridcode", vec![text("forest"), text("urban")]);
        let err = preprocess_landuse(&landuse, &Crs::WGS84, "gridcode").unwrap_err();
        assert!(err.to_string().contains("entirely non-numeric"));
    }
}
