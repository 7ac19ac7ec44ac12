use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::layer::AttrValue;
use crate::lookup::{HydroGroup, LookupTable};
use crate::overlay::IntersectionLayer;

// Land use / soil group combination with no lookup entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct UnmatchedPair {
    pub land_use: String,
    pub hydro_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignmentReport {
    pub assigned: usize,
    pub unassigned: usize,
    pub unmatched: BTreeSet<UnmatchedPair>,
}

/// Sets the curve number of every intersection feature from the lookup table.
///
/// Features whose (code, group) pair has no entry keep `cn = None` and stay
/// in the layer; the dissolve step drops them.
pub fn assign_curve_numbers(
    layer: &mut IntersectionLayer,
    lookup: &LookupTable,
    hydgrp_field: &str,
    code_field: &str,
) -> AssignmentReport {
    let mut report = AssignmentReport::default();
    for feature in layer.features.iter_mut() {
        let code_value = feature.attributes.get(code_field).unwrap_or(&AttrValue::Null);
        let group_value = feature.attributes.get(hydgrp_field).unwrap_or(&AttrValue::Null);

        let code = match code_value {
            AttrValue::Int(code) => Some(*code),
            _ => None,
        };
        let group = group_value.as_text().and_then(HydroGroup::parse);
        feature.cn = code.zip(group).and_then(|(code, group)| lookup.get(code, group));

        if feature.cn.is_some() {
            report.assigned += 1;
        } else {
            report.unassigned += 1;
            report.unmatched.insert(UnmatchedPair {
                land_use: code_value.to_string(),
                hydro_group: group_value.to_string(),
            });
        }
    }

    info!(
        "Assigned curve numbers to {}/{} polygons",
        report.assigned,
        layer.features.len()
    );
    if report.unassigned > 0 {
        warn!("{} polygons have no CN value", report.unassigned);
        for pair in &report.unmatched {
            warn!("   Missing combination: land use {}, soil group {}", pair.land_use, pair.hydro_group);
        }
    }
    report
}
