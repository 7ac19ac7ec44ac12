//! Distribution statistics over the dissolved curve number layer.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::dissolve::DissolvedLayer;

pub const PERCENTILES: [u8; 5] = [10, 25, 50, 75, 90];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunoffPotential {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl RunoffPotential {
    pub fn classify(cn: u8) -> Self {
        match cn {
            0..=39 => RunoffPotential::Low,
            40..=59 => RunoffPotential::Moderate,
            60..=79 => RunoffPotential::High,
            _ => RunoffPotential::VeryHigh,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunoffPotential::Low => "Low Runoff Potential",
            RunoffPotential::Moderate => "Moderate Runoff Potential",
            RunoffPotential::High => "High Runoff Potential",
            RunoffPotential::VeryHigh => "Very High Runoff Potential",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Percentile {
    pub percentile: u8,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStatistics {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>, // Sample standard deviation; needs two values
    pub unique_values: usize,
    pub weighted_mean: Option<f64>, // Area weighted, one weight per dissolved feature
    pub percentiles: Vec<Percentile>,
    pub total_area_ha: f64,
    pub missing_hydgroup_count: usize, // Soil records with an invalid or missing group
}

/// Global statistics over the CN values of a dissolved layer.
///
/// Each dissolved feature contributes one value. The weighted mean and the
/// percentile cuts are only reported when the layer carries a positive
/// total area.
pub fn global_statistics(layer: &DissolvedLayer, missing_hydgroup_count: usize) -> GlobalStatistics {
    let values: Vec<f64> = layer.features.iter().map(|f| f.cn as f64).collect();
    let areas: Vec<f64> = layer.features.iter().map(|f| f.area_ha).collect();
    let total_area_ha: f64 = areas.iter().sum();

    let mut sorted = values.clone();
    sorted.sort_by(f64::total_cmp);

    let has_area = total_area_ha > 0.0 && !values.is_empty();
    let weighted_mean = has_area.then(|| {
        values.iter().zip(&areas).map(|(v, a)| v * a).sum::<f64>() / total_area_ha
    });
    let percentiles = if has_area {
        PERCENTILES
            .iter()
            .filter_map(|&p| {
                percentile_linear(&sorted, p as f64).map(|value| Percentile {
                    percentile: p,
                    value,
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    let unique_values = layer.features.iter().map(|f| f.cn).collect::<BTreeSet<_>>().len();

    GlobalStatistics {
        count: values.len(),
        min: sorted.first().copied(),
        max: sorted.last().copied(),
        mean: mean(&values),
        median: percentile_linear(&sorted, 50.0),
        std: sample_std(&values),
        unique_values,
        weighted_mean,
        percentiles,
        total_area_ha,
        missing_hydgroup_count,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionRow {
    pub cn: u8,
    pub area_ha: f64,
    pub polygon_count: usize,
    pub area_percent: f64,
    pub cumulative_percent: f64,
    pub runoff_potential: RunoffPotential,
}

// Area share of each CN, ascending by CN
pub fn cn_distribution(layer: &DissolvedLayer) -> Vec<DistributionRow> {
    let total = layer.total_area_ha();
    let mut cumulative = 0.0;
    layer
        .features
        .iter()
        .map(|f| {
            let area_percent = if total > 0.0 {
                round2(f.area_ha / total * 100.0)
            } else {
                0.0
            };
            cumulative += area_percent;
            DistributionRow {
                cn: f.cn,
                area_ha: f.area_ha,
                polygon_count: f.polygon_count,
                area_percent,
                cumulative_percent: round2(cumulative),
                runoff_potential: RunoffPotential::classify(f.cn),
            }
        })
        .collect()
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub(crate) fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

pub(crate) fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / values.len() as f64).sqrt())
}

// Linear interpolation between closest ranks; `sorted` must be ascending
pub(crate) fn percentile_linear(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = p / 100.0 * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
