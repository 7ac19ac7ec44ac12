use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_abs_diff_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use curve_number::raster::read_geotiff;
use curve_number::{
    read_geojson, AttrValue, CnConfig, CnError, CnPipeline, CnRequest, ErrorKind, LookupChoice,
};

const X0: f64 = 500_000.0;
const Y0: f64 = 4_980_000.0;

// Square-ish polygon in local meters, offset into UTM zone 15N
fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [X0 + x0, Y0 + y0], [X0 + x1, Y0 + y0], [X0 + x1, Y0 + y1], [X0 + x0, Y0 + y1], [X0 + x0, Y0 + y0]
        ]]
    })
}

fn write_layer(dir: &Path, name: &str, features: Vec<(Value, Value)>) -> PathBuf {
    let features: Vec<Value> = features
        .into_iter()
        .map(|(geometry, properties)| json!({"type": "Feature", "geometry": geometry, "properties": properties}))
        .collect();
    let collection = json!({
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "EPSG:32615"}},
        "features": features,
    });
    let path = dir.join(name);
    fs::write(&path, collection.to_string()).unwrap();
    path
}

fn utm_config() -> CnConfig {
    CnConfig {
        crs_epsg: 32615,
        cell_size: 10.0,
        hydgrp_field: "hydgrp".into(),
        ..CnConfig::default()
    }
}

fn request(dir: &Path, soil: PathBuf, landuse: PathBuf) -> CnRequest {
    CnRequest {
        soil: Some(soil),
        landuse: Some(landuse),
        lookup: Some(LookupChoice::Nlcd),
        watersheds: None,
        output_dir: dir.join("out"),
    }
}

#[test]
fn grass_on_group_b_gives_69() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"hydgrp": "B", "musym": "DaB"}))],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"gridcode": 71}))],
    );

    let pipeline = CnPipeline::new(utm_config()).unwrap();
    let (result, outputs) = pipeline.run(&request(dir.path(), soil, landuse)).unwrap();

    assert_eq!(result.intersections.len(), 1);
    assert_eq!(result.intersections.features[0].cn, Some(69));
    assert_eq!(result.dissolved.len(), 1);
    assert_eq!(result.dissolved.features[0].cn, 69);
    assert_abs_diff_eq!(result.dissolved.features[0].area_ha, 1.0, epsilon = 1e-6);
    assert_eq!(result.statistics.count, 1);
    assert_eq!(result.statistics.mean, Some(69.0));
    assert_eq!(result.statistics.missing_hydgroup_count, 0);
    assert_eq!((result.raster.width, result.raster.height), (10, 10));
    assert!(result.raster.data.iter().all(|&v| v == 69));

    let polygons = read_geojson(&outputs.polygons).unwrap();
    assert_eq!(polygons.crs.epsg(), 32615);
    assert_eq!(polygons.features[0].attr("CN"), &AttrValue::Int(69));
    assert_eq!(
        polygons.features[0].attr("runoff_potential"),
        &AttrValue::Text("High Runoff Potential".into())
    );

    let raster = read_geotiff(&outputs.raster).unwrap();
    assert_eq!(raster.data, result.raster.data);
    assert!(outputs.color_ramp.exists());
    assert_eq!(outputs.watershed_statistics, None);

    let stats: Value = serde_json::from_str(&fs::read_to_string(&outputs.statistics).unwrap()).unwrap();
    assert_eq!(stats["crs"], "EPSG:32615");
    assert_eq!(stats["lookup"], "NLCD");
    assert_eq!(stats["global"]["count"], 1);
    assert_eq!(stats["distribution"][0]["cn"], 69);
    assert_eq!(stats["distribution"][0]["area_percent"], 100.0);

    // Nothing staged is left behind
    let names: Vec<String> = fs::read_dir(dir.path().join("out"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 4);
    assert!(names.iter().all(|n| !n.ends_with(".tmp")));
}

#[test]
fn dual_group_uses_replacement_row() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![
            (rect(0.0, 0.0, 100.0, 100.0), json!({"hydgrp": "A/D"})),
            (rect(100.0, 0.0, 200.0, 100.0), json!({"hydgrp": "B/D"})),
        ],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![(rect(0.0, 0.0, 200.0, 100.0), json!({"gridcode": 71}))],
    );

    let mut config = utm_config();
    config.replacements.bd = "B".into();
    let pipeline = CnPipeline::new(config).unwrap();
    let (result, _) = pipeline.run(&request(dir.path(), soil, landuse)).unwrap();

    let cns: Vec<u8> = result.dissolved.features.iter().map(|f| f.cn).collect();
    assert_eq!(cns, vec![69, 84]);
    assert_eq!(result.diagnostics.soil.replaced.get("A/D"), Some(&1));
    assert_eq!(result.diagnostics.soil.replaced.get("B/D"), Some(&1));
    assert_eq!(result.diagnostics.soil.invalid_count, 0);
}

#[test]
fn unmatched_land_use_is_excluded_from_outputs() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![
            (rect(0.0, 0.0, 200.0, 100.0), json!({"hydgrp": "B"})),
            (rect(0.0, 100.0, 200.0, 200.0), json!({"hydgrp": null})),
        ],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![
            (rect(0.0, 0.0, 100.0, 200.0), json!({"gridcode": 71})),
            (rect(100.0, 0.0, 200.0, 200.0), json!({"gridcode": 12})),
        ],
    );

    let pipeline = CnPipeline::new(utm_config()).unwrap();
    let (result, _) = pipeline.run(&request(dir.path(), soil, landuse)).unwrap();

    assert_eq!(result.intersections.len(), 4);
    assert_eq!(result.diagnostics.assignment.assigned, 1);
    assert_eq!(result.diagnostics.assignment.unassigned, 3);
    assert_eq!(result.diagnostics.soil.invalid_count, 1);
    assert!(result.diagnostics.has_warnings());

    assert_eq!(result.dissolved.len(), 1);
    assert_eq!(result.statistics.count, 1);
    assert_eq!(result.statistics.missing_hydgroup_count, 1);
    assert_abs_diff_eq!(result.statistics.total_area_ha, 1.0, epsilon = 1e-6);
}

#[test]
fn zonal_block_statistics_from_written_raster() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![(rect(0.0, 0.0, 20.0, 20.0), json!({"hydgrp": "B"}))],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![
            (rect(0.0, 10.0, 20.0, 20.0), json!({"gridcode": 1})),
            (rect(0.0, 0.0, 20.0, 10.0), json!({"gridcode": 2})),
        ],
    );
    let zones = write_layer(
        dir.path(),
        "zones.geojson",
        vec![
            (rect(0.0, 0.0, 20.0, 20.0), json!({"HUC": "0701"})),
            (rect(500.0, 500.0, 600.0, 600.0), json!({"HUC": "0702"})),
        ],
    );
    let lookup = dir.path().join("lookup.csv");
    fs::write(&lookup, "LUValue,A,B,C,D\n1,40,50,60,70\n2,45,60,70,80\n").unwrap();

    let mut config = utm_config();
    config.watershed_field = Some("HUC".into());
    let pipeline = CnPipeline::new(config).unwrap();
    let mut req = request(dir.path(), soil, landuse);
    req.lookup = Some(LookupChoice::Csv(lookup));
    req.watersheds = Some(zones);
    let (result, outputs) = pipeline.run(&req).unwrap();

    assert_eq!((result.raster.width, result.raster.height), (2, 2));
    assert_eq!(result.raster.data, vec![50, 50, 60, 60]);

    let zonal = result.zonal.as_ref().unwrap();
    assert_eq!(zonal.len(), 2);
    let block = &zonal[0];
    assert_eq!(block.zone, "0701");
    assert_eq!(block.count, 4);
    assert_eq!(block.mean, Some(55.0));
    assert_eq!(block.min, Some(50.0));
    assert_eq!(block.max, Some(60.0));
    assert_eq!(block.range, Some(10.0));
    assert_eq!(block.std, Some(5.0));
    assert_abs_diff_eq!(block.cv.unwrap(), 9.09);

    let outside = &zonal[1];
    assert_eq!(outside.zone, "0702");
    assert_eq!(outside.count, 0);
    assert_eq!(outside.mean, None);

    let csv = fs::read_to_string(outputs.watershed_statistics.unwrap()).unwrap();
    assert!(csv.starts_with("HUC,min,max,mean,median,std,count,sum,cv,range"));
    assert_eq!(csv.lines().count(), 3);
}

#[test]
fn repeated_runs_agree() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![
            (rect(0.0, 0.0, 150.0, 100.0), json!({"hydgrp": "C"})),
            (rect(150.0, 0.0, 300.0, 100.0), json!({"hydgrp": "A"})),
        ],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![
            (rect(0.0, 0.0, 100.0, 100.0), json!({"gridcode": 82})),
            (rect(100.0, 0.0, 300.0, 100.0), json!({"gridcode": "41"})),
        ],
    );

    let pipeline = CnPipeline::new(utm_config()).unwrap();
    let (first, _) = pipeline.run(&request(dir.path(), soil.clone(), landuse.clone())).unwrap();
    let (second, _) = pipeline.run(&request(dir.path(), soil, landuse)).unwrap();

    assert_eq!(first.dissolved.cn_areas(), second.dissolved.cn_areas());
    assert_eq!(first.statistics, second.statistics);
    assert_eq!(first.raster.data, second.raster.data);
    // 82/C, 41/C, 41/A
    let cns: Vec<u8> = first.dissolved.cn_areas().keys().copied().collect();
    assert_eq!(cns, vec![45, 77, 85]);
    assert_eq!(first.diagnostics.landuse.coerced, 2);
}

#[test]
fn failed_run_leaves_no_outputs() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"hydgrp": "B"}))],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"gridcode": 71}))],
    );
    // Zone field missing from the zone layer fails after the raster is staged
    let zones = write_layer(
        dir.path(),
        "zones.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"name": "upper"}))],
    );

    let mut config = utm_config();
    config.watershed_field = Some("HUC".into());
    let pipeline = CnPipeline::new(config).unwrap();
    let mut req = request(dir.path(), soil, landuse);
    req.watersheds = Some(zones);

    let err = pipeline.run(&req).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
}

#[test]
fn no_valid_curve_numbers_is_fatal() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"hydgrp": "B"}))],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"gridcode": 12}))],
    );

    let pipeline = CnPipeline::new(utm_config()).unwrap();
    let err = pipeline.run(&request(dir.path(), soil, landuse)).unwrap_err();
    assert!(matches!(err, CnError::EmptyResult(_)));
    assert_eq!(err.kind(), ErrorKind::EmptyResult);
    assert!(err.to_string().starts_with("no valid curve numbers produced"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn unreadable_and_non_numeric_inputs_are_input_errors() {
    let dir = TempDir::new().unwrap();
    let garbage = dir.path().join("soil.geojson");
    fs::write(&garbage, "not a vector file").unwrap();
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"gridcode": "forest"}))],
    );

    let pipeline = CnPipeline::new(utm_config()).unwrap();
    let err = pipeline
        .run(&request(dir.path(), garbage, landuse.clone()))
        .unwrap_err();
    assert!(matches!(err, CnError::Unreadable { .. }));
    assert!(err.to_string().starts_with("file unreadable as geospatial data"));

    let soil = write_layer(
        dir.path(),
        "soil_ok.geojson",
        vec![(rect(0.0, 0.0, 100.0, 100.0), json!({"hydgrp": "B"}))],
    );
    let err = pipeline.run(&request(dir.path(), soil, landuse)).unwrap_err();
    assert!(matches!(err, CnError::InvalidInput(_)));
}

#[test]
fn geographic_output_crs_converts_cell_size() {
    let dir = TempDir::new().unwrap();
    let soil = write_layer(
        dir.path(),
        "soil.geojson",
        vec![(rect(0.0, 0.0, 300.0, 300.0), json!({"hydgrp": "D"}))],
    );
    let landuse = write_layer(
        dir.path(),
        "landuse.geojson",
        vec![(rect(0.0, 0.0, 300.0, 300.0), json!({"gridcode": 22}))],
    );

    let config = CnConfig {
        crs_epsg: 4326,
        cell_size: 30.0,
        hydgrp_field: "hydgrp".into(),
        ..CnConfig::default()
    };
    let pipeline = CnPipeline::new(config).unwrap();
    let (result, _) = pipeline.run(&request(dir.path(), soil, landuse)).unwrap();

    assert_eq!(result.dissolved.features[0].cn, 86);
    assert!(result.raster.crs.is_geographic());
    let (px, _) = result.raster.transform.pixel_size();
    // ~30 m cells expressed in degrees
    assert!(px > 0.0002 && px < 0.0004);
    assert!(result.raster.valid_cells() > 0);
}
