//! SceneCollection: chronological ordering, mosaicking, alignment, clipping
//! and feature time series.

use approx::assert_abs_diff_eq;
use chrono::{DateTime, Duration, Utc};
use eostack::{
    mean_reducer, Band, BoundingBox, ClipOptions, DType, EoError, Feature, GridSpec,
    MosaicPolicy, RasterCollection, Scene, SceneCollection,
};
use geo::{coord, Rect};
use ndarray::Array2;

const NODATA: f64 = -9999.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn grid() -> GridSpec {
    GridSpec::from_bounds(&BoundingBox::new(0.0, 0.0, 40.0, 40.0), 10.0, 10.0, 32632)
}

fn scene(id: &str, timestamp: &str, fill: f64) -> Scene {
    let band = Band::filled("B04", fill, DType::F32, NODATA, grid()).unwrap();
    let raster = RasterCollection::from_bands(vec![band]).unwrap();
    Scene::new(raster, ts(timestamp), Some(id.to_string()))
}

#[test]
fn test_scenes_are_kept_in_chronological_order() {
    let mut sc = SceneCollection::new();
    sc.add_scene(scene("c", "2023-05-20T10:00:00Z", 3.0)).unwrap();
    sc.add_scene(scene("a", "2023-05-10T10:00:00Z", 1.0)).unwrap();
    sc.add_scene(scene("b", "2023-05-15T10:00:00Z", 2.0)).unwrap();

    assert_eq!(sc.scene_ids(), vec!["a", "b", "c"]);
    assert!(sc.timestamps().windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_duplicate_scene_identifiers_are_rejected() {
    let mut sc = SceneCollection::new();
    sc.add_scene(scene("a", "2023-05-10T10:00:00Z", 1.0)).unwrap();

    let result = sc.add_scene(scene("a", "2023-05-11T10:00:00Z", 2.0));
    assert!(matches!(result, Err(EoError::DuplicateScene(_))));
}

#[test]
fn test_mosaic_merges_scenes_within_the_tolerance_slot() {
    init_logging();
    // two half-covered tiles from the same overpass plus a later scene
    let mut west = Array2::from_elem((4, 4), 1.0);
    let mut east = Array2::from_elem((4, 4), 2.0);
    for row in 0..4 {
        for col in 2..4 {
            west[[row, col]] = NODATA;
        }
        for col in 0..2 {
            east[[row, col]] = NODATA;
        }
    }

    let make = |id: &str, timestamp: &str, data: Array2<f64>| {
        let band = Band::new("B04", data, DType::F32, NODATA, grid()).unwrap();
        Scene::new(
            RasterCollection::from_bands(vec![band]).unwrap(),
            ts(timestamp),
            Some(id.to_string()),
        )
    };

    let mut sc = SceneCollection::new();
    sc.add_scene(make("tile-west", "2023-05-10T10:00:03Z", west)).unwrap();
    sc.add_scene(make("tile-east", "2023-05-10T10:00:47Z", east)).unwrap();
    sc.add_scene(scene("later", "2023-05-10T11:30:00Z", 9.0)).unwrap();

    let mosaicked = sc.mosaic(Duration::seconds(60), &MosaicPolicy::FirstWins).unwrap();

    assert_eq!(mosaicked.len(), 2);
    let merged = mosaicked.iter().next().unwrap();
    assert_eq!(merged.scene_id(), Some("tile-west&&tile-east"));

    let band = merged.raster().get_band("B04").unwrap();
    assert_eq!(band.valid_count(), 16);
    assert_abs_diff_eq!(band.value_at(0, 0).unwrap(), 1.0);
    assert_abs_diff_eq!(band.value_at(0, 3).unwrap(), 2.0);
}

#[test]
fn test_mosaic_priority_policy_controls_overlap_winners() {
    let mut sc = SceneCollection::new();
    sc.add_scene(scene("first", "2023-05-10T10:00:00Z", 1.0)).unwrap();
    sc.add_scene(scene("second", "2023-05-10T10:00:30Z", 2.0)).unwrap();

    let policy = MosaicPolicy::Priority(vec!["second".to_string()]);
    let mosaicked = sc.mosaic(Duration::seconds(60), &policy).unwrap();

    let merged = mosaicked.iter().next().unwrap();
    let band = merged.raster().get_band("B04").unwrap();
    assert_abs_diff_eq!(band.value_at(0, 0).unwrap(), 2.0);
}

#[test]
fn test_align_resamples_every_scene_onto_one_grid() {
    let coarse = GridSpec::from_bounds(&BoundingBox::new(0.0, 0.0, 40.0, 40.0), 20.0, 20.0, 32632);
    let fine_band = Band::filled("B04", 1.0, DType::F32, NODATA, grid()).unwrap();
    let coarse_band = Band::filled("B04", 2.0, DType::F32, NODATA, coarse).unwrap();

    let mut sc = SceneCollection::new();
    sc.add_scene(Scene::new(
        RasterCollection::from_bands(vec![fine_band]).unwrap(),
        ts("2023-05-10T10:00:00Z"),
        Some("fine".to_string()),
    ))
    .unwrap();
    sc.add_scene(Scene::new(
        RasterCollection::from_bands(vec![coarse_band]).unwrap(),
        ts("2023-05-12T10:00:00Z"),
        Some("coarse".to_string()),
    ))
    .unwrap();

    let aligned = sc.align(None).unwrap();

    let grids: Vec<_> = aligned
        .iter()
        .map(|s| s.raster().grid().unwrap().clone())
        .collect();
    assert!(grids[0].aligned_with(&grids[1]));
    // the reference resolution comes from the first (earliest) scene
    assert_abs_diff_eq!(grids[0].pixres_x(), 10.0);
}

#[test]
fn test_clip_drops_disjoint_scenes_and_reports_them() {
    init_logging();
    let mut sc = SceneCollection::new();
    sc.add_scene(scene("inside", "2023-05-10T10:00:00Z", 1.0)).unwrap();

    let far_grid =
        GridSpec::from_bounds(&BoundingBox::new(900.0, 900.0, 940.0, 940.0), 10.0, 10.0, 32632);
    let far_band = Band::filled("B04", 5.0, DType::F32, NODATA, far_grid).unwrap();
    sc.add_scene(Scene::new(
        RasterCollection::from_bands(vec![far_band]).unwrap(),
        ts("2023-05-12T10:00:00Z"),
        Some("outside".to_string()),
    ))
    .unwrap();

    let geom = geo::Geometry::Rect(Rect::new(
        coord! { x: 5.0, y: 5.0 },
        coord! { x: 35.0, y: 35.0 },
    ));
    let feature = Feature::new("aoi", geom, 32632);

    let (clipped, dropped) = sc.clip_scenes(&feature, &ClipOptions::default()).unwrap();

    assert_eq!(clipped.len(), 1);
    assert_eq!(clipped.iter().next().unwrap().scene_id(), Some("inside"));
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].scene_id.as_deref(), Some("outside"));
}

#[test]
fn test_feature_timeseries_is_chronological_and_reports_empty_scenes() {
    let mut sc = SceneCollection::new();
    sc.add_scene(scene("a", "2023-05-10T10:00:00Z", 3.0)).unwrap();
    sc.add_scene(scene("b", "2023-05-15T10:00:00Z", NODATA)).unwrap();
    sc.add_scene(scene("c", "2023-05-20T10:00:00Z", 7.0)).unwrap();

    let geom = geo::Geometry::Rect(Rect::new(
        coord! { x: 5.0, y: 5.0 },
        coord! { x: 35.0, y: 35.0 },
    ));
    let feature = Feature::new("field", geom, 32632);

    let records = sc.get_feature_timeseries(&[feature], mean_reducer).unwrap();

    assert_eq!(records.len(), 3);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_abs_diff_eq!(records[0].value.unwrap(), 3.0);
    // the all-nodata scene yields a row with no value
    assert!(records[1].value.is_none());
    assert_abs_diff_eq!(records[2].value.unwrap(), 7.0);
}
