//! RasterCollection: band bookkeeping, selection, collection algebra and
//! masking.

use approx::assert_abs_diff_eq;
use eostack::{Band, BoundingBox, DType, EoError, GridSpec, RasterCollection};
use ndarray::Array2;

fn grid() -> GridSpec {
    GridSpec::from_bounds(&BoundingBox::new(0.0, 0.0, 40.0, 40.0), 10.0, 10.0, 32632)
}

fn filled(name: &str, value: f64) -> Band {
    Band::filled(name, value, DType::F32, -9999.0, grid()).unwrap()
}

#[test]
fn test_duplicate_band_names_and_aliases_are_rejected() {
    let mut rc = RasterCollection::new();
    rc.add_band(filled("B04", 1.0).with_alias("red")).unwrap();

    let same_name = filled("B04", 2.0);
    assert!(matches!(rc.add_band(same_name), Err(EoError::DuplicateBand(_))));

    let same_alias = filled("B05", 2.0).with_alias("red");
    assert!(matches!(rc.add_band(same_alias), Err(EoError::DuplicateBand(_))));
}

#[test]
fn test_bands_resolve_by_name_and_by_alias() {
    let rc = RasterCollection::from_bands(vec![
        filled("B04", 1.0).with_alias("red"),
        filled("B08", 2.0).with_alias("nir"),
    ])
    .unwrap();

    assert_eq!(rc.get_band("B08").unwrap().name(), "B08");
    assert_eq!(rc.get_band("nir").unwrap().name(), "B08");
    assert!(matches!(rc.get_band("swir"), Err(EoError::BandNotFound(_))));
}

#[test]
fn test_band_selection_preserves_request_order() {
    let rc = RasterCollection::from_bands(vec![
        filled("B02", 1.0),
        filled("B04", 2.0).with_alias("red"),
        filled("B08", 3.0),
    ])
    .unwrap();

    let subset = rc.band_selection(&["B08", "red"]).unwrap();
    assert_eq!(subset.band_names(), vec!["B08", "B04"]);

    let err = rc.band_selection(&["B08", "B99"]).unwrap_err();
    match err {
        EoError::BandNotFound(key) => assert!(key.contains("B99")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_misaligned_band_is_rejected() {
    let mut rc = RasterCollection::new();
    rc.add_band(filled("a", 1.0)).unwrap();

    let other_grid =
        GridSpec::from_bounds(&BoundingBox::new(0.0, 0.0, 40.0, 40.0), 20.0, 20.0, 32632);
    let coarse = Band::filled("b", 1.0, DType::F32, -9999.0, other_grid).unwrap();
    assert!(matches!(rc.add_band(coarse), Err(EoError::GridMismatch(_))));
}

#[test]
fn test_scalar_algebra_keeps_band_names() {
    let rc = RasterCollection::from_bands(vec![filled("B04", 2.0), filled("B08", 6.0)]).unwrap();

    let scaled = rc.mul_scalar(0.5).unwrap();

    assert_eq!(scaled.band_names(), vec!["B04", "B08"]);
    assert_abs_diff_eq!(scaled.get_band("B04").unwrap().value_at(0, 0).unwrap(), 1.0);
    assert_abs_diff_eq!(scaled.get_band("B08").unwrap().value_at(0, 0).unwrap(), 3.0);
}

#[test]
fn test_collection_algebra_requires_identical_band_sets() {
    let a = RasterCollection::from_bands(vec![filled("B04", 6.0), filled("B08", 8.0)]).unwrap();
    let b = RasterCollection::from_bands(vec![filled("B08", 2.0), filled("B04", 3.0)]).unwrap();

    // bands are matched by name, insertion order does not matter
    let ratio = a.div_collection(&b).unwrap();
    assert_abs_diff_eq!(ratio.get_band("B04").unwrap().value_at(0, 0).unwrap(), 2.0);
    assert_abs_diff_eq!(ratio.get_band("B08").unwrap().value_at(0, 0).unwrap(), 4.0);

    let c = RasterCollection::from_bands(vec![filled("B04", 1.0)]).unwrap();
    assert!(matches!(a.add_collection(&c), Err(EoError::BandNotFound(_))));
}

#[test]
fn test_mask_by_classification_band() {
    let mut cloud = Array2::zeros((4, 4));
    cloud[[0, 0]] = 9.0;
    cloud[[3, 3]] = 8.0;
    let scl = Band::new("SCL", cloud, DType::U8, 255.0, grid()).unwrap();

    let mut rc = RasterCollection::from_bands(vec![filled("B04", 5.0), filled("B08", 7.0)]).unwrap();
    rc.add_band(scl).unwrap();

    let masked = rc.mask("SCL", &[8.0, 9.0], Some(&["B04", "B08"])).unwrap();

    let b04 = masked.get_band("B04").unwrap();
    assert!(b04.value_at(0, 0).is_none());
    assert!(b04.value_at(3, 3).is_none());
    assert_abs_diff_eq!(b04.value_at(1, 1).unwrap(), 5.0);
    // the classification band itself is left untouched
    assert_abs_diff_eq!(masked.get_band("SCL").unwrap().value_at(0, 0).unwrap(), 9.0);
}
