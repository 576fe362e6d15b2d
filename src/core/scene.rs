//! Timestamped scenes and time-ordered scene collections: mosaicking,
//! grid alignment, feature time series and clipping.

use crate::core::band::{Band, ClipOptions, ClipTarget, OverlapPolicy};
use crate::core::raster::RasterCollection;
use crate::types::{BoundingBox, EoError, EoResult, Feature, GridSpec};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A [`RasterCollection`] with an acquisition timestamp and an optional
/// scene identifier (e.g. a product URI)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    raster: RasterCollection,
    timestamp: DateTime<Utc>,
    scene_id: Option<String>,
}

impl Scene {
    pub fn new(
        raster: RasterCollection,
        timestamp: DateTime<Utc>,
        scene_id: Option<String>,
    ) -> Self {
        Self {
            raster,
            timestamp,
            scene_id,
        }
    }

    pub fn raster(&self) -> &RasterCollection {
        &self.raster
    }

    pub fn raster_mut(&mut self) -> &mut RasterCollection {
        &mut self.raster
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn scene_id(&self) -> Option<&str> {
        self.scene_id.as_deref()
    }
}

/// Pixel tie-break rule for overlapping scenes during mosaicking
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MosaicPolicy {
    /// First non-nodata value in insertion order wins (default)
    #[default]
    FirstWins,
    /// Most recently inserted non-nodata value wins
    LastWins,
    /// Scenes are consulted in the order their ids appear in the list;
    /// unlisted scenes come last in insertion order
    Priority(Vec<String>),
}

/// Scene dropped by [`SceneCollection::clip_scenes`]
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedScene {
    pub timestamp: DateTime<Utc>,
    pub scene_id: Option<String>,
}

/// One aggregated value of a feature time series
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesRecord {
    pub timestamp: DateTime<Utc>,
    pub scene_id: Option<String>,
    pub feature_name: String,
    pub band_name: String,
    /// `None` when the feature covers no unmasked pixel in this scene
    pub value: Option<f64>,
}

/// Arithmetic mean, the default time series reducer
pub fn mean_reducer(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Time-ordered collection of [`Scene`]s.
///
/// Scenes are kept chronological; equal timestamps keep their insertion
/// order. Duplicate timestamps are permitted (distinct acquisitions of the
/// same pass), duplicate scene ids are not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Scene>", into = "Vec<Scene>")]
pub struct SceneCollection {
    scenes: Vec<Scene>,
}

impl TryFrom<Vec<Scene>> for SceneCollection {
    type Error = EoError;

    fn try_from(scenes: Vec<Scene>) -> EoResult<Self> {
        let mut collection = SceneCollection::new();
        for scene in scenes {
            collection.add_scene(scene)?;
        }
        Ok(collection)
    }
}

impl From<SceneCollection> for Vec<Scene> {
    fn from(collection: SceneCollection) -> Self {
        collection.scenes
    }
}

impl SceneCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.iter()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.scenes.iter().map(|s| s.timestamp).collect()
    }

    pub fn scene_ids(&self) -> Vec<&str> {
        self.scenes.iter().filter_map(|s| s.scene_id()).collect()
    }

    /// Insert a scene at its chronological position; ties go after existing
    /// scenes with the same timestamp
    pub fn add_scene(&mut self, scene: Scene) -> EoResult<()> {
        if let Some(id) = scene.scene_id() {
            if self.scenes.iter().any(|s| s.scene_id() == Some(id)) {
                return Err(EoError::DuplicateScene(id.to_string()));
            }
        }
        let pos = self
            .scenes
            .partition_point(|s| s.timestamp <= scene.timestamp);
        self.scenes.insert(pos, scene);
        Ok(())
    }

    /// First scene with the exact timestamp
    pub fn scene_at(&self, timestamp: DateTime<Utc>) -> EoResult<&Scene> {
        self.scenes
            .iter()
            .find(|s| s.timestamp == timestamp)
            .ok_or_else(|| EoError::SceneNotFound(timestamp.to_rfc3339()))
    }

    pub fn scene_by_id(&self, scene_id: &str) -> EoResult<&Scene> {
        self.scenes
            .iter()
            .find(|s| s.scene_id() == Some(scene_id))
            .ok_or_else(|| EoError::SceneNotFound(scene_id.to_string()))
    }

    /// Transform every scene with a caller-supplied function
    pub fn apply<F>(&self, func: F) -> EoResult<SceneCollection>
    where
        F: Fn(&Scene) -> EoResult<Scene>,
    {
        let mut out = SceneCollection::new();
        for scene in &self.scenes {
            out.add_scene(func(scene)?)?;
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // alignment
    // ------------------------------------------------------------------

    /// Resample every scene onto one reference grid so pixel `(r, c)` means
    /// the same ground location across the collection.
    ///
    /// The reference is the supplied target grid or, by default, the union
    /// of all scene extents at the first scene's resolution and CRS. Scenes
    /// in a different CRS fail with [`EoError::GridMismatch`].
    pub fn align(&self, target: Option<&GridSpec>) -> EoResult<SceneCollection> {
        if self.scenes.is_empty() {
            return Ok(SceneCollection::new());
        }
        let reference = match target {
            Some(grid) => grid.clone(),
            None => self.common_grid()?,
        };
        let mut out = SceneCollection::new();
        for scene in &self.scenes {
            let resampled = scene.raster.resample(&reference)?;
            out.add_scene(Scene::new(resampled, scene.timestamp, scene.scene_id.clone()))?;
        }
        Ok(out)
    }

    /// Union of all scene extents at the first scene's resolution
    fn common_grid(&self) -> EoResult<GridSpec> {
        let first = self
            .scenes
            .iter()
            .find_map(|s| s.raster.grid())
            .ok_or_else(|| {
                EoError::GridMismatch("no scene in the collection carries a grid".to_string())
            })?;
        let mut bounds: Option<BoundingBox> = None;
        for scene in &self.scenes {
            if let Some(grid) = scene.raster.grid() {
                if grid.epsg() != first.epsg() {
                    return Err(EoError::GridMismatch(format!(
                        "scene '{}' is in EPSG:{}, reference is EPSG:{}",
                        scene.scene_id().unwrap_or("<unnamed>"),
                        grid.epsg(),
                        first.epsg()
                    )));
                }
                let b = grid.bounds();
                bounds = Some(bounds.map_or(b, |acc| acc.union(&b)));
            }
        }
        let bounds = bounds.unwrap_or_else(|| first.bounds());
        Ok(GridSpec::from_bounds(
            &bounds,
            first.pixres_x(),
            first.pixres_y(),
            first.epsg(),
        ))
    }

    // ------------------------------------------------------------------
    // mosaicking
    // ------------------------------------------------------------------

    /// Merge scenes acquired within the same time slot.
    ///
    /// Timestamps are rounded down to a multiple of `tolerance`; all scenes
    /// sharing a rounded value are merged into one scene carrying the
    /// rounded timestamp. Overlapping pixels are resolved by `policy`.
    /// Merging requires all grouped scenes to be aligned (call
    /// [`SceneCollection::align`] first) and to expose the same band names.
    pub fn mosaic(&self, tolerance: Duration, policy: &MosaicPolicy) -> EoResult<SceneCollection> {
        if tolerance <= Duration::zero() {
            return Err(EoError::InvalidParameter(
                "mosaic tolerance must be positive".to_string(),
            ));
        }
        // group by rounded timestamp, chronological via BTreeMap
        let mut groups: BTreeMap<DateTime<Utc>, Vec<&Scene>> = BTreeMap::new();
        for scene in &self.scenes {
            let rounded = scene.timestamp.duration_trunc(tolerance).map_err(|e| {
                EoError::InvalidParameter(format!("mosaic tolerance: {}", e))
            })?;
            groups.entry(rounded).or_default().push(scene);
        }
        let mut out = SceneCollection::new();
        for (rounded, group) in groups {
            if group.len() == 1 {
                let scene = group[0];
                out.add_scene(Scene::new(
                    scene.raster.clone(),
                    rounded,
                    scene.scene_id.clone(),
                ))?;
                continue;
            }
            log::info!(
                "mosaicking {} scenes into time slot {}",
                group.len(),
                rounded.to_rfc3339()
            );
            out.add_scene(Self::merge_group(&group, rounded, policy)?)?;
        }
        Ok(out)
    }

    fn merge_group(
        group: &[&Scene],
        timestamp: DateTime<Utc>,
        policy: &MosaicPolicy,
    ) -> EoResult<Scene> {
        let mut ordered: Vec<&Scene> = group.to_vec();
        match policy {
            MosaicPolicy::FirstWins => {}
            MosaicPolicy::LastWins => ordered.reverse(),
            MosaicPolicy::Priority(ids) => {
                let rank = |scene: &Scene| {
                    scene
                        .scene_id()
                        .and_then(|id| ids.iter().position(|p| p == id))
                        .unwrap_or(ids.len())
                };
                ordered.sort_by_key(|s| rank(*s));
            }
        }
        let first = ordered[0];
        let mut merged_bands: Vec<Band> = first.raster.iter().cloned().collect();
        for scene in &ordered[1..] {
            let mut names: Vec<&str> = scene.raster.band_names();
            let mut first_names: Vec<&str> = first.raster.band_names();
            names.sort_unstable();
            first_names.sort_unstable();
            if names != first_names {
                return Err(EoError::BandNotFound(format!(
                    "scenes in time slot {} expose different band sets",
                    timestamp.to_rfc3339()
                )));
            }
            for band in merged_bands.iter_mut() {
                band.fill_nodata_from(scene.raster.get_band(band.name())?)?;
            }
        }
        let ids: Vec<&str> = ordered.iter().filter_map(|s| s.scene_id()).collect();
        let scene_id = if ids.is_empty() {
            None
        } else {
            Some(ids.join("&&"))
        };
        Ok(Scene::new(
            RasterCollection::from_bands(merged_bands)?,
            timestamp,
            scene_id,
        ))
    }

    // ------------------------------------------------------------------
    // time series and clipping
    // ------------------------------------------------------------------

    /// Aggregate every (scene, feature, band) to one scalar, chronologically.
    ///
    /// The reducer sees all unmasked pixels of a band inside a feature;
    /// [`mean_reducer`] is the conventional choice.
    pub fn get_feature_timeseries<F>(
        &self,
        features: &[Feature],
        reducer: F,
    ) -> EoResult<Vec<TimeseriesRecord>>
    where
        F: Fn(&[f64]) -> Option<f64>,
    {
        let mut records = Vec::new();
        for scene in &self.scenes {
            for feature in features {
                for band in scene.raster.iter() {
                    let values =
                        band.valid_values(Some(feature.geometry()), OverlapPolicy::PixelCenter)?;
                    records.push(TimeseriesRecord {
                        timestamp: scene.timestamp,
                        scene_id: scene.scene_id.clone(),
                        feature_name: feature.name().to_string(),
                        band_name: band.name().to_string(),
                        value: reducer(&values),
                    });
                }
            }
        }
        Ok(records)
    }

    /// Intersect every scene with a feature geometry.
    ///
    /// Scenes with an empty intersection are dropped from the result and
    /// reported back; nothing disappears silently.
    pub fn clip_scenes(
        &self,
        feature: &Feature,
        opts: &ClipOptions,
    ) -> EoResult<(SceneCollection, Vec<DroppedScene>)> {
        let target = ClipTarget::Geometry(feature.geometry());
        let mut out = SceneCollection::new();
        let mut dropped = Vec::new();
        for scene in &self.scenes {
            match scene.raster.clip_bands(&target, opts) {
                Ok(clipped) => {
                    out.add_scene(Scene::new(clipped, scene.timestamp, scene.scene_id.clone()))?;
                }
                Err(EoError::EmptyGeometry(_)) => {
                    log::warn!(
                        "dropping scene '{}' ({}): no intersection with feature '{}'",
                        scene.scene_id().unwrap_or("<unnamed>"),
                        scene.timestamp.to_rfc3339(),
                        feature.name()
                    );
                    dropped.push(DroppedScene {
                        timestamp: scene.timestamp,
                        scene_id: scene.scene_id.clone(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok((out, dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;
    use chrono::TimeZone;
    use ndarray::{array, Array2};

    fn grid_at(min_x: f64) -> GridSpec {
        GridSpec::new([10.0, 0.0, min_x, 0.0, -10.0, 20.0], 32633, 2, 2)
    }

    fn scene(ts: &str, id: &str, fill: f64, min_x: f64) -> Scene {
        let band = Band::new(
            "B04",
            Array2::from_elem((2, 2), fill),
            DType::F32,
            f64::NAN,
            grid_at(min_x),
        )
        .unwrap();
        Scene::new(
            RasterCollection::from_bands(vec![band]).unwrap(),
            ts.parse().unwrap(),
            Some(id.to_string()),
        )
    }

    #[test]
    fn test_chronological_order_with_ties() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-02T10:00:00Z", "b", 1.0, 0.0)).unwrap();
        sc.add_scene(scene("2023-06-01T10:00:00Z", "a", 1.0, 0.0)).unwrap();
        sc.add_scene(scene("2023-06-02T10:00:00Z", "c", 1.0, 0.0)).unwrap();
        assert_eq!(sc.scene_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-01T10:00:00Z", "a", 1.0, 0.0)).unwrap();
        let result = sc.add_scene(scene("2023-06-02T10:00:00Z", "a", 1.0, 0.0));
        assert!(matches!(result, Err(EoError::DuplicateScene(_))));
    }

    #[test]
    fn test_mosaic_rejects_non_positive_tolerance() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-01T10:00:00Z", "a", 1.0, 0.0)).unwrap();
        let result = sc.mosaic(Duration::zero(), &MosaicPolicy::FirstWins);
        assert!(matches!(result, Err(EoError::InvalidParameter(_))));
    }

    #[test]
    fn test_mosaic_groups_by_rounded_timestamp() {
        let mut sc = SceneCollection::new();
        // tile "a" has a nodata hole that tile "b" fills
        let hole = Band::new(
            "B04",
            array![[1.0, f64::NAN], [1.0, 1.0]],
            DType::F32,
            f64::NAN,
            grid_at(0.0),
        )
        .unwrap();
        let tile_a = Scene::new(
            RasterCollection::from_bands(vec![hole]).unwrap(),
            "2023-06-01T10:00:03Z".parse().unwrap(),
            Some("a".to_string()),
        );
        sc.add_scene(tile_a).unwrap();
        sc.add_scene(scene("2023-06-01T10:00:47Z", "b", 2.0, 0.0)).unwrap();
        sc.add_scene(scene("2023-06-01T11:30:00Z", "c", 3.0, 0.0)).unwrap();

        let mosaicked = sc
            .mosaic(Duration::seconds(60), &MosaicPolicy::FirstWins)
            .unwrap();
        assert_eq!(mosaicked.len(), 2);
        let merged = mosaicked
            .scene_at(Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap())
            .unwrap();
        assert_eq!(merged.scene_id(), Some("a&&b"));
        let values = merged.raster().get_band("B04").unwrap();
        // first-wins keeps tile "a" where valid, fills the hole from "b"
        assert_eq!(values.values().unwrap()[(0, 0)], 1.0);
        assert_eq!(values.values().unwrap()[(0, 1)], 2.0);
        // the late scene stays separate with its rounded timestamp
        assert!(mosaicked
            .scene_at(Utc.with_ymd_and_hms(2023, 6, 1, 11, 30, 0).unwrap())
            .is_ok());
    }

    #[test]
    fn test_mosaic_priority_policy() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-01T10:00:03Z", "a", 1.0, 0.0)).unwrap();
        sc.add_scene(scene("2023-06-01T10:00:47Z", "b", 2.0, 0.0)).unwrap();
        let mosaicked = sc
            .mosaic(
                Duration::seconds(60),
                &MosaicPolicy::Priority(vec!["b".to_string(), "a".to_string()]),
            )
            .unwrap();
        let merged = mosaicked.iter().next().unwrap();
        assert_eq!(
            merged.raster().get_band("B04").unwrap().values().unwrap()[(0, 0)],
            2.0
        );
    }

    #[test]
    fn test_align_onto_union_grid() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-01T10:00:00Z", "a", 1.0, 0.0)).unwrap();
        sc.add_scene(scene("2023-06-02T10:00:00Z", "b", 2.0, 10.0)).unwrap();
        let aligned = sc.align(None).unwrap();
        let grids: Vec<&GridSpec> = aligned
            .iter()
            .map(|s| s.raster().grid().unwrap())
            .collect();
        assert!(grids[0].aligned_with(grids[1]));
        // union of [0, 20] and [10, 30] at 10 m resolution is 3 columns
        assert_eq!(grids[0].n_cols(), 3);
        // scene "a" has no pixels in the easternmost column
        let band = aligned.iter().next().unwrap().raster().get_band("B04").unwrap();
        assert!(band.value_at(0, 2).is_none());
        assert_eq!(band.value_at(0, 0), Some(1.0));
    }

    #[test]
    fn test_clip_scenes_drops_disjoint() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-01T10:00:00Z", "a", 1.0, 0.0)).unwrap();
        let far_away = geo::Geometry::Rect(geo::Rect::new(
            geo::coord! { x: 1e6, y: 1e6 },
            geo::coord! { x: 2e6, y: 2e6 },
        ));
        let feature = Feature::new("field", far_away, 32633);
        let (clipped, dropped) = sc
            .clip_scenes(&feature, &ClipOptions::default())
            .unwrap();
        assert_eq!(clipped.len(), 0);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].scene_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_feature_timeseries_is_chronological() {
        let mut sc = SceneCollection::new();
        sc.add_scene(scene("2023-06-02T10:00:00Z", "b", 4.0, 0.0)).unwrap();
        sc.add_scene(scene("2023-06-01T10:00:00Z", "a", 2.0, 0.0)).unwrap();
        let geom = geo::Geometry::Rect(geo::Rect::new(
            geo::coord! { x: 0.0, y: 0.0 },
            geo::coord! { x: 20.0, y: 20.0 },
        ));
        let feature = Feature::new("field", geom, 32633);
        let records = sc
            .get_feature_timeseries(std::slice::from_ref(&feature), mean_reducer)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].scene_id.as_deref(), Some("a"));
        assert_eq!(records[0].value, Some(2.0));
        assert_eq!(records[1].value, Some(4.0));
    }
}
