//! Query-and-merge pipeline: search a scene catalog, materialize scenes
//! through a caller-supplied constructor and assemble an analysis-ready,
//! grid-aligned [`SceneCollection`].

use crate::core::scene::{MosaicPolicy, Scene, SceneCollection};
use crate::io::catalog::{CatalogQuery, Filter, SceneCatalog, SceneMetadata};
use crate::types::{EoError, EoResult, Feature, GridSpec};
use chrono::{DateTime, Duration, Utc};

/// Search parameters of a [`Mapper`]
#[derive(Debug, Clone)]
pub struct MapperConfigs {
    pub collection: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub feature: Feature,
    pub metadata_filters: Vec<Filter>,
}

impl MapperConfigs {
    pub fn new(
        collection: impl Into<String>,
        time_start: DateTime<Utc>,
        time_end: DateTime<Utc>,
        feature: Feature,
        metadata_filters: Vec<Filter>,
    ) -> Self {
        Self {
            collection: collection.into(),
            time_start,
            time_end,
            feature,
            metadata_filters,
        }
    }
}

/// Options of one [`Mapper::load_scenes`] call.
///
/// Defaults: load all bands, skip failing scenes instead of aborting, no
/// mosaicking, reference grid derived from the loaded scenes.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Band names the scene constructor is asked to materialize
    pub band_selection: Option<Vec<String>>,
    /// Abort the whole load on the first scene construction failure
    pub strict: bool,
    /// Merge scenes whose timestamps fall into the same slot of this width
    pub mosaic_tolerance: Option<Duration>,
    pub mosaic_policy: MosaicPolicy,
    /// Explicit reference grid; default is the union grid of the scenes
    pub target_grid: Option<GridSpec>,
}

/// A metadata row skipped during a non-strict load
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedScene {
    pub scene_id: String,
    pub reason: String,
}

/// Pipeline state: queries move the mapper to `Queried`, loads to `Loaded`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperState {
    Configured,
    Queried,
    Loaded,
}

/// Orchestrates catalog query, scene construction, alignment and
/// mosaicking.
///
/// The mapper is polymorphic over two capabilities supplied by the caller:
/// a [`SceneCatalog`] for metadata search and a scene constructor
/// `(metadata, options) -> Scene` for pixel materialization. It never
/// interprets storage formats itself.
pub struct Mapper {
    configs: MapperConfigs,
    state: MapperState,
    metadata: Vec<SceneMetadata>,
    data: Option<SceneCollection>,
    skipped: Vec<SkippedScene>,
}

impl Mapper {
    pub fn new(configs: MapperConfigs) -> Self {
        Self {
            configs,
            state: MapperState::Configured,
            metadata: Vec::new(),
            data: None,
            skipped: Vec::new(),
        }
    }

    pub fn configs(&self) -> &MapperConfigs {
        &self.configs
    }

    pub fn state(&self) -> MapperState {
        self.state
    }

    /// Metadata rows of the last query, sorted by ascending acquisition time
    pub fn metadata(&self) -> &[SceneMetadata] {
        &self.metadata
    }

    /// The assembled collection, `None` before a successful load
    pub fn data(&self) -> Option<&SceneCollection> {
        self.data.as_ref()
    }

    /// Rows skipped by the last non-strict load
    pub fn skipped(&self) -> &[SkippedScene] {
        &self.skipped
    }

    /// Query the catalog for scene metadata; no pixel data is fetched.
    ///
    /// Re-querying resets the mapper to the `Queried` state and discards any
    /// previously loaded collection.
    pub fn query_scenes(&mut self, catalog: &dyn SceneCatalog) -> EoResult<()> {
        let query = CatalogQuery {
            collection: self.configs.collection.clone(),
            time_start: self.configs.time_start,
            time_end: self.configs.time_end,
            feature: self.configs.feature.clone(),
            filters: self.configs.metadata_filters.clone(),
        };
        self.metadata = catalog.search(&query)?;
        self.data = None;
        self.skipped.clear();
        self.state = MapperState::Queried;
        log::info!(
            "query for collection '{}' matched {} scenes",
            self.configs.collection,
            self.metadata.len()
        );
        Ok(())
    }

    /// Materialize, align and optionally mosaic the queried scenes.
    ///
    /// The constructor is invoked once per metadata row. In non-strict mode
    /// a failing row is recorded in [`Mapper::skipped`] and skipped; in
    /// strict mode the first failure aborts the load. The call is idempotent
    /// for fixed metadata and constructor: the collection is rebuilt from
    /// scratch every time.
    pub fn load_scenes<F>(&mut self, constructor: F, opts: &LoadOptions) -> EoResult<()>
    where
        F: Fn(&SceneMetadata, &LoadOptions) -> EoResult<Scene>,
    {
        if self.state == MapperState::Configured {
            return Err(EoError::MapperState(
                "load_scenes requires a preceding query_scenes call".to_string(),
            ));
        }
        let mut collection = SceneCollection::new();
        self.skipped.clear();
        for record in &self.metadata {
            let scene = match constructor(record, opts) {
                Ok(scene) => scene,
                Err(e) => {
                    if opts.strict {
                        return Err(EoError::SceneConstruction {
                            scene_id: record.scene_id.clone(),
                            reason: e.to_string(),
                        });
                    }
                    log::warn!(
                        "skipping scene '{}': construction failed: {}",
                        record.scene_id,
                        e
                    );
                    self.skipped.push(SkippedScene {
                        scene_id: record.scene_id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match collection.add_scene(scene) {
                Ok(()) => {}
                // catalogs occasionally list the same product twice under
                // slightly different timestamps
                Err(EoError::DuplicateScene(id)) => {
                    log::warn!("scene '{}' already part of the collection, skipping", id);
                    self.skipped.push(SkippedScene {
                        scene_id: id.clone(),
                        reason: format!("duplicate scene identifier '{}'", id),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        let mut collection = collection.align(opts.target_grid.as_ref())?;
        if let Some(tolerance) = opts.mosaic_tolerance {
            collection = collection.mosaic(tolerance, &opts.mosaic_policy)?;
        }
        log::info!(
            "loaded {} scenes ({} skipped)",
            collection.len(),
            self.skipped.len()
        );
        self.data = Some(collection);
        self.state = MapperState::Loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{coord, Rect};

    fn configs() -> MapperConfigs {
        let geom = geo::Geometry::Rect(Rect::new(
            coord! { x: 10.0, y: 45.0 },
            coord! { x: 11.0, y: 46.0 },
        ));
        MapperConfigs::new(
            "sentinel-2-l2a",
            "2023-03-01T00:00:00Z".parse().unwrap(),
            "2023-07-01T00:00:00Z".parse().unwrap(),
            Feature::new("aoi", geom, 4326),
            Vec::new(),
        )
    }

    #[test]
    fn test_load_before_query_is_a_state_error() {
        let mut mapper = Mapper::new(configs());
        let result = mapper.load_scenes(
            |_, _| unreachable!("constructor must not run"),
            &LoadOptions::default(),
        );
        assert!(matches!(result, Err(EoError::MapperState(_))));
        assert_eq!(mapper.state(), MapperState::Configured);
    }
}
