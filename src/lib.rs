//! eostack: a raster data model and catalog pipeline for earth observation
//! time series
//!
//! The crate provides masked raster bands with explicit dtype promotion,
//! band collections, timestamped scenes, chronologically ordered scene
//! collections with alignment and mosaicking, a pluggable scene catalog
//! interface with a STAC client, and a mapper that turns a catalog query
//! into an analysis-ready collection.

pub mod core;
pub mod io;
pub mod mapper;
pub mod types;

// Re-export main types for easier access
pub use types::{BoundingBox, DType, EoError, EoResult, Feature, GridSpec, PromoteOp};

pub use crate::core::{
    mean_reducer, Band, BandData, BandStatistics, ClipOptions, ClipTarget, DroppedScene,
    MosaicPolicy, Operand, OverlapPolicy, RasterCollection, ReduceOptions, Scene,
    SceneCollection, TimeseriesRecord,
};

pub use io::{
    filter_and_sort, read_series, write_series, CatalogQuery, CompareOp, Filter, SceneCatalog,
    SceneMetadata, StacClient,
};

pub use mapper::{LoadOptions, Mapper, MapperConfigs, MapperState, SkippedScene};
