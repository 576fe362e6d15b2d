//! In-memory raster data model: bands, band collections and timestamped
//! scene collections with map algebra, mosaicking and alignment.

pub mod band;
pub mod raster;
pub mod scene;

// Re-export main types
pub use band::{
    Band, BandData, BandStatistics, ClipOptions, ClipTarget, Operand, OverlapPolicy,
    ReduceOptions,
};
pub use raster::RasterCollection;
pub use scene::{
    mean_reducer, DroppedScene, MosaicPolicy, Scene, SceneCollection, TimeseriesRecord,
};
