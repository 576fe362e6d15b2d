//! I/O boundaries: catalog queries, series persistence and the raster
//! export interface.

pub mod catalog;
pub mod export;
pub mod persistence;

pub use catalog::{
    filter_and_sort, CatalogQuery, CompareOp, Filter, SceneCatalog, SceneMetadata, StacClient,
};
pub use export::{export_metadata, BandExportMetadata, ExportOptions, RasterWriter};
pub use persistence::{dump_series, load_series, read_series, write_series, FORMAT_VERSION};
