//! Raster export interface consumed by writer collaborators.
//!
//! Concrete file formats live outside this crate; a writer receives the
//! collection together with per-band scale/offset/nodata metadata so viewers
//! can apply scale and offset on the fly.

use crate::core::raster::RasterCollection;
use crate::types::{DType, EoResult};

/// Per-band metadata a writer must carry into the output file
#[derive(Debug, Clone, PartialEq)]
pub struct BandExportMetadata {
    pub name: String,
    pub alias: Option<String>,
    pub dtype: DType,
    pub nodata: f64,
    pub scale: f64,
    pub offset: f64,
}

/// Writer-facing options
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Request a cloud-optimized layout; internal tiling and overview
    /// generation are the writer's job
    pub cloud_optimized: bool,
}

/// Capability interface of an external raster writer
pub trait RasterWriter {
    fn write(&mut self, raster: &RasterCollection, opts: &ExportOptions) -> EoResult<()>;
}

/// Export metadata for every band, in band order
pub fn export_metadata(raster: &RasterCollection) -> Vec<BandExportMetadata> {
    raster
        .iter()
        .map(|band| BandExportMetadata {
            name: band.name().to_string(),
            alias: band.alias().map(str::to_string),
            dtype: band.dtype(),
            nodata: band.nodata(),
            scale: band.scale(),
            offset: band.offset(),
        })
        .collect()
}
