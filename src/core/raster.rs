//! Ordered collection of co-registered bands.

use crate::core::band::{
    Band, BandStatistics, ClipOptions, ClipTarget, Operand, ReduceOptions,
};
use crate::types::{EoError, EoResult, Feature, GridSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named set of [`Band`]s sharing one [`GridSpec`].
///
/// Bands are kept in insertion order and addressed by their unique name or,
/// if present, their unique alias. Insertion rejects bands whose grid is not
/// aligned with the collection grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Band>", into = "Vec<Band>")]
pub struct RasterCollection {
    bands: Vec<Band>,
    name_index: HashMap<String, usize>,
    alias_index: HashMap<String, String>,
}

impl TryFrom<Vec<Band>> for RasterCollection {
    type Error = EoError;

    fn try_from(bands: Vec<Band>) -> EoResult<Self> {
        let mut collection = RasterCollection::new();
        for band in bands {
            collection.add_band(band)?;
        }
        Ok(collection)
    }
}

impl From<RasterCollection> for Vec<Band> {
    fn from(collection: RasterCollection) -> Self {
        collection.bands
    }
}

impl RasterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from bands in order; fails on misaligned grids or
    /// duplicate names/aliases
    pub fn from_bands(bands: Vec<Band>) -> EoResult<Self> {
        Self::try_from(bands)
    }

    /// Grid shared by all member bands, `None` while the collection is empty
    pub fn grid(&self) -> Option<&GridSpec> {
        self.bands.first().map(|b| b.grid())
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.iter().map(|b| b.name()).collect()
    }

    pub fn band_aliases(&self) -> Vec<&str> {
        self.bands.iter().filter_map(|b| b.alias()).collect()
    }

    /// Bands in insertion order; the iterator is restartable
    pub fn iter(&self) -> impl Iterator<Item = &Band> {
        self.bands.iter()
    }

    /// Append a band.
    ///
    /// Fails with [`EoError::GridMismatch`] if the band grid differs from the
    /// collection grid and with [`EoError::DuplicateBand`] on a name or alias
    /// already taken.
    pub fn add_band(&mut self, band: Band) -> EoResult<()> {
        if let Some(grid) = self.grid() {
            if !grid.aligned_with(band.grid()) {
                return Err(EoError::GridMismatch(format!(
                    "band '{}' is not aligned with the collection grid",
                    band.name()
                )));
            }
        }
        if self.name_index.contains_key(band.name()) || self.alias_index.contains_key(band.name())
        {
            return Err(EoError::DuplicateBand(band.name().to_string()));
        }
        if let Some(alias) = band.alias() {
            if self.alias_index.contains_key(alias) || self.name_index.contains_key(alias) {
                return Err(EoError::DuplicateBand(alias.to_string()));
            }
            self.alias_index
                .insert(alias.to_string(), band.name().to_string());
        }
        self.name_index
            .insert(band.name().to_string(), self.bands.len());
        self.bands.push(band);
        Ok(())
    }

    /// Resolve a name or alias to the band name, naming the unresolved key
    /// on failure
    fn resolve(&self, key: &str) -> EoResult<&str> {
        if self.name_index.contains_key(key) {
            Ok(self.bands[self.name_index[key]].name())
        } else if let Some(name) = self.alias_index.get(key) {
            Ok(name)
        } else {
            Err(EoError::BandNotFound(key.to_string()))
        }
    }

    pub fn get_band(&self, key: &str) -> EoResult<&Band> {
        let name = self.resolve(key)?;
        Ok(&self.bands[self.name_index[name]])
    }

    /// Remove and return a band addressed by name or alias
    pub fn drop_band(&mut self, key: &str) -> EoResult<Band> {
        let name = self.resolve(key)?.to_string();
        let idx = self.name_index[&name];
        let band = self.bands.remove(idx);
        self.rebuild_index();
        Ok(band)
    }

    fn rebuild_index(&mut self) {
        self.name_index.clear();
        self.alias_index.clear();
        for (idx, band) in self.bands.iter().enumerate() {
            self.name_index.insert(band.name().to_string(), idx);
            if let Some(alias) = band.alias() {
                self.alias_index
                    .insert(alias.to_string(), band.name().to_string());
            }
        }
    }

    /// Sub-collection of the requested names/aliases, preserving the order
    /// of the request
    pub fn band_selection(&self, keys: &[&str]) -> EoResult<RasterCollection> {
        let mut selected = RasterCollection::new();
        for key in keys {
            selected.add_band(self.get_band(key)?.clone())?;
        }
        Ok(selected)
    }

    /// Transform every band with a caller-supplied function.
    ///
    /// The function must preserve the collection grid; a result on a
    /// different grid fails with [`EoError::GridMismatch`].
    pub fn apply<F>(&self, func: F) -> EoResult<RasterCollection>
    where
        F: Fn(&Band) -> EoResult<Band>,
    {
        let grid = self.grid().cloned();
        let mut out = RasterCollection::new();
        for band in &self.bands {
            let transformed = func(band)?;
            if let Some(grid) = &grid {
                if !grid.aligned_with(transformed.grid()) {
                    return Err(EoError::GridMismatch(format!(
                        "apply function changed the grid of band '{}'",
                        band.name()
                    )));
                }
            }
            out.add_band(transformed)?;
        }
        Ok(out)
    }

    /// Nearest-neighbor resample of every band onto a target grid; unlike
    /// [`RasterCollection::apply`] the grid is allowed (and expected) to
    /// change
    pub fn resample(&self, target: &GridSpec) -> EoResult<RasterCollection> {
        let mut out = RasterCollection::new();
        for band in &self.bands {
            out.add_band(band.resample_nearest(target)?)?;
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // collection algebra
    // ------------------------------------------------------------------

    fn map_scalar<F>(&self, op: F) -> EoResult<RasterCollection>
    where
        F: Fn(&Band) -> EoResult<Band>,
    {
        let mut out = RasterCollection::new();
        for band in &self.bands {
            let mut result = op(band)?;
            result.rename(band.name());
            out.add_band(result)?;
        }
        Ok(out)
    }

    pub fn add_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.add(value))
    }

    pub fn sub_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.sub(value))
    }

    /// Reflected subtraction: `value - band` for every band
    pub fn rsub_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.rsub(value))
    }

    pub fn mul_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.mul(value))
    }

    pub fn div_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.div(value))
    }

    /// Reflected division: `value / band` for every band
    pub fn rdiv_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.rdiv(value))
    }

    pub fn pow_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.pow(value))
    }

    /// Reflected power: `value ** band` for every band
    pub fn rpow_scalar(&self, value: f64) -> EoResult<RasterCollection> {
        self.map_scalar(|b| b.rpow(value))
    }

    fn zip_collections<F>(&self, other: &RasterCollection, op: F) -> EoResult<RasterCollection>
    where
        F: for<'a> Fn(&Band, Operand<'a>) -> EoResult<Band>,
    {
        let mut self_names: Vec<&str> = self.band_names();
        let mut other_names: Vec<&str> = other.band_names();
        self_names.sort_unstable();
        other_names.sort_unstable();
        if self_names != other_names {
            return Err(EoError::BandNotFound(format!(
                "collections do not share the same band names ({:?} vs {:?})",
                self_names, other_names
            )));
        }
        let mut out = RasterCollection::new();
        for band in &self.bands {
            let rhs = other.get_band(band.name())?;
            let mut result = op(band, Operand::Band(rhs))?;
            result.rename(band.name());
            out.add_band(result)?;
        }
        Ok(out)
    }

    /// Bandwise addition with another collection; both collections must
    /// expose exactly the same band names
    pub fn add_collection(&self, other: &RasterCollection) -> EoResult<RasterCollection> {
        self.zip_collections(other, |a, b| a.add(b))
    }

    pub fn sub_collection(&self, other: &RasterCollection) -> EoResult<RasterCollection> {
        self.zip_collections(other, |a, b| a.sub(b))
    }

    pub fn mul_collection(&self, other: &RasterCollection) -> EoResult<RasterCollection> {
        self.zip_collections(other, |a, b| a.mul(b))
    }

    pub fn div_collection(&self, other: &RasterCollection) -> EoResult<RasterCollection> {
        self.zip_collections(other, |a, b| a.div(b))
    }

    // ------------------------------------------------------------------
    // summaries, masking, clipping
    // ------------------------------------------------------------------

    /// Run [`Band::reduce`] over every band, one row per (band, feature)
    /// pair; without features one whole-band row per band
    pub fn band_summaries(
        &self,
        features: Option<&[Feature]>,
        opts: &ReduceOptions,
    ) -> EoResult<Vec<BandStatistics>> {
        let mut rows = Vec::new();
        for band in &self.bands {
            match features {
                None => rows.push(band.reduce(opts)?),
                Some(features) => rows.extend(band.reduce_by_features(features, opts)?),
            }
        }
        Ok(rows)
    }

    /// Mask bands with a classification band: pixels whose mask value is in
    /// `classes` become nodata in the selected bands (all bands except the
    /// mask band when `band_names` is `None`)
    pub fn mask(
        &self,
        mask_band: &str,
        classes: &[f64],
        band_names: Option<&[&str]>,
    ) -> EoResult<RasterCollection> {
        let mask = self.get_band(mask_band)?.clone();
        let targets: Vec<String> = match band_names {
            Some(names) => names
                .iter()
                .map(|n| self.resolve(n).map(str::to_string))
                .collect::<EoResult<_>>()?,
            None => self
                .bands
                .iter()
                .filter(|b| b.name() != mask.name())
                .map(|b| b.name().to_string())
                .collect(),
        };
        let mut out = RasterCollection::new();
        for band in &self.bands {
            let masked = if targets.iter().any(|t| t == band.name()) {
                band.mask_by(&mask, classes)?
            } else {
                band.clone()
            };
            out.add_band(masked)?;
        }
        Ok(out)
    }

    /// Apply scale/offset of every band, yielding physical values
    pub fn scale_values(&self) -> EoResult<RasterCollection> {
        self.apply(|b| b.scale_values())
    }

    /// Clip every band to a bound or geometry; see [`Band::clip`]
    pub fn clip_bands(
        &self,
        target: &ClipTarget<'_>,
        opts: &ClipOptions,
    ) -> EoResult<RasterCollection> {
        let mut out = RasterCollection::new();
        for band in &self.bands {
            out.add_band(band.clip(target, opts)?)?;
        }
        Ok(out)
    }
}
