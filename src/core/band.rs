//! Georeferenced single-band raster with masked algebra, reduction,
//! clipping and masking.

use crate::types::{BoundingBox, DType, EoError, EoResult, Feature, GridSpec, PromoteOp};
use geo::{BoundingRect, Contains, Geometry, Intersects, Point, Rect};
use ndarray::{Array2, Zip};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Pixel storage of a band.
///
/// Real-valued bands keep their pixels at full `f64` precision regardless of
/// the logical [`DType`]; the dtype tells exporters and algebra how the values
/// are to be stored and promoted.
#[derive(Debug, Clone)]
pub enum BandData {
    Real(Array2<f64>),
    Complex(Array2<Complex<f64>>),
}

impl BandData {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            BandData::Real(a) => a.dim(),
            BandData::Complex(a) => a.dim(),
        }
    }
}

/// Default nodata sentinel for a dtype, used when an algebra result cannot
/// carry the left operand's sentinel
fn default_nodata(dtype: DType) -> f64 {
    match dtype {
        DType::U8 => u8::MAX as f64,
        DType::U16 => u16::MAX as f64,
        DType::I16 => i16::MIN as f64,
        DType::U32 => u32::MAX as f64,
        DType::I32 => i32::MIN as f64,
        DType::F32 | DType::F64 | DType::C64 => f64::NAN,
    }
}

/// Smallest dtype that represents a scalar operand exactly
fn scalar_dtype(value: f64) -> DType {
    for candidate in [DType::U8, DType::I16, DType::U16, DType::I32, DType::U32, DType::F32] {
        if candidate.can_represent(value) {
            return candidate;
        }
    }
    DType::F64
}

/// Elementwise operators supported by band algebra
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl ArithOp {
    fn promote_class(self) -> PromoteOp {
        match self {
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul => PromoteOp::Arithmetic,
            ArithOp::Div | ArithOp::Pow => PromoteOp::Fractional,
            _ => PromoteOp::Comparison,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Pow => "**",
            ArithOp::Lt => "<",
            ArithOp::Le => "<=",
            ArithOp::Gt => ">",
            ArithOp::Ge => ">=",
            ArithOp::Eq => "==",
            ArithOp::Ne => "!=",
        }
    }

    fn apply_real(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Pow => a.powf(b),
            ArithOp::Lt => (a < b) as u8 as f64,
            ArithOp::Le => (a <= b) as u8 as f64,
            ArithOp::Gt => (a > b) as u8 as f64,
            ArithOp::Ge => (a >= b) as u8 as f64,
            ArithOp::Eq => (a == b) as u8 as f64,
            ArithOp::Ne => (a != b) as u8 as f64,
        }
    }

    fn apply_complex(self, a: Complex<f64>, b: Complex<f64>) -> Complex<f64> {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Pow => a.powc(b),
            // comparisons are rejected during promotion
            _ => unreachable!("comparison on complex operands"),
        }
    }
}

/// Right-hand side of a band algebra expression
pub enum Operand<'a> {
    Band(&'a Band),
    Scalar(f64),
}

impl<'a> From<&'a Band> for Operand<'a> {
    fn from(band: &'a Band) -> Self {
        Operand::Band(band)
    }
}

impl From<f64> for Operand<'_> {
    fn from(value: f64) -> Self {
        Operand::Scalar(value)
    }
}

impl From<i32> for Operand<'_> {
    fn from(value: i32) -> Self {
        Operand::Scalar(value as f64)
    }
}

/// Pixel inclusion policy when rasterizing polygon features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Include a pixel if its center falls inside the polygon (default)
    PixelCenter,
    /// Include a pixel if any part of its cell overlaps the polygon
    WholeCell,
}

/// Options for [`Band::reduce`] and friends
#[derive(Debug, Clone)]
pub struct ReduceOptions {
    /// Percentiles in [0, 100] to report alongside the base statistics
    pub percentiles: Vec<f64>,
    pub overlap: OverlapPolicy,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            percentiles: Vec::new(),
            overlap: OverlapPolicy::PixelCenter,
        }
    }
}

/// Scalar statistics over the unmasked pixels of a band
#[derive(Debug, Clone, PartialEq)]
pub struct BandStatistics {
    pub band_name: String,
    /// Name of the polygon feature the statistics refer to, `None` for
    /// whole-band statistics
    pub feature_name: Option<String>,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// `(percentile, value)` pairs in the order requested
    pub percentiles: Vec<(f64, f64)>,
}

/// Clip target: a plain rectangle or a feature geometry
pub enum ClipTarget<'a> {
    Bounds(BoundingBox),
    Geometry(&'a Geometry<f64>),
}

/// Options for [`Band::clip`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipOptions {
    /// Crop to the geometry's bounding box only, without masking pixels
    /// outside the geometry itself
    pub full_bounding_box_only: bool,
}

/// One 2-D georeferenced raster band.
///
/// A band owns its pixel values, a unique name (and optional alias), a
/// nodata sentinel, scale/offset for recovering physical units, and the
/// [`GridSpec`] tying pixels to ground locations. Pixels equal to the nodata
/// sentinel are masked: they are excluded from reductions and propagate
/// through algebra.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "BandRepr", into = "BandRepr")]
pub struct Band {
    name: String,
    alias: Option<String>,
    data: BandData,
    dtype: DType,
    nodata: f64,
    scale: f64,
    offset: f64,
    grid: GridSpec,
}

/// JSON float, with string sentinels for the values JSON cannot spell.
///
/// serde_json writes non-finite numbers as `null`, which does not survive a
/// round trip; NaN nodata (the float default) and NaN pixels are encoded as
/// `"NaN"`, `"inf"` and `"-inf"` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum EncodedFloat {
    Finite(f64),
    Special(String),
}

impl From<f64> for EncodedFloat {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            EncodedFloat::Finite(value)
        } else if value.is_nan() {
            EncodedFloat::Special("NaN".to_string())
        } else if value.is_sign_positive() {
            EncodedFloat::Special("inf".to_string())
        } else {
            EncodedFloat::Special("-inf".to_string())
        }
    }
}

impl TryFrom<EncodedFloat> for f64 {
    type Error = EoError;

    fn try_from(value: EncodedFloat) -> EoResult<f64> {
        match value {
            EncodedFloat::Finite(v) => Ok(v),
            EncodedFloat::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(EoError::Persistence(format!(
                    "unknown float encoding '{}'",
                    other
                ))),
            },
        }
    }
}

/// Serialized form of a band: pixels flattened row-major, with a second
/// plane for the imaginary component of complex bands. Deserialization runs
/// the [`Band`] constructors, so pixel count, grid shape and nodata
/// representability are re-validated on every load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BandRepr {
    name: String,
    alias: Option<String>,
    dtype: DType,
    nodata: EncodedFloat,
    scale: f64,
    offset: f64,
    grid: GridSpec,
    values: Vec<EncodedFloat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    imag: Option<Vec<EncodedFloat>>,
}

impl From<Band> for BandRepr {
    fn from(band: Band) -> Self {
        let (values, imag) = match &band.data {
            BandData::Real(data) => (data.iter().map(|v| EncodedFloat::from(*v)).collect(), None),
            BandData::Complex(data) => (
                data.iter().map(|v| EncodedFloat::from(v.re)).collect(),
                Some(data.iter().map(|v| EncodedFloat::from(v.im)).collect()),
            ),
        };
        BandRepr {
            name: band.name,
            alias: band.alias,
            dtype: band.dtype,
            nodata: band.nodata.into(),
            scale: band.scale,
            offset: band.offset,
            grid: band.grid,
            values,
            imag,
        }
    }
}

impl TryFrom<BandRepr> for Band {
    type Error = EoError;

    fn try_from(repr: BandRepr) -> EoResult<Band> {
        let shape = (repr.grid.n_rows(), repr.grid.n_cols());
        let expected = shape.0 * shape.1;
        if repr.values.len() != expected {
            return Err(EoError::Persistence(format!(
                "band '{}' carries {} pixels for a {} x {} grid",
                repr.name,
                repr.values.len(),
                shape.0,
                shape.1
            )));
        }
        let decode = |encoded: Vec<EncodedFloat>| -> EoResult<Vec<f64>> {
            encoded.into_iter().map(f64::try_from).collect()
        };
        let nodata = f64::try_from(repr.nodata)?;
        let real = decode(repr.values)?;
        let mut band = match repr.imag {
            None => {
                let data = Array2::from_shape_vec(shape, real)
                    .map_err(|e| EoError::Persistence(format!("band '{}': {}", repr.name, e)))?;
                Band::new(repr.name, data, repr.dtype, nodata, repr.grid)?
            }
            Some(imag) => {
                if repr.dtype != DType::C64 {
                    return Err(EoError::Persistence(format!(
                        "band '{}' carries an imaginary plane but dtype {}",
                        repr.name, repr.dtype
                    )));
                }
                if imag.len() != expected {
                    return Err(EoError::Persistence(format!(
                        "band '{}' carries {} imaginary pixels for a {} x {} grid",
                        repr.name,
                        imag.len(),
                        shape.0,
                        shape.1
                    )));
                }
                let pixels = real
                    .into_iter()
                    .zip(decode(imag)?)
                    .map(|(re, im)| Complex::new(re, im))
                    .collect();
                let data = Array2::from_shape_vec(shape, pixels)
                    .map_err(|e| EoError::Persistence(format!("band '{}': {}", repr.name, e)))?;
                Band::new_complex(repr.name, data, nodata, repr.grid)?
            }
        };
        band.alias = repr.alias;
        band.scale = repr.scale;
        band.offset = repr.offset;
        Ok(band)
    }
}

impl Band {
    /// Create a real-valued band.
    ///
    /// The array shape must match the grid and the nodata sentinel must be
    /// representable in `dtype` (a floating sentinel on an integer band is a
    /// [`EoError::DType`] error, never coerced).
    pub fn new(
        name: impl Into<String>,
        data: Array2<f64>,
        dtype: DType,
        nodata: f64,
        grid: GridSpec,
    ) -> EoResult<Self> {
        if dtype.is_complex() {
            return Err(EoError::DType(
                "use Band::new_complex for complex bands".to_string(),
            ));
        }
        Self::validate(&data.dim(), dtype, nodata, &grid)?;
        Ok(Self {
            name: name.into(),
            alias: None,
            data: BandData::Real(data),
            dtype,
            nodata,
            scale: 1.0,
            offset: 0.0,
            grid,
        })
    }

    /// Create a complex-valued band; the nodata sentinel applies to the real
    /// component
    pub fn new_complex(
        name: impl Into<String>,
        data: Array2<Complex<f64>>,
        nodata: f64,
        grid: GridSpec,
    ) -> EoResult<Self> {
        Self::validate(&data.dim(), DType::C64, nodata, &grid)?;
        Ok(Self {
            name: name.into(),
            alias: None,
            data: BandData::Complex(data),
            dtype: DType::C64,
            nodata,
            scale: 1.0,
            offset: 0.0,
            grid,
        })
    }

    /// Constant-valued band covering a grid
    pub fn filled(
        name: impl Into<String>,
        fill: f64,
        dtype: DType,
        nodata: f64,
        grid: GridSpec,
    ) -> EoResult<Self> {
        let data = Array2::from_elem((grid.n_rows(), grid.n_cols()), fill);
        Self::new(name, data, dtype, nodata, grid)
    }

    fn validate(dim: &(usize, usize), dtype: DType, nodata: f64, grid: &GridSpec) -> EoResult<()> {
        if *dim != (grid.n_rows(), grid.n_cols()) {
            return Err(EoError::GridMismatch(format!(
                "array shape {:?} does not match grid ({} x {})",
                dim,
                grid.n_rows(),
                grid.n_cols()
            )));
        }
        if !dtype.can_represent(nodata) {
            return Err(EoError::DType(format!(
                "nodata {} is not representable in {}",
                nodata, dtype
            )));
        }
        Ok(())
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_scale_offset(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn data(&self) -> &BandData {
        &self.data
    }

    /// Real-valued pixels; [`EoError::DType`] on a complex band
    pub fn values(&self) -> EoResult<&Array2<f64>> {
        match &self.data {
            BandData::Real(a) => Ok(a),
            BandData::Complex(_) => Err(EoError::DType(format!(
                "band '{}' is complex-valued",
                self.name
            ))),
        }
    }

    pub fn is_nodata(&self, value: f64) -> bool {
        value == self.nodata || (self.nodata.is_nan() && value.is_nan())
    }

    fn is_nodata_complex(&self, value: Complex<f64>) -> bool {
        self.is_nodata(value.re) && value.im == 0.0
    }

    /// Unmasked raw value at a pixel, `None` when masked or out of range
    pub fn value_at(&self, row: usize, col: usize) -> Option<f64> {
        match &self.data {
            BandData::Real(a) => {
                let v = *a.get((row, col))?;
                if self.is_nodata(v) {
                    None
                } else {
                    Some(v)
                }
            }
            BandData::Complex(a) => {
                let v = *a.get((row, col))?;
                if self.is_nodata_complex(v) {
                    None
                } else {
                    Some(v.norm())
                }
            }
        }
    }

    /// Number of unmasked pixels
    pub fn valid_count(&self) -> usize {
        match &self.data {
            BandData::Real(a) => a.iter().filter(|v| !self.is_nodata(**v)).count(),
            BandData::Complex(a) => a.iter().filter(|v| !self.is_nodata_complex(**v)).count(),
        }
    }

    // ------------------------------------------------------------------
    // algebra
    // ------------------------------------------------------------------

    fn binary_op(&self, other: Operand<'_>, op: ArithOp, reflected: bool) -> EoResult<Band> {
        let (other_dtype, result_name) = match &other {
            Operand::Band(b) => {
                if !self.grid.aligned_with(&b.grid) {
                    return Err(EoError::GridMismatch(format!(
                        "bands '{}' and '{}' are not on the same grid",
                        self.name, b.name
                    )));
                }
                (b.dtype, format!("{}{}{}", self.name, op.symbol(), b.name))
            }
            Operand::Scalar(v) => (scalar_dtype(*v), self.name.clone()),
        };
        let result_dtype = self.dtype.promote(other_dtype, op.promote_class())?;
        let result_nodata = if op.promote_class() == PromoteOp::Comparison {
            u8::MAX as f64
        } else if result_dtype.can_represent(self.nodata) {
            self.nodata
        } else {
            default_nodata(result_dtype)
        };

        if result_dtype.is_complex() {
            let data = self.binary_op_complex(&other, op, reflected, result_nodata)?;
            let mut band = Band::new_complex(result_name, data, result_nodata, self.grid.clone())?;
            band.alias = None;
            return Ok(band);
        }

        let lhs = self.values()?;
        let data = match &other {
            Operand::Band(b) => {
                let rhs = b.values()?;
                Zip::from(lhs).and(rhs).map_collect(|&a, &bv| {
                    if self.is_nodata(a) || b.is_nodata(bv) {
                        result_nodata
                    } else if reflected {
                        op.apply_real(bv, a)
                    } else {
                        op.apply_real(a, bv)
                    }
                })
            }
            Operand::Scalar(s) => lhs.mapv(|a| {
                if self.is_nodata(a) {
                    result_nodata
                } else if reflected {
                    op.apply_real(*s, a)
                } else {
                    op.apply_real(a, *s)
                }
            }),
        };
        Band::new(result_name, data, result_dtype, result_nodata, self.grid.clone())
    }

    fn binary_op_complex(
        &self,
        other: &Operand<'_>,
        op: ArithOp,
        reflected: bool,
        result_nodata: f64,
    ) -> EoResult<Array2<Complex<f64>>> {
        let masked = Complex::new(result_nodata, 0.0);
        let lhs: Array2<Complex<f64>> = match &self.data {
            BandData::Complex(a) => a.clone(),
            BandData::Real(a) => a.mapv(|v| Complex::new(v, 0.0)),
        };
        let lhs_mask: Array2<bool> = match &self.data {
            BandData::Complex(a) => a.mapv(|v| self.is_nodata_complex(v)),
            BandData::Real(a) => a.mapv(|v| self.is_nodata(v)),
        };
        Ok(match other {
            Operand::Band(b) => {
                let rhs: Array2<Complex<f64>> = match &b.data {
                    BandData::Complex(a) => a.clone(),
                    BandData::Real(a) => a.mapv(|v| Complex::new(v, 0.0)),
                };
                let rhs_mask: Array2<bool> = match &b.data {
                    BandData::Complex(a) => a.mapv(|v| b.is_nodata_complex(v)),
                    BandData::Real(a) => a.mapv(|v| b.is_nodata(v)),
                };
                let mut out = Array2::from_elem(lhs.dim(), masked);
                Zip::from(&mut out)
                    .and(&lhs)
                    .and(&rhs)
                    .and(&lhs_mask)
                    .and(&rhs_mask)
                    .for_each(|o, &a, &bv, &ma, &mb| {
                        if !(ma || mb) {
                            *o = if reflected {
                                op.apply_complex(bv, a)
                            } else {
                                op.apply_complex(a, bv)
                            };
                        }
                    });
                out
            }
            Operand::Scalar(s) => {
                let sc = Complex::new(*s, 0.0);
                let mut out = Array2::from_elem(lhs.dim(), masked);
                Zip::from(&mut out)
                    .and(&lhs)
                    .and(&lhs_mask)
                    .for_each(|o, &a, &ma| {
                        if !ma {
                            *o = if reflected {
                                op.apply_complex(sc, a)
                            } else {
                                op.apply_complex(a, sc)
                            };
                        }
                    });
                out
            }
        })
    }

    pub fn add<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Add, false)
    }

    /// Reflected addition; identical to [`Band::add`] (commutative)
    pub fn radd<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Add, true)
    }

    pub fn sub<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Sub, false)
    }

    /// Reflected subtraction: `other - self`
    pub fn rsub<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Sub, true)
    }

    pub fn mul<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Mul, false)
    }

    /// Reflected multiplication; identical to [`Band::mul`] (commutative)
    pub fn rmul<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Mul, true)
    }

    pub fn div<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Div, false)
    }

    /// Reflected division: `other / self`
    pub fn rdiv<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Div, true)
    }

    pub fn pow<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Pow, false)
    }

    /// Reflected power: `other ** self`
    pub fn rpow<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Pow, true)
    }

    pub fn lt<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Lt, false)
    }

    pub fn le<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Le, false)
    }

    pub fn gt<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Gt, false)
    }

    pub fn ge<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Ge, false)
    }

    pub fn eq_<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Eq, false)
    }

    pub fn ne_<'a>(&self, other: impl Into<Operand<'a>>) -> EoResult<Band> {
        self.binary_op(other.into(), ArithOp::Ne, false)
    }

    // ------------------------------------------------------------------
    // reduction
    // ------------------------------------------------------------------

    /// Scalar statistics over all unmasked pixels
    pub fn reduce(&self, opts: &ReduceOptions) -> EoResult<BandStatistics> {
        let values = self.valid_values(None, opts.overlap)?;
        Ok(Self::statistics(&self.name, None, values, &opts.percentiles))
    }

    /// Per-feature statistics: one row per polygon, pixels selected by
    /// rasterizing each polygon against the band grid.
    ///
    /// A feature that does not intersect the grid yields a zero-count row
    /// rather than an error.
    pub fn reduce_by_features(
        &self,
        features: &[Feature],
        opts: &ReduceOptions,
    ) -> EoResult<Vec<BandStatistics>> {
        features
            .iter()
            .map(|feature| {
                let values = self.valid_values(Some(feature.geometry()), opts.overlap)?;
                Ok(Self::statistics(
                    &self.name,
                    Some(feature.name().to_string()),
                    values,
                    &opts.percentiles,
                ))
            })
            .collect()
    }

    /// Unmasked raw values, optionally restricted to a geometry.
    ///
    /// Together with a caller-supplied reducer this backs feature time
    /// series extraction. Complex bands are a dtype error.
    pub fn valid_values(
        &self,
        geometry: Option<&Geometry<f64>>,
        overlap: OverlapPolicy,
    ) -> EoResult<Vec<f64>> {
        let values = match &self.data {
            BandData::Real(a) => a,
            BandData::Complex(_) => {
                return Err(EoError::DType(format!(
                    "cannot reduce complex band '{}'",
                    self.name
                )))
            }
        };
        let mut result = Vec::new();
        match geometry {
            None => {
                result.extend(values.iter().copied().filter(|v| !self.is_nodata(*v)));
            }
            Some(geom) => {
                let bbox = match geom.bounding_rect() {
                    Some(rect) => BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y),
                    None => return Ok(result),
                };
                let (row0, col0, n_rows, n_cols) = match self.grid.window(&bbox) {
                    Ok(window) => window,
                    Err(EoError::EmptyGeometry(_)) => return Ok(result),
                    Err(e) => return Err(e),
                };
                for row in row0..row0 + n_rows {
                    for col in col0..col0 + n_cols {
                        if !self.pixel_in_geometry(row, col, geom, overlap) {
                            continue;
                        }
                        let v = values[(row, col)];
                        if !self.is_nodata(v) {
                            result.push(v);
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    fn pixel_in_geometry(
        &self,
        row: usize,
        col: usize,
        geom: &Geometry<f64>,
        overlap: OverlapPolicy,
    ) -> bool {
        match overlap {
            OverlapPolicy::PixelCenter => {
                let (x, y) = self.grid.pixel_center(row, col);
                geom.contains(&Point::new(x, y))
            }
            OverlapPolicy::WholeCell => {
                let (x0, y0) = self.grid.pixel_origin(row, col);
                let (x1, y1) = self.grid.pixel_origin(row + 1, col + 1);
                let cell = Rect::new(
                    geo::coord! { x: x0.min(x1), y: y0.min(y1) },
                    geo::coord! { x: x0.max(x1), y: y0.max(y1) },
                )
                .to_polygon();
                geom.intersects(&cell)
            }
        }
    }

    fn statistics(
        band_name: &str,
        feature_name: Option<String>,
        mut values: Vec<f64>,
        percentiles: &[f64],
    ) -> BandStatistics {
        let count = values.len();
        if count == 0 {
            return BandStatistics {
                band_name: band_name.to_string(),
                feature_name,
                count: 0,
                mean: None,
                std: None,
                min: None,
                max: None,
                percentiles: Vec::new(),
            };
        }
        let mean = values.iter().sum::<f64>() / count as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pct_values = percentiles
            .iter()
            .map(|&p| (p, percentile_of_sorted(&values, p)))
            .collect();
        BandStatistics {
            band_name: band_name.to_string(),
            feature_name,
            count,
            mean: Some(mean),
            std: Some(var.sqrt()),
            min: Some(values[0]),
            max: Some(values[count - 1]),
            percentiles: pct_values,
        }
    }

    // ------------------------------------------------------------------
    // clipping and masking
    // ------------------------------------------------------------------

    /// Clip the band to a rectangular bound or a feature geometry.
    ///
    /// The result grid is the grid-snapped intersection window; with a
    /// geometry target, pixels outside the geometry are set to nodata unless
    /// `full_bounding_box_only` is requested. The result always stays
    /// rectangular. A disjoint target is an [`EoError::EmptyGeometry`] error.
    pub fn clip(&self, target: &ClipTarget<'_>, opts: &ClipOptions) -> EoResult<Band> {
        let bbox = match target {
            ClipTarget::Bounds(b) => *b,
            ClipTarget::Geometry(g) => {
                let rect = g.bounding_rect().ok_or_else(|| {
                    EoError::EmptyGeometry("clip geometry has no extent".to_string())
                })?;
                BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
            }
        };
        let (row0, col0, n_rows, n_cols) = self.grid.window(&bbox)?;
        let grid = self.grid.windowed(row0, col0, n_rows, n_cols);
        let window = ndarray::s![row0..row0 + n_rows, col0..col0 + n_cols];
        let mut clipped = Band {
            name: self.name.clone(),
            alias: self.alias.clone(),
            data: match &self.data {
                BandData::Real(a) => BandData::Real(a.slice(window).to_owned()),
                BandData::Complex(a) => BandData::Complex(a.slice(window).to_owned()),
            },
            dtype: self.dtype,
            nodata: self.nodata,
            scale: self.scale,
            offset: self.offset,
            grid,
        };
        if let ClipTarget::Geometry(geom) = target {
            if !opts.full_bounding_box_only {
                clipped.mask_outside_geometry(geom);
            }
        }
        Ok(clipped)
    }

    fn mask_outside_geometry(&mut self, geom: &Geometry<f64>) {
        let nodata = self.nodata;
        let grid = self.grid.clone();
        let inside = |row: usize, col: usize| {
            let (x, y) = grid.pixel_center(row, col);
            geom.contains(&Point::new(x, y))
        };
        match &mut self.data {
            BandData::Real(a) => {
                for ((row, col), v) in a.indexed_iter_mut() {
                    if !inside(row, col) {
                        *v = nodata;
                    }
                }
            }
            BandData::Complex(a) => {
                for ((row, col), v) in a.indexed_iter_mut() {
                    if !inside(row, col) {
                        *v = Complex::new(nodata, 0.0);
                    }
                }
            }
        }
    }

    /// Derived band with every pixel matching `predicate` set to nodata
    pub fn mask_where<F: Fn(f64) -> bool>(&self, predicate: F, name: Option<&str>) -> EoResult<Band> {
        let mut masked = self.clone();
        masked.mask_where_inplace(predicate)?;
        if let Some(name) = name {
            masked.rename(name);
        }
        Ok(masked)
    }

    /// Set every pixel matching `predicate` to nodata in place.
    ///
    /// The predicate only sees unmasked raw values; already-masked pixels
    /// stay masked. Complex bands are a dtype error.
    pub fn mask_where_inplace<F: Fn(f64) -> bool>(&mut self, predicate: F) -> EoResult<()> {
        let nodata = self.nodata;
        let values = match &mut self.data {
            BandData::Real(a) => a,
            BandData::Complex(_) => {
                return Err(EoError::DType(format!(
                    "cannot apply a value mask to complex band '{}'",
                    self.name
                )))
            }
        };
        let is_nodata =
            |v: f64| v == nodata || (nodata.is_nan() && v.is_nan());
        for v in values.iter_mut() {
            if !is_nodata(*v) && predicate(*v) {
                *v = nodata;
            }
        }
        Ok(())
    }

    /// Nearest-neighbor resample onto a target grid in the same CRS.
    ///
    /// Target pixels whose center falls outside the source extent become
    /// nodata. Reprojection between CRSs is the job of the reader
    /// collaborators; a CRS mismatch is a [`EoError::GridMismatch`] error.
    pub fn resample_nearest(&self, target: &GridSpec) -> EoResult<Band> {
        if target.epsg() != self.grid.epsg() {
            return Err(EoError::GridMismatch(format!(
                "cannot resample band '{}' from EPSG:{} onto EPSG:{}",
                self.name,
                self.grid.epsg(),
                target.epsg()
            )));
        }
        if self.grid.aligned_with(target) {
            return Ok(self.clone());
        }
        let shape = (target.n_rows(), target.n_cols());
        let lookup = |row: usize, col: usize| {
            let (x, y) = target.pixel_center(row, col);
            self.grid.coords_to_pixel(x, y)
        };
        let data = match &self.data {
            BandData::Real(a) => BandData::Real(Array2::from_shape_fn(shape, |(row, col)| {
                lookup(row, col).map_or(self.nodata, |(r, c)| a[(r, c)])
            })),
            BandData::Complex(a) => {
                BandData::Complex(Array2::from_shape_fn(shape, |(row, col)| {
                    lookup(row, col)
                        .map_or(Complex::new(self.nodata, 0.0), |(r, c)| a[(r, c)])
                }))
            }
        };
        Ok(Band {
            name: self.name.clone(),
            alias: self.alias.clone(),
            data,
            dtype: self.dtype,
            nodata: self.nodata,
            scale: self.scale,
            offset: self.offset,
            grid: target.clone(),
        })
    }

    /// Fill masked pixels from another band on the same grid (mosaicking
    /// merge step). Both bands must share the dtype family.
    pub fn fill_nodata_from(&mut self, other: &Band) -> EoResult<()> {
        if !self.grid.aligned_with(&other.grid) {
            return Err(EoError::GridMismatch(format!(
                "cannot merge band '{}': grids differ",
                other.name
            )));
        }
        if self.dtype != other.dtype {
            return Err(EoError::DType(format!(
                "cannot merge band '{}' ({}) into '{}' ({})",
                other.name, other.dtype, self.name, self.dtype
            )));
        }
        let nodata = self.nodata;
        match (&mut self.data, &other.data) {
            (BandData::Real(dst), BandData::Real(src)) => {
                let is_nodata = |v: f64| v == nodata || (nodata.is_nan() && v.is_nan());
                Zip::from(dst).and(src).for_each(|d, &s| {
                    if is_nodata(*d) && !other.is_nodata(s) {
                        *d = s;
                    }
                });
            }
            (BandData::Complex(dst), BandData::Complex(src)) => {
                let is_nodata = |v: Complex<f64>| {
                    (v.re == nodata || (nodata.is_nan() && v.re.is_nan())) && v.im == 0.0
                };
                Zip::from(dst).and(src).for_each(|d, &s| {
                    if is_nodata(*d) && !other.is_nodata_complex(s) {
                        *d = s;
                    }
                });
            }
            _ => {
                return Err(EoError::DType(format!(
                    "cannot merge real and complex data for band '{}'",
                    self.name
                )))
            }
        }
        Ok(())
    }

    /// Derived band with pixels set to nodata wherever the mask band's value
    /// is one of `classes` (e.g. cloud and shadow codes of a scene
    /// classification band)
    pub fn mask_by(&self, mask: &Band, classes: &[f64]) -> EoResult<Band> {
        if !self.grid.aligned_with(&mask.grid) {
            return Err(EoError::GridMismatch(format!(
                "mask band '{}' is not on the grid of band '{}'",
                mask.name, self.name
            )));
        }
        let mask_values = mask.values()?;
        let nodata = self.nodata;
        let mut out = self.clone();
        match &mut out.data {
            BandData::Real(a) => {
                for ((row, col), v) in a.indexed_iter_mut() {
                    let m = mask_values[(row, col)];
                    if !mask.is_nodata(m) && classes.contains(&m) {
                        *v = nodata;
                    }
                }
            }
            BandData::Complex(a) => {
                for ((row, col), v) in a.indexed_iter_mut() {
                    let m = mask_values[(row, col)];
                    if !mask.is_nodata(m) && classes.contains(&m) {
                        *v = Complex::new(nodata, 0.0);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Apply scale and offset, yielding physical values.
    ///
    /// The result is floating (complex stays complex), scale/offset reset to
    /// identity, nodata pixels untouched.
    pub fn scale_values(&self) -> EoResult<Band> {
        let (scale, offset) = (self.scale, self.offset);
        let dtype = if self.dtype.is_complex() {
            DType::C64
        } else {
            DType::F64
        };
        let mut scaled = self.clone();
        scaled.dtype = dtype;
        match &mut scaled.data {
            BandData::Real(a) => {
                for v in a.iter_mut() {
                    if !(self.is_nodata(*v)) {
                        *v = *v * scale + offset;
                    }
                }
            }
            BandData::Complex(a) => {
                for v in a.iter_mut() {
                    if !self.is_nodata_complex(*v) {
                        *v = *v * scale + offset;
                    }
                }
            }
        }
        scaled.scale = 1.0;
        scaled.offset = 0.0;
        Ok(scaled)
    }
}

/// Linear-interpolated percentile of an ascending-sorted slice
fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}
