use geo::{BoundingRect, Geometry};
use serde::{Deserialize, Serialize};

/// Geographic bounding box in the coordinate system of its grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// True if the two boxes overlap with non-zero area
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }

    /// Intersection of two boxes, `None` if they are disjoint
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BoundingBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Smallest box covering both operands
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// Immutable description of a 2-D raster grid: affine transform, CRS
/// (EPSG code) and pixel dimensions.
///
/// The affine transform maps pixel space to map coordinates:
/// `x = t[0]*col + t[1]*row + t[2]` and `y = t[3]*col + t[4]*row + t[5]`.
/// For north-up imagery `t[0]` is the (positive) pixel width, `t[4]` the
/// (negative) pixel height, `t[2]`/`t[5]` the upper-left corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    transform: [f64; 6],
    epsg: u32,
    n_rows: usize,
    n_cols: usize,
}

/// Absolute tolerance used when comparing affine coefficients
const TRANSFORM_TOL: f64 = 1e-9;

impl GridSpec {
    pub fn new(transform: [f64; 6], epsg: u32, n_rows: usize, n_cols: usize) -> Self {
        Self {
            transform,
            epsg,
            n_rows,
            n_cols,
        }
    }

    /// North-up grid from a bounding box and pixel resolution (map units)
    pub fn from_bounds(bbox: &BoundingBox, pixres_x: f64, pixres_y: f64, epsg: u32) -> Self {
        let pixres_y = -pixres_y.abs();
        let n_cols = ((bbox.max_x - bbox.min_x) / pixres_x).ceil() as usize;
        let n_rows = ((bbox.max_y - bbox.min_y) / pixres_y.abs()).ceil() as usize;
        Self {
            transform: [pixres_x, 0.0, bbox.min_x, 0.0, pixres_y, bbox.max_y],
            epsg,
            n_rows,
            n_cols,
        }
    }

    pub fn transform(&self) -> &[f64; 6] {
        &self.transform
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn pixres_x(&self) -> f64 {
        self.transform[0]
    }

    pub fn pixres_y(&self) -> f64 {
        self.transform[4]
    }

    fn is_north_up(&self) -> bool {
        self.transform[1].abs() < TRANSFORM_TOL && self.transform[3].abs() < TRANSFORM_TOL
    }

    /// Two grids are aligned iff CRS, dimensions and affine coefficients
    /// (within a floating tolerance) all agree
    pub fn aligned_with(&self, other: &GridSpec) -> bool {
        self.epsg == other.epsg
            && self.n_rows == other.n_rows
            && self.n_cols == other.n_cols
            && self
                .transform
                .iter()
                .zip(other.transform.iter())
                .all(|(a, b)| (a - b).abs() < TRANSFORM_TOL)
    }

    /// Map coordinates of the upper-left corner of a pixel
    pub fn pixel_origin(&self, row: usize, col: usize) -> (f64, f64) {
        let t = &self.transform;
        let (col, row) = (col as f64, row as f64);
        (t[0] * col + t[1] * row + t[2], t[3] * col + t[4] * row + t[5])
    }

    /// Map coordinates of the center of a pixel
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let t = &self.transform;
        let (col, row) = (col as f64 + 0.5, row as f64 + 0.5);
        (t[0] * col + t[1] * row + t[2], t[3] * col + t[4] * row + t[5])
    }

    /// Pixel containing a map coordinate, `None` outside the grid.
    /// Only defined for north-up (non-rotated) grids.
    pub fn coords_to_pixel(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !self.is_north_up() {
            return None;
        }
        let col = (x - self.transform[2]) / self.transform[0];
        let row = (y - self.transform[5]) / self.transform[4];
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row.floor() as usize, col.floor() as usize);
        if row >= self.n_rows || col >= self.n_cols {
            return None;
        }
        Some((row, col))
    }

    /// Spatial extent of the full grid
    pub fn bounds(&self) -> BoundingBox {
        let corners = [
            self.pixel_origin(0, 0),
            self.pixel_origin(0, self.n_cols),
            self.pixel_origin(self.n_rows, 0),
            self.pixel_origin(self.n_rows, self.n_cols),
        ];
        let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (x, y) in corners {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }

    /// Grid-snapped pixel window `(row_off, col_off, n_rows, n_cols)` of the
    /// intersection between the grid and a bounding box.
    ///
    /// Fails with [`EoError::EmptyGeometry`] if the box does not overlap the
    /// grid and with [`EoError::GridMismatch`] on rotated grids.
    pub fn window(&self, bbox: &BoundingBox) -> EoResult<(usize, usize, usize, usize)> {
        if !self.is_north_up() {
            return Err(EoError::GridMismatch(
                "pixel windows are only defined for north-up grids".to_string(),
            ));
        }
        let isect = self.bounds().intersection(bbox).ok_or_else(|| {
            EoError::EmptyGeometry(format!(
                "bounding box {:?} does not intersect grid extent {:?}",
                bbox,
                self.bounds()
            ))
        })?;
        let t = &self.transform;
        // snap outward to whole pixels, then clamp onto the grid
        let col0 = (((isect.min_x - t[2]) / t[0]).floor().max(0.0)) as usize;
        let row0 = (((isect.max_y - t[5]) / t[4]).floor().max(0.0)) as usize;
        let col1 = ((((isect.max_x - t[2]) / t[0]).ceil()) as usize).min(self.n_cols);
        let row1 = ((((isect.min_y - t[5]) / t[4]).ceil()) as usize).min(self.n_rows);
        if row1 <= row0 || col1 <= col0 {
            return Err(EoError::EmptyGeometry(
                "intersection covers no whole pixel".to_string(),
            ));
        }
        Ok((row0, col0, row1 - row0, col1 - col0))
    }

    /// Sub-grid described by a pixel window of this grid
    pub fn windowed(
        &self,
        row_off: usize,
        col_off: usize,
        n_rows: usize,
        n_cols: usize,
    ) -> GridSpec {
        let (x0, y0) = self.pixel_origin(row_off, col_off);
        let t = &self.transform;
        GridSpec {
            transform: [t[0], t[1], x0, t[3], t[4], y0],
            epsg: self.epsg,
            n_rows,
            n_cols,
        }
    }
}

/// A named geographic feature: a geometry with the EPSG code of its
/// coordinate reference system.
///
/// Features drive catalog queries, clipping and per-polygon reductions. The
/// crate never reprojects them; callers hand features in whichever CRS the
/// consuming operation requires (catalog queries expect EPSG:4326, raster
/// operations expect the raster's CRS).
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    name: String,
    geometry: Geometry<f64>,
    epsg: u32,
}

impl Feature {
    pub fn new(name: impl Into<String>, geometry: Geometry<f64>, epsg: u32) -> Self {
        Self {
            name: name.into(),
            geometry,
            epsg,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    /// Axis-aligned extent of the geometry
    pub fn bounding_box(&self) -> EoResult<BoundingBox> {
        let rect = self.geometry.bounding_rect().ok_or_else(|| {
            EoError::EmptyGeometry(format!("feature '{}' has no extent", self.name))
        })?;
        Ok(BoundingBox::new(
            rect.min().x,
            rect.min().y,
            rect.max().x,
            rect.max().y,
        ))
    }
}

/// Logical storage type of a band.
///
/// The dtype is fixed when a band is constructed or produced by algebra; it
/// is never re-derived by scanning pixel contents. Algebra results follow the
/// explicit promotion table in [`DType::promote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    /// Complex with 64-bit components (e.g. SAR SLC imagery)
    C64,
}

/// Operation class used to look up the promotion table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOp {
    /// `+`, `-`, `*`: integers widen, floats stay floating
    Arithmetic,
    /// `/`, `**`: always floating (true division)
    Fractional,
    /// comparisons: boolean-like U8 result
    Comparison,
}

impl DType {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::U8 | DType::U16 | DType::I16 | DType::U32 | DType::I32
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_complex(self) -> bool {
        self == DType::C64
    }

    fn int_bits(self) -> u8 {
        match self {
            DType::U8 => 8,
            DType::U16 | DType::I16 => 16,
            DType::U32 | DType::I32 => 32,
            _ => 0,
        }
    }

    fn is_signed_int(self) -> bool {
        matches!(self, DType::I16 | DType::I32)
    }

    /// Smallest common result type of two operands under `op`.
    ///
    /// Integer/integer arithmetic widens one step past the wider operand so
    /// same-width sums and products never overflow silently; any float
    /// operand promotes to floating; any complex operand promotes to complex.
    /// Comparisons yield [`DType::U8`] and are undefined on complex operands.
    pub fn promote(self, other: DType, op: PromoteOp) -> EoResult<DType> {
        let complex = self.is_complex() || other.is_complex();
        match op {
            PromoteOp::Comparison => {
                if complex {
                    Err(EoError::DType(
                        "comparison operators are not defined for complex bands".to_string(),
                    ))
                } else {
                    Ok(DType::U8)
                }
            }
            PromoteOp::Fractional => {
                if complex {
                    Ok(DType::C64)
                } else if self == DType::F32 && other == DType::F32 {
                    Ok(DType::F32)
                } else {
                    Ok(DType::F64)
                }
            }
            PromoteOp::Arithmetic => {
                if complex {
                    return Ok(DType::C64);
                }
                if self.is_float() || other.is_float() {
                    return Ok(if self == DType::F64 || other == DType::F64 {
                        DType::F64
                    } else if self.int_bits().max(other.int_bits()) > 16 {
                        // a 32-bit integer does not fit an F32 mantissa
                        DType::F64
                    } else {
                        DType::F32
                    });
                }
                let bits = self.int_bits().max(other.int_bits());
                let signed = self.is_signed_int() || other.is_signed_int();
                Ok(match (bits, signed) {
                    (8, false) => DType::U16,
                    (8, true) | (16, true) => DType::I32,
                    (16, false) => DType::U32,
                    // widening past 32 bits leaves the integer family
                    _ => DType::F64,
                })
            }
        }
    }

    /// Whether a scalar (e.g. a nodata sentinel) is exactly representable
    pub fn can_represent(self, value: f64) -> bool {
        match self {
            DType::U8 => value.fract() == 0.0 && (0.0..=u8::MAX as f64).contains(&value),
            DType::U16 => value.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(&value),
            DType::I16 => {
                value.fract() == 0.0 && (i16::MIN as f64..=i16::MAX as f64).contains(&value)
            }
            DType::U32 => value.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&value),
            DType::I32 => {
                value.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&value)
            }
            DType::F32 => value.is_nan() || value as f32 as f64 == value,
            DType::F64 | DType::C64 => true,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::I16 => "int16",
            DType::U32 => "uint32",
            DType::I32 => "int32",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::C64 => "complex64",
        };
        write!(f, "{}", name)
    }
}

/// Error types for raster handling and the query/load pipeline
#[derive(Debug, thiserror::Error)]
pub enum EoError {
    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    #[error("dtype error: {0}")]
    DType(String),

    #[error("band not found: {0}")]
    BandNotFound(String),

    #[error("duplicate band name or alias: {0}")]
    DuplicateBand(String),

    #[error("scene not found: {0}")]
    SceneNotFound(String),

    #[error("duplicate scene identifier: {0}")]
    DuplicateScene(String),

    #[error("empty geometry: {0}")]
    EmptyGeometry(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("catalog query error: {0}")]
    CatalogQuery(String),

    #[error("scene construction failed for '{scene_id}': {reason}")]
    SceneConstruction { scene_id: String, reason: String },

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("mapper state error: {0}")]
    MapperState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for all fallible operations in this crate
pub type EoResult<T> = Result<T, EoError>;
