#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a native-memory array handle.
///
/// Handles are minted by the native engine and are not owned by Rust's
/// ownership system; whoever holds one must release it through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl HandleId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nd#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int64")]
    I64,
}

impl DType {
    #[must_use]
    pub const fn all() -> &'static [DType] {
        &[
            DType::F32,
            DType::F64,
            DType::F16,
            DType::U8,
            DType::I32,
            DType::I8,
            DType::I64,
        ]
    }

    #[must_use]
    pub const fn native_tag(self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::F64 => 1,
            Self::F16 => 2,
            Self::U8 => 3,
            Self::I32 => 4,
            Self::I8 => 5,
            Self::I64 => 6,
        }
    }

    pub fn from_native_tag(tag: i32) -> Result<Self, TagError> {
        Self::all()
            .iter()
            .copied()
            .find(|dtype| dtype.native_tag() == tag)
            .ok_or(TagError::UnknownDTypeTag(tag))
    }

    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 => 2,
            Self::U8 | Self::I8 => 1,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::F16 => "float16",
            Self::U8 => "uint8",
            Self::I32 => "int32",
            Self::I8 => "int8",
            Self::I64 => "int64",
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64 | Self::F16)
    }

    /// Rounds `value` to what an element of this dtype can hold.
    ///
    /// Integer casts truncate toward zero and saturate; NaN becomes zero.
    /// `float16` is approximated through `f32`.
    #[must_use]
    pub fn quantize(self, value: f64) -> f64 {
        match self {
            Self::F64 => value,
            Self::F32 | Self::F16 => f64::from(value as f32),
            Self::U8 => f64::from(value as u8),
            Self::I8 => f64::from(value as i8),
            Self::I32 => f64::from(value as i32),
            Self::I64 => (value as i64) as f64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|dtype| dtype.name() == s)
            .ok_or_else(|| TagError::UnknownDType {
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    CpuPinned,
    CpuShared,
}

impl DeviceType {
    #[must_use]
    pub const fn all() -> &'static [DeviceType] {
        &[
            DeviceType::Cpu,
            DeviceType::Gpu,
            DeviceType::CpuPinned,
            DeviceType::CpuShared,
        ]
    }

    #[must_use]
    pub const fn native_tag(self) -> i32 {
        match self {
            Self::Cpu => 1,
            Self::Gpu => 2,
            Self::CpuPinned => 3,
            Self::CpuShared => 5,
        }
    }

    pub fn from_native_tag(tag: i32) -> Result<Self, TagError> {
        Self::all()
            .iter()
            .copied()
            .find(|device| device.native_tag() == tag)
            .ok_or(TagError::UnknownDeviceTag(tag))
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::CpuPinned => "cpu_pinned",
            Self::CpuShared => "cpu_shared",
        }
    }

    #[must_use]
    pub const fn is_host(self) -> bool {
        !matches!(self, Self::Gpu)
    }
}

/// Device placement of an array: a device type plus an ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Context {
    device_type: DeviceType,
    device_id: u32,
}

impl Context {
    #[must_use]
    pub const fn new(device_type: DeviceType, device_id: u32) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    #[must_use]
    pub const fn cpu(device_id: u32) -> Self {
        Self::new(DeviceType::Cpu, device_id)
    }

    #[must_use]
    pub const fn gpu(device_id: u32) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }

    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        self.device_type
    }

    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu(0)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device_type.name(), self.device_id)
    }
}

impl FromStr for Context {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let malformed = || TagError::MalformedContext {
            input: s.to_string(),
        };

        let (name, device_id) = match trimmed.split_once('(') {
            Some((name, rest)) => {
                let digits = rest.strip_suffix(')').ok_or_else(malformed)?;
                let device_id = digits.trim().parse::<u32>().map_err(|_| malformed())?;
                (name.trim(), device_id)
            }
            None => (trimmed, 0),
        };

        let device_type = DeviceType::all()
            .iter()
            .copied()
            .find(|device| device.name() == name)
            .ok_or_else(|| TagError::UnknownDevice {
                name: name.to_string(),
            })?;
        Ok(Self::new(device_type, device_id))
    }
}

impl TryFrom<String> for Context {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Context> for String {
    fn from(value: Context) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Default,
    RowSparse,
    Csr,
}

impl StorageType {
    #[must_use]
    pub const fn all() -> &'static [StorageType] {
        &[StorageType::Default, StorageType::RowSparse, StorageType::Csr]
    }

    #[must_use]
    pub const fn native_tag(self) -> i32 {
        match self {
            Self::Default => 0,
            Self::RowSparse => 1,
            Self::Csr => 2,
        }
    }

    /// Tag `-1` is the engine's "undefined" storage and is rejected like any
    /// other unknown tag.
    pub fn from_native_tag(tag: i32) -> Result<Self, TagError> {
        Self::all()
            .iter()
            .copied()
            .find(|stype| stype.native_tag() == tag)
            .ok_or(TagError::UnknownStorageTag(tag))
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::RowSparse => "row_sparse",
            Self::Csr => "csr",
        }
    }

    #[must_use]
    pub const fn is_sparse(self) -> bool {
        !matches!(self, Self::Default)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StorageType {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|stype| stype.name() == s)
            .ok_or_else(|| TagError::UnknownStorageType {
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    UnknownDType { name: String },
    UnknownDTypeTag(i32),
    UnknownDevice { name: String },
    UnknownDeviceTag(i32),
    UnknownStorageType { name: String },
    UnknownStorageTag(i32),
    MalformedContext { input: String },
}

impl fmt::Display for TagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDType { name } => write!(f, "unknown dtype '{name}'"),
            Self::UnknownDTypeTag(tag) => write!(f, "unknown dtype tag {tag}"),
            Self::UnknownDevice { name } => write!(f, "unknown device type '{name}'"),
            Self::UnknownDeviceTag(tag) => write!(f, "unknown device tag {tag}"),
            Self::UnknownStorageType { name } => write!(f, "unknown storage type '{name}'"),
            Self::UnknownStorageTag(tag) => write!(f, "unknown storage type tag {tag}"),
            Self::MalformedContext { input } => {
                write!(f, "malformed context '{input}', expected e.g. cpu(0)")
            }
        }
    }
}

impl std::error::Error for TagError {}

/// Ordered, non-negative dimension sizes of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    #[must_use]
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Builds a shape from signed dimensions, failing on the first negative
    /// one.
    pub fn from_signed(dims: &[i64]) -> Result<Self, ShapeError> {
        let mut out = Vec::with_capacity(dims.len());
        for (axis, value) in dims.iter().copied().enumerate() {
            let dim = usize::try_from(value).map_err(|_| ShapeError::NegativeDim { axis, value })?;
            out.push(dim);
        }
        Ok(Self { dims: out })
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Element count; saturates instead of overflowing.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.dims
            .iter()
            .copied()
            .fold(1usize, |acc, dim| acc.saturating_mul(dim))
    }

    pub fn checked_numel(&self) -> Result<usize, ShapeError> {
        self.dims
            .iter()
            .copied()
            .try_fold(1usize, |acc, dim| acc.checked_mul(dim))
            .ok_or_else(|| ShapeError::NumelOverflow {
                dims: self.dims.clone(),
            })
    }

    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        contiguous_strides(&self.dims)
    }

    /// Validates that `target` holds the same number of elements.
    pub fn ensure_reshapable(&self, target: &Shape) -> Result<(), ShapeError> {
        let from = self.checked_numel()?;
        let to = target.checked_numel()?;
        if from != to {
            return Err(ShapeError::ReshapeMismatch { from, to });
        }
        Ok(())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Self::new(value)
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Self::new(value.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(value: [usize; N]) -> Self {
        Self::new(value.to_vec())
    }
}

impl TryFrom<&[i64]> for Shape {
    type Error = ShapeError;

    fn try_from(value: &[i64]) -> Result<Self, Self::Error> {
        Self::from_signed(value)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        if self.dims.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

impl FromStr for Shape {
    type Err = ShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_error = || ShapeError::Parse {
            input: s.to_string(),
        };
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(parse_error)?;

        let mut dims = Vec::new();
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let value = part.parse::<i64>().map_err(|_| parse_error())?;
            dims.push(value);
        }
        Self::from_signed(&dims)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    NegativeDim { axis: usize, value: i64 },
    NumelOverflow { dims: Vec<usize> },
    ReshapeMismatch { from: usize, to: usize },
    Parse { input: String },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeDim { axis, value } => {
                write!(f, "negative dimension {value} at axis {axis}")
            }
            Self::NumelOverflow { dims } => {
                write!(f, "element count overflows for dims={dims:?}")
            }
            Self::ReshapeMismatch { from, to } => {
                write!(f, "cannot reshape {from} elements into {to} elements")
            }
            Self::Parse { input } => write!(f, "malformed shape literal '{input}'"),
        }
    }
}

impl std::error::Error for ShapeError {}

/// Everything the binding knows about an array without reading its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayMeta {
    shape: Shape,
    dtype: DType,
    context: Context,
    storage_type: StorageType,
}

impl ArrayMeta {
    #[must_use]
    pub fn new(shape: Shape, dtype: DType, context: Context, storage_type: StorageType) -> Self {
        Self {
            shape,
            dtype,
            context,
            storage_type,
        }
    }

    #[must_use]
    pub fn dense(shape: Shape, dtype: DType, context: Context) -> Self {
        Self::new(shape, dtype, context, StorageType::Default)
    }

    #[must_use]
    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    #[must_use]
    pub fn with_storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.context
    }

    #[must_use]
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> Result<usize, ShapeError> {
        self.shape
            .checked_numel()?
            .checked_mul(self.dtype.size_of())
            .ok_or_else(|| ShapeError::NumelOverflow {
                dims: self.shape.dims().to_vec(),
            })
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.context.hash(&mut hasher);
        self.storage_type.hash(&mut hasher);
        hasher.finish()
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}
