#![forbid(unsafe_code)]

//! The native array engine as seen from the binding.
//!
//! Everything numeric lives behind [`NativeEngine`]: allocation, operator
//! execution, synchronization and persistence. The binding only ever holds
//! [`HandleId`]s. [`CpuEngine`] is an in-process host implementation used as
//! the reference collaborator.

use std::collections::BTreeMap;
use std::fmt;

use nd_core::{ArrayMeta, Context, DType, HandleId, Shape, ShapeError, StorageType};
use nd_serialize::SerializeError;

mod cpu;

pub use cpu::{CpuEngine, CpuEngineConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub shape: Shape,
    pub context: Context,
    pub dtype: DType,
    pub delay_alloc: bool,
}

impl AllocRequest {
    #[must_use]
    pub fn new(shape: Shape, context: Context, dtype: DType) -> Self {
        Self {
            shape,
            context,
            dtype,
            delay_alloc: false,
        }
    }

    #[must_use]
    pub fn with_delay_alloc(mut self, delay_alloc: bool) -> Self {
        self.delay_alloc = delay_alloc;
        self
    }
}

/// One imperative operator invocation.
///
/// `outputs` empty means the engine allocates the results itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpCall {
    pub op: String,
    pub inputs: Vec<HandleId>,
    pub params: BTreeMap<String, String>,
    pub outputs: Vec<HandleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpOutput {
    pub handle: HandleId,
    pub storage_type: StorageType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedHandles {
    pub names: Vec<String>,
    pub handles: Vec<HandleId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub live_handles: usize,
    pub live_storages: usize,
    pub bytes_in_use: usize,
    pub ops_invoked: u64,
    pub sync_calls: u64,
}

pub trait NativeEngine: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn alloc(&self, request: &AllocRequest) -> Result<HandleId, EngineError>;

    fn free(&self, handle: HandleId) -> Result<(), EngineError>;

    fn meta(&self, handle: HandleId) -> Result<ArrayMeta, EngineError>;

    fn operator_names(&self) -> Vec<String>;

    fn invoke(&self, call: &OpCall) -> Result<Vec<OpOutput>, EngineError>;

    /// Blocking copy of the handle's elements to host memory.
    fn read(&self, handle: HandleId) -> Result<Vec<f64>, EngineError>;

    fn write(&self, handle: HandleId, values: &[f64]) -> Result<(), EngineError>;

    /// View of rows `begin..end` along the first axis, sharing storage.
    fn slice(&self, handle: HandleId, begin: usize, end: usize) -> Result<HandleId, EngineError>;

    /// View of row `index` with the first axis dropped, sharing storage.
    fn at(&self, handle: HandleId, index: usize) -> Result<HandleId, EngineError>;

    fn reshape(&self, handle: HandleId, shape: &Shape) -> Result<HandleId, EngineError>;

    fn wait_to_read(&self, handle: HandleId) -> Result<(), EngineError>;

    fn wait_to_write(&self, handle: HandleId) -> Result<(), EngineError>;

    fn wait_all(&self) -> Result<(), EngineError>;

    /// `names` is either empty or exactly as long as `handles`.
    fn save(&self, location: &str, handles: &[HandleId], names: &[String])
    -> Result<(), EngineError>;

    fn load(&self, location: &str) -> Result<LoadedHandles, EngineError>;

    fn save_raw_bytes(&self, handle: HandleId) -> Result<Vec<u8>, EngineError>;

    fn load_from_raw_bytes(&self, bytes: &[u8]) -> Result<HandleId, EngineError>;

    fn stats(&self) -> EngineStats;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    UnknownHandle(HandleId),
    UnknownOperator {
        name: String,
    },
    UnsupportedDType {
        dtype: DType,
    },
    DeviceUnavailable {
        context: Context,
    },
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    InvalidShape(ShapeError),
    ShapeMismatch {
        op: String,
        lhs: Shape,
        rhs: Shape,
    },
    DTypeMismatch {
        op: String,
        lhs: DType,
        rhs: DType,
    },
    ContextMismatch {
        op: String,
        lhs: Context,
        rhs: Context,
    },
    InvalidArgument {
        op: String,
        reason: String,
    },
    OutputCount {
        op: String,
        expected: usize,
        actual: usize,
    },
    Io {
        location: String,
        diagnostic: String,
    },
    UnsupportedScheme {
        location: String,
    },
    Serialize(SerializeError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHandle(handle) => write!(f, "unknown native handle {handle}"),
            Self::UnknownOperator { name } => write!(f, "unknown operator '{name}'"),
            Self::UnsupportedDType { dtype } => write!(f, "unsupported dtype {dtype}"),
            Self::DeviceUnavailable { context } => write!(f, "device {context} is unavailable"),
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested={requested} bytes, available={available} bytes"
            ),
            Self::InvalidShape(error) => write!(f, "invalid shape: {error}"),
            Self::ShapeMismatch { op, lhs, rhs } => {
                write!(f, "{op}: shape mismatch lhs={lhs} rhs={rhs}")
            }
            Self::DTypeMismatch { op, lhs, rhs } => {
                write!(f, "{op}: dtype mismatch lhs={lhs} rhs={rhs}")
            }
            Self::ContextMismatch { op, lhs, rhs } => {
                write!(f, "{op}: context mismatch lhs={lhs} rhs={rhs}")
            }
            Self::InvalidArgument { op, reason } => write!(f, "{op}: invalid argument: {reason}"),
            Self::OutputCount {
                op,
                expected,
                actual,
            } => write!(f, "{op}: expected {expected} output(s), got {actual}"),
            Self::Io {
                location,
                diagnostic,
            } => write!(f, "i/o failure at '{location}': {diagnostic}"),
            Self::UnsupportedScheme { location } => {
                write!(f, "unsupported storage scheme in '{location}'")
            }
            Self::Serialize(error) => write!(f, "serialization failure: {error}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ShapeError> for EngineError {
    fn from(value: ShapeError) -> Self {
        Self::InvalidShape(value)
    }
}

impl From<SerializeError> for EngineError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}
