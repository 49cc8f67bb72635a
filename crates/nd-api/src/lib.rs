#![forbid(unsafe_code)]

use std::sync::Arc;

pub use nd_array::{
    ArrayEnv, ArrayError, ArrayOutput, Invocation, NamedArg, NdArray, OUT_KEY, Operand,
    ReleaseReport, SparseNdArray, UsageError,
};
pub use nd_core::{ArrayMeta, Context, DType, DeviceType, HandleId, Shape, StorageType};
pub use nd_dispatch::ParamValue;
pub use nd_engine::{CpuEngine, CpuEngineConfig, EngineError, EngineStats, NativeEngine};
pub use nd_runtime::{ConfigError, EvidenceEntry, EvidenceKind, RuntimeConfig};

use nd_engine::AllocRequest;

/// Per-call placement overrides; unset fields fall back to the session
/// config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayOptions {
    pub context: Option<Context>,
    pub dtype: Option<DType>,
    pub delay_alloc: bool,
}

impl ArrayOptions {
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    #[must_use]
    pub fn with_delay_alloc(mut self, delay_alloc: bool) -> Self {
        self.delay_alloc = delay_alloc;
        self
    }
}

#[derive(Debug, Clone)]
pub enum LoadedArrays {
    Named(Vec<(String, ArrayOutput)>),
    List(Vec<ArrayOutput>),
}

impl LoadedArrays {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Named(entries) => entries.len(),
            Self::List(arrays) => arrays.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ArrayOutput> {
        match self {
            Self::Named(entries) => entries
                .iter()
                .find(|(entry_name, _)| entry_name == name)
                .map(|(_, array)| array),
            Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn into_arrays(self) -> Vec<ArrayOutput> {
        match self {
            Self::Named(entries) => entries.into_iter().map(|(_, array)| array).collect(),
            Self::List(arrays) => arrays,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NdSession {
    env: Arc<ArrayEnv>,
}

impl NdSession {
    /// Session over an in-process host engine sized from `config`.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let engine = CpuEngine::new(CpuEngineConfig {
            capacity_bytes: config
                .engine_capacity_bytes
                .map(|bytes| usize::try_from(bytes).unwrap_or(usize::MAX)),
            decode_mode: config.archive_decode_mode,
            ..CpuEngineConfig::default()
        });
        Self::with_engine(Arc::new(engine), config)
    }

    #[must_use]
    pub fn with_engine(engine: Arc<dyn NativeEngine>, config: RuntimeConfig) -> Self {
        Self {
            env: ArrayEnv::new(engine, config),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    #[must_use]
    pub fn env(&self) -> &Arc<ArrayEnv> {
        &self.env
    }

    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.env.config()
    }

    pub fn set_default_context(&self, context: Context) {
        self.env.set_default_context(context);
    }

    fn placement(&self, options: ArrayOptions) -> (Context, DType) {
        let config = self.env.config();
        (
            options.context.unwrap_or(config.default_context),
            options.dtype.unwrap_or(config.default_dtype),
        )
    }

    /// Uninitialized array. Negative dimensions fail before the engine is
    /// asked for a handle.
    pub fn empty(&self, shape: &[i64], options: ArrayOptions) -> Result<NdArray, ArrayError> {
        let shape = Shape::from_signed(shape)?;
        let (context, dtype) = self.placement(options);
        let request =
            AllocRequest::new(shape, context, dtype).with_delay_alloc(options.delay_alloc);
        self.env.alloc(&request)
    }

    fn filled(
        &self,
        op: &str,
        shape: &[i64],
        value: Option<f64>,
        options: ArrayOptions,
    ) -> Result<NdArray, ArrayError> {
        let shape = Shape::from_signed(shape)?;
        let (context, dtype) = self.placement(options);
        let mut invocation = Invocation::new()
            .param("shape", shape)
            .param("ctx", context)
            .param("dtype", dtype);
        if let Some(value) = value {
            invocation = invocation.param("value", value);
        }
        let mut outputs = self.env.invoke(op, invocation)?;
        if outputs.len() != 1 {
            return Err(EngineError::OutputCount {
                op: op.to_string(),
                expected: 1,
                actual: outputs.len(),
            }
            .into());
        }
        Ok(outputs.remove(0).into_array())
    }

    pub fn zeros(&self, shape: &[i64], options: ArrayOptions) -> Result<NdArray, ArrayError> {
        self.filled("_zeros", shape, None, options)
    }

    pub fn ones(&self, shape: &[i64], options: ArrayOptions) -> Result<NdArray, ArrayError> {
        self.filled("_ones", shape, None, options)
    }

    pub fn full(
        &self,
        shape: &[i64],
        value: f64,
        options: ArrayOptions,
    ) -> Result<NdArray, ArrayError> {
        self.filled("_full", shape, Some(value), options)
    }

    /// Array holding `values` in row-major order.
    pub fn array(
        &self,
        values: &[f64],
        shape: &[i64],
        options: ArrayOptions,
    ) -> Result<NdArray, ArrayError> {
        let shape = Shape::from_signed(shape)?;
        let expected = shape.checked_numel()?;
        if values.len() != expected {
            return Err(UsageError::ValueCount {
                expected,
                actual: values.len(),
            }
            .into());
        }
        let (context, dtype) = self.placement(options);
        let array = self.env.alloc(&AllocRequest::new(shape, context, dtype))?;
        array.set_values(values)?;
        Ok(array)
    }

    /// `[start, stop)` with spacing `step`.
    ///
    /// Storage is reserved with the engine before any values are produced,
    /// so a range larger than the engine can hold fails with its error.
    pub fn arange(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        options: ArrayOptions,
    ) -> Result<NdArray, ArrayError> {
        let invalid = |reason: String| -> ArrayError {
            UsageError::InvalidArgument {
                op: "arange".to_string(),
                reason,
            }
            .into()
        };
        if step == 0.0 || !step.is_finite() || !start.is_finite() || !stop.is_finite() {
            return Err(invalid(format!("start={start} stop={stop} step={step}")));
        }
        let span = ((stop - start) / step).ceil().max(0.0);
        if !span.is_finite() || span >= i64::MAX as f64 || span >= usize::MAX as f64 {
            return Err(invalid(format!(
                "start={start} stop={stop} step={step} yields {span} elements"
            )));
        }
        let count = span as i64;

        let array = self.empty(&[count], options.with_delay_alloc(true))?;
        let values = (0..count)
            .map(|index| start + step * index as f64)
            .collect::<Vec<_>>();
        array.set_values(&values)?;
        Ok(array)
    }

    pub fn invoke(
        &self,
        op: &str,
        invocation: Invocation,
    ) -> Result<Vec<ArrayOutput>, ArrayError> {
        self.env.invoke(op, invocation)
    }

    pub fn wait_all(&self) -> Result<(), ArrayError> {
        self.env.wait_all()
    }

    pub fn save(&self, location: &str, arrays: &[(&str, &NdArray)]) -> Result<(), ArrayError> {
        let names = arrays
            .iter()
            .map(|(name, _)| (*name).to_string())
            .collect::<Vec<_>>();
        let arrays = arrays.iter().map(|(_, array)| *array).collect::<Vec<_>>();
        self.save_with_names(location, &names, &arrays)
    }

    pub fn save_list(&self, location: &str, arrays: &[&NdArray]) -> Result<(), ArrayError> {
        self.save_with_names(location, &[], arrays)
    }

    /// `names` must be empty or as long as `arrays`.
    pub fn save_with_names(
        &self,
        location: &str,
        names: &[String],
        arrays: &[&NdArray],
    ) -> Result<(), ArrayError> {
        if !names.is_empty() && names.len() != arrays.len() {
            return Err(UsageError::NameCountMismatch {
                names: names.len(),
                arrays: arrays.len(),
            }
            .into());
        }

        let mut handles = Vec::with_capacity(arrays.len());
        for array in arrays {
            if !Arc::ptr_eq(array.env(), &self.env) {
                return Err(UsageError::ForeignEnvironment {
                    op: "save".to_string(),
                }
                .into());
            }
            handles.push(array.handle()?);
        }

        self.env.engine().save(location, &handles, names)?;
        self.env.record(
            EvidenceKind::Durability,
            format!(
                "saved {} array(s) named={} to {location}",
                handles.len(),
                !names.is_empty()
            ),
        );
        Ok(())
    }

    pub fn load(&self, location: &str) -> Result<LoadedArrays, ArrayError> {
        let loaded = match self.env.engine().load(location) {
            Ok(loaded) => loaded,
            Err(error) => {
                if matches!(error, EngineError::Serialize(_)) {
                    self.env.record_archive_decode_failure(location, &error);
                }
                return Err(error.into());
            }
        };

        let arrays = self.env.adopt_all(&loaded.handles)?;
        self.env.record(
            EvidenceKind::Durability,
            format!("loaded {} array(s) from {location}", arrays.len()),
        );
        if loaded.names.is_empty() {
            Ok(LoadedArrays::List(arrays))
        } else {
            Ok(LoadedArrays::Named(
                loaded.names.into_iter().zip(arrays).collect(),
            ))
        }
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<ArrayOutput, ArrayError> {
        let handle = match self.env.engine().load_from_raw_bytes(bytes) {
            Ok(handle) => handle,
            Err(error) => {
                self.env.record_archive_decode_failure("<raw bytes>", &error);
                return Err(error.into());
            }
        };
        self.env.adopt(handle)
    }

    #[must_use]
    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.env.evidence()
    }

    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.env.engine().stats().live_handles
    }
}

impl Default for NdSession {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
