#![forbid(unsafe_code)]

//! Array wrappers over native handles.
//!
//! An [`NdArray`] owns exactly one engine handle and a flattened registry of
//! the wrappers that contributed to computing it. Registry entries are weak,
//! so lineage never keeps a producer alive. The handle is released once,
//! either by [`NdArray::dispose`], by a transitive release from a dependent
//! wrapper, or when the last strong reference is dropped.
//!
//! Locking: at most one wrapper lock is held at any time, and the runtime
//! ledger lock is only ever taken after (never while waiting on) a wrapper
//! lock.

mod invocation;
mod lineage;

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, Deref, Div, Mul, Neg, Sub};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nd_core::{ArrayMeta, Context, DType, HandleId, Shape, ShapeError, StorageType};
use nd_dispatch::{DispatchError, OperatorRegistry};
use nd_engine::{AllocRequest, EngineError, NativeEngine, OpOutput};
use nd_runtime::{EvidenceEntry, EvidenceKind, RuntimeConfig, RuntimeContext};

pub use invocation::{Invocation, NamedArg, OUT_KEY, Operand};
pub use lineage::{ReleasePlan, ReleaseReport, release_plan};

use lineage::{Lineage, ProducerSnapshot};

/// Caller-side precondition violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    Disposed {
        handle: HandleId,
    },
    ReadOnly {
        handle: HandleId,
    },
    ValueCount {
        expected: usize,
        actual: usize,
    },
    ShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    ArgumentCount {
        op: String,
        expected: usize,
        actual: usize,
    },
    ScalarOperand {
        op: String,
    },
    UnsupportedOutputHolder {
        key: String,
        found: &'static str,
    },
    UnexpectedArrayArgument {
        key: String,
    },
    NameCountMismatch {
        names: usize,
        arrays: usize,
    },
    NotScalar {
        shape: Shape,
    },
    NotSparse {
        handle: HandleId,
    },
    ForeignEnvironment {
        op: String,
    },
    InvalidShape(ShapeError),
    InvalidArgument {
        op: String,
        reason: String,
    },
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed { handle } => write!(f, "array {handle} has been disposed"),
            Self::ReadOnly { handle } => write!(f, "array {handle} is not writable"),
            Self::ValueCount { expected, actual } => {
                write!(f, "expected {expected} value(s), got {actual}")
            }
            Self::ShapeMismatch { expected, actual } => {
                write!(f, "shape mismatch: expected {expected}, got {actual}")
            }
            Self::ArgumentCount {
                op,
                expected,
                actual,
            } => write!(f, "{op}: expected {expected} argument(s), got {actual}"),
            Self::ScalarOperand { op } => write!(f, "{op}: scalar operand not supported"),
            Self::UnsupportedOutputHolder { key, found } => {
                write!(f, "'{key}' must hold arrays, found {found}")
            }
            Self::UnexpectedArrayArgument { key } => {
                write!(f, "array passed under '{key}'; arrays go positional or under '{OUT_KEY}'")
            }
            Self::NameCountMismatch { names, arrays } => {
                write!(f, "{names} name(s) for {arrays} array(s)")
            }
            Self::NotScalar { shape } => write!(f, "array of shape {shape} is not a scalar"),
            Self::NotSparse { handle } => write!(f, "array {handle} uses dense storage"),
            Self::ForeignEnvironment { op } => {
                write!(f, "{op}: arrays belong to different sessions")
            }
            Self::InvalidShape(error) => write!(f, "invalid shape: {error}"),
            Self::InvalidArgument { op, reason } => write!(f, "{op}: {reason}"),
        }
    }
}

impl std::error::Error for UsageError {}

/// Either a lifecycle/precondition bug in the caller or a failure reported by
/// the engine. The two never overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    Usage(UsageError),
    Native(EngineError),
}

impl ArrayError {
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(error) => write!(f, "usage error: {error}"),
            Self::Native(error) => write!(f, "native error: {error}"),
        }
    }
}

impl std::error::Error for ArrayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Usage(error) => Some(error),
            Self::Native(error) => Some(error),
        }
    }
}

impl From<UsageError> for ArrayError {
    fn from(value: UsageError) -> Self {
        Self::Usage(value)
    }
}

impl From<EngineError> for ArrayError {
    fn from(value: EngineError) -> Self {
        Self::Native(value)
    }
}

impl From<ShapeError> for ArrayError {
    fn from(value: ShapeError) -> Self {
        Self::Usage(UsageError::InvalidShape(value))
    }
}

impl From<DispatchError> for ArrayError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::UnknownOperator { name } => {
                Self::Native(EngineError::UnknownOperator { name })
            }
            DispatchError::ArityMismatch {
                op,
                expected,
                actual,
            }
            | DispatchError::OutputArity {
                op,
                expected,
                actual,
            } => Self::Usage(UsageError::ArgumentCount {
                op,
                expected,
                actual,
            }),
            DispatchError::ScalarNotSupported { op } => {
                Self::Usage(UsageError::ScalarOperand { op })
            }
            DispatchError::Engine(error) => Self::Native(error),
        }
    }
}

/// Engine, operator table and runtime ledger shared by every array of one
/// session.
pub struct ArrayEnv {
    engine: Arc<dyn NativeEngine>,
    operators: OperatorRegistry,
    runtime: Mutex<RuntimeContext>,
    warn_on_undisposed_drop: bool,
}

impl fmt::Debug for ArrayEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayEnv")
            .field("engine", &self.engine.name())
            .field("operators", &self.operators.len())
            .field("warn_on_undisposed_drop", &self.warn_on_undisposed_drop)
            .finish()
    }
}

impl ArrayEnv {
    #[must_use]
    pub fn new(engine: Arc<dyn NativeEngine>, config: RuntimeConfig) -> Arc<Self> {
        let operators = OperatorRegistry::from_engine(engine.as_ref());
        let warn_on_undisposed_drop = config.warn_on_undisposed_drop;
        let mut runtime = RuntimeContext::new(config);
        runtime.record(
            EvidenceKind::Policy,
            format!(
                "engine '{}' exposes {} operator(s)",
                engine.name(),
                operators.len()
            ),
        );
        Arc::new(Self {
            engine,
            operators,
            runtime: Mutex::new(runtime),
            warn_on_undisposed_drop,
        })
    }

    #[must_use]
    pub fn engine(&self) -> &dyn NativeEngine {
        self.engine.as_ref()
    }

    #[must_use]
    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    fn runtime(&self) -> MutexGuard<'_, RuntimeContext> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.runtime().config().clone()
    }

    /// Runs `f` under the runtime lock. Array wrappers record into the same
    /// ledger when they are released, so `f` must not drop one.
    fn with_runtime<R>(&self, f: impl FnOnce(&mut RuntimeContext) -> R) -> R {
        f(&mut self.runtime())
    }

    pub fn set_default_context(&self, context: Context) {
        self.with_runtime(|runtime| runtime.set_default_context(context));
    }

    pub fn record_archive_decode_failure<E>(&self, location: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.with_runtime(|runtime| runtime.record_archive_decode_failure(location, error));
    }

    pub fn record(&self, kind: EvidenceKind, summary: impl Into<String>) {
        self.runtime().record(kind, summary);
    }

    #[must_use]
    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.runtime().ledger().entries().cloned().collect()
    }

    /// Fresh handle with no recorded dependencies.
    pub fn alloc(self: &Arc<Self>, request: &AllocRequest) -> Result<NdArray, ArrayError> {
        let handle = self.engine.alloc(request)?;
        let meta = ArrayMeta::dense(request.shape.clone(), request.dtype, request.context);
        self.record(
            EvidenceKind::Allocation,
            format!(
                "alloc {handle} shape={} dtype={} ctx={} delay_alloc={}",
                request.shape, request.dtype, request.context, request.delay_alloc
            ),
        );
        Ok(NdArray::from_parts(Arc::clone(self), handle, meta, true))
    }

    /// Takes ownership of a handle the engine produced outside an operator
    /// call, such as a loaded or deserialized array. The handle is freed if it
    /// cannot be wrapped.
    pub fn adopt(self: &Arc<Self>, handle: HandleId) -> Result<ArrayOutput, ArrayError> {
        match self.engine.meta(handle) {
            Ok(meta) => {
                let storage_type = meta.storage_type();
                let array = NdArray::from_parts(Arc::clone(self), handle, meta, true);
                Ok(ArrayOutput::classify(array, storage_type))
            }
            Err(error) => {
                if let Err(free_error) = self.engine.free(handle) {
                    tracing::error!("failed to free unadoptable {handle}: {free_error}");
                }
                Err(error.into())
            }
        }
    }

    /// All-or-nothing [`adopt`](Self::adopt) over several handles.
    pub fn adopt_all(self: &Arc<Self>, handles: &[HandleId]) -> Result<Vec<ArrayOutput>, ArrayError> {
        let mut adopted = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            match self.adopt(*handle) {
                Ok(output) => adopted.push(output),
                Err(error) => {
                    for output in adopted {
                        if let Err(dispose_error) = output.array().dispose() {
                            tracing::error!("failed to release adopted array: {dispose_error}");
                        }
                    }
                    for rest in &handles[index + 1..] {
                        if let Err(free_error) = self.engine.free(*rest) {
                            tracing::error!("failed to free {rest}: {free_error}");
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(adopted)
    }

    pub fn invoke(
        self: &Arc<Self>,
        op: &str,
        invocation: Invocation,
    ) -> Result<Vec<ArrayOutput>, ArrayError> {
        let prepared = invocation.prepare(self, op)?;
        let outcome = self.operators.dispatch(
            self.engine.as_ref(),
            op,
            &prepared.operands,
            &prepared.params,
            &prepared.output_handles,
        )?;
        self.record(EvidenceKind::Dispatch, outcome.decision.to_string());

        let results = if prepared.outputs.is_empty() {
            self.wrap_outputs(&outcome.outputs)?
        } else if prepared.outputs.len() != outcome.outputs.len() {
            return Err(EngineError::OutputCount {
                op: op.to_string(),
                expected: prepared.outputs.len(),
                actual: outcome.outputs.len(),
            }
            .into());
        } else {
            prepared
                .outputs
                .into_iter()
                .zip(outcome.outputs.iter())
                .map(|(array, output)| ArrayOutput::classify(array, output.storage_type))
                .collect()
        };

        let result_arrays = results.iter().map(ArrayOutput::array).collect::<Vec<_>>();
        record_lineage(self, &prepared.producers, &result_arrays);
        Ok(results)
    }

    fn wrap_outputs(self: &Arc<Self>, outputs: &[OpOutput]) -> Result<Vec<ArrayOutput>, ArrayError> {
        let handles = outputs.iter().map(|output| output.handle).collect::<Vec<_>>();
        self.adopt_all(&handles)
    }

    pub fn wait_all(&self) -> Result<(), ArrayError> {
        self.engine.wait_all()?;
        self.record(EvidenceKind::Sync, "wait_all");
        Ok(())
    }
}

fn record_lineage(env: &ArrayEnv, producers: &[NdArray], results: &[&NdArray]) {
    if producers.is_empty() {
        return;
    }

    let snapshots = producers
        .iter()
        .map(NdArray::producer_snapshot)
        .collect::<Vec<_>>();
    for result in results {
        let owner = result.inner.handle;
        let (added, total) = {
            let mut state = result.inner.lock();
            if state.disposed {
                continue;
            }
            let added = snapshots
                .iter()
                .map(|snapshot| state.lineage.absorb(owner, snapshot))
                .sum::<usize>();
            (added, state.lineage.len())
        };
        env.record(
            EvidenceKind::Lineage,
            format!(
                "{owner} <- {} producer(s) added={added} lineage_len={total}",
                snapshots.len()
            ),
        );
    }
}

struct ArrayState {
    disposed: bool,
    lineage: Lineage<ArrayInner>,
}

struct ArrayInner {
    env: Arc<ArrayEnv>,
    handle: HandleId,
    meta: ArrayMeta,
    writable: bool,
    state: Mutex<ArrayState>,
}

impl ArrayInner {
    fn lock(&self) -> MutexGuard<'_, ArrayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok(false)` when the handle was already released.
    fn dispose(&self) -> Result<bool, ArrayError> {
        let dropped_edges = {
            let mut state = self.lock();
            if state.disposed {
                return Ok(false);
            }
            state.disposed = true;
            let edges = state.lineage.len();
            state.lineage.clear();
            edges
        };

        match self.env.engine.free(self.handle) {
            Ok(()) => {
                tracing::trace!("disposed {} (dropped {dropped_edges} edge(s))", self.handle);
                self.env.record(
                    EvidenceKind::Release,
                    format!("dispose {} dropped_edges={dropped_edges}", self.handle),
                );
                Ok(true)
            }
            Err(error) => {
                tracing::error!("native free of {} failed: {error}", self.handle);
                self.env.record(
                    EvidenceKind::Release,
                    format!("dispose {} failed: {error}", self.handle),
                );
                Err(error.into())
            }
        }
    }
}

impl Drop for ArrayInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.disposed {
            return;
        }
        state.disposed = true;

        if self.env.warn_on_undisposed_drop {
            tracing::warn!(
                "array {} dropped without dispose; releasing native handle",
                self.handle
            );
        }
        match self.env.engine.free(self.handle) {
            Ok(()) => {
                tracing::trace!("released {} on drop", self.handle);
                self.env
                    .record(EvidenceKind::Release, format!("drop {}", self.handle));
            }
            Err(error) => tracing::error!("native free of {} on drop failed: {error}", self.handle),
        }
    }
}

/// Shared reference to one array wrapper. Cloning shares the wrapper; it does
/// not allocate a new handle.
#[derive(Clone)]
pub struct NdArray {
    inner: Arc<ArrayInner>,
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("handle", &self.inner.handle)
            .field("meta", &self.inner.meta)
            .field("writable", &self.inner.writable)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl NdArray {
    fn from_parts(env: Arc<ArrayEnv>, handle: HandleId, meta: ArrayMeta, writable: bool) -> Self {
        Self {
            inner: Arc::new(ArrayInner {
                env,
                handle,
                meta,
                writable,
                state: Mutex::new(ArrayState {
                    disposed: false,
                    lineage: Lineage::default(),
                }),
            }),
        }
    }

    fn ensure_live(&self) -> Result<(), ArrayError> {
        if self.is_disposed() {
            return Err(UsageError::Disposed {
                handle: self.inner.handle,
            }
            .into());
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), ArrayError> {
        self.ensure_live()?;
        if !self.inner.writable {
            return Err(UsageError::ReadOnly {
                handle: self.inner.handle,
            }
            .into());
        }
        Ok(())
    }

    fn ensure_env(&self, env: &ArrayEnv, op: &str) -> Result<(), ArrayError> {
        if !std::ptr::eq(self.inner.env.as_ref(), env) {
            return Err(UsageError::ForeignEnvironment { op: op.to_string() }.into());
        }
        Ok(())
    }

    fn producer_snapshot(&self) -> ProducerSnapshot<ArrayInner> {
        let lineage = self.inner.lock().lineage.snapshot();
        ProducerSnapshot {
            handle: self.inner.handle,
            weak: Arc::downgrade(&self.inner),
            lineage,
        }
    }

    fn engine(&self) -> &dyn NativeEngine {
        self.inner.env.engine.as_ref()
    }

    fn invoke_single(&self, op: &str, invocation: Invocation) -> Result<ArrayOutput, ArrayError> {
        let mut outputs = self.inner.env.invoke(op, invocation)?;
        if outputs.len() != 1 {
            return Err(EngineError::OutputCount {
                op: op.to_string(),
                expected: 1,
                actual: outputs.len(),
            }
            .into());
        }
        Ok(outputs.remove(0))
    }

    fn wrap_view(&self, handle: HandleId, writable: bool) -> Result<NdArray, ArrayError> {
        let env = &self.inner.env;
        let meta = match env.engine.meta(handle) {
            Ok(meta) => meta,
            Err(error) => {
                if let Err(free_error) = env.engine.free(handle) {
                    tracing::error!("failed to free unwrappable view {handle}: {free_error}");
                }
                return Err(error.into());
            }
        };
        let view = NdArray::from_parts(Arc::clone(env), handle, meta, writable);
        record_lineage(env, std::slice::from_ref(self), &[&view]);
        Ok(view)
    }

    #[must_use]
    pub fn env(&self) -> &Arc<ArrayEnv> {
        &self.inner.env
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &NdArray) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    pub fn handle(&self) -> Result<HandleId, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.handle)
    }

    pub fn meta(&self) -> Result<ArrayMeta, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.meta.clone())
    }

    pub fn shape(&self) -> Result<Shape, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.meta.shape().clone())
    }

    pub fn dtype(&self) -> Result<DType, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.meta.dtype())
    }

    pub fn context(&self) -> Result<Context, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.meta.context())
    }

    pub fn storage_type(&self) -> Result<StorageType, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.meta.storage_type())
    }

    pub fn size(&self) -> Result<usize, ArrayError> {
        self.ensure_live()?;
        Ok(self.inner.meta.numel())
    }

    /// Registry keys, ascending.
    pub fn dependency_handles(&self) -> Result<Vec<HandleId>, ArrayError> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(UsageError::Disposed {
                handle: self.inner.handle,
            }
            .into());
        }
        Ok(state.lineage.keys().collect())
    }

    pub fn depends_on(&self, other: &NdArray) -> Result<bool, ArrayError> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(UsageError::Disposed {
                handle: self.inner.handle,
            }
            .into());
        }
        Ok(state.lineage.contains(other.inner.handle))
    }

    pub fn lineage_len(&self) -> Result<usize, ArrayError> {
        Ok(self.dependency_handles()?.len())
    }

    /// Releases the native handle. Only the first call does anything; later
    /// calls return `Ok(false)`. Producers in the registry are not released.
    pub fn dispose(&self) -> Result<bool, ArrayError> {
        self.inner.dispose()
    }

    pub fn dispose_deps(&self) -> Result<ReleaseReport, ArrayError> {
        self.dispose_deps_except(&[])
    }

    /// Releases everything in this wrapper's registry except `keep` and
    /// whatever `keep` itself depends on. The wrapper itself stays live.
    ///
    /// The exclusion set is computed in full before the registry is touched.
    /// Entries whose wrapper is already gone are pruned without error. Every
    /// entry is attempted; the first native free failure, if any, is returned
    /// afterwards.
    pub fn dispose_deps_except(&self, keep: &[&NdArray]) -> Result<ReleaseReport, ArrayError> {
        self.ensure_live()?;

        for kept in keep {
            kept.ensure_env(&self.inner.env, "dispose_deps_except")?;
        }
        let mut exclusion = BTreeSet::new();
        for kept in keep {
            exclusion.insert(kept.inner.handle);
            exclusion.extend(kept.inner.lock().lineage.keys());
        }

        let plan = {
            let mut state = self.inner.lock();
            if state.disposed {
                return Err(UsageError::Disposed {
                    handle: self.inner.handle,
                }
                .into());
            }
            let plan = release_plan(state.lineage.take(), &exclusion);
            state.lineage.replace(plan.kept.clone());
            plan
        };

        let mut report = ReleaseReport {
            retained: plan.kept.keys().copied().collect(),
            ..ReleaseReport::default()
        };
        let mut first_error = None;
        for (handle, weak) in plan.released {
            let outcome = match weak.upgrade() {
                Some(dependency) => dependency.dispose(),
                None => Ok(false),
            };
            match outcome {
                Ok(true) => report.released.push(handle),
                Ok(false) => report.already_gone.push(handle),
                Err(error) => {
                    report.released.push(handle);
                    first_error.get_or_insert(error);
                }
            }
        }

        self.inner.env.record(
            EvidenceKind::Lineage,
            format!(
                "dispose_deps {} released={} already_gone={} retained={}",
                self.inner.handle,
                report.released.len(),
                report.already_gone.len(),
                report.retained.len()
            ),
        );
        match first_error {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<f64>, ArrayError> {
        self.ensure_live()?;
        Ok(self.engine().read(self.inner.handle)?)
    }

    pub fn to_scalar(&self) -> Result<f64, ArrayError> {
        self.ensure_live()?;
        if self.inner.meta.numel() != 1 {
            return Err(UsageError::NotScalar {
                shape: self.inner.meta.shape().clone(),
            }
            .into());
        }
        let values = self.engine().read(self.inner.handle)?;
        values.first().copied().ok_or_else(|| {
            ArrayError::from(UsageError::NotScalar {
                shape: self.inner.meta.shape().clone(),
            })
        })
    }

    pub fn set_scalar(&self, value: f64) -> Result<(), ArrayError> {
        self.ensure_writable()?;
        self.invoke_single("_set_value", Invocation::new().param("src", value).out(self))?;
        Ok(())
    }

    pub fn set_values(&self, values: &[f64]) -> Result<(), ArrayError> {
        self.ensure_writable()?;
        let expected = self.inner.meta.numel();
        if values.len() != expected {
            return Err(UsageError::ValueCount {
                expected,
                actual: values.len(),
            }
            .into());
        }
        Ok(self.engine().write(self.inner.handle, values)?)
    }

    /// Copies `source` into this array; records `source` as a producer.
    pub fn set_from(&self, source: &NdArray) -> Result<(), ArrayError> {
        self.ensure_writable()?;
        let expected = self.inner.meta.shape();
        let actual = source.shape()?;
        if &actual != expected {
            return Err(UsageError::ShapeMismatch {
                expected: expected.clone(),
                actual,
            }
            .into());
        }
        self.invoke_single("_copyto", Invocation::new().arg(source).out(self))?;
        Ok(())
    }

    pub fn copy(&self) -> Result<NdArray, ArrayError> {
        Ok(self
            .invoke_single("_copyto", Invocation::new().arg(self))?
            .into_array())
    }

    pub fn copy_to(&self, target: &NdArray) -> Result<(), ArrayError> {
        target.set_from(self)
    }

    /// Same wrapper when already on `context`, otherwise a copy there.
    pub fn as_in_context(&self, context: Context) -> Result<NdArray, ArrayError> {
        let meta = self.meta()?;
        if meta.context() == context {
            return Ok(self.clone());
        }
        let request = AllocRequest::new(meta.shape().clone(), context, meta.dtype());
        let target = self.inner.env.alloc(&request)?;
        target.set_from(self)?;
        Ok(target)
    }

    pub fn slice(&self, begin: usize, end: usize) -> Result<NdArray, ArrayError> {
        self.ensure_live()?;
        let handle = self.engine().slice(self.inner.handle, begin, end)?;
        self.wrap_view(handle, self.inner.writable)
    }

    pub fn at(&self, index: usize) -> Result<NdArray, ArrayError> {
        self.ensure_live()?;
        let handle = self.engine().at(self.inner.handle, index)?;
        self.wrap_view(handle, self.inner.writable)
    }

    pub fn reshape(&self, dims: &[i64]) -> Result<NdArray, ArrayError> {
        self.ensure_live()?;
        let shape = Shape::from_signed(dims)?;
        let handle = self.engine().reshape(self.inner.handle, &shape)?;
        self.wrap_view(handle, self.inner.writable)
    }

    /// View over the same storage that rejects writes.
    pub fn read_only_view(&self) -> Result<NdArray, ArrayError> {
        self.ensure_live()?;
        let handle = self
            .engine()
            .reshape(self.inner.handle, self.inner.meta.shape())?;
        self.wrap_view(handle, false)
    }

    pub fn wait_to_read(&self) -> Result<(), ArrayError> {
        self.ensure_live()?;
        self.engine().wait_to_read(self.inner.handle)?;
        self.inner
            .env
            .record(EvidenceKind::Sync, format!("wait_to_read {}", self.inner.handle));
        Ok(())
    }

    pub fn wait_to_write(&self) -> Result<(), ArrayError> {
        self.ensure_live()?;
        self.engine().wait_to_write(self.inner.handle)?;
        self.inner
            .env
            .record(EvidenceKind::Sync, format!("wait_to_write {}", self.inner.handle));
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ArrayError> {
        self.ensure_live()?;
        Ok(self.engine().save_raw_bytes(self.inner.handle)?)
    }

    pub fn cast_storage(&self, storage_type: StorageType) -> Result<ArrayOutput, ArrayError> {
        self.invoke_single(
            "cast_storage",
            Invocation::new().arg(self).param("stype", storage_type),
        )
    }

    fn binary(&self, op: &str, rhs: Operand<'_>) -> Result<NdArray, ArrayError> {
        Ok(self
            .invoke_single(op, Invocation::new().arg(self).operand(rhs))?
            .into_array())
    }

    fn binary_scalar_lhs(&self, op: &str, lhs: f64) -> Result<NdArray, ArrayError> {
        Ok(self
            .invoke_single(op, Invocation::new().scalar(lhs).arg(self))?
            .into_array())
    }

    fn binary_in_place(&self, op: &str, rhs: Operand<'_>) -> Result<(), ArrayError> {
        self.ensure_writable()?;
        self.invoke_single(op, Invocation::new().arg(self).operand(rhs).out(self))?;
        Ok(())
    }

    pub fn add<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<NdArray, ArrayError> {
        self.binary("_plus", rhs.into())
    }

    pub fn sub<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<NdArray, ArrayError> {
        self.binary("_minus", rhs.into())
    }

    pub fn mul<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<NdArray, ArrayError> {
        self.binary("_mul", rhs.into())
    }

    pub fn div<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<NdArray, ArrayError> {
        self.binary("_div", rhs.into())
    }

    pub fn neg(&self) -> Result<NdArray, ArrayError> {
        Ok(self
            .invoke_single("negative", Invocation::new().arg(self))?
            .into_array())
    }

    pub fn add_assign<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<(), ArrayError> {
        self.binary_in_place("_plus", rhs.into())
    }

    pub fn sub_assign<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<(), ArrayError> {
        self.binary_in_place("_minus", rhs.into())
    }

    pub fn mul_assign<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<(), ArrayError> {
        self.binary_in_place("_mul", rhs.into())
    }

    pub fn div_assign<'a>(&self, rhs: impl Into<Operand<'a>>) -> Result<(), ArrayError> {
        self.binary_in_place("_div", rhs.into())
    }
}

macro_rules! binary_operator {
    ($op_trait:ident, $op_method:ident, $native:literal) => {
        impl $op_trait<&NdArray> for &NdArray {
            type Output = Result<NdArray, ArrayError>;

            fn $op_method(self, rhs: &NdArray) -> Self::Output {
                self.binary($native, Operand::Array(rhs))
            }
        }

        impl $op_trait<f64> for &NdArray {
            type Output = Result<NdArray, ArrayError>;

            fn $op_method(self, rhs: f64) -> Self::Output {
                self.binary($native, Operand::Scalar(rhs))
            }
        }

        impl $op_trait<&NdArray> for f64 {
            type Output = Result<NdArray, ArrayError>;

            fn $op_method(self, rhs: &NdArray) -> Self::Output {
                rhs.binary_scalar_lhs($native, self)
            }
        }
    };
}

binary_operator!(Add, add, "_plus");
binary_operator!(Sub, sub, "_minus");
binary_operator!(Mul, mul, "_mul");
binary_operator!(Div, div, "_div");

impl Neg for &NdArray {
    type Output = Result<NdArray, ArrayError>;

    fn neg(self) -> Self::Output {
        NdArray::neg(self)
    }
}

/// Wrapper for an array whose storage uses a sparse encoding. Dense reads
/// and arithmetic go through the underlying [`NdArray`].
#[derive(Debug, Clone)]
pub struct SparseNdArray {
    array: NdArray,
}

impl SparseNdArray {
    #[must_use]
    pub fn as_array(&self) -> &NdArray {
        &self.array
    }

    #[must_use]
    pub fn into_array(self) -> NdArray {
        self.array
    }

    pub fn to_dense(&self) -> Result<NdArray, ArrayError> {
        Ok(self.array.cast_storage(StorageType::Default)?.into_array())
    }
}

impl Deref for SparseNdArray {
    type Target = NdArray;

    fn deref(&self) -> &Self::Target {
        &self.array
    }
}

impl TryFrom<NdArray> for SparseNdArray {
    type Error = ArrayError;

    fn try_from(array: NdArray) -> Result<Self, Self::Error> {
        if !array.storage_type()?.is_sparse() {
            return Err(UsageError::NotSparse {
                handle: array.inner.handle,
            }
            .into());
        }
        Ok(Self { array })
    }
}

/// Result of an operator call, wrapped by the storage tag the engine
/// reported.
#[derive(Debug, Clone)]
pub enum ArrayOutput {
    Dense(NdArray),
    Sparse(SparseNdArray),
}

impl ArrayOutput {
    fn classify(array: NdArray, storage_type: StorageType) -> Self {
        if storage_type.is_sparse() {
            Self::Sparse(SparseNdArray { array })
        } else {
            Self::Dense(array)
        }
    }

    #[must_use]
    pub fn array(&self) -> &NdArray {
        match self {
            Self::Dense(array) => array,
            Self::Sparse(sparse) => &sparse.array,
        }
    }

    #[must_use]
    pub fn into_array(self) -> NdArray {
        match self {
            Self::Dense(array) => array,
            Self::Sparse(sparse) => sparse.array,
        }
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    pub fn into_sparse(self) -> Result<SparseNdArray, ArrayError> {
        match self {
            Self::Sparse(sparse) => Ok(sparse),
            Self::Dense(array) => Err(UsageError::NotSparse {
                handle: array.inner.handle,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use nd_core::{Context, DType, HandleId, Shape, StorageType};
    use nd_engine::{
        AllocRequest, CpuEngine, EngineError, EngineStats, LoadedHandles, NativeEngine, OpCall,
        OpOutput,
    };
    use nd_runtime::{EvidenceKind, RuntimeConfig};
    use proptest::prelude::*;

    use super::{
        ArrayEnv, ArrayError, ArrayOutput, Invocation, NamedArg, NdArray, SparseNdArray,
        UsageError,
    };

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        seed: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "nd_array_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p nd-array {test_id} -- --nocapture"),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "suite_id",
            "test_id",
            "seed",
            "output_digest",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    fn env() -> Arc<ArrayEnv> {
        ArrayEnv::new(Arc::new(CpuEngine::default()), RuntimeConfig::default())
    }

    fn array(env: &Arc<ArrayEnv>, values: &[f64]) -> NdArray {
        let request = AllocRequest::new(
            Shape::new(vec![values.len()]),
            Context::cpu(0),
            DType::F64,
        );
        let array = env.alloc(&request).expect("alloc");
        array.set_values(values).expect("set values");
        array
    }

    fn live_handles(env: &ArrayEnv) -> usize {
        env.engine().stats().live_handles
    }

    /// Host engine plus one extra operator, `_discard`, that reports no
    /// outputs even when holders were supplied.
    #[derive(Debug, Default)]
    struct DiscardingEngine {
        host: CpuEngine,
    }

    impl NativeEngine for DiscardingEngine {
        fn name(&self) -> &'static str {
            "discarding"
        }

        fn alloc(&self, request: &AllocRequest) -> Result<HandleId, EngineError> {
            self.host.alloc(request)
        }

        fn free(&self, handle: HandleId) -> Result<(), EngineError> {
            self.host.free(handle)
        }

        fn meta(&self, handle: HandleId) -> Result<nd_core::ArrayMeta, EngineError> {
            self.host.meta(handle)
        }

        fn operator_names(&self) -> Vec<String> {
            let mut names = self.host.operator_names();
            names.push("_discard".to_string());
            names
        }

        fn invoke(&self, call: &OpCall) -> Result<Vec<OpOutput>, EngineError> {
            if call.op == "_discard" {
                return Ok(Vec::new());
            }
            self.host.invoke(call)
        }

        fn read(&self, handle: HandleId) -> Result<Vec<f64>, EngineError> {
            self.host.read(handle)
        }

        fn write(&self, handle: HandleId, values: &[f64]) -> Result<(), EngineError> {
            self.host.write(handle, values)
        }

        fn slice(&self, handle: HandleId, begin: usize, end: usize) -> Result<HandleId, EngineError> {
            self.host.slice(handle, begin, end)
        }

        fn at(&self, handle: HandleId, index: usize) -> Result<HandleId, EngineError> {
            self.host.at(handle, index)
        }

        fn reshape(&self, handle: HandleId, shape: &Shape) -> Result<HandleId, EngineError> {
            self.host.reshape(handle, shape)
        }

        fn wait_to_read(&self, handle: HandleId) -> Result<(), EngineError> {
            self.host.wait_to_read(handle)
        }

        fn wait_to_write(&self, handle: HandleId) -> Result<(), EngineError> {
            self.host.wait_to_write(handle)
        }

        fn wait_all(&self) -> Result<(), EngineError> {
            self.host.wait_all()
        }

        fn save(
            &self,
            location: &str,
            handles: &[HandleId],
            names: &[String],
        ) -> Result<(), EngineError> {
            self.host.save(location, handles, names)
        }

        fn load(&self, location: &str) -> Result<LoadedHandles, EngineError> {
            self.host.load(location)
        }

        fn save_raw_bytes(&self, handle: HandleId) -> Result<Vec<u8>, EngineError> {
            self.host.save_raw_bytes(handle)
        }

        fn load_from_raw_bytes(&self, bytes: &[u8]) -> Result<HandleId, EngineError> {
            self.host.load_from_raw_bytes(bytes)
        }

        fn stats(&self) -> EngineStats {
            self.host.stats()
        }
    }

    #[test]
    fn missing_engine_outputs_for_holders_are_reported() {
        let env = ArrayEnv::new(
            Arc::new(DiscardingEngine::default()),
            RuntimeConfig::default(),
        );
        let a = array(&env, &[1.0, 2.0]);
        let out = array(&env, &[0.0, 0.0]);

        let err = env
            .invoke("_discard", Invocation::new().arg(&a).out(&out))
            .expect_err("engine returned no outputs");
        assert!(matches!(
            err,
            ArrayError::Native(EngineError::OutputCount {
                expected: 1,
                actual: 0,
                ..
            })
        ));
        assert!(!out.depends_on(&a).expect("live"));
    }

    #[test]
    fn keep_list_from_another_environment_is_rejected() {
        let local = env();
        let remote = env();
        let a = array(&local, &[1.0]);
        let b = array(&local, &[2.0]);
        let sum = (&a + &b).expect("add");
        let foreign = array(&remote, &[3.0]);
        assert_eq!(foreign.handle().expect("live"), a.handle().expect("live"));

        let err = sum
            .dispose_deps_except(&[&foreign])
            .expect_err("foreign keep wrapper");
        assert!(matches!(
            err,
            ArrayError::Usage(UsageError::ForeignEnvironment { .. })
        ));
        assert_eq!(sum.lineage_len().expect("live"), 2);
        assert!(!a.is_disposed());
        assert!(!b.is_disposed());

        let b_handle = b.handle().expect("live");
        let report = sum.dispose_deps_except(&[&a]).expect("local keep wrapper");
        assert_eq!(report.released, vec![b_handle]);
        assert!(b.is_disposed());
    }

    #[test]
    fn fresh_allocation_has_no_dependencies() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        assert_eq!(a.lineage_len().expect("live"), 0);
        assert!(a.is_writable());
        assert_eq!(a.shape().expect("live"), Shape::new(vec![2]));
    }

    #[test]
    fn lineage_is_flattened_on_creation() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        let b = array(&env, &[3.0, 4.0]);
        let c = array(&env, &[5.0, 6.0]);

        let ab = (&a * &b).expect("mul");
        let result = (&ab + &c).expect("add");

        let deps = result.dependency_handles().expect("live");
        for producer in [&a, &b, &c, &ab] {
            assert!(deps.contains(&producer.handle().expect("live")));
        }
        assert_eq!(deps.len(), 4);
        assert_eq!(result.to_vec().expect("read"), vec![8.0, 14.0]);
    }

    #[test]
    fn dispose_is_idempotent() {
        let env = env();
        let a = array(&env, &[1.0]);
        let before = live_handles(&env);

        assert_eq!(a.dispose(), Ok(true));
        assert_eq!(live_handles(&env), before - 1);
        assert_eq!(a.dispose(), Ok(false));
        assert_eq!(live_handles(&env), before - 1);
        assert!(a.is_disposed());
    }

    #[test]
    fn dispose_clears_registry_without_releasing_producers() {
        let env = env();
        let a = array(&env, &[1.0]);
        let b = (&a + 1.0).expect("add");
        b.dispose().expect("dispose");
        assert!(!a.is_disposed());
        assert!(b.dependency_handles().is_err());
    }

    #[test]
    fn disposed_wrapper_reports_usage_errors() {
        let env = env();
        let a = array(&env, &[1.0]);
        let b = array(&env, &[2.0]);
        let handle = a.handle().expect("live");
        a.dispose().expect("dispose");

        let expected = ArrayError::Usage(UsageError::Disposed { handle });
        assert_eq!(a.to_vec(), Err(expected.clone()));
        assert_eq!((&a + &b).map(|_| ()), Err(expected.clone()));
        assert_eq!((&b + &a).map(|_| ()), Err(expected.clone()));
        assert_eq!(a.set_scalar(3.0), Err(expected.clone()));
        assert_eq!(a.dispose_deps().map(|_| ()), Err(expected.clone()));
        assert_eq!(a.shape().map(|_| ()), Err(expected));
        assert!(a.to_vec().expect_err("disposed").is_usage());
    }

    #[test]
    fn transitive_release_spares_self_and_exclusions() {
        let env = env();
        let a = array(&env, &[1.0]);
        let b = array(&env, &[2.0]);
        let c = array(&env, &[3.0]);
        let ab = (&a * &b).expect("mul");
        let result = (&ab + &c).expect("add");

        let report = result.dispose_deps_except(&[&a, &b]).expect("release");
        assert!(!a.is_disposed());
        assert!(!b.is_disposed());
        assert!(c.is_disposed());
        assert!(ab.is_disposed());
        assert!(!result.is_disposed());
        assert_eq!(report.released.len(), 2);
        assert_eq!(report.retained.len(), 2);
        assert_eq!(result.lineage_len().expect("live"), 2);
        assert_eq!(result.to_vec().expect("read"), vec![5.0]);
    }

    #[test]
    fn excluding_an_intermediate_keeps_its_closure() {
        let env = env();
        let a = array(&env, &[1.0]);
        let b = array(&env, &[2.0]);
        let c = array(&env, &[3.0]);
        let ab = (&a * &b).expect("mul");
        let result = (&ab + &c).expect("add");

        result.dispose_deps_except(&[&ab]).expect("release");
        assert!(!a.is_disposed());
        assert!(!b.is_disposed());
        assert!(!ab.is_disposed());
        assert!(c.is_disposed());
    }

    #[test]
    fn dropped_dependencies_are_pruned_without_error() {
        let env = env();
        let a = array(&env, &[1.0]);
        let b = array(&env, &[2.0]);
        let result = (&a + &b).expect("add");

        drop(a);
        b.dispose().expect("dispose");
        let report = result.dispose_deps().expect("release");
        assert!(report.released.is_empty());
        assert_eq!(report.already_gone.len(), 2);
        assert_eq!(result.lineage_len().expect("live"), 0);
    }

    #[test]
    fn in_place_update_never_records_self() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        let b = array(&env, &[10.0, 20.0]);
        let doubled = (&a * 2.0).expect("mul");

        a.add_assign(&doubled).expect("in place");
        assert_eq!(a.to_vec().expect("read"), vec![3.0, 6.0]);
        assert!(!a.depends_on(&a).expect("live"));
        assert!(a.depends_on(&doubled).expect("live"));

        a.mul_assign(&b).expect("in place");
        a.dispose_deps().expect("release");
        assert!(!a.is_disposed());
        assert!(doubled.is_disposed());
        assert!(b.is_disposed());
    }

    #[test]
    fn scalar_on_left_uses_reversed_operator() {
        let env = env();
        let a = array(&env, &[1.0, 4.0]);
        assert_eq!((10.0 - &a).expect("rsub").to_vec().expect("read"), vec![9.0, 6.0]);
        assert_eq!((8.0 / &a).expect("rdiv").to_vec().expect("read"), vec![8.0, 2.0]);
        assert_eq!((-&a).expect("neg").to_vec().expect("read"), vec![-1.0, -4.0]);
    }

    #[test]
    fn read_only_view_rejects_writes() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        let view = a.read_only_view().expect("view");
        let handle = view.handle().expect("live");
        assert!(!view.is_writable());
        assert_eq!(
            view.set_values(&[0.0, 0.0]),
            Err(ArrayError::Usage(UsageError::ReadOnly { handle }))
        );
        assert!(view.add_assign(1.0).expect_err("read only").is_usage());
        assert!(view.depends_on(&a).expect("live"));
    }

    #[test]
    fn value_count_mismatch_is_usage_error() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        assert_eq!(
            a.set_values(&[1.0]),
            Err(ArrayError::Usage(UsageError::ValueCount {
                expected: 2,
                actual: 1
            }))
        );
    }

    #[test]
    fn shape_mismatch_on_copy_is_usage_error() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        let b = array(&env, &[1.0]);
        let err = a.set_from(&b).expect_err("mismatch");
        assert!(matches!(err, ArrayError::Usage(UsageError::ShapeMismatch { .. })));
    }

    #[test]
    fn arity_and_unknown_operator_errors_are_classified() {
        let env = env();
        let a = array(&env, &[1.0]);

        let arity = env
            .invoke("_plus", Invocation::new().arg(&a))
            .expect_err("arity");
        assert!(arity.is_usage());

        let unknown = env
            .invoke("_not_an_op", Invocation::new().arg(&a))
            .expect_err("unknown");
        assert_eq!(
            unknown,
            ArrayError::Native(EngineError::UnknownOperator {
                name: "_not_an_op".to_string()
            })
        );
    }

    #[test]
    fn non_array_output_holder_is_rejected() {
        let env = env();
        let a = array(&env, &[1.0]);
        let before = live_handles(&env);
        let err = env
            .invoke(
                "negative",
                Invocation::new()
                    .arg(&a)
                    .named("out", NamedArg::Value("a".into())),
            )
            .expect_err("string holder");
        assert_eq!(
            err,
            ArrayError::Usage(UsageError::UnsupportedOutputHolder {
                key: "out".to_string(),
                found: "str"
            })
        );
        assert_eq!(live_handles(&env), before);
    }

    #[test]
    fn arrays_from_other_environments_are_rejected() {
        let left = env();
        let right = env();
        let a = array(&left, &[1.0]);
        let b = array(&right, &[1.0]);
        let err = (&a + &b).expect_err("foreign");
        assert!(matches!(err, ArrayError::Usage(UsageError::ForeignEnvironment { .. })));
    }

    #[test]
    fn dropping_last_reference_frees_handle() {
        let env = env();
        let a = array(&env, &[1.0]);
        let alias = a.clone();
        let before = live_handles(&env);
        drop(a);
        assert_eq!(live_handles(&env), before);
        drop(alias);
        assert_eq!(live_handles(&env), before - 1);
        assert!(
            env.evidence()
                .iter()
                .any(|entry| entry.kind == EvidenceKind::Release && entry.summary.starts_with("drop"))
        );
    }

    #[test]
    fn lineage_does_not_keep_producers_alive() {
        let env = env();
        let a = array(&env, &[1.0]);
        let b = (&a + 1.0).expect("add");
        let before = live_handles(&env);
        drop(a);
        assert_eq!(live_handles(&env), before - 1);
        assert_eq!(b.to_vec().expect("read"), vec![2.0]);
    }

    #[test]
    fn views_record_source_and_outlive_it() {
        let env = env();
        let request = AllocRequest::new(Shape::new(vec![2, 2]), Context::cpu(0), DType::F64);
        let base = env.alloc(&request).expect("alloc");
        base.set_values(&[1.0, 2.0, 3.0, 4.0]).expect("write");

        let row = base.at(1).expect("at");
        let flat = base.reshape(&[4]).expect("reshape");
        assert!(row.depends_on(&base).expect("live"));
        assert_eq!(row.to_vec().expect("read"), vec![3.0, 4.0]);

        base.dispose().expect("dispose");
        assert_eq!(flat.to_vec().expect("read"), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(base.reshape(&[4]).expect_err("disposed").is_usage());
    }

    #[test]
    fn negative_reshape_is_usage_error() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        let before = live_handles(&env);
        let err = a.reshape(&[-2]).expect_err("negative dim");
        assert!(err.is_usage());
        assert_eq!(live_handles(&env), before);
    }

    #[test]
    fn sparse_outputs_are_wrapped_as_sparse() {
        let env = env();
        let a = array(&env, &[0.0, 5.0]);
        let output = a.cast_storage(StorageType::Csr).expect("cast");
        assert!(output.is_sparse());

        let sparse = output.into_sparse().expect("sparse");
        assert_eq!(sparse.storage_type().expect("live"), StorageType::Csr);
        let dense = sparse.to_dense().expect("densify");
        assert_eq!(dense.storage_type().expect("live"), StorageType::Default);
        assert_eq!(dense.to_vec().expect("read"), vec![0.0, 5.0]);
        assert!(dense.depends_on(&a).expect("live"));

        let err = SparseNdArray::try_from(dense).expect_err("dense");
        assert!(matches!(err, ArrayError::Usage(UsageError::NotSparse { .. })));
        assert!(matches!(
            a.copy().map(ArrayOutput::Dense).and_then(ArrayOutput::into_sparse),
            Err(ArrayError::Usage(UsageError::NotSparse { .. }))
        ));
    }

    #[test]
    fn gpu_copy_is_native_error() {
        let env = env();
        let a = array(&env, &[1.0]);
        let err = a.as_in_context(Context::gpu(0)).expect_err("no gpu");
        assert!(err.is_native());
        assert!(a.as_in_context(Context::cpu(0)).expect("same").ptr_eq(&a));

        let moved = a.as_in_context(Context::cpu(1)).expect("cpu(1)");
        assert_eq!(moved.context().expect("live"), Context::cpu(1));
        assert!(moved.depends_on(&a).expect("live"));
    }

    #[test]
    fn to_scalar_requires_single_element() {
        let env = env();
        let a = array(&env, &[1.0, 2.0]);
        assert!(matches!(
            a.to_scalar(),
            Err(ArrayError::Usage(UsageError::NotScalar { .. }))
        ));
        let total = env
            .invoke("sum", Invocation::new().arg(&a))
            .expect("sum")
            .remove(0)
            .into_array();
        assert_eq!(total.to_scalar(), Ok(3.0));
    }

    #[test]
    fn set_scalar_fills_every_element() {
        let env = env();
        let a = array(&env, &[1.0, 2.0, 3.0]);
        a.set_scalar(7.0).expect("fill");
        assert_eq!(a.to_vec().expect("read"), vec![7.0; 3]);
    }

    #[test]
    fn adopt_all_frees_everything_on_failure() {
        let env = env();
        let engine = env.engine();
        let good = engine
            .alloc(&AllocRequest::new(Shape::new(vec![1]), Context::cpu(0), DType::F32))
            .expect("alloc");
        let trailing = engine
            .alloc(&AllocRequest::new(Shape::new(vec![1]), Context::cpu(0), DType::F32))
            .expect("alloc");
        let err = env
            .adopt_all(&[good, HandleId(9_999), trailing])
            .expect_err("missing handle");
        assert!(err.is_native());
        assert_eq!(live_handles(&env), 0);
    }

    proptest! {
        #[test]
        fn prop_lineage_closure_holds_for_random_chains(
            steps in prop::collection::vec((0usize..4, 0usize..16, 0usize..16), 1..=12),
        ) {
            let env = env();
            let mut pool = vec![array(&env, &[1.0]), array(&env, &[2.0])];
            for (op_index, lhs_seed, rhs_seed) in &steps {
                let lhs = pool[lhs_seed % pool.len()].clone();
                let rhs = pool[rhs_seed % pool.len()].clone();
                let before = [
                    lhs.dependency_handles().expect("live"),
                    rhs.dependency_handles().expect("live"),
                ];
                let result = match op_index {
                    0 => (&lhs + &rhs),
                    1 => (&lhs - &rhs),
                    2 => (&lhs * &rhs),
                    _ => (&lhs + 1.0),
                }
                .expect("op");

                let deps = result.dependency_handles().expect("live");
                prop_assert!(deps.contains(&lhs.handle().expect("live")));
                if *op_index < 3 {
                    prop_assert!(deps.contains(&rhs.handle().expect("live")));
                    for handle in &before[1] {
                        prop_assert!(deps.contains(handle));
                    }
                }
                for handle in &before[0] {
                    prop_assert!(deps.contains(handle));
                }
                prop_assert!(!deps.contains(&result.handle().expect("live")));
                pool.push(result);
            }

            let last = pool.last().expect("non-empty").clone();
            let total = last.lineage_len().expect("live");
            let report = last.dispose_deps().expect("release");
            prop_assert_eq!(report.pruned(), total);
            prop_assert!(!last.is_disposed());

            let seed = det_seed(&steps.iter().map(|(op, _, _)| *op as u64).collect::<Vec<_>>());
            let log = build_property_log(
                "prop_lineage_closure_holds_for_random_chains",
                seed,
                det_seed(&[total as u64, report.released.len() as u64]),
                "lineage_closure_ok",
            );
            assert_log_contract(&log);
        }
    }
}
