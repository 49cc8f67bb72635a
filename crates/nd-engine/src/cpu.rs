use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nd_core::{ArrayMeta, Context, DType, HandleId, Shape, StorageType};
use nd_serialize::{
    ArrayPayload, DecodeMode, decode_archive, decode_raw_array, encode_archive, encode_raw_array,
};

use crate::{
    AllocRequest, EngineError, EngineStats, LoadedHandles, NativeEngine, OpCall, OpOutput,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuEngineConfig {
    /// Total bytes the engine may hand out; `None` is unbounded.
    pub capacity_bytes: Option<usize>,
    pub supported_dtypes: Vec<DType>,
    pub decode_mode: DecodeMode,
}

impl Default for CpuEngineConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: None,
            supported_dtypes: DType::all().to_vec(),
            decode_mode: DecodeMode::Strict,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kernel {
    Binary(fn(f64, f64) -> f64),
    Scalar(fn(f64, f64) -> f64),
    Unary(fn(f64) -> f64),
    Sum,
    CopyTo,
    SetValue,
    Fill(Option<f64>),
    CastStorage,
}

fn add(lhs: f64, rhs: f64) -> f64 {
    lhs + rhs
}

fn sub(lhs: f64, rhs: f64) -> f64 {
    lhs - rhs
}

fn rsub(lhs: f64, rhs: f64) -> f64 {
    rhs - lhs
}

fn mul(lhs: f64, rhs: f64) -> f64 {
    lhs * rhs
}

fn div(lhs: f64, rhs: f64) -> f64 {
    lhs / rhs
}

fn rdiv(lhs: f64, rhs: f64) -> f64 {
    rhs / lhs
}

fn negative(value: f64) -> f64 {
    -value
}

fn square(value: f64) -> f64 {
    value * value
}

const OPERATORS: &[(&str, Kernel)] = &[
    ("_plus", Kernel::Binary(add)),
    ("_minus", Kernel::Binary(sub)),
    ("_mul", Kernel::Binary(mul)),
    ("_div", Kernel::Binary(div)),
    ("_plus_scalar", Kernel::Scalar(add)),
    ("_minus_scalar", Kernel::Scalar(sub)),
    ("_rminus_scalar", Kernel::Scalar(rsub)),
    ("_mul_scalar", Kernel::Scalar(mul)),
    ("_div_scalar", Kernel::Scalar(div)),
    ("_rdiv_scalar", Kernel::Scalar(rdiv)),
    ("negative", Kernel::Unary(negative)),
    ("abs", Kernel::Unary(f64::abs)),
    ("sqrt", Kernel::Unary(f64::sqrt)),
    ("square", Kernel::Unary(square)),
    ("exp", Kernel::Unary(f64::exp)),
    ("sum", Kernel::Sum),
    ("_copyto", Kernel::CopyTo),
    ("_set_value", Kernel::SetValue),
    ("_zeros", Kernel::Fill(Some(0.0))),
    ("_ones", Kernel::Fill(Some(1.0))),
    ("_full", Kernel::Fill(None)),
    ("cast_storage", Kernel::CastStorage),
];

fn lookup(op: &str) -> Option<Kernel> {
    OPERATORS
        .iter()
        .find(|(name, _)| *name == op)
        .map(|(_, kernel)| *kernel)
}

#[derive(Debug)]
struct StorageBlock {
    /// `None` until first touched when allocation was deferred.
    values: Option<Vec<f64>>,
    len: usize,
    bytes: usize,
    refs: usize,
}

#[derive(Debug, Clone)]
struct HandleEntry {
    meta: ArrayMeta,
    storage: u64,
    offset: usize,
}

#[derive(Debug, Default)]
struct CpuState {
    next_handle: u64,
    next_storage: u64,
    handles: BTreeMap<HandleId, HandleEntry>,
    storages: BTreeMap<u64, StorageBlock>,
    bytes_in_use: usize,
    ops_invoked: u64,
    sync_calls: u64,
}

impl CpuState {
    fn entry(&self, handle: HandleId) -> Result<&HandleEntry, EngineError> {
        self.handles
            .get(&handle)
            .ok_or(EngineError::UnknownHandle(handle))
    }

    fn reserve(&mut self, bytes: usize, capacity: Option<usize>) -> Result<(), EngineError> {
        if let Some(capacity) = capacity {
            let available = capacity.saturating_sub(self.bytes_in_use);
            if bytes > available {
                return Err(EngineError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        self.bytes_in_use = self.bytes_in_use.saturating_add(bytes);
        Ok(())
    }

    fn allocate(
        &mut self,
        meta: ArrayMeta,
        values: Option<Vec<f64>>,
        capacity: Option<usize>,
    ) -> Result<HandleId, EngineError> {
        let len = meta.shape().checked_numel()?;
        let bytes = meta.nbytes()?;
        self.reserve(bytes, capacity)?;

        self.next_storage += 1;
        let storage = self.next_storage;
        self.storages.insert(
            storage,
            StorageBlock {
                values,
                len,
                bytes,
                refs: 1,
            },
        );
        Ok(self.insert_handle(HandleEntry {
            meta,
            storage,
            offset: 0,
        }))
    }

    // Ids are never reused, so a stale id can only ever miss.
    fn insert_handle(&mut self, entry: HandleEntry) -> HandleId {
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.handles.insert(handle, entry);
        handle
    }

    fn alias(
        &mut self,
        source: HandleId,
        meta: ArrayMeta,
        offset: usize,
    ) -> Result<HandleId, EngineError> {
        let storage = self.entry(source)?.storage;
        let block = self
            .storages
            .get_mut(&storage)
            .ok_or(EngineError::UnknownHandle(source))?;
        block.refs += 1;
        Ok(self.insert_handle(HandleEntry {
            meta,
            storage,
            offset,
        }))
    }

    fn release(&mut self, handle: HandleId) -> Result<(), EngineError> {
        let entry = self
            .handles
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;
        let last_reference = match self.storages.get_mut(&entry.storage) {
            Some(block) => {
                block.refs = block.refs.saturating_sub(1);
                block.refs == 0
            }
            None => false,
        };
        if last_reference {
            if let Some(block) = self.storages.remove(&entry.storage) {
                self.bytes_in_use = self.bytes_in_use.saturating_sub(block.bytes);
            }
        }
        Ok(())
    }

    fn values(&self, handle: HandleId) -> Result<Vec<f64>, EngineError> {
        let entry = self.entry(handle)?;
        let numel = entry.meta.numel();
        let block = self
            .storages
            .get(&entry.storage)
            .ok_or(EngineError::UnknownHandle(handle))?;
        match &block.values {
            Some(values) => values
                .get(entry.offset..entry.offset + numel)
                .map(<[f64]>::to_vec)
                .ok_or_else(|| storage_span_error("read", entry.offset, numel, block.len)),
            None => Ok(vec![0.0; numel]),
        }
    }

    fn store(&mut self, handle: HandleId, values: &[f64]) -> Result<(), EngineError> {
        let entry = self.entry(handle)?.clone();
        let numel = entry.meta.numel();
        if values.len() != numel {
            return Err(EngineError::InvalidArgument {
                op: "write".to_string(),
                reason: format!(
                    "handle {handle} holds {numel} elements, got {}",
                    values.len()
                ),
            });
        }

        let dtype = entry.meta.dtype();
        let block = self
            .storages
            .get_mut(&entry.storage)
            .ok_or(EngineError::UnknownHandle(handle))?;
        let len = block.len;
        let data = block.values.get_or_insert_with(|| vec![0.0; len]);
        let target = data
            .get_mut(entry.offset..entry.offset + numel)
            .ok_or_else(|| storage_span_error("write", entry.offset, numel, len))?;
        for (slot, value) in target.iter_mut().zip(values) {
            *slot = dtype.quantize(*value);
        }
        Ok(())
    }
}

fn storage_span_error(op: &str, offset: usize, numel: usize, len: usize) -> EngineError {
    EngineError::InvalidArgument {
        op: op.to_string(),
        reason: format!("view span offset={offset} numel={numel} exceeds storage len={len}"),
    }
}

struct Planned {
    meta: ArrayMeta,
    values: Vec<f64>,
}

/// Host-memory engine executing every operator synchronously.
pub struct CpuEngine {
    config: CpuEngineConfig,
    state: Mutex<CpuState>,
}

impl fmt::Debug for CpuEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuEngine")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new(CpuEngineConfig::default())
    }
}

impl CpuEngine {
    #[must_use]
    pub fn new(config: CpuEngineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CpuState::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CpuEngineConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CpuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_placement(&self, context: Context, dtype: DType) -> Result<(), EngineError> {
        if !context.device_type().is_host() {
            return Err(EngineError::DeviceUnavailable { context });
        }
        if !self.config.supported_dtypes.contains(&dtype) {
            return Err(EngineError::UnsupportedDType { dtype });
        }
        Ok(())
    }

    fn plan(&self, state: &CpuState, kernel: Kernel, call: &OpCall) -> Result<Planned, EngineError> {
        let op = call.op.as_str();
        match kernel {
            Kernel::Binary(f) => {
                let [lhs, rhs] = expect_inputs::<2>(call)?;
                let lhs_meta = state.entry(lhs)?.meta.clone();
                let rhs_meta = &state.entry(rhs)?.meta;
                ensure_meta_compatible(op, &lhs_meta, rhs_meta)?;
                let lhs_values = state.values(lhs)?;
                let rhs_values = state.values(rhs)?;
                let values = lhs_values
                    .iter()
                    .zip(rhs_values.iter())
                    .map(|(a, b)| f(*a, *b))
                    .collect();
                Ok(Planned {
                    meta: lhs_meta.with_storage_type(StorageType::Default),
                    values,
                })
            }
            Kernel::Scalar(f) => {
                let [input] = expect_inputs::<1>(call)?;
                let scalar: f64 = required_param(call, "scalar")?;
                let meta = state.entry(input)?.meta.clone();
                let values = state
                    .values(input)?
                    .into_iter()
                    .map(|value| f(value, scalar))
                    .collect();
                Ok(Planned {
                    meta: meta.with_storage_type(StorageType::Default),
                    values,
                })
            }
            Kernel::Unary(f) => {
                let [input] = expect_inputs::<1>(call)?;
                let meta = state.entry(input)?.meta.clone();
                let values = state.values(input)?.into_iter().map(f).collect();
                Ok(Planned {
                    meta: meta.with_storage_type(StorageType::Default),
                    values,
                })
            }
            Kernel::Sum => {
                let [input] = expect_inputs::<1>(call)?;
                let meta = state.entry(input)?.meta.clone();
                let total = state.values(input)?.iter().sum();
                Ok(Planned {
                    meta: ArrayMeta::dense(Shape::new(vec![1]), meta.dtype(), meta.context()),
                    values: vec![total],
                })
            }
            Kernel::CopyTo => {
                let [input] = expect_inputs::<1>(call)?;
                Ok(Planned {
                    meta: state.entry(input)?.meta.clone(),
                    values: state.values(input)?,
                })
            }
            Kernel::SetValue => {
                expect_inputs::<0>(call)?;
                let src: f64 = required_param(call, "src")?;
                let [out] = call.outputs.as_slice() else {
                    return Err(EngineError::OutputCount {
                        op: op.to_string(),
                        expected: 1,
                        actual: call.outputs.len(),
                    });
                };
                let meta = state.entry(*out)?.meta.clone();
                let values = vec![src; meta.numel()];
                Ok(Planned { meta, values })
            }
            Kernel::Fill(fixed) => {
                expect_inputs::<0>(call)?;
                let value = match fixed {
                    Some(value) => value,
                    None => required_param(call, "value")?,
                };
                let meta = match call.outputs.first() {
                    Some(out) => state.entry(*out)?.meta.clone(),
                    None => {
                        let shape: Shape = required_param(call, "shape")?;
                        let context: Context =
                            optional_param(call, "ctx")?.unwrap_or_else(Context::default);
                        let dtype: DType = optional_param(call, "dtype")?.unwrap_or(DType::F32);
                        self.ensure_placement(context, dtype)?;
                        ArrayMeta::dense(shape, dtype, context)
                    }
                };
                if let Some(shape) = optional_param::<Shape>(call, "shape")? {
                    if &shape != meta.shape() {
                        return Err(EngineError::ShapeMismatch {
                            op: op.to_string(),
                            lhs: shape,
                            rhs: meta.shape().clone(),
                        });
                    }
                }
                let values = vec![value; meta.shape().checked_numel()?];
                Ok(Planned { meta, values })
            }
            Kernel::CastStorage => {
                let [input] = expect_inputs::<1>(call)?;
                let stype: StorageType = required_param(call, "stype")?;
                Ok(Planned {
                    meta: state.entry(input)?.meta.clone().with_storage_type(stype),
                    values: state.values(input)?,
                })
            }
        }
    }

    fn commit(
        &self,
        state: &mut CpuState,
        op: &str,
        planned: Planned,
        outputs: &[HandleId],
    ) -> Result<Vec<OpOutput>, EngineError> {
        match outputs {
            [] => {
                let storage_type = planned.meta.storage_type();
                let dtype = planned.meta.dtype();
                let values = planned
                    .values
                    .into_iter()
                    .map(|value| dtype.quantize(value))
                    .collect();
                let handle =
                    state.allocate(planned.meta, Some(values), self.config.capacity_bytes)?;
                Ok(vec![OpOutput {
                    handle,
                    storage_type,
                }])
            }
            [out] => {
                let out_meta = state.entry(*out)?.meta.clone();
                if out_meta.shape() != planned.meta.shape() {
                    return Err(EngineError::ShapeMismatch {
                        op: op.to_string(),
                        lhs: planned.meta.shape().clone(),
                        rhs: out_meta.shape().clone(),
                    });
                }
                state.store(*out, &planned.values)?;
                Ok(vec![OpOutput {
                    handle: *out,
                    storage_type: out_meta.storage_type(),
                }])
            }
            _ => Err(EngineError::OutputCount {
                op: op.to_string(),
                expected: 1,
                actual: outputs.len(),
            }),
        }
    }

    fn payload(state: &CpuState, handle: HandleId) -> Result<ArrayPayload, EngineError> {
        let meta = state.entry(handle)?.meta.clone();
        let values = state.values(handle)?;
        Ok(ArrayPayload::new(
            meta.shape().clone(),
            meta.dtype(),
            meta.storage_type(),
            meta.context(),
            &values,
        ))
    }

    fn materialize(
        &self,
        state: &mut CpuState,
        payload: ArrayPayload,
    ) -> Result<HandleId, EngineError> {
        self.ensure_placement(payload.context, payload.dtype)?;
        let values = payload.values();
        let meta = ArrayMeta::new(
            payload.shape,
            payload.dtype,
            payload.context,
            payload.storage_type,
        );
        state.allocate(meta, Some(values), self.config.capacity_bytes)
    }
}

impl NativeEngine for CpuEngine {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn alloc(&self, request: &AllocRequest) -> Result<HandleId, EngineError> {
        self.ensure_placement(request.context, request.dtype)?;
        let meta = ArrayMeta::dense(request.shape.clone(), request.dtype, request.context);
        let values = if request.delay_alloc {
            None
        } else {
            Some(vec![0.0; request.shape.checked_numel()?])
        };

        let handle = self
            .lock()
            .allocate(meta, values, self.config.capacity_bytes)?;
        tracing::trace!(
            "allocated {handle} shape={} dtype={} ctx={} delay_alloc={}",
            request.shape,
            request.dtype,
            request.context,
            request.delay_alloc
        );
        Ok(handle)
    }

    fn free(&self, handle: HandleId) -> Result<(), EngineError> {
        self.lock().release(handle)?;
        tracing::trace!("freed {handle}");
        Ok(())
    }

    fn meta(&self, handle: HandleId) -> Result<ArrayMeta, EngineError> {
        Ok(self.lock().entry(handle)?.meta.clone())
    }

    fn operator_names(&self) -> Vec<String> {
        OPERATORS
            .iter()
            .map(|(name, _)| (*name).to_string())
            .collect()
    }

    fn invoke(&self, call: &OpCall) -> Result<Vec<OpOutput>, EngineError> {
        let kernel = lookup(&call.op).ok_or_else(|| EngineError::UnknownOperator {
            name: call.op.clone(),
        })?;

        let mut state = self.lock();
        let planned = self.plan(&state, kernel, call)?;
        let outputs = self.commit(&mut state, &call.op, planned, &call.outputs)?;
        state.ops_invoked += 1;
        tracing::debug!(
            "invoked {} inputs={} outputs={}",
            call.op,
            call.inputs.len(),
            outputs.len()
        );
        Ok(outputs)
    }

    fn read(&self, handle: HandleId) -> Result<Vec<f64>, EngineError> {
        self.lock().values(handle)
    }

    fn write(&self, handle: HandleId, values: &[f64]) -> Result<(), EngineError> {
        self.lock().store(handle, values)
    }

    fn slice(&self, handle: HandleId, begin: usize, end: usize) -> Result<HandleId, EngineError> {
        let mut state = self.lock();
        let entry = state.entry(handle)?.clone();
        let dims = entry.meta.shape().dims();
        let Some(&rows) = dims.first() else {
            return Err(EngineError::InvalidArgument {
                op: "slice".to_string(),
                reason: "cannot slice a scalar".to_string(),
            });
        };
        if begin > end || end > rows {
            return Err(EngineError::InvalidArgument {
                op: "slice".to_string(),
                reason: format!("range {begin}..{end} out of bounds for {rows} rows"),
            });
        }

        let row_len = dims[1..].iter().product::<usize>();
        let mut sliced = dims.to_vec();
        sliced[0] = end - begin;
        let meta = entry.meta.clone().with_shape(Shape::new(sliced));
        state.alias(handle, meta, entry.offset + begin * row_len)
    }

    fn at(&self, handle: HandleId, index: usize) -> Result<HandleId, EngineError> {
        let mut state = self.lock();
        let entry = state.entry(handle)?.clone();
        let dims = entry.meta.shape().dims();
        let Some(&rows) = dims.first() else {
            return Err(EngineError::InvalidArgument {
                op: "at".to_string(),
                reason: "cannot index a scalar".to_string(),
            });
        };
        if index >= rows {
            return Err(EngineError::InvalidArgument {
                op: "at".to_string(),
                reason: format!("index {index} out of bounds for {rows} rows"),
            });
        }

        let row_shape = Shape::new(dims[1..].to_vec());
        let row_len = row_shape.numel();
        let meta = entry.meta.clone().with_shape(row_shape);
        state.alias(handle, meta, entry.offset + index * row_len)
    }

    fn reshape(&self, handle: HandleId, shape: &Shape) -> Result<HandleId, EngineError> {
        let mut state = self.lock();
        let entry = state.entry(handle)?.clone();
        entry.meta.shape().ensure_reshapable(shape)?;
        let meta = entry.meta.clone().with_shape(shape.clone());
        state.alias(handle, meta, entry.offset)
    }

    fn wait_to_read(&self, handle: HandleId) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.entry(handle)?;
        state.sync_calls += 1;
        Ok(())
    }

    fn wait_to_write(&self, handle: HandleId) -> Result<(), EngineError> {
        self.wait_to_read(handle)
    }

    fn wait_all(&self) -> Result<(), EngineError> {
        self.lock().sync_calls += 1;
        Ok(())
    }

    fn save(
        &self,
        location: &str,
        handles: &[HandleId],
        names: &[String],
    ) -> Result<(), EngineError> {
        let path = local_path(location)?;
        let payloads = {
            let state = self.lock();
            handles
                .iter()
                .map(|handle| Self::payload(&state, *handle))
                .collect::<Result<Vec<_>, _>>()?
        };
        let encoded = encode_archive(names, &payloads)?;
        std::fs::write(&path, encoded).map_err(|error| EngineError::Io {
            location: location.to_string(),
            diagnostic: error.to_string(),
        })?;
        tracing::debug!("saved {} array(s) to {location}", handles.len());
        Ok(())
    }

    fn load(&self, location: &str) -> Result<LoadedHandles, EngineError> {
        let path = local_path(location)?;
        let input = std::fs::read_to_string(&path).map_err(|error| EngineError::Io {
            location: location.to_string(),
            diagnostic: error.to_string(),
        })?;
        let archive = decode_archive(&input, self.config.decode_mode)?;

        let mut state = self.lock();
        let mut handles = Vec::with_capacity(archive.arrays.len());
        for payload in archive.arrays {
            match self.materialize(&mut state, payload) {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for handle in handles {
                        let _ = state.release(handle);
                    }
                    return Err(error);
                }
            }
        }
        tracing::debug!("loaded {} array(s) from {location}", handles.len());
        Ok(LoadedHandles {
            names: archive.names,
            handles,
        })
    }

    fn save_raw_bytes(&self, handle: HandleId) -> Result<Vec<u8>, EngineError> {
        let payload = Self::payload(&self.lock(), handle)?;
        Ok(encode_raw_array(&payload)?)
    }

    fn load_from_raw_bytes(&self, bytes: &[u8]) -> Result<HandleId, EngineError> {
        let payload = decode_raw_array(bytes, self.config.decode_mode)?;
        let mut state = self.lock();
        self.materialize(&mut state, payload)
    }

    fn stats(&self) -> EngineStats {
        let state = self.lock();
        EngineStats {
            live_handles: state.handles.len(),
            live_storages: state.storages.len(),
            bytes_in_use: state.bytes_in_use,
            ops_invoked: state.ops_invoked,
            sync_calls: state.sync_calls,
        }
    }
}

fn expect_inputs<const N: usize>(call: &OpCall) -> Result<[HandleId; N], EngineError> {
    <[HandleId; N]>::try_from(call.inputs.as_slice()).map_err(|_| EngineError::InvalidArgument {
        op: call.op.clone(),
        reason: format!("expects {N} input(s), got {}", call.inputs.len()),
    })
}

fn optional_param<T>(call: &OpCall, key: &str) -> Result<Option<T>, EngineError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    call.params
        .get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|error| EngineError::InvalidArgument {
                op: call.op.clone(),
                reason: format!("param '{key}'='{raw}': {error}"),
            })
        })
        .transpose()
}

fn required_param<T>(call: &OpCall, key: &str) -> Result<T, EngineError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    optional_param(call, key)?.ok_or_else(|| EngineError::InvalidArgument {
        op: call.op.clone(),
        reason: format!("missing required param '{key}'"),
    })
}

fn ensure_meta_compatible(op: &str, lhs: &ArrayMeta, rhs: &ArrayMeta) -> Result<(), EngineError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(EngineError::DTypeMismatch {
            op: op.to_string(),
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.context() != rhs.context() {
        return Err(EngineError::ContextMismatch {
            op: op.to_string(),
            lhs: lhs.context(),
            rhs: rhs.context(),
        });
    }

    if lhs.shape() != rhs.shape() {
        return Err(EngineError::ShapeMismatch {
            op: op.to_string(),
            lhs: lhs.shape().clone(),
            rhs: rhs.shape().clone(),
        });
    }

    Ok(())
}

fn local_path(location: &str) -> Result<PathBuf, EngineError> {
    if let Some(path) = location.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if location.contains("://") {
        return Err(EngineError::UnsupportedScheme {
            location: location.to_string(),
        });
    }
    Ok(PathBuf::from(location))
}
