use nd_core::HandleId;
use nd_dispatch::{ParamValue, RawOperand};

use crate::{ArrayEnv, ArrayError, NdArray, UsageError};

/// Named argument that designates pre-allocated output holders.
pub const OUT_KEY: &str = "out";

/// Borrowed positional operand for the arithmetic helpers.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Array(&'a NdArray),
    Scalar(f64),
}

impl<'a> From<&'a NdArray> for Operand<'a> {
    fn from(value: &'a NdArray) -> Self {
        Self::Array(value)
    }
}

impl From<f64> for Operand<'_> {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

#[derive(Debug, Clone)]
pub enum NamedArg {
    Value(ParamValue),
    Array(NdArray),
    Arrays(Vec<NdArray>),
}

impl NamedArg {
    fn kind(&self) -> &'static str {
        match self {
            Self::Value(ParamValue::Str(_)) => "str",
            Self::Value(ParamValue::Int(_)) => "int",
            Self::Value(ParamValue::Float(_)) => "float",
            Self::Value(ParamValue::Bool(_)) => "bool",
            Self::Value(ParamValue::Shape(_)) => "shape",
            Self::Value(ParamValue::DType(_)) => "dtype",
            Self::Value(ParamValue::Context(_)) => "context",
            Self::Value(ParamValue::StorageType(_)) => "storage_type",
            Self::Array(_) => "array",
            Self::Arrays(_) => "array list",
        }
    }
}

#[derive(Debug, Clone)]
enum Arg {
    Array(NdArray),
    Scalar(f64),
}

/// Arguments for one operator call: positional operands, named parameters
/// and optional output holders under [`OUT_KEY`].
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    args: Vec<Arg>,
    named: Vec<(String, NamedArg)>,
}

impl Invocation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, array: &NdArray) -> Self {
        self.args.push(Arg::Array(array.clone()));
        self
    }

    #[must_use]
    pub fn scalar(mut self, value: f64) -> Self {
        self.args.push(Arg::Scalar(value));
        self
    }

    #[must_use]
    pub fn operand<'a>(self, operand: impl Into<Operand<'a>>) -> Self {
        match operand.into() {
            Operand::Array(array) => self.arg(array),
            Operand::Scalar(value) => self.scalar(value),
        }
    }

    #[must_use]
    pub fn param(self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.named(key, NamedArg::Value(value.into()))
    }

    #[must_use]
    pub fn out(self, array: &NdArray) -> Self {
        self.named(OUT_KEY, NamedArg::Array(array.clone()))
    }

    #[must_use]
    pub fn outs(self, arrays: &[&NdArray]) -> Self {
        let arrays = arrays.iter().map(|array| (*array).clone()).collect();
        self.named(OUT_KEY, NamedArg::Arrays(arrays))
    }

    #[must_use]
    pub fn named(mut self, key: impl Into<String>, value: NamedArg) -> Self {
        self.named.push((key.into(), value));
        self
    }

    #[must_use]
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Validates holders and operands against `env` and lowers them to
    /// engine handles.
    pub(crate) fn prepare(self, env: &ArrayEnv, op: &str) -> Result<Prepared, ArrayError> {
        let mut params = Vec::new();
        let mut outputs = Vec::new();
        for (key, value) in self.named {
            match value {
                NamedArg::Value(param) if key != OUT_KEY => params.push((key, param)),
                NamedArg::Array(array) if key == OUT_KEY => outputs.push(array),
                NamedArg::Arrays(arrays) if key == OUT_KEY => outputs.extend(arrays),
                NamedArg::Array(_) | NamedArg::Arrays(_) => {
                    return Err(UsageError::UnexpectedArrayArgument { key }.into());
                }
                other => {
                    return Err(UsageError::UnsupportedOutputHolder {
                        key,
                        found: other.kind(),
                    }
                    .into());
                }
            }
        }

        let mut operands = Vec::with_capacity(self.args.len());
        let mut producers = Vec::new();
        for arg in self.args {
            match arg {
                Arg::Array(array) => {
                    array.ensure_env(env, op)?;
                    operands.push(RawOperand::Handle(array.handle()?));
                    producers.push(array);
                }
                Arg::Scalar(value) => operands.push(RawOperand::Scalar(value)),
            }
        }

        let mut output_handles = Vec::with_capacity(outputs.len());
        for output in &outputs {
            output.ensure_env(env, op)?;
            output.ensure_writable()?;
            output_handles.push(output.handle()?);
        }

        Ok(Prepared {
            operands,
            producers,
            params,
            outputs,
            output_handles,
        })
    }
}

pub(crate) struct Prepared {
    pub(crate) operands: Vec<RawOperand>,
    pub(crate) producers: Vec<NdArray>,
    pub(crate) params: Vec<(String, ParamValue)>,
    pub(crate) outputs: Vec<NdArray>,
    pub(crate) output_handles: Vec<HandleId>,
}
