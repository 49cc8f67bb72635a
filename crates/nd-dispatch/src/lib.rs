#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use nd_core::{Context, DType, HandleId, Shape, StorageType};
use nd_engine::{EngineError, NativeEngine, OpCall, OpOutput};

/// Positional operand of an imperative call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawOperand {
    Handle(HandleId),
    Scalar(f64),
}

impl From<HandleId> for RawOperand {
    fn from(value: HandleId) -> Self {
        Self::Handle(value)
    }
}

impl From<f64> for RawOperand {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

/// Named operator argument before packing into the engine's string map.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Shape(Shape),
    DType(DType),
    Context(Context),
    StorageType(StorageType),
}

impl ParamValue {
    #[must_use]
    pub fn pack(&self) -> String {
        match self {
            Self::Str(value) => value.clone(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Shape(value) => value.to_string(),
            Self::DType(value) => value.to_string(),
            Self::Context(value) => value.to_string(),
            Self::StorageType(value) => value.to_string(),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Shape> for ParamValue {
    fn from(value: Shape) -> Self {
        Self::Shape(value)
    }
}

impl From<DType> for ParamValue {
    fn from(value: DType) -> Self {
        Self::DType(value)
    }
}

impl From<Context> for ParamValue {
    fn from(value: Context) -> Self {
        Self::Context(value)
    }
}

impl From<StorageType> for ParamValue {
    fn from(value: StorageType) -> Self {
        Self::StorageType(value)
    }
}

/// Later keys overwrite earlier ones.
#[must_use]
pub fn pack_params<'a, I>(params: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a ParamValue)>,
{
    params
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.pack()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSignature {
    /// `None` accepts any number of inputs.
    pub num_inputs: Option<usize>,
    pub num_outputs: usize,
    pub scalar_variant: Option<&'static str>,
    /// Variant used when the scalar is the left operand.
    pub reversed_scalar_variant: Option<&'static str>,
}

impl OpSignature {
    const fn fixed(num_inputs: usize) -> Self {
        Self {
            num_inputs: Some(num_inputs),
            num_outputs: 1,
            scalar_variant: None,
            reversed_scalar_variant: None,
        }
    }

    const fn binary(scalar_variant: &'static str, reversed_scalar_variant: &'static str) -> Self {
        Self {
            num_inputs: Some(2),
            num_outputs: 1,
            scalar_variant: Some(scalar_variant),
            reversed_scalar_variant: Some(reversed_scalar_variant),
        }
    }

    const fn variadic() -> Self {
        Self {
            num_inputs: None,
            num_outputs: 1,
            scalar_variant: None,
            reversed_scalar_variant: None,
        }
    }
}

const SIGNATURES: &[(&str, OpSignature)] = &[
    ("_plus", OpSignature::binary("_plus_scalar", "_plus_scalar")),
    ("_minus", OpSignature::binary("_minus_scalar", "_rminus_scalar")),
    ("_mul", OpSignature::binary("_mul_scalar", "_mul_scalar")),
    ("_div", OpSignature::binary("_div_scalar", "_rdiv_scalar")),
    ("_plus_scalar", OpSignature::fixed(1)),
    ("_minus_scalar", OpSignature::fixed(1)),
    ("_rminus_scalar", OpSignature::fixed(1)),
    ("_mul_scalar", OpSignature::fixed(1)),
    ("_div_scalar", OpSignature::fixed(1)),
    ("_rdiv_scalar", OpSignature::fixed(1)),
    ("negative", OpSignature::fixed(1)),
    ("abs", OpSignature::fixed(1)),
    ("sqrt", OpSignature::fixed(1)),
    ("square", OpSignature::fixed(1)),
    ("exp", OpSignature::fixed(1)),
    ("sum", OpSignature::fixed(1)),
    ("_copyto", OpSignature::fixed(1)),
    ("_set_value", OpSignature::fixed(0)),
    ("_zeros", OpSignature::fixed(0)),
    ("_ones", OpSignature::fixed(0)),
    ("_full", OpSignature::fixed(0)),
    ("cast_storage", OpSignature::fixed(1)),
];

/// Operators the engine actually exposes, with their known signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorRegistry {
    signatures: BTreeMap<String, OpSignature>,
}

impl OperatorRegistry {
    #[must_use]
    pub fn from_engine(engine: &dyn NativeEngine) -> Self {
        Self::from_names(engine.operator_names())
    }

    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let signatures = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                let signature = SIGNATURES
                    .iter()
                    .find(|(known, _)| *known == name)
                    .map_or_else(OpSignature::variadic, |(_, signature)| *signature);
                (name.to_string(), signature)
            })
            .collect();
        Self { signatures }
    }

    #[must_use]
    pub fn signature(&self, op: &str) -> Option<&OpSignature> {
        self.signatures.get(op)
    }

    #[must_use]
    pub fn contains(&self, op: &str) -> bool {
        self.signatures.contains_key(op)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signatures.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Resolves an invocation to a concrete operator without touching the
    /// engine.
    pub fn resolve(
        &self,
        op: &str,
        operands: &[RawOperand],
        params: &[(String, ParamValue)],
        outputs: &[HandleId],
    ) -> Result<ResolvedCall, DispatchError> {
        let signature = self
            .signature(op)
            .ok_or_else(|| DispatchError::UnknownOperator {
                name: op.to_string(),
            })?;

        if let Some(expected) = signature.num_inputs {
            if operands.len() != expected {
                return Err(DispatchError::ArityMismatch {
                    op: op.to_string(),
                    expected,
                    actual: operands.len(),
                });
            }
        }

        if !outputs.is_empty() && outputs.len() != signature.num_outputs {
            return Err(DispatchError::OutputArity {
                op: op.to_string(),
                expected: signature.num_outputs,
                actual: outputs.len(),
            });
        }

        let mut packed = pack_params(params.iter().map(|(key, value)| (key.as_str(), value)));
        let (resolved, inputs, scalar_lowered, reversed) = match operands {
            [RawOperand::Handle(lhs), RawOperand::Scalar(scalar)] => {
                let variant = signature.scalar_variant.ok_or_else(|| {
                    DispatchError::ScalarNotSupported { op: op.to_string() }
                })?;
                packed.insert("scalar".to_string(), scalar.to_string());
                (variant, vec![*lhs], true, false)
            }
            [RawOperand::Scalar(scalar), RawOperand::Handle(rhs)] => {
                let variant = signature.reversed_scalar_variant.ok_or_else(|| {
                    DispatchError::ScalarNotSupported { op: op.to_string() }
                })?;
                packed.insert("scalar".to_string(), scalar.to_string());
                (variant, vec![*rhs], true, true)
            }
            _ => {
                let inputs = operands
                    .iter()
                    .map(|operand| match operand {
                        RawOperand::Handle(handle) => Ok(*handle),
                        RawOperand::Scalar(_) => {
                            Err(DispatchError::ScalarNotSupported { op: op.to_string() })
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                (op, inputs, false, false)
            }
        };

        if !self.contains(resolved) {
            return Err(DispatchError::UnknownOperator {
                name: resolved.to_string(),
            });
        }

        let decision = DispatchDecision {
            requested: op.to_string(),
            resolved: resolved.to_string(),
            scalar_lowered,
            reversed,
            num_inputs: inputs.len(),
            num_params: packed.len(),
            num_outputs_provided: outputs.len(),
        };
        Ok(ResolvedCall {
            call: OpCall {
                op: resolved.to_string(),
                inputs,
                params: packed,
                outputs: outputs.to_vec(),
            },
            decision,
        })
    }

    pub fn dispatch(
        &self,
        engine: &dyn NativeEngine,
        op: &str,
        operands: &[RawOperand],
        params: &[(String, ParamValue)],
        outputs: &[HandleId],
    ) -> Result<DispatchOutcome, DispatchError> {
        let ResolvedCall { call, decision } = self.resolve(op, operands, params, outputs)?;
        let outputs = engine.invoke(&call)?;
        Ok(DispatchOutcome { outputs, decision })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub call: OpCall,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub requested: String,
    pub resolved: String,
    pub scalar_lowered: bool,
    pub reversed: bool,
    pub num_inputs: usize,
    pub num_params: usize,
    pub num_outputs_provided: usize,
}

impl fmt::Display for DispatchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} scalar_lowered={} reversed={} inputs={} params={} outputs_provided={}",
            self.requested,
            self.resolved,
            self.scalar_lowered,
            self.reversed,
            self.num_inputs,
            self.num_params,
            self.num_outputs_provided
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub outputs: Vec<OpOutput>,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    UnknownOperator {
        name: String,
    },
    ArityMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },
    OutputArity {
        op: String,
        expected: usize,
        actual: usize,
    },
    ScalarNotSupported {
        op: String,
    },
    Engine(EngineError),
}

impl DispatchError {
    /// True when the caller violated the operator's calling convention.
    #[must_use]
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::ArityMismatch { .. } | Self::OutputArity { .. } | Self::ScalarNotSupported { .. }
        )
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperator { name } => write!(f, "operator '{name}' is not registered"),
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => write!(f, "{op}: expected {expected} operand(s), got {actual}"),
            Self::OutputArity {
                op,
                expected,
                actual,
            } => write!(f, "{op}: expected {expected} output holder(s), got {actual}"),
            Self::ScalarNotSupported { op } => {
                write!(f, "{op}: scalar operands are not supported here")
            }
            Self::Engine(error) => write!(f, "engine failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<EngineError> for DispatchError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}
