#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use nd_core::{Context, DType, Shape, StorageType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ARCHIVE_SCHEMA_VERSION: u32 = 1;
pub const RAW_ARRAY_SCHEMA_VERSION: u32 = 1;
const MAX_PAYLOAD_BYTES: usize = 64 * 1_048_576;

/// One array's metadata and values. Values are stored as IEEE-754 bit
/// patterns so NaN and infinities survive the JSON envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArrayPayload {
    pub shape: Shape,
    pub dtype: DType,
    pub storage_type: StorageType,
    pub context: Context,
    pub value_bits: Vec<u64>,
}

impl ArrayPayload {
    #[must_use]
    pub fn new(
        shape: Shape,
        dtype: DType,
        storage_type: StorageType,
        context: Context,
        values: &[f64],
    ) -> Self {
        Self {
            shape,
            dtype,
            storage_type,
            context,
            value_bits: values.iter().map(|value| value.to_bits()).collect(),
        }
    }

    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.value_bits
            .iter()
            .copied()
            .map(f64::from_bits)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    Strict,
    Hardened,
}

impl FromStr for DecodeMode {
    type Err = SerializeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "hardened" => Ok(Self::Hardened),
            other => Err(SerializeError::IncompatiblePayload {
                reason: format!("unknown decode mode '{other}'"),
            }),
        }
    }
}

/// Named-file container: an ordered array list plus an optional, equally
/// long name list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveEnvelope {
    pub schema_version: u32,
    pub names: Vec<String>,
    pub arrays: Vec<ArrayPayload>,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawArrayEnvelope {
    pub schema_version: u32,
    pub array: ArrayPayload,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
    NameCountMismatch { names: usize, arrays: usize },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
            Self::NameCountMismatch { names, arrays } => write!(
                f,
                "name/array count mismatch: names={names} arrays={arrays}"
            ),
        }
    }
}

impl std::error::Error for SerializeError {}

pub fn encode_archive(names: &[String], arrays: &[ArrayPayload]) -> Result<String, SerializeError> {
    ensure_name_count(names.len(), arrays.len())?;
    for array in arrays {
        validate_payload(array)?;
    }

    let envelope = ArchiveEnvelope {
        schema_version: ARCHIVE_SCHEMA_VERSION,
        names: names.to_vec(),
        arrays: arrays.to_vec(),
        source_hash: archive_hash(ARCHIVE_SCHEMA_VERSION, names, arrays),
    };

    serde_json::to_string(&envelope).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("archive encoding failed: {error}"),
    })
}

pub fn decode_archive(input: &str, mode: DecodeMode) -> Result<ArchiveEnvelope, SerializeError> {
    validate_payload_size(input)?;
    let envelope: ArchiveEnvelope = match mode {
        DecodeMode::Strict => decode_strict(input)?,
        DecodeMode::Hardened => decode_hardened(
            input,
            &["schema_version", "names", "arrays", "source_hash"],
        )?,
    };

    ensure_schema_version(ARCHIVE_SCHEMA_VERSION, envelope.schema_version)?;
    ensure_name_count(envelope.names.len(), envelope.arrays.len())?;
    for array in &envelope.arrays {
        validate_payload(array)?;
    }
    let expected = archive_hash(
        envelope.schema_version,
        &envelope.names,
        &envelope.arrays,
    );
    ensure_hash(expected, &envelope.source_hash)?;
    Ok(envelope)
}

pub fn encode_raw_array(array: &ArrayPayload) -> Result<Vec<u8>, SerializeError> {
    validate_payload(array)?;
    let envelope = RawArrayEnvelope {
        schema_version: RAW_ARRAY_SCHEMA_VERSION,
        array: array.clone(),
        source_hash: raw_hash(RAW_ARRAY_SCHEMA_VERSION, array),
    };
    serde_json::to_vec(&envelope).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("raw array encoding failed: {error}"),
    })
}

pub fn decode_raw_array(bytes: &[u8], mode: DecodeMode) -> Result<ArrayPayload, SerializeError> {
    let input = std::str::from_utf8(bytes).map_err(|error| SerializeError::InvalidJson {
        diagnostic: format!("payload is not utf-8: {error}"),
    })?;
    validate_payload_size(input)?;
    let envelope: RawArrayEnvelope = match mode {
        DecodeMode::Strict => decode_strict(input)?,
        DecodeMode::Hardened => {
            decode_hardened(input, &["schema_version", "array", "source_hash"])?
        }
    };

    ensure_schema_version(RAW_ARRAY_SCHEMA_VERSION, envelope.schema_version)?;
    validate_payload(&envelope.array)?;
    ensure_hash(
        raw_hash(envelope.schema_version, &envelope.array),
        &envelope.source_hash,
    )?;
    Ok(envelope.array)
}

fn decode_strict<T>(input: &str) -> Result<T, SerializeError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn decode_hardened<T>(input: &str, allowed_keys: &[&str]) -> Result<T, SerializeError>
where
    T: for<'de> Deserialize<'de>,
{
    let raw: Value = serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
        diagnostic: bounded(
            format!(
                "{error}; payload_prefix={} ",
                bounded(input.replace('\n', " ").as_str(), 96)
            )
            .as_str(),
            220,
        ),
    })?;

    let obj = raw
        .as_object()
        .ok_or_else(|| SerializeError::IncompatiblePayload {
            reason: "top-level payload must be a JSON object".to_string(),
        })?;

    let allowed: BTreeSet<&str> = allowed_keys.iter().copied().collect();
    for key in obj.keys() {
        if !allowed.contains(key.as_str()) {
            return Err(SerializeError::UnknownField { field: key.clone() });
        }
    }

    serde_json::from_value(raw).map_err(|error| SerializeError::IncompatiblePayload {
        reason: bounded(error.to_string().as_str(), 200),
    })
}

fn validate_payload_size(input: &str) -> Result<(), SerializeError> {
    let actual = input.len();
    if actual > MAX_PAYLOAD_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!("payload exceeds max bytes: actual={actual} max={MAX_PAYLOAD_BYTES}"),
        });
    }
    Ok(())
}

fn validate_payload(array: &ArrayPayload) -> Result<(), SerializeError> {
    let numel = array
        .shape
        .checked_numel()
        .map_err(|error| SerializeError::IncompatiblePayload {
            reason: error.to_string(),
        })?;
    if numel != array.value_bits.len() {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "shape {} holds {numel} elements but payload carries {}",
                array.shape,
                array.value_bits.len()
            ),
        });
    }
    Ok(())
}

fn ensure_name_count(names: usize, arrays: usize) -> Result<(), SerializeError> {
    if names != 0 && names != arrays {
        return Err(SerializeError::NameCountMismatch { names, arrays });
    }
    Ok(())
}

fn ensure_schema_version(expected: u32, found: u32) -> Result<(), SerializeError> {
    if expected != found {
        return Err(SerializeError::VersionMismatch { expected, found });
    }
    Ok(())
}

fn ensure_hash(expected: String, found: &str) -> Result<(), SerializeError> {
    if expected != found {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: found.to_string(),
        });
    }
    Ok(())
}

/// FNV-1a over a byte stream; stable across processes and platforms.
#[derive(Debug, Clone, Copy)]
struct Det64(u64);

impl Det64 {
    fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    fn write_str(&mut self, value: &str) {
        self.write_u64(value.len() as u64);
        self.write(value.as_bytes());
    }

    fn write_payload(&mut self, array: &ArrayPayload) {
        self.write_u64(array.shape.rank() as u64);
        for dim in array.shape.dims() {
            self.write_u64(*dim as u64);
        }
        self.write_u64(array.dtype.native_tag() as u64);
        self.write_u64(array.storage_type.native_tag() as u64);
        self.write_str(&array.context.to_string());
        for bits in &array.value_bits {
            self.write_u64(*bits);
        }
    }

    fn finish(self) -> String {
        format!("det64:{:016x}", self.0)
    }
}

fn archive_hash(schema_version: u32, names: &[String], arrays: &[ArrayPayload]) -> String {
    let mut hasher = Det64::new();
    hasher.write_u64(u64::from(schema_version));
    hasher.write_u64(names.len() as u64);
    for name in names {
        hasher.write_str(name);
    }
    hasher.write_u64(arrays.len() as u64);
    for array in arrays {
        hasher.write_payload(array);
    }
    hasher.finish()
}

fn raw_hash(schema_version: u32, array: &ArrayPayload) -> String {
    let mut hasher = Det64::new();
    hasher.write_u64(u64::from(schema_version));
    hasher.write_payload(array);
    hasher.finish()
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}

#[cfg(test)]
mod tests {
    use nd_core::{Context, DType, Shape, StorageType};
    use proptest::prelude::*;
    use serde_json::json;

    use super::{
        ArrayPayload, DecodeMode, SerializeError, decode_archive, decode_raw_array,
        encode_archive, encode_raw_array,
    };

    fn payload(values: &[f64], dims: &[usize]) -> ArrayPayload {
        ArrayPayload::new(
            Shape::new(dims.to_vec()),
            DType::F64,
            StorageType::Default,
            Context::cpu(0),
            values,
        )
    }

    #[test]
    fn archive_round_trip_preserves_order_and_names() {
        let arrays = vec![payload(&[1.0, 2.0], &[2]), payload(&[3.0], &[1])];
        let names = vec!["weight".to_string(), "bias".to_string()];
        let encoded = encode_archive(&names, &arrays).expect("encode should work");

        for mode in [DecodeMode::Strict, DecodeMode::Hardened] {
            let decoded = decode_archive(&encoded, mode).expect("decode should work");
            assert_eq!(decoded.names, names);
            assert_eq!(decoded.arrays, arrays);
        }
    }

    #[test]
    fn archive_without_names_is_accepted() {
        let arrays = vec![payload(&[1.0], &[1])];
        let encoded = encode_archive(&[], &arrays).expect("unnamed encode should work");
        let decoded = decode_archive(&encoded, DecodeMode::Strict).expect("decode");
        assert!(decoded.names.is_empty());
        assert_eq!(decoded.arrays.len(), 1);
    }

    #[test]
    fn name_count_mismatch_fails_on_encode() {
        let arrays = vec![payload(&[1.0], &[1]), payload(&[2.0], &[1])];
        let err = encode_archive(&["only".to_string()], &arrays).expect_err("must fail");
        assert_eq!(err, SerializeError::NameCountMismatch { names: 1, arrays: 2 });
    }

    #[test]
    fn name_count_mismatch_fails_on_decode() {
        let arrays = vec![payload(&[1.0], &[1])];
        let encoded = encode_archive(&["a".to_string()], &arrays).expect("encode");
        let mut value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        value["names"] = json!(["a", "b"]);

        let err = decode_archive(value.to_string().as_str(), DecodeMode::Strict)
            .expect_err("mismatch must fail");
        assert!(matches!(err, SerializeError::NameCountMismatch { names: 2, arrays: 1 }));
    }

    #[test]
    fn strict_unknown_field_fail_closed() {
        let payload = json!({
            "schema_version": 1,
            "names": [],
            "arrays": [],
            "source_hash": "det64:0000000000000000",
            "extra": "boom"
        })
        .to_string();

        let err = decode_archive(&payload, DecodeMode::Strict).expect_err("must fail");
        assert!(err.to_string().contains("unknown field"));
        let err = decode_archive(&payload, DecodeMode::Hardened).expect_err("must fail");
        assert_eq!(
            err,
            SerializeError::UnknownField {
                field: "extra".to_string()
            }
        );
    }

    #[test]
    fn hardened_malformed_payload_returns_bounded_diagnostic() {
        let err = decode_archive("{ not json", DecodeMode::Hardened).expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("invalid json"));
        assert!(msg.len() < 320);
    }

    #[test]
    fn checksum_mismatch_is_fail_closed() {
        let encoded = encode_archive(&[], &[payload(&[1.0], &[1])]).expect("encode");
        let mut value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        value["source_hash"] = json!("det64:deadbeefdeadbeef");

        let err = decode_archive(value.to_string().as_str(), DecodeMode::Strict)
            .expect_err("checksum mismatch should fail");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn version_mismatch_is_fail_closed() {
        let encoded = encode_archive(&[], &[]).expect("encode");
        let mut value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        value["schema_version"] = json!(9);

        let err = decode_archive(value.to_string().as_str(), DecodeMode::Strict)
            .expect_err("version mismatch should fail");
        assert_eq!(err, SerializeError::VersionMismatch { expected: 1, found: 9 });
    }

    #[test]
    fn payload_with_wrong_value_count_is_rejected() {
        let bad = payload(&[1.0, 2.0, 3.0], &[2]);
        let err = encode_raw_array(&bad).expect_err("must fail");
        assert!(err.to_string().contains("holds 2 elements"));
    }

    #[test]
    fn raw_array_preserves_non_finite_values() {
        let array = payload(&[f64::NAN, f64::INFINITY, -0.0], &[3]);
        let bytes = encode_raw_array(&array).expect("encode raw");
        let decoded = decode_raw_array(&bytes, DecodeMode::Strict).expect("decode raw");
        let values = decoded.values();
        assert!(values[0].is_nan());
        assert_eq!(values[1], f64::INFINITY);
        assert!(values[2].is_sign_negative());
    }

    #[test]
    fn raw_array_rejects_non_utf8() {
        let err = decode_raw_array(&[0xff, 0xfe], DecodeMode::Strict).expect_err("must fail");
        assert!(matches!(err, SerializeError::InvalidJson { .. }));
    }

    #[test]
    fn oversized_payload_is_fail_closed() {
        let input = "x".repeat(super::MAX_PAYLOAD_BYTES + 1);
        let err = decode_archive(&input, DecodeMode::Strict).expect_err("must fail");
        assert!(err.to_string().contains("exceeds max bytes"));
    }

    #[test]
    fn decode_mode_parses_names() {
        assert_eq!("strict".parse::<DecodeMode>(), Ok(DecodeMode::Strict));
        assert_eq!("hardened".parse::<DecodeMode>(), Ok(DecodeMode::Hardened));
        assert!("lenient".parse::<DecodeMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_tampered_value_breaks_checksum(
            values in prop::collection::vec(-1_000.0f64..1_000.0f64, 1..=16),
            flip in any::<usize>(),
        ) {
            let array = payload(&values, &[values.len()]);
            let bytes = encode_raw_array(&array).expect("encode raw");
            let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

            let index = flip % values.len();
            let original = envelope["array"]["value_bits"][index].as_u64().expect("bits");
            envelope["array"]["value_bits"][index] = json!(original ^ 1);

            let err = decode_raw_array(envelope.to_string().as_bytes(), DecodeMode::Strict)
                .expect_err("tampered payload must fail");
            let is_checksum_mismatch = matches!(err, SerializeError::ChecksumMismatch { .. });
            prop_assert!(is_checksum_mismatch);
        }
    }
}
