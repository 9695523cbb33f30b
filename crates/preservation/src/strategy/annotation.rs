use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use resource::Resource;
use serde_json::Value;

use super::{expect_type, StrategyType};
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

pub type CipherFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Caller-supplied encrypt/decrypt pair.
#[derive(Clone)]
pub struct Cipher {
    encrypt: CipherFn,
    decrypt: CipherFn,
}

impl Cipher {
    pub fn new<E, D>(encrypt: E, decrypt: D) -> Self
    where
        E: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        Self {
            encrypt: Arc::new(encrypt),
            decrypt: Arc::new(decrypt),
        }
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(..)")
    }
}

/// Side-channel preservation: the value is written as an annotation on the
/// object itself under `<base>/<lowercased-path-with-dashes>`.
///
/// Encoding: JSON, then zstd when the JSON exceeds `compression_threshold`,
/// then the cipher when configured. Binary output is base64-encoded.
#[derive(Debug, Clone)]
pub struct AnnotationStrategy {
    base: String,
    compression_threshold: Option<usize>,
    compression_level: i32,
    cipher: Option<Cipher>,
}

const KEY_META: &str = "annotationKey";
const COMPRESSED_META: &str = "compressed";
const ENCRYPTED_META: &str = "encrypted";

impl AnnotationStrategy {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            compression_threshold: None,
            compression_level: 3,
            cipher: None,
        }
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    pub fn with_cipher(mut self, cipher: Cipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// `Spec.LargeConfig` -> `<base>/spec-largeconfig`.
    pub fn annotation_key(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.to_lowercase().replace('.', "-"))
    }

    pub(crate) fn apply(
        &self,
        object: &mut Resource,
        field: &FieldDescriptor,
    ) -> Result<PreservedField, PreservationError> {
        let mut bytes = serde_json::to_vec(&field.value)?;
        let compressed = self
            .compression_threshold
            .is_some_and(|threshold| bytes.len() > threshold);
        if compressed {
            bytes = zstd::encode_all(bytes.as_slice(), self.compression_level)
                .map_err(|e| PreservationError::Codec(format!("zstd encode: {e}")))?;
        }
        if let Some(cipher) = &self.cipher {
            bytes = (cipher.encrypt)(&bytes)
                .map_err(|e| PreservationError::Codec(format!("encrypt: {e}")))?;
        }

        let encoded = if compressed || self.cipher.is_some() {
            STANDARD.encode(&bytes)
        } else {
            String::from_utf8(bytes).map_err(|e| PreservationError::Codec(e.to_string()))?
        };

        let key = self.annotation_key(&field.path);
        object.set_annotation(key.clone(), encoded);

        Ok(PreservedField::new(field, field.value.clone(), StrategyType::Annotation)
            .with_metadata(KEY_META, Value::String(key))
            .with_metadata(COMPRESSED_META, Value::Bool(compressed))
            .with_metadata(ENCRYPTED_META, Value::Bool(self.cipher.is_some())))
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        expect_type(preserved, StrategyType::Annotation)?;
        let key = preserved
            .metadata_str(KEY_META)
            .map(str::to_string)
            .unwrap_or_else(|| self.annotation_key(preserved.path()));
        let flag = |name: &str| preserved.metadata.get(name).and_then(Value::as_bool).unwrap_or(false);
        let compressed = flag(COMPRESSED_META);
        let encrypted = flag(ENCRYPTED_META);

        let raw = object
            .annotation(&key)
            .ok_or_else(|| PreservationError::MissingAnnotation(key.clone()))?;

        let mut bytes = if compressed || encrypted {
            STANDARD
                .decode(raw)
                .map_err(|e| PreservationError::Codec(format!("base64 decode: {e}")))?
        } else {
            raw.as_bytes().to_vec()
        };
        if encrypted {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                PreservationError::InvalidConfiguration(format!(
                    "annotation `{key}` is encrypted but no cipher is configured"
                ))
            })?;
            bytes = (cipher.decrypt)(&bytes)
                .map_err(|e| PreservationError::Codec(format!("decrypt: {e}")))?;
        }
        if compressed {
            bytes = zstd::decode_all(bytes.as_slice())
                .map_err(|e| PreservationError::Codec(format!("zstd decode: {e}")))?;
        }
        let value: Value = serde_json::from_slice(&bytes)?;

        if !preserved.verify(&value) {
            return Err(PreservationError::RestoreValidationFailed {
                path: preserved.path().to_string(),
                reason: format!("annotation `{key}` does not match the preserved checksum"),
            });
        }

        object.set_field(preserved.path(), value)?;
        object.remove_annotation(&key);
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        let base = self.base.trim();
        if base.is_empty() || base.ends_with('/') || base.contains(char::is_whitespace) {
            return Err(PreservationError::InvalidConfiguration(format!(
                "annotation base `{}` must be a non-empty key prefix without whitespace or trailing `/`",
                self.base
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object() -> Resource {
        Resource::new("example.io/v1alpha1", "Widget", "default", "w")
    }

    fn xor_cipher() -> Cipher {
        fn flip(bytes: &[u8]) -> Result<Vec<u8>, String> {
            Ok(bytes.iter().map(|b| b ^ 0x5a).collect())
        }
        Cipher::new(flip, flip)
    }

    #[test]
    fn derives_annotation_key_from_path() {
        let strategy = AnnotationStrategy::new("base");
        assert_eq!(strategy.annotation_key("Spec.LargeConfig"), "base/spec-largeconfig");
    }

    #[test]
    fn plain_round_trip_leaves_no_residue() {
        let strategy = AnnotationStrategy::new("base");
        let mut target = object();
        let value = json!({"k": "v"});
        let preserved = strategy
            .apply(&mut target, &FieldDescriptor::new("Spec.Extra", value.clone()))
            .unwrap();
        assert_eq!(target.annotation("base/spec-extra"), Some(r#"{"k":"v"}"#));

        strategy.restore(&mut target, &preserved).unwrap();
        assert_eq!(target.get_field("Spec.Extra").unwrap(), Some(&value));
        assert_eq!(target.annotations().count(), 0);
    }

    #[test]
    fn compressed_and_encrypted_round_trip() {
        let strategy = AnnotationStrategy::new("base")
            .with_compression_threshold(16)
            .with_cipher(xor_cipher());
        let value = Value::String("x".repeat(400));
        let mut target = object();
        let preserved = strategy
            .apply(&mut target, &FieldDescriptor::new("Spec.LargeConfig", value.clone()))
            .unwrap();
        assert_eq!(preserved.metadata[COMPRESSED_META], json!(true));
        let stored = target.annotation("base/spec-largeconfig").unwrap();
        assert!(stored.len() < 400);

        strategy.restore(&mut target, &preserved).unwrap();
        assert_eq!(target.get_field("Spec.LargeConfig").unwrap(), Some(&value));
        assert!(target.annotation("base/spec-largeconfig").is_none());
    }

    #[test]
    fn missing_annotation_fails_restore() {
        let strategy = AnnotationStrategy::new("base");
        let mut target = object();
        let preserved = strategy
            .apply(&mut target, &FieldDescriptor::new("Spec.A", json!(1)))
            .unwrap();
        let mut fresh = object();
        assert_eq!(
            strategy.restore(&mut fresh, &preserved).unwrap_err(),
            PreservationError::MissingAnnotation("base/spec-a".into())
        );
    }

    #[test]
    fn tampered_annotation_fails_checksum() {
        let strategy = AnnotationStrategy::new("base");
        let mut target = object();
        let preserved = strategy
            .apply(&mut target, &FieldDescriptor::new("Spec.A", json!(1)))
            .unwrap();
        target.set_annotation("base/spec-a", "2");
        let err = strategy.restore(&mut target, &preserved).unwrap_err();
        assert!(matches!(err, PreservationError::RestoreValidationFailed { .. }));
        assert!(target.annotation("base/spec-a").is_some());
    }

    #[test]
    fn base_must_be_a_key_prefix() {
        assert!(AnnotationStrategy::new("").validate().is_err());
        assert!(AnnotationStrategy::new("a b").validate().is_err());
        assert!(AnnotationStrategy::new("example.io/").validate().is_err());
        assert!(AnnotationStrategy::new("example.io/preserved").validate().is_ok());
    }
}
