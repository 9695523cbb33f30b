use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use resource::Resource;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{marker, OptimizationStrategy};
use crate::error::OptimizeError;

pub const COMPRESSION_ENCODING: &str = "gzip+base64";

const COMPRESSIBLE_FIELDS: [&str; 3] = ["configuration", "rules", "dashboards"];

/// Gzips large string fields in `spec` into a self-describing envelope:
/// `{compressed, encoding, data, originalSize, compressedSize}`.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStrategy {
    threshold_bytes: usize,
}

impl CompressionStrategy {
    pub fn new(threshold_bytes: usize) -> Self {
        Self { threshold_bytes }
    }

    fn is_candidate(&self, value: &Value) -> bool {
        value.as_str().is_some_and(|s| s.len() > self.threshold_bytes)
    }
}

impl OptimizationStrategy for CompressionStrategy {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn can_optimize(&self, object: &Resource, _target_version: &str) -> bool {
        object.spec().is_some_and(|spec| {
            COMPRESSIBLE_FIELDS
                .iter()
                .any(|field| spec.get(field).is_some_and(|v| self.is_candidate(v)))
        })
    }

    fn optimize(&self, object: &mut Resource, _target_version: &str) -> Result<(), OptimizeError> {
        let Some(spec) = object.spec_mut() else {
            return Ok(());
        };
        let mut compressed = 0;
        for field in COMPRESSIBLE_FIELDS {
            let Some(text) = spec.get(field).filter(|v| self.is_candidate(v)).and_then(Value::as_str) else {
                continue;
            };
            let original_size = text.len();
            match gzip_base64(text) {
                Ok(data) => {
                    let compressed_size = data.len();
                    spec.insert(
                        field.to_string(),
                        json!({
                            "compressed": true,
                            "encoding": COMPRESSION_ENCODING,
                            "data": data,
                            "originalSize": original_size,
                            "compressedSize": compressed_size,
                        }),
                    );
                    compressed += 1;
                }
                Err(err) => warn!(field, error = %err, "field_compression_failed"),
            }
        }
        if compressed > 0 {
            object.set_annotation(marker("compressed"), compressed.to_string());
        }
        debug!(resource = %object.reference(), compressed, "fields_compressed");
        Ok(())
    }
}

/// Replace every compression envelope in `spec` with the original text and
/// drop the marker annotation. Returns how many fields were inflated.
pub fn inflate_compressed_fields(object: &mut Resource) -> Result<usize, OptimizeError> {
    let Some(spec) = object.spec_mut() else {
        return Ok(0);
    };
    let mut inflated = 0;
    for field in COMPRESSIBLE_FIELDS {
        let Some(envelope) = spec.get(field).filter(|v| is_envelope(v)) else {
            continue;
        };
        let data = envelope
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| OptimizeError::codec(field, "envelope has no data"))?;
        let text = gunzip_base64(data).map_err(|reason| OptimizeError::codec(field, reason))?;
        spec.insert(field.to_string(), Value::String(text));
        inflated += 1;
    }
    if inflated > 0 {
        object.remove_annotation(&marker("compressed"));
    }
    Ok(inflated)
}

fn is_envelope(value: &Value) -> bool {
    value.get("compressed").and_then(Value::as_bool) == Some(true)
        && value.get("encoding").and_then(Value::as_str) == Some(COMPRESSION_ENCODING)
}

fn gzip_base64(text: &str) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

fn gunzip_base64(data: &str) -> Result<String, String> {
    let bytes = STANDARD.decode(data).map_err(|e| e.to_string())?;
    let mut text = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut text)
        .map_err(|e| e.to_string())?;
    Ok(text)
}
