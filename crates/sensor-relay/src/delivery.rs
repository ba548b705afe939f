// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport-neutral delivery envelope.
//!
//! A [`Delivery`] owns the raw payload, its metadata, and the handle used to
//! settle it with the broker. Settling consumes the delivery, so each one is
//! acknowledged or rejected exactly once.
//!
//! Retry state lives in the metadata under [`ATTEMPTS_KEY`]. A missing key
//! means no forward attempt has failed yet.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::errors::TransportError;

/// Metadata key carrying the number of failed forward attempts so far.
pub const ATTEMPTS_KEY: &str = "x-attempts";

/// Metadata value.
///
/// Mirrors the value model of broker message headers closely enough that a
/// copy published with unchanged metadata is identical on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    Int(i64),
    F32(f32),
    Float(f64),
    Decimal { scale: u8, value: u32 },
    Text(String),
    /// A string header whose bytes are not valid UTF-8.
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    /// Seconds since the Unix epoch.
    Timestamp(u64),
    List(Vec<MetadataValue>),
    Table(Metadata),
    Void,
}

impl MetadataValue {
    /// Integer view of the value. Floats are truncated and strings parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::U8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::U16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::U32(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(*v),
            Self::F32(v) => Some(v.trunc() as i64),
            Self::Float(v) => Some(v.trunc() as i64),
            Self::Text(v) => v.trim().parse().ok(),
            Self::Bytes(v) => std::str::from_utf8(v).ok()?.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Decimal { scale, value } => write!(f, "{value}e-{scale}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Bytes(v) | Self::ByteArray(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Self::Timestamp(v) => write!(f, "{v}"),
            Self::List(_) | Self::Table(_) | Self::Void => write!(f, "{self:?}"),
        }
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Reads the attempt counter. Absent, negative or non-numeric values count as 0.
pub fn attempts(metadata: &Metadata) -> u32 {
    let attempts = metadata
        .get(ATTEMPTS_KEY)
        .and_then(MetadataValue::as_i64)
        .unwrap_or(0);
    u32::try_from(attempts.max(0)).unwrap_or(u32::MAX)
}

/// Returns a copy of `metadata` with the attempt counter set to `attempts`.
pub fn with_attempts(metadata: &Metadata, attempts: u32) -> Metadata {
    let mut metadata = metadata.clone();
    metadata.insert(
        ATTEMPTS_KEY.to_string(),
        MetadataValue::Int(i64::from(attempts)),
    );
    metadata
}

/// Settles a delivery with the broker it came from.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self) -> Result<(), TransportError>;
}

pub struct Delivery {
    payload: Vec<u8>,
    metadata: Metadata,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        metadata: Metadata,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            payload,
            metadata,
            acker: Box::new(acker),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn attempts(&self) -> u32 {
        attempts(&self.metadata)
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<(), TransportError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with(value: MetadataValue) -> Metadata {
        Metadata::from([(ATTEMPTS_KEY.to_string(), value)])
    }

    #[test]
    fn test_attempts_absent_is_zero() {
        assert_eq!(attempts(&Metadata::new()), 0);
    }

    #[test]
    fn test_attempts_value_kinds() {
        assert_eq!(attempts(&metadata_with(MetadataValue::Int(2))), 2);
        assert_eq!(attempts(&metadata_with(MetadataValue::Float(3.9))), 3);
        assert_eq!(attempts(&metadata_with(MetadataValue::Text(" 4 ".into()))), 4);
        assert_eq!(attempts(&metadata_with(MetadataValue::Text("four".into()))), 0);
        assert_eq!(attempts(&metadata_with(MetadataValue::Bool(true))), 0);
        assert_eq!(attempts(&metadata_with(MetadataValue::I32(5))), 5);
        assert_eq!(attempts(&metadata_with(MetadataValue::U8(6))), 6);
        assert_eq!(attempts(&metadata_with(MetadataValue::Bytes(b"7".to_vec()))), 7);
        assert_eq!(
            attempts(&metadata_with(MetadataValue::Bytes(vec![0xff, 0xfe]))),
            0
        );
        assert_eq!(attempts(&metadata_with(MetadataValue::Timestamp(9))), 0);
        assert_eq!(attempts(&metadata_with(MetadataValue::Int(-7))), 0);
        assert_eq!(
            attempts(&metadata_with(MetadataValue::Int(i64::MAX))),
            u32::MAX
        );
    }

    #[test]
    fn test_with_attempts_preserves_other_keys() {
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), MetadataValue::Text("producer".into()));
        metadata.insert(ATTEMPTS_KEY.to_string(), MetadataValue::Text("1".into()));

        let updated = with_attempts(&metadata, 2);

        assert_eq!(updated.get(ATTEMPTS_KEY), Some(&MetadataValue::Int(2)));
        assert_eq!(
            updated.get("source"),
            Some(&MetadataValue::Text("producer".into()))
        );
        // the original is untouched
        assert_eq!(attempts(&metadata), 1);
    }

    #[test]
    fn test_metadata_value_display() {
        assert_eq!(MetadataValue::Int(3).to_string(), "3");
        assert_eq!(MetadataValue::Text("x".into()).to_string(), "x");
        assert_eq!(MetadataValue::Bool(false).to_string(), "false");
        assert_eq!(
            MetadataValue::Decimal {
                scale: 2,
                value: 150
            }
            .to_string(),
            "150e-2"
        );
    }
}
