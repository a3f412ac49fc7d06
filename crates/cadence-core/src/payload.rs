//! Audio payload codec — transferable sample buffers.
//!
//! Every numeric series that crosses the broker/dispatcher boundary travels as
//! an [`F32Buffer`]: a `Bytes` handle whose backing store is the original
//! `Vec<f32>`. Building one from a vector moves the allocation, it never
//! copies it. The receiving side reads the same memory back as `&[f32]`
//! through zerocopy, so an audio buffer handed to `run()` is bit-identical
//! (and pointer-identical) when the analyzer sees it.
//!
//! Samples are native-endian. The buffer never leaves the process, so there
//! is no byte-order negotiation.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zerocopy::{AsBytes, FromBytes};

const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("sample buffer length {0} is not a multiple of 4")]
    Misaligned(usize),
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(f32),
}

// ── F32Buffer ─────────────────────────────────────────────────────────────────

/// Owner handed to `Bytes::from_owner`; keeps the vector alive for the
/// lifetime of every `Bytes` view into it.
struct SampleOwner(Vec<f32>);

impl AsRef<[u8]> for SampleOwner {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice().as_bytes()
    }
}

/// Immutable, cheaply cloneable `f32` series in transferable form.
///
/// Invariant: `bytes` is 4-byte aligned and its length is a multiple of 4,
/// so [`as_slice`](Self::as_slice) is always a zero-copy view.
#[derive(Clone, Default)]
pub struct F32Buffer {
    bytes: Bytes,
}

impl F32Buffer {
    /// Take ownership of `samples` without copying them.
    pub fn from_vec(samples: Vec<f32>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        Self {
            bytes: Bytes::from_owner(SampleOwner(samples)),
        }
    }

    /// Reconstruct a buffer from raw bytes.
    ///
    /// Aligned input is adopted as-is. Unaligned input (e.g. a slice out of a
    /// larger network or file buffer) is copied once into an aligned vector.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, CodecError> {
        if bytes.len() % SAMPLE_SIZE != 0 {
            return Err(CodecError::Misaligned(bytes.len()));
        }
        if bytes.is_empty() || f32::slice_from(&bytes).is_some() {
            return Ok(Self { bytes });
        }
        let samples = bytes
            .chunks_exact(SAMPLE_SIZE)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::from_vec(samples))
    }

    /// Typed view over the backing store.
    pub fn as_slice(&self) -> &[f32] {
        f32::slice_from(&self.bytes).unwrap_or_default()
    }

    /// The underlying bytes (shares the allocation).
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / SAMPLE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the first sample. Used to verify that a transfer moved the
    /// allocation instead of copying it.
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

impl From<Vec<f32>> for F32Buffer {
    fn from(samples: Vec<f32>) -> Self {
        Self::from_vec(samples)
    }
}

impl PartialEq for F32Buffer {
    /// Bitwise comparison, so NaN payloads compare equal to themselves.
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for F32Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("F32Buffer").field("len", &self.len()).finish()
    }
}

impl Serialize for F32Buffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.as_slice())
    }
}

impl<'de> Deserialize<'de> for F32Buffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<f32>::deserialize(deserializer).map(Self::from_vec)
    }
}

// ── Audio payload ─────────────────────────────────────────────────────────────

/// Mono audio handed to an analysis job.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    sample_rate: f32,
    mono: F32Buffer,
}

impl AudioPayload {
    pub fn new(sample_rate: f32, mono: impl Into<F32Buffer>) -> Result<Self, CodecError> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(CodecError::InvalidSampleRate(sample_rate));
        }
        Ok(Self {
            sample_rate,
            mono: mono.into(),
        })
    }

    /// Build a payload from raw native-endian `f32` bytes.
    pub fn from_bytes(sample_rate: f32, mono: Bytes) -> Result<Self, CodecError> {
        Self::new(sample_rate, F32Buffer::from_bytes(mono)?)
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        self.mono.as_slice()
    }

    pub fn buffer(&self) -> &F32Buffer {
        &self.mono
    }

    pub fn frames(&self) -> usize {
        self.mono.len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Consume the payload into its wire form. The caller keeps nothing.
    pub fn into_transfer(self) -> TransferAudio {
        TransferAudio {
            sample_rate: self.sample_rate,
            mono: self.mono.into_bytes(),
        }
    }
}

/// Wire form of [`AudioPayload`]: unvalidated sample rate plus raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAudio {
    pub sample_rate: f32,
    #[serde(with = "raw_samples")]
    pub mono: Bytes,
}

impl TransferAudio {
    /// Rebuild the typed payload on the receiving side.
    pub fn reconstruct(self) -> Result<AudioPayload, CodecError> {
        AudioPayload::from_bytes(self.sample_rate, self.mono)
    }

    pub fn byte_len(&self) -> usize {
        self.mono.len()
    }
}

/// Serializes raw sample bytes as a numeric sequence so diagnostics dumps
/// show samples rather than opaque bytes.
mod raw_samples {
    use bytes::Bytes;
    use serde::{Deserializer, Serialize, Serializer};

    use super::F32Buffer;

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        match F32Buffer::from_bytes(bytes.clone()) {
            Ok(buf) => buf.serialize(serializer),
            Err(e) => Err(serde::ser::Error::custom(e)),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let buf: F32Buffer = serde::Deserialize::deserialize(deserializer)?;
        Ok(buf.into_bytes())
    }
}
