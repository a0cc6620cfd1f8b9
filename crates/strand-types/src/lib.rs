//! Shared types and identifiers for Strand.
//!
//! This crate defines the core types used across the Strand workspace:
//! identifiers ([`RequestId`], [`NodeRef`], [`SegmentIdent`]), the
//! metadata record ([`ContentPointer`]), the durable handoff record
//! ([`HandoffHint`]), wire-level result codes ([`ResultCode`]), and the
//! adler32+md5 [`Checksum`] pair carried by every archived segment.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use adler32::RollingAdler32;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Tenant/account identifier scoping all keys.
pub type AvatarId = u32;

/// Milliseconds since the Unix epoch. Participates in last-writer-wins
/// ordering at the metadata store.
pub type Timestamp = u64;

/// Version counter for a stored key. Bumped by the writer on overwrite.
pub type VersionNumber = u32;

/// 1-based slot identifying which erasure-coded share of an object.
pub type SegmentNumber = u8;

/// Default payload slice size for streaming transfers: 120 KiB.
pub const DEFAULT_SLICE_SIZE: usize = 120 * 1024;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// 128-bit identifier for one logical request or transfer.
///
/// Serialized as a 32-character hex string on the wire. One request id
/// denotes exactly one logical streaming transfer; reuse while a session
/// is open is rejected by the receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; 16]);

impl RequestId {
    /// Generate a fresh random request id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Return the raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for RequestId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

impl FromStr for RequestId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(format!("request id must be 32 hex chars, got {}", s.len()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|e| e.to_string())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// Logical identity of a storage destination.
///
/// Equality is exchange-name based; the transport layer maps the exchange
/// name to a concrete network address. Coordinators hold clones, never
/// ownership of liveness state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Exchange name identifying the storage node for one segment slot.
    pub exchange: String,
}

impl NodeRef {
    /// Create a node reference from an exchange name.
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.exchange)
    }
}

/// The addressing tuple every segment operation carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentIdent {
    /// Tenant scoping the key.
    pub avatar_id: AvatarId,
    /// Object key.
    pub key: String,
    /// Version of the object this segment belongs to.
    pub version_number: VersionNumber,
    /// Which erasure share (1..=N).
    pub segment_number: SegmentNumber,
}

impl fmt::Display for SegmentIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} v{} s{}",
            self.avatar_id, self.key, self.version_number, self.segment_number
        )
    }
}

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Outcome code carried by every reply. `Success` encodes as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Operation succeeded.
    Success,
    /// Write rejected: stored timestamp is not older, or the request id
    /// is already bound to an open session.
    InvalidDuplicate,
    /// Destroy rejected: the stored entry is strictly newer.
    TooOld,
    /// Streaming slice arrived with an unexpected sequence number.
    OutOfSequence,
    /// No such key/segment.
    NotFound,
    /// Unclassified server-side failure; see `error_message`.
    Internal,
}

impl ResultCode {
    /// Whether this code denotes success.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Success => "success",
            ResultCode::InvalidDuplicate => "error_invalid_duplicate",
            ResultCode::TooOld => "error_too_old",
            ResultCode::OutOfSequence => "error_out_of_sequence",
            ResultCode::NotFound => "not_found",
            ResultCode::Internal => "error_internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// The adler32 + md5 pair carried on the wire for both whole files and
/// individual segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// Rolling adler32 of the content.
    pub adler32: u32,
    /// md5 digest of the content.
    pub md5: [u8; 16],
}

impl Checksum {
    /// Compute both checksums over a complete buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut acc = ChecksumAccumulator::new();
        acc.update(data);
        acc.finish()
    }
}

/// Incremental adler32 + md5 accumulation for streaming sessions.
///
/// One accumulator lives per in-flight transfer, keyed by request id,
/// and is fed one slice at a time.
#[derive(Clone)]
pub struct ChecksumAccumulator {
    adler: RollingAdler32,
    md5: Md5,
}

impl ChecksumAccumulator {
    /// Start a fresh accumulation.
    pub fn new() -> Self {
        Self {
            adler: RollingAdler32::new(),
            md5: Md5::new(),
        }
    }

    /// Feed one slice of content.
    pub fn update(&mut self, data: &[u8]) {
        self.adler.update_buffer(data);
        self.md5.update(data);
    }

    /// Consume the accumulator and produce the final pair.
    pub fn finish(self) -> Checksum {
        Checksum {
            adler32: self.adler.hash(),
            md5: self.md5.finalize().into(),
        }
    }
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChecksumAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumAccumulator").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Metadata records
// ---------------------------------------------------------------------------

/// Per-segment, per-key metadata record owned by the metadata store.
///
/// A write whose `timestamp` is not newer than the stored value is
/// rejected; a tombstone sets `is_tombstone` and zeroes both sizes while
/// its timestamp still participates in ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPointer {
    /// Write time; last-writer-wins ordering key.
    pub timestamp: Timestamp,
    /// Whether this entry marks a deletion.
    pub is_tombstone: bool,
    /// Which erasure share this record describes.
    pub segment_number: SegmentNumber,
    /// Bytes stored for this segment.
    pub segment_size: u64,
    /// Bytes of the whole original object.
    pub total_size: u64,
    /// Checksums of the whole original object.
    pub file_checksum: Checksum,
    /// Checksums of this segment's bytes.
    pub segment_checksum: Checksum,
    /// Version of the object this record belongs to.
    pub version_number: VersionNumber,
}

impl ContentPointer {
    /// Build a tombstone record for the given segment at `timestamp`.
    pub fn tombstone(
        timestamp: Timestamp,
        segment_number: SegmentNumber,
        version_number: VersionNumber,
    ) -> Self {
        let zero = Checksum { adler32: 0, md5: [0u8; 16] };
        Self {
            timestamp,
            is_tombstone: true,
            segment_number,
            segment_size: 0,
            total_size: 0,
            file_checksum: zero,
            segment_checksum: zero,
            version_number,
        }
    }
}

/// The subset of a [`ContentPointer`] a stat query reports: whole-file
/// facts only, independent of which segment answered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatRecord {
    /// Write time of the stored object.
    pub timestamp: Timestamp,
    /// Bytes of the whole original object.
    pub total_size: u64,
    /// Whole-file checksums.
    pub file_checksum: Checksum,
    /// Stored version.
    pub version_number: VersionNumber,
}

// ---------------------------------------------------------------------------
// Handoff hints
// ---------------------------------------------------------------------------

/// Durable record of a segment owed to a down destination.
///
/// At most one row exists per full tuple; duplicate inserts are no-ops.
/// A hint is deleted only after its replay succeeded and the stand-in's
/// local copy was purged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandoffHint {
    /// When the original write happened.
    pub timestamp: Timestamp,
    /// Exchange name of the destination the segment is owed to.
    pub destination_exchange: String,
    /// Tenant scoping the key.
    pub avatar_id: AvatarId,
    /// Object key.
    pub key: String,
    /// Version of the owed write.
    pub version_number: VersionNumber,
    /// Which erasure share is owed.
    pub segment_number: SegmentNumber,
}

impl HandoffHint {
    /// The segment addressing tuple this hint refers to.
    pub fn ident(&self) -> SegmentIdent {
        SegmentIdent {
            avatar_id: self.avatar_id,
            key: self.key.clone(),
            version_number: self.version_number,
            segment_number: self.segment_number,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
