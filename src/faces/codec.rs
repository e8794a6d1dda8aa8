//! Binary encoding of a face index snapshot.
//!
//! Blob layout (`faces.bin`):
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the extractor model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated `entry_count` times):
//! - identifier_len: u16 (little-endian), identifier: UTF-8
//! - source_key_len: u16 (little-endian), source_key: UTF-8
//! - vector: [f32; dimensions] (little-endian)
//!
//! Trailer:
//! - body_checksum: u32 (CRC32 of all entry bytes)
//!
//! Encoding is deterministic: the same snapshot always yields the same bytes.

use crate::faces::snapshot::{IndexEntry, Snapshot};
use crate::faces::vector::FeatureVector;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Trailer size in bytes
const TRAILER_SIZE: usize = 4;

/// Errors that can occur while encoding or decoding a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unexpected end of data while reading {0}")]
    Truncated(&'static str),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Header checksum mismatch: file may be corrupted")]
    HeaderChecksumMismatch,

    #[error("Body checksum mismatch: file may be corrupted")]
    BodyChecksumMismatch,

    #[error("Model mismatch: index was built with a different extractor model")]
    ModelMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl CodecError {
    /// Whether this error means the blob itself is damaged, as opposed to
    /// being a valid index for a different model.
    pub fn is_corruption(&self) -> bool {
        !matches!(
            self,
            CodecError::ModelMismatch | CodecError::DimensionMismatch { .. }
        )
    }
}

/// Decoded header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub model_id: [u8; 32],
    pub dimensions: u16,
    pub entry_count: u64,
}

/// Encode a snapshot tagged with `model_id`.
pub fn encode(snapshot: &Snapshot, model_id: &[u8; 32]) -> Result<Vec<u8>, CodecError> {
    let dimensions = u16::try_from(snapshot.dimensions()).map_err(|_| {
        CodecError::InvalidFormat(format!(
            "dimensions {} do not fit the format",
            snapshot.dimensions()
        ))
    })?;

    let mut body = Vec::new();
    for entry in snapshot.entries() {
        write_entry(&mut body, entry, snapshot.dimensions())?;
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + TRAILER_SIZE);
    let header = Header {
        version: FORMAT_VERSION,
        model_id: *model_id,
        dimensions,
        entry_count: snapshot.len() as u64,
    };
    write_header(&mut out, &header);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

    Ok(out)
}

/// Decode a blob, checking it belongs to `expected_model_id` with
/// `expected_dimensions`-long vectors.
pub fn decode(
    data: &[u8],
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<Snapshot, CodecError> {
    let header = read_header(data)?;

    if header.model_id != *expected_model_id {
        return Err(CodecError::ModelMismatch);
    }
    if header.dimensions as usize != expected_dimensions {
        return Err(CodecError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    if data.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(CodecError::Truncated("trailer"));
    }
    let body = &data[HEADER_SIZE..data.len() - TRAILER_SIZE];
    let stored_body_checksum = u32::from_le_bytes(
        data[data.len() - TRAILER_SIZE..]
            .try_into()
            .map_err(|_| CodecError::Truncated("trailer"))?,
    );
    if crc32fast::hash(body) != stored_body_checksum {
        return Err(CodecError::BodyChecksumMismatch);
    }

    let dimensions = header.dimensions as usize;
    // Smallest possible entry: two empty strings plus the vector.
    let min_entry_size = 4 + dimensions * 4;
    let max_entries = body.len() / min_entry_size.max(1);
    if header.entry_count > max_entries as u64 {
        return Err(CodecError::InvalidFormat(format!(
            "header claims {} entries, body holds at most {}",
            header.entry_count, max_entries
        )));
    }

    let mut reader = Reader::new(body);
    let mut entries = Vec::with_capacity(header.entry_count as usize);
    for _ in 0..header.entry_count {
        entries.push(read_entry(&mut reader, dimensions)?);
    }

    if !reader.is_empty() {
        return Err(CodecError::InvalidFormat(format!(
            "{} trailing bytes after last entry",
            reader.remaining()
        )));
    }

    Ok(Snapshot::from_entries(dimensions, entries))
}

/// Read and validate the header only.
pub fn read_header(data: &[u8]) -> Result<Header, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::Truncated("header"));
    }
    let header_bytes = &data[..HEADER_SIZE];

    let version = header_bytes[0];

    // Version check first
    if version == 0 || version > FORMAT_VERSION {
        return Err(CodecError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[35..43]);
    let entry_count = u64::from_le_bytes(count_bytes);
    let stored_checksum = u32::from_le_bytes([
        header_bytes[43],
        header_bytes[44],
        header_bytes[45],
        header_bytes[46],
    ]);

    // Verify checksum (computed over header without checksum field)
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(CodecError::HeaderChecksumMismatch);
    }

    Ok(Header {
        version,
        model_id,
        dimensions,
        entry_count,
    })
}

fn write_header(out: &mut Vec<u8>, header: &Header) {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    out.extend_from_slice(&header_bytes);
}

fn write_entry(out: &mut Vec<u8>, entry: &IndexEntry, dimensions: usize) -> Result<(), CodecError> {
    if entry.vector.len() != dimensions {
        return Err(CodecError::DimensionMismatch {
            expected: dimensions,
            got: entry.vector.len(),
        });
    }
    write_str(out, &entry.identifier)?;
    write_str(out, &entry.source_key)?;
    for &value in entry.vector.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len())
        .map_err(|_| CodecError::InvalidFormat(format!("string of {} bytes is too long", s.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_entry(reader: &mut Reader<'_>, dimensions: usize) -> Result<IndexEntry, CodecError> {
    let identifier = reader.string("identifier")?;
    let source_key = reader.string("source key")?;

    let raw = reader.take(dimensions * 4, "vector")?;
    let vector: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(IndexEntry {
        identifier,
        source_key,
        vector: FeatureVector::new(vector),
    })
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated(what));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn string(&mut self, what: &'static str) -> Result<String, CodecError> {
        let len_bytes = self.take(2, what)?;
        let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::InvalidFormat(format!("{what} is not valid UTF-8")))
    }
}
