//! Binary splat map files
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! magic        4 bytes   "SPLT"
//! version      u32       1
//! count        i32
//! records      count x 32 bytes: position[3], scale, color[3], opacity (f32)
//! anchor       16 x f32, column-major
//! ```
//!
//! Confidence is not stored separately; it is restored from opacity.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{Mat4, Vec3};
use log::warn;
use serde::Serialize;
use thiserror::Error;

use crate::core::splat::SplatRecord;

pub const MAP_MAGIC: [u8; 4] = *b"SPLT";
pub const MAP_VERSION: u32 = 1;
pub const HEADER_BYTES: usize = 12;
pub const RECORD_BYTES: usize = 32;
pub const ANCHOR_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum MapFileError {
    #[error("failed to write map {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("failed to read map {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("not a splat map (magic {found:?})")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported map version {found} (expected {MAP_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("invalid splat count {count} (limit {limit})")]
    InvalidCount { count: i64, limit: usize },
    #[error("map data truncated: need {expected} bytes, file has {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("non-finite value in record {index}")]
    NonFiniteRecord { index: usize },
    #[error("non-finite anchor transform")]
    NonFiniteAnchor,
}

/// Decoded file contents
#[derive(Debug, Clone)]
pub struct MapFileContents {
    pub records: Vec<SplatRecord>,
    pub anchor: Mat4,
}

impl MapFileContents {
    pub fn summary(&self) -> MapSummary {
        MapSummary::from_records(&self.records, &self.anchor)
    }
}

/// Short description of a saved or loaded map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapSummary {
    pub splat_count: usize,
    pub mean_confidence: f32,
    pub bounds_min: Option<[f32; 3]>,
    pub bounds_max: Option<[f32; 3]>,
    /// Column-major anchor transform
    pub anchor: [f32; 16],
}

impl MapSummary {
    pub fn from_records(records: &[SplatRecord], anchor: &Mat4) -> Self {
        let mean_confidence = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.confidence).sum::<f32>() / records.len() as f32
        };

        let bounds = records.iter().map(SplatRecord::position).fold(None, |acc: Option<(Vec3, Vec3)>, p| {
            Some(match acc {
                Some((min, max)) => (min.min(p), max.max(p)),
                None => (p, p),
            })
        });

        Self {
            splat_count: records.len(),
            mean_confidence,
            bounds_min: bounds.map(|(min, _)| min.to_array()),
            bounds_max: bounds.map(|(_, max)| max.to_array()),
            anchor: anchor.to_cols_array(),
        }
    }
}

/// Serialize records and anchor into `writer`
pub fn encode_map<W: Write>(writer: &mut W, records: &[SplatRecord], anchor: &Mat4) -> std::io::Result<()> {
    let count = i32::try_from(records.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many splats for an i32 count")
    })?;

    writer.write_all(&MAP_MAGIC)?;
    writer.write_u32::<LittleEndian>(MAP_VERSION)?;
    writer.write_i32::<LittleEndian>(count)?;

    for record in records {
        for v in record.position {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(record.scale)?;
        for v in record.color {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.write_f32::<LittleEndian>(record.opacity)?;
    }

    for v in anchor.to_cols_array() {
        writer.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

/// Parse and validate a complete map file image.
///
/// Nothing is returned unless every record and the anchor are well formed.
pub fn decode_map(bytes: &[u8], max_splats: usize) -> Result<MapFileContents, MapFileError> {
    let truncated = |expected: usize| MapFileError::Truncated {
        expected,
        actual: bytes.len(),
    };
    if bytes.len() < HEADER_BYTES {
        return Err(truncated(HEADER_BYTES));
    }

    let mut cursor = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(|_| truncated(HEADER_BYTES))?;
    if magic != MAP_MAGIC {
        return Err(MapFileError::BadMagic { found: magic });
    }

    let version = cursor.read_u32::<LittleEndian>().map_err(|_| truncated(HEADER_BYTES))?;
    if version != MAP_VERSION {
        return Err(MapFileError::UnsupportedVersion { found: version });
    }

    let count = cursor.read_i32::<LittleEndian>().map_err(|_| truncated(HEADER_BYTES))?;
    if count < 0 || count as usize > max_splats {
        return Err(MapFileError::InvalidCount {
            count: count as i64,
            limit: max_splats,
        });
    }
    let count = count as usize;

    let expected = HEADER_BYTES + count * RECORD_BYTES + ANCHOR_BYTES;
    if bytes.len() < expected {
        return Err(truncated(expected));
    }
    if bytes.len() > expected {
        warn!("Ignoring {} trailing bytes after splat map", bytes.len() - expected);
    }

    let mut records = Vec::with_capacity(count);
    for index in 0..count {
        let mut values = [0f32; 8];
        cursor
            .read_f32_into::<LittleEndian>(&mut values)
            .map_err(|_| truncated(expected))?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(MapFileError::NonFiniteRecord { index });
        }

        let position = Vec3::new(values[0], values[1], values[2]);
        let color = [values[4], values[5], values[6]];
        records.push(SplatRecord::new(position, values[3], color, values[7]));
    }

    let mut anchor = [0f32; 16];
    cursor
        .read_f32_into::<LittleEndian>(&mut anchor)
        .map_err(|_| truncated(expected))?;
    if anchor.iter().any(|v| !v.is_finite()) {
        return Err(MapFileError::NonFiniteAnchor);
    }

    Ok(MapFileContents {
        records,
        anchor: Mat4::from_cols_array(&anchor),
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a map file, replacing `path` only once the new data is complete
pub fn write_map(path: &Path, records: &[SplatRecord], anchor: &Mat4) -> Result<(), MapFileError> {
    let tmp = temp_sibling(path);

    let result: std::io::Result<()> = (|| {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        encode_map(&mut writer, records, anchor)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(source) = result {
        let _ = fs::remove_file(&tmp);
        return Err(MapFileError::Write {
            path: path.display().to_string(),
            source,
        });
    }
    Ok(())
}

/// Read and fully validate a map file
pub fn read_map(path: &Path, max_splats: usize) -> Result<MapFileContents, MapFileError> {
    let bytes = fs::read(path).map_err(|source| MapFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    decode_map(&bytes, max_splats)
}
