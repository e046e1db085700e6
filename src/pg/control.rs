//! `global/pg_control` parsing.
//!
//! The control file starts with the cluster's system identifier and the
//! control/catalog version pair, which together select the field layout
//! of the remainder. Only the fields the backup engine consumes are
//! extracted.

use std::convert::TryInto;
use std::path::Path;

use anyhow::{format_err, Error};

use crate::error::BackupError;
use crate::tools;

use super::*;

/// Size of the control file read (and of the file itself, padded).
pub const PG_CONTROL_SIZE: usize = 8192;

/// One supported control-file format. The version pair uniquely
/// identifies a major release; field offsets differ between them.
struct ControlFormat {
    control_version: u32,
    catalog_version: u32,
    version: u32,
    block_size_offset: usize,
    wal_segment_size_offset: usize,
    /// Absent before data checksums existed (9.3).
    checksum_version_offset: Option<usize>,
}

const CONTROL_FORMATS: &[ControlFormat] = &[
    ControlFormat { control_version: 1100, catalog_version: 201809051, version: PG_VERSION_11, block_size_offset: 208, wal_segment_size_offset: 216, checksum_version_offset: Some(256) },
    ControlFormat { control_version: 1002, catalog_version: 201707211, version: PG_VERSION_10, block_size_offset: 208, wal_segment_size_offset: 216, checksum_version_offset: Some(256) },
    ControlFormat { control_version: 960, catalog_version: 201608131, version: PG_VERSION_96, block_size_offset: 200, wal_segment_size_offset: 208, checksum_version_offset: Some(248) },
    ControlFormat { control_version: 942, catalog_version: 201510051, version: PG_VERSION_95, block_size_offset: 200, wal_segment_size_offset: 208, checksum_version_offset: Some(248) },
    ControlFormat { control_version: 942, catalog_version: 201409291, version: PG_VERSION_94, block_size_offset: 200, wal_segment_size_offset: 208, checksum_version_offset: Some(248) },
    ControlFormat { control_version: 937, catalog_version: 201306121, version: PG_VERSION_93, block_size_offset: 192, wal_segment_size_offset: 200, checksum_version_offset: Some(240) },
    ControlFormat { control_version: 922, catalog_version: 201204301, version: PG_VERSION_92, block_size_offset: 192, wal_segment_size_offset: 200, checksum_version_offset: None },
    ControlFormat { control_version: 903, catalog_version: 201105231, version: PG_VERSION_91, block_size_offset: 184, wal_segment_size_offset: 192, checksum_version_offset: None },
    ControlFormat { control_version: 903, catalog_version: 201008051, version: PG_VERSION_90, block_size_offset: 184, wal_segment_size_offset: 192, checksum_version_offset: None },
    ControlFormat { control_version: 843, catalog_version: 200904091, version: PG_VERSION_84, block_size_offset: 176, wal_segment_size_offset: 184, checksum_version_offset: None },
    ControlFormat { control_version: 833, catalog_version: 200711281, version: PG_VERSION_83, block_size_offset: 168, wal_segment_size_offset: 176, checksum_version_offset: None },
];

/// Decoded cluster control data, immutable for one backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgControl {
    pub version: u32,
    pub system_id: u64,
    pub control_version: u32,
    pub catalog_version: u32,
    pub page_size: u32,
    pub wal_segment_size: u32,
    pub page_checksum: bool,
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, Error> {
    let end = offset + 4;
    if end > buf.len() {
        return Err(BackupError::Format(format!(
            "control data truncated at offset {}",
            offset
        ))
        .into());
    }
    Ok(u32::from_le_bytes(buf[offset..end].try_into().unwrap()))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, Error> {
    let end = offset + 8;
    if end > buf.len() {
        return Err(BackupError::Format(format!(
            "control data truncated at offset {}",
            offset
        ))
        .into());
    }
    Ok(u64::from_le_bytes(buf[offset..end].try_into().unwrap()))
}

impl PgControl {
    /// Read and decode `global/pg_control` below a data directory.
    pub fn read(pg_path: &Path) -> Result<Self, Error> {
        let path = pg_path.join(PG_FILE_PGCONTROL);
        let data = tools::file_get_contents(&path)
            .map_err(|err| format_err!("unable to read control file - {}", err))?;
        Self::parse(&data)
    }

    /// Decode a control file image.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let system_id = read_u64(buf, 0)?;
        let control_version = read_u32(buf, 8)?;
        let catalog_version = read_u32(buf, 12)?;

        let format = CONTROL_FORMATS
            .iter()
            .find(|f| {
                f.control_version == control_version && f.catalog_version == catalog_version
            })
            .ok_or_else(|| {
                BackupError::Format(format!(
                    "unsupported control version {} (catalog {})",
                    control_version, catalog_version
                ))
            })?;

        let page_size = read_u32(buf, format.block_size_offset)?;
        let wal_segment_size = read_u32(buf, format.wal_segment_size_offset)?;

        let page_checksum = match format.checksum_version_offset {
            Some(offset) => read_u32(buf, offset)? > 0,
            None => false,
        };

        Ok(Self {
            version: format.version,
            system_id,
            control_version,
            catalog_version,
            page_size,
            wal_segment_size,
            page_checksum,
        })
    }

    /// Build a control file image for a given version. Test fixtures
    /// need to fabricate clusters; not part of the public API surface.
    #[doc(hidden)]
    pub fn encode(
        version: u32,
        system_id: u64,
        page_size: u32,
        wal_segment_size: u32,
        page_checksum: bool,
    ) -> Vec<u8> {
        let format = CONTROL_FORMATS
            .iter()
            .find(|f| f.version == version)
            .expect("unsupported version in control encode");

        let mut buf = vec![0u8; PG_CONTROL_SIZE];
        buf[0..8].copy_from_slice(&system_id.to_le_bytes());
        buf[8..12].copy_from_slice(&format.control_version.to_le_bytes());
        buf[12..16].copy_from_slice(&format.catalog_version.to_le_bytes());

        let o = format.block_size_offset;
        buf[o..o + 4].copy_from_slice(&page_size.to_le_bytes());
        let o = format.wal_segment_size_offset;
        buf[o..o + 4].copy_from_slice(&wal_segment_size.to_le_bytes());
        if let Some(o) = format.checksum_version_offset {
            let v: u32 = if page_checksum { 1 } else { 0 };
            buf[o..o + 4].copy_from_slice(&v.to_le_bytes());
        }

        buf
    }
}
