use crate::digest::{INDEX_MAGIC, SNAPSHOT_MAGIC};
use crate::error::{Error, Result};
use crate::format::{FORMAT_VERSION, WallTime};
use crate::wire::codec::{read_fixed32, read_fixed64, read_varint};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

/// The decoded `.hpc` header and index.
#[derive(Clone, Debug, PartialEq)]
pub struct DigestMetadata {
    pub start: WallTime,
    pub interval_seconds: f64,
    /// Byte offset of each snapshot, in time order.
    pub offsets: Vec<u64>,
}

/// Parse the digest header, then seek to and decode the index.
pub fn read_digest_metadata<R: Read + Seek>(r: &mut R) -> Result<DigestMetadata> {
    let version = read_fixed32(r)?;
    if version != FORMAT_VERSION {
        return Err(Error::MalformedStream(format!(
            "unrecognized digest version {version}"
        )));
    }

    let sec = read_fixed64(r)? as i64;
    let nsec = read_fixed64(r)? as u32;
    let interval_msec = read_varint(r)?;
    let index_offset = read_fixed64(r)?;

    r.seek(SeekFrom::Start(index_offset))?;
    let magic = read_fixed32(r)?;
    if magic != INDEX_MAGIC {
        return Err(Error::MalformedStream(format!(
            "bad index magic {magic:#010x}"
        )));
    }

    let num_entries = read_varint(r)?;
    let mut offsets = Vec::with_capacity(num_entries.min(1 << 20) as usize);
    let mut offset = 0u64;
    for _ in 0..num_entries {
        offset += read_varint(r)?;
        offsets.push(offset);
    }

    Ok(DigestMetadata {
        start: WallTime { sec, nsec },
        interval_seconds: interval_msec as f64 * 1e-3,
        offsets,
    })
}

/// Read the snapshot at `offset`, returning live bytes per trace index.
pub fn read_digest_entry<R: Read + Seek>(r: &mut R, offset: u64) -> Result<HashMap<u32, i64>> {
    r.seek(SeekFrom::Start(offset))?;
    let magic = read_fixed32(r)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(Error::MalformedStream(format!(
            "bad snapshot magic {magic:#010x} at offset {offset}"
        )));
    }

    let num_items = read_varint(r)?;
    let mut entries = HashMap::with_capacity(num_items.min(1 << 20) as usize);
    let mut size: i64 = 0;
    for i in 0..num_items {
        let trace_index = u32::try_from(read_varint(r)?)
            .map_err(|_| Error::MalformedStream("trace index out of range".into()))?;
        let delta = read_varint(r)? as i64;
        if i == 0 {
            size = delta;
        } else {
            // Descending order on disk, so each entry stores how far it
            // sits below the previous one.
            size -= delta;
        }
        entries.insert(trace_index, size);
    }
    Ok(entries)
}
