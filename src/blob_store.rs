use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use log::{info, trace};

use crate::error::{BlobError, BlobResult};

/// `len` ‖ `slack` ‖ `deleted`: two little-endian `u64`s and a bool byte.
const HEADER_LEN: usize = 17;

fn encode_header(len: u64, slack: u64, deleted: bool) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..8].copy_from_slice(&len.to_le_bytes());
    buf[8..16].copy_from_slice(&slack.to_le_bytes());
    buf[16] = deleted as u8;
    buf
}

fn decode_header(buf: &[u8; HEADER_LEN]) -> BlobResult<(u64, u64, bool)> {
    let len = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let slack = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let deleted = match buf[16] {
        0 => false,
        1 => true,
        other => {
            return Err(BlobError::Malformed(format!(
                "deleted flag byte must be 0 or 1, found {}",
                other
            )))
        }
    };
    Ok((len, slack, deleted))
}

/// A variable-length blob heap: a single file holding a head-to-tail
/// sequence of `(header, payload)` records. Records are never moved except
/// by [`vacuum`](BlobStore::vacuum); a returned offset stays valid until the
/// record at it is deleted or the file is vacuumed.
///
/// Offset 0 is reserved: the first time a fresh (empty) file is opened, a
/// permanent zero-length tombstone is written there so no live blob can
/// ever resolve to offset 0. [`KvStore`](crate::KvStore) relies on this to
/// use `(0, 0)` as its empty-slot sentinel.
pub struct BlobStore {
    file: File,
    /// offset -> reclaimable span, rebuilt from tombstones on open.
    free_list: HashMap<u64, u64>,
}

impl BlobStore {
    /// Opens a blob store over `file`. If `file` is empty, reserves offset
    /// 0 with a dummy tombstone before scanning; otherwise rebuilds the
    /// free list from whatever tombstones are already present.
    pub fn open(mut file: File) -> BlobResult<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        let mut store = BlobStore {
            file,
            free_list: HashMap::new(),
        };
        if len == 0 {
            store.reserve_offset_zero()?;
        }
        store.rebuild_free_list()?;
        Ok(store)
    }

    fn reserve_offset_zero(&mut self) -> BlobResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encode_header(0, 0, true))?;
        self.file.flush()?;
        trace!("blob_store: reserved offset 0 with a dummy tombstone");
        Ok(())
    }

    fn rebuild_free_list(&mut self) -> BlobResult<()> {
        self.free_list.clear();
        for (offset, len, _slack, deleted) in self.headers()? {
            // offset 0 is permanently reserved and never reused, even
            // though it is itself tombstoned.
            if deleted && offset != 0 {
                self.free_list.insert(offset, len);
            }
        }
        Ok(())
    }

    /// Persists `bytes` as a new record and returns its offset. Reuses the
    /// first free-list entry whose span is large enough (first-fit);
    /// otherwise appends to the end of the file.
    pub fn add(&mut self, bytes: &[u8]) -> BlobResult<u64> {
        let len = bytes.len() as u64;
        let mut reuse = None;
        for (&candidate_offset, &span) in self.free_list.iter() {
            if span >= len {
                reuse = Some((candidate_offset, span));
                break;
            }
        }

        let offset = if let Some((offset, span)) = reuse {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&encode_header(len, span - len, false))?;
            self.file.write_all(bytes)?;
            self.free_list.remove(&offset);
            offset
        } else {
            let offset = self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(&encode_header(len, 0, false))?;
            self.file.write_all(bytes)?;
            offset
        };
        self.file.flush()?;
        trace!("blob_store: added {} byte record at offset {}", len, offset);
        Ok(offset)
    }

    /// Returns the live payload at `offset`. Fails with
    /// [`BlobError::Deleted`] if the record has been tombstoned.
    pub fn get(&mut self, offset: u64) -> BlobResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_LEN];
        self.file.read_exact(&mut header)?;
        let (len, _slack, deleted) = decode_header(&header)?;
        if deleted {
            return Err(BlobError::Deleted);
        }
        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Tombstones the record at `offset` and publishes its whole span
    /// (payload + slack) to the free list. The record's footprint on disk
    /// is unchanged.
    pub fn delete(&mut self, offset: u64) -> BlobResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_LEN];
        self.file.read_exact(&mut header)?;
        let (len, slack, _deleted) = decode_header(&header)?;
        let span = len + slack;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encode_header(span, 0, true))?;
        self.file.flush()?;

        if offset != 0 {
            self.free_list.insert(offset, span);
        }
        trace!("blob_store: deleted offset {}, span {} reclaimed", offset, span);
        Ok(())
    }

    /// Scans every record header from the start of the file, live or
    /// dead, yielding `(offset, len, slack, deleted)`.
    pub fn headers(&mut self) -> BlobResult<Vec<(u64, u64, u64, bool)>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        loop {
            let offset = self.file.seek(SeekFrom::Current(0))?;
            let mut header = [0u8; HEADER_LEN];
            match self.file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (len, slack, deleted) = decode_header(&header)?;
            out.push((offset, len, slack, deleted));
            self.file.seek(SeekFrom::Current((len + slack) as i64))?;
        }
        Ok(out)
    }

    /// Scans for live payloads only, in file order.
    pub fn iter(&mut self) -> BlobResult<Vec<Vec<u8>>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        loop {
            let mut header = [0u8; HEADER_LEN];
            match self.file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (len, slack, deleted) = decode_header(&header)?;
            if deleted {
                self.file.seek(SeekFrom::Current((len + slack) as i64))?;
            } else {
                let mut payload = vec![0u8; len as usize];
                self.file.read_exact(&mut payload)?;
                out.push(payload);
                self.file.seek(SeekFrom::Current(slack as i64))?;
            }
        }
        Ok(out)
    }

    /// Scans every record, live or dead, yielding `(offset, len, slack,
    /// deleted, bytes)`; the payload bytes of a tombstoned record are
    /// whatever was physically last written there (delete never clears
    /// the payload region, only the header).
    pub fn items(&mut self) -> BlobResult<Vec<(u64, u64, u64, bool, Vec<u8>)>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        loop {
            let offset = self.file.seek(SeekFrom::Current(0))?;
            let mut header = [0u8; HEADER_LEN];
            match self.file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (len, slack, deleted) = decode_header(&header)?;
            let mut payload = vec![0u8; len as usize];
            self.file.read_exact(&mut payload)?;
            out.push((offset, len, slack, deleted, payload));
            self.file.seek(SeekFrom::Current(slack as i64))?;
        }
        Ok(out)
    }

    /// Rewrites the file compactly: every live record is re-appended with
    /// no slack and no tombstones, preserving file order but not offsets.
    /// All offsets issued before a `vacuum` are invalid afterwards. Offset
    /// 0's reserved dummy tombstone is rewritten first, so it still holds
    /// offset 0 once the rewrite lands and no live record can end up there.
    pub fn vacuum(&mut self) -> BlobResult<()> {
        let live = self.iter()?;
        let mut scratch = Vec::new();
        scratch.extend_from_slice(&encode_header(0, 0, true));
        for payload in &live {
            scratch.extend_from_slice(&encode_header(payload.len() as u64, 0, false));
            scratch.extend_from_slice(payload);
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&scratch)?;
        self.file.set_len(scratch.len() as u64)?;
        self.file.flush()?;
        self.free_list.clear();
        info!(
            "blob_store: vacuum rewrote {} live records into {} bytes",
            live.len(),
            scratch.len()
        );
        Ok(())
    }
}
