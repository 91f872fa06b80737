//! Chunked, random-access resource reads.
//!
//! The read path per chunk: load the covering chunk-table slice, derive each
//! chunk's stored size from adjacent offsets (the final chunk's from the
//! resource's total stored size), read the chunk, then either copy it raw
//! (stored size == uncompressed size) or decompress with the archive codec.
//! Partial chunks at the request boundaries go through a scratch buffer and
//! only the needed slice is copied out. Chunks are always delivered in
//! ascending index order.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha1::{Digest, Sha1};

use super::{ResourceEntry, CHUNK_SIZE_SLACK};
use crate::blob::BlobDescriptor;
use crate::codec::{get_codec, Codec, CodecKind};
use crate::error::{Result, WimError};
use crate::header::WIM_CHUNK_SIZE;
use crate::integrity::Sha1Hash;

fn seek_to<F: Seek>(f: &mut F, path: &Path, offset: u64) -> Result<()> {
    f.seek(SeekFrom::Start(offset))
        .map(|_| ())
        .map_err(|e| WimError::Seek {
            path: path.to_owned(),
            offset,
            source: e,
        })
}

fn read_exact_at<F: Read + Seek>(f: &mut F, path: &Path, offset: u64, out: &mut [u8]) -> Result<()> {
    seek_to(f, path, offset)?;
    f.read_exact(out).map_err(|e| WimError::Read {
        path: path.to_owned(),
        offset,
        len: out.len(),
        source: e,
    })
}

/// Bulk read from an uncompressed resource: seek plus read, nothing else.
pub fn read_uncompressed<F: Read + Seek>(
    f: &mut F,
    path: &Path,
    res: &ResourceEntry,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    debug_assert!(!res.is_compressed());
    if offset + out.len() as u64 > res.original_size {
        return Err(WimError::Read {
            path: path.to_owned(),
            offset: res.offset + offset,
            len: out.len(),
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of resource",
            ),
        });
    }
    read_exact_at(f, path, res.offset + offset, out)
}

/// Stored sizes and data offsets for chunks `first..=last`, derived from a
/// single chunk-table slice load.
struct TableSlice {
    first: u64,
    /// Offset of each covered chunk's data, relative to the end of the table.
    starts: Vec<u64>,
    /// End offset of the last covered chunk.
    end: u64,
}

impl TableSlice {
    fn stored_size(&self, chunk: u64) -> u64 {
        let i = (chunk - self.first) as usize;
        let start = self.starts[i];
        let end = self
            .starts
            .get(i + 1)
            .copied()
            .unwrap_or(self.end);
        end.wrapping_sub(start)
    }

    fn data_offset(&self, chunk: u64) -> u64 {
        self.starts[(chunk - self.first) as usize]
    }
}

fn load_table_slice<F: Read + Seek>(
    f: &mut F,
    path: &Path,
    res: &ResourceEntry,
    first: u64,
    last: u64,
) -> Result<TableSlice> {
    let nchunks = res.chunk_count();
    let esize = res.chunk_entry_size();
    let table_size = res.chunk_table_size();
    debug_assert!(first <= last && last < nchunks);

    // Entry i (for i in 0..nchunks-1) holds the offset of chunk i+1 relative
    // to the end of the table; chunk 0 starts at 0 implicitly. Chunk `c`
    // needs entry c-1 for its start and entry c for its end — one entry past
    // the request unless `last` is the final chunk, whose end derives from
    // the resource's total stored size.
    let mut entries: Vec<u64> = Vec::new();
    let mut lo_entry = 0u64;
    if nchunks >= 2 {
        lo_entry = first.saturating_sub(1);
        let hi_entry = last.min(nchunks - 2);
        if lo_entry <= hi_entry {
            let count = (hi_entry - lo_entry + 1) as usize;
            let mut raw = vec![0u8; count * esize as usize];
            read_exact_at(f, path, res.offset + lo_entry * esize, &mut raw)?;
            entries = raw
                .chunks_exact(esize as usize)
                .map(|e| {
                    if esize == 4 {
                        u32::from_le_bytes(e.try_into().unwrap()) as u64
                    } else {
                        u64::from_le_bytes(e.try_into().unwrap())
                    }
                })
                .collect();
        }
    }
    let entry = |idx: u64| entries[(idx - lo_entry) as usize];

    let mut starts = Vec::with_capacity((last - first + 1) as usize);
    for c in first..=last {
        starts.push(if c == 0 { 0 } else { entry(c - 1) });
    }
    let end = if last + 1 < nchunks {
        entry(last)
    } else {
        res.size_in_wim - table_size
    };

    // Offsets must be strictly increasing; a violation is corruption.
    let mut prev = starts[0];
    for &s in &starts[1..] {
        if s <= prev {
            return Err(WimError::DecompressionFailed {
                resource_offset: res.offset,
                chunk: first,
                detail: "chunk offsets are not strictly increasing".into(),
            });
        }
        prev = s;
    }
    if end <= prev {
        return Err(WimError::DecompressionFailed {
            resource_offset: res.offset,
            chunk: last,
            detail: "chunk end offset precedes its start".into(),
        });
    }

    Ok(TableSlice { first, starts, end })
}

/// Read `out.len()` bytes at `offset` from a compressed resource, touching
/// only the chunks that cover the range.
pub fn read_compressed<F: Read + Seek>(
    f: &mut F,
    path: &Path,
    res: &ResourceEntry,
    codec: &dyn Codec,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    debug_assert!(res.is_compressed());
    if out.is_empty() {
        return Ok(());
    }
    if offset + out.len() as u64 > res.original_size {
        return Err(WimError::Read {
            path: path.to_owned(),
            offset: res.offset,
            len: out.len(),
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of resource",
            ),
        });
    }

    let chunk_size = WIM_CHUNK_SIZE as u64;
    let first = offset / chunk_size;
    let last = (offset + out.len() as u64 - 1) / chunk_size;
    let slice = load_table_slice(f, path, res, first, last)?;
    let data_base = res.offset + res.chunk_table_size();

    let mut cbuf = Vec::new();
    let mut scratch = vec![0u8; WIM_CHUNK_SIZE];
    let mut written = 0usize;
    for chunk in first..=last {
        let orig = res.chunk_original_size(chunk) as usize;
        let stored = slice.stored_size(chunk);
        if stored == 0 || stored > chunk_size + CHUNK_SIZE_SLACK {
            return Err(WimError::DecompressionFailed {
                resource_offset: res.offset,
                chunk,
                detail: format!("derived chunk size {stored} is out of range"),
            });
        }

        cbuf.resize(stored as usize, 0);
        read_exact_at(f, path, data_base + slice.data_offset(chunk), &mut cbuf)?;

        // Byte range of this chunk within the request.
        let chunk_off = chunk * chunk_size;
        let copy_from = offset.max(chunk_off) - chunk_off;
        let copy_to = (offset + out.len() as u64).min(chunk_off + orig as u64) - chunk_off;
        let whole = copy_from == 0 && copy_to == orig as u64;

        let dest_range = written..written + (copy_to - copy_from) as usize;
        if stored as usize == orig {
            // Stored verbatim; the codec is not involved.
            out[dest_range.clone()].copy_from_slice(&cbuf[copy_from as usize..copy_to as usize]);
        } else if whole {
            codec
                .decompress(&cbuf, &mut out[written..written + orig])
                .map_err(|e| WimError::DecompressionFailed {
                    resource_offset: res.offset,
                    chunk,
                    detail: e.to_string(),
                })?;
        } else {
            codec
                .decompress(&cbuf, &mut scratch[..orig])
                .map_err(|e| WimError::DecompressionFailed {
                    resource_offset: res.offset,
                    chunk,
                    detail: e.to_string(),
                })?;
            out[dest_range.clone()].copy_from_slice(&scratch[copy_from as usize..copy_to as usize]);
        }
        written = dest_range.end;
    }
    debug_assert_eq!(written, out.len());
    Ok(())
}

/// Sequential whole-resource reader delivering one chunk at a time, used by
/// full reads and the apply pipeline's per-blob fan-out.
pub struct ChunkCursor {
    res: ResourceEntry,
    codec: Option<&'static dyn Codec>,
    /// Start offset of every chunk's stored bytes, plus the end sentinel.
    bounds: Vec<u64>,
    next: u64,
    cbuf: Vec<u8>,
}

impl ChunkCursor {
    pub fn new<F: Read + Seek>(
        f: &mut F,
        path: &Path,
        res: &ResourceEntry,
        codec_kind: CodecKind,
    ) -> Result<Self> {
        let codec = if res.is_compressed() {
            Some(get_codec(codec_kind).ok_or_else(|| {
                WimError::header("compressed resource in an archive with no codec flag")
            })?)
        } else {
            None
        };

        let nchunks = res.chunk_count();
        let mut bounds = Vec::with_capacity(nchunks as usize + 1);
        if res.is_compressed() && nchunks > 0 {
            let slice = load_table_slice(f, path, res, 0, nchunks - 1)?;
            bounds.extend_from_slice(&slice.starts);
            bounds.push(slice.end);
        }
        Ok(Self {
            res: *res,
            codec,
            bounds,
            next: 0,
            cbuf: Vec::new(),
        })
    }

    pub fn chunk_count(&self) -> u64 {
        self.res.chunk_count()
    }

    /// Decode the next chunk into `out` (at least 32 KiB long). Returns the
    /// uncompressed chunk length, or 0 once the resource is exhausted.
    pub fn next_chunk<F: Read + Seek>(
        &mut self,
        f: &mut F,
        path: &Path,
        out: &mut [u8],
    ) -> Result<usize> {
        if self.next >= self.res.chunk_count() {
            return Ok(0);
        }
        let chunk = self.next;
        self.next += 1;
        let orig = self.res.chunk_original_size(chunk) as usize;
        debug_assert!(out.len() >= orig);

        match self.codec {
            None => {
                read_exact_at(
                    f,
                    path,
                    self.res.offset + chunk * WIM_CHUNK_SIZE as u64,
                    &mut out[..orig],
                )?;
            }
            Some(codec) => {
                let start = self.bounds[chunk as usize];
                let end = self.bounds[chunk as usize + 1];
                let stored = end - start;
                if stored == 0 || stored > WIM_CHUNK_SIZE as u64 + CHUNK_SIZE_SLACK {
                    return Err(WimError::DecompressionFailed {
                        resource_offset: self.res.offset,
                        chunk,
                        detail: format!("derived chunk size {stored} is out of range"),
                    });
                }
                self.cbuf.resize(stored as usize, 0);
                read_exact_at(
                    f,
                    path,
                    self.res.offset + self.res.chunk_table_size() + start,
                    &mut self.cbuf,
                )?;
                if stored as usize == orig {
                    out[..orig].copy_from_slice(&self.cbuf);
                } else {
                    codec
                        .decompress(&self.cbuf, &mut out[..orig])
                        .map_err(|e| WimError::DecompressionFailed {
                            resource_offset: self.res.offset,
                            chunk,
                            detail: e.to_string(),
                        })?;
                }
            }
        }
        Ok(orig)
    }
}

/// Read an entire resource into `out` (replacing its contents).
pub fn read_full<F: Read + Seek>(
    f: &mut F,
    path: &Path,
    res: &ResourceEntry,
    codec_kind: CodecKind,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.clear();
    out.resize(res.original_size as usize, 0);
    let mut cursor = ChunkCursor::new(f, path, res, codec_kind)?;
    let mut pos = 0usize;
    loop {
        let remaining = &mut out[pos..];
        if remaining.is_empty() {
            break;
        }
        let n = {
            // Each chunk lands at a 32 KiB boundary of the output.
            let max = remaining.len().min(WIM_CHUNK_SIZE);
            cursor.next_chunk(f, path, &mut remaining[..max])?
        };
        if n == 0 {
            break;
        }
        pos += n;
    }
    debug_assert_eq!(pos, out.len());
    Ok(())
}

/// Read a blob's full content and verify it against its SHA-1 key.
pub fn read_blob_verified<F: Read + Seek>(
    f: &mut F,
    path: &Path,
    blob: &BlobDescriptor,
    codec_kind: CodecKind,
    out: &mut Vec<u8>,
) -> Result<()> {
    read_full(f, path, &blob.entry, codec_kind, out)?;
    let mut h = Sha1::new();
    h.update(&out[..]);
    let actual: Sha1Hash = h.finalize().into();
    if actual != blob.hash {
        return Err(WimError::InvalidResourceHash {
            hash: hex::encode(blob.hash),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}
