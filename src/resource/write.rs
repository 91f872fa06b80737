//! Streaming resource writer.
//!
//! `ResourceWriter` buffers 32 KiB of uncompressed input, compresses each
//! full chunk (falling back to verbatim storage whenever the codec cannot
//! shrink it), and appends the chunks after a reserved chunk-table region.
//! On `finish` the table is filled in with a seek-back and the file position
//! is restored to the end of the resource. A SHA-1 over the uncompressed
//! bytes runs alongside so the caller can mint a blob descriptor without a
//! second pass.
//!
//! The uncompressed size must be declared up front: it fixes the table
//! geometry (entry width and count) before the first chunk lands.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use super::{ResourceEntry, RESOURCE_FLAG_COMPRESSED};
use crate::codec::{get_codec, Codec, CodecKind};
use crate::error::{Result, WimError};
use crate::header::WIM_CHUNK_SIZE;
use crate::integrity::Sha1Hash;

pub struct ResourceWriter<'a, F: Write + Seek> {
    file: &'a mut F,
    path: PathBuf,
    codec: Option<&'static dyn Codec>,
    original_size: u64,
    start: u64,
    /// Stored size of each chunk written so far.
    stored: Vec<u64>,
    buf: Vec<u8>,
    cbuf: Vec<u8>,
    hasher: Sha1,
    fed: u64,
}

impl<'a, F: Write + Seek> ResourceWriter<'a, F> {
    /// Begin a resource at the current file position. `codec_kind` selects
    /// chunked compression; `CodecKind::None` stores the bytes verbatim.
    pub fn new(
        file: &'a mut F,
        path: &Path,
        codec_kind: CodecKind,
        original_size: u64,
    ) -> Result<Self> {
        let start = file.stream_position().map_err(|e| WimError::Seek {
            path: path.to_owned(),
            offset: 0,
            source: e,
        })?;
        let codec = get_codec(codec_kind);

        let mut this = Self {
            file,
            path: path.to_owned(),
            codec,
            original_size,
            start,
            stored: Vec::new(),
            buf: Vec::with_capacity(WIM_CHUNK_SIZE),
            cbuf: Vec::new(),
            hasher: Sha1::new(),
            fed: 0,
        };
        if this.codec.is_some() {
            // Reserve the chunk table; it is patched on finish.
            let table_size = this.entry().chunk_table_size();
            this.write_raw(&vec![0u8; table_size as usize])?;
        }
        Ok(this)
    }

    fn entry(&self) -> ResourceEntry {
        ResourceEntry {
            size_in_wim: 0,
            flags: if self.codec.is_some() {
                RESOURCE_FLAG_COMPRESSED
            } else {
                0
            },
            offset: self.start,
            original_size: self.original_size,
        }
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).map_err(|e| WimError::Write {
            path: self.path.clone(),
            offset: self.start,
            source: e,
        })
    }

    /// Feed uncompressed bytes; full chunks are compressed and written out
    /// immediately.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.fed += data.len() as u64;
        if self.codec.is_none() {
            return self.write_raw(data);
        }
        while !data.is_empty() {
            let take = (WIM_CHUNK_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == WIM_CHUNK_SIZE {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        let codec = self.codec.expect("flush_chunk only runs in compressed mode");
        match codec.compress(&self.buf, &mut self.cbuf) {
            Some(n) => {
                debug_assert!(n < self.buf.len());
                self.stored.push(n as u64);
                let chunk = std::mem::take(&mut self.cbuf);
                self.write_raw(&chunk[..n])?;
                self.cbuf = chunk;
            }
            None => {
                // Not compressible: stored size equals uncompressed size and
                // the reader copies the bytes verbatim.
                self.stored.push(self.buf.len() as u64);
                let chunk = std::mem::take(&mut self.buf);
                self.write_raw(&chunk)?;
                self.buf = chunk;
            }
        }
        self.buf.clear();
        Ok(())
    }

    /// Flush the tail chunk, patch the chunk table, and return the finished
    /// entry plus the SHA-1 of everything fed.
    pub fn finish(mut self, extra_flags: u8) -> Result<(ResourceEntry, Sha1Hash)> {
        if self.fed != self.original_size {
            return Err(WimError::Write {
                path: self.path.clone(),
                offset: self.start,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "resource fed {} bytes but declared {}",
                        self.fed, self.original_size
                    ),
                ),
            });
        }
        if self.codec.is_some() && !self.buf.is_empty() {
            self.flush_chunk()?;
        }

        let mut entry = self.entry();
        entry.flags |= extra_flags;

        if self.codec.is_some() {
            let table_size = entry.chunk_table_size();
            let data_size: u64 = self.stored.iter().sum();
            entry.size_in_wim = table_size + data_size;

            // Fill the table: entry i is the running offset of chunk i+1.
            debug_assert_eq!(self.stored.len() as u64, entry.chunk_count());
            let esize = entry.chunk_entry_size();
            let mut table = Vec::with_capacity(table_size as usize);
            let mut acc = 0u64;
            for &s in &self.stored[..self.stored.len().saturating_sub(1)] {
                acc += s;
                if esize == 4 {
                    table.extend_from_slice(&(acc as u32).to_le_bytes());
                } else {
                    table.extend_from_slice(&acc.to_le_bytes());
                }
            }
            debug_assert_eq!(table.len() as u64, table_size);

            let end = self.start + table_size + data_size;
            self.file
                .seek(SeekFrom::Start(self.start))
                .map_err(|e| WimError::Seek {
                    path: self.path.clone(),
                    offset: self.start,
                    source: e,
                })?;
            self.write_raw(&table)?;
            self.file
                .seek(SeekFrom::Start(end))
                .map_err(|e| WimError::Seek {
                    path: self.path.clone(),
                    offset: end,
                    source: e,
                })?;
        } else {
            entry.size_in_wim = self.original_size;
        }

        Ok((entry, self.hasher.finalize().into()))
    }
}

/// One-shot convenience: write `data` as a complete resource.
pub fn write_resource<F: Write + Seek>(
    file: &mut F,
    path: &Path,
    codec_kind: CodecKind,
    data: &[u8],
    extra_flags: u8,
) -> Result<(ResourceEntry, Sha1Hash)> {
    let mut w = ResourceWriter::new(file, path, codec_kind, data.len() as u64)?;
    w.write(data)?;
    w.finish(extra_flags)
}

#[cfg(test)]
mod tests {
    use super::super::read::{read_blob_verified, read_compressed, read_full, read_uncompressed};
    use super::*;
    use crate::blob::{BlobDescriptor, BlobSource};
    use crate::codec::CodecKind;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn mem() -> (Cursor<Vec<u8>>, PathBuf) {
        (Cursor::new(Vec::new()), PathBuf::from("<mem>"))
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| b"the chunked resource layer of a wim archive "[i % 44] ^ (i / 7000) as u8)
            .collect()
    }

    #[test]
    fn uncompressed_roundtrip() {
        let (mut f, path) = mem();
        let data = sample(100_000);
        let (entry, hash) = write_resource(&mut f, &path, CodecKind::None, &data, 0).unwrap();
        assert!(!entry.is_compressed());
        assert_eq!(entry.size_in_wim, data.len() as u64);

        let mut out = vec![0u8; 1000];
        read_uncompressed(&mut f, &path, &entry, 50_000, &mut out).unwrap();
        assert_eq!(out, data[50_000..51_000]);
        assert_eq!(hash, crate::integrity::sha1_of(&data));
    }

    #[test]
    fn compressed_roundtrip_both_codecs() {
        for kind in [CodecKind::Xpress, CodecKind::Lzx] {
            let (mut f, path) = mem();
            let data = sample(200_000);
            let (entry, hash) = write_resource(&mut f, &path, kind, &data, 0).unwrap();
            assert!(entry.is_compressed());
            assert!(entry.size_in_wim < data.len() as u64, "{kind:?} did not shrink");
            assert_eq!(entry.original_size, data.len() as u64);

            let mut out = Vec::new();
            read_full(&mut f, &path, &entry, kind, &mut out).unwrap();
            assert_eq!(out, data);
            assert_eq!(hash, crate::integrity::sha1_of(&data));

            // Random access crossing a chunk boundary.
            let codec = crate::codec::get_codec(kind).unwrap();
            let mut out = vec![0u8; 5000];
            read_compressed(&mut f, &path, &entry, codec, 31_000, &mut out).unwrap();
            assert_eq!(out, data[31_000..36_000]);
        }
    }

    #[test]
    fn exact_chunk_boundaries() {
        // 32768 bytes: one chunk, empty table; 32769: two chunks, one entry.
        for (len, chunks, table) in [(32_768usize, 1u64, 0u64), (32_769, 2, 4)] {
            let (mut f, path) = mem();
            let data = sample(len);
            let (entry, _) = write_resource(&mut f, &path, CodecKind::Lzx, &data, 0).unwrap();
            assert_eq!(entry.chunk_count(), chunks);
            assert_eq!(entry.chunk_table_size(), table);
            let mut out = Vec::new();
            read_full(&mut f, &path, &entry, CodecKind::Lzx, &mut out).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn incompressible_chunks_are_stored_verbatim() {
        // A keyed PRNG stream does not compress; each chunk must be stored
        // with stored size == uncompressed size and read back bit-exact.
        let mut x = 0x2545F491_4F6CDD1Du64;
        let data: Vec<u8> = (0..70_000)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 32) as u8
            })
            .collect();
        let (mut f, path) = mem();
        let (entry, _) = write_resource(&mut f, &path, CodecKind::Xpress, &data, 0).unwrap();
        // Stored payload is table + raw chunks.
        assert_eq!(
            entry.size_in_wim,
            entry.chunk_table_size() + data.len() as u64
        );
        let mut out = Vec::new();
        read_full(&mut f, &path, &entry, CodecKind::Xpress, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn blob_verification_catches_flipped_bits() {
        let (mut f, path) = mem();
        let data = sample(80_000);
        let (entry, hash) = write_resource(&mut f, &path, CodecKind::Lzx, &data, 0).unwrap();
        let blob = BlobDescriptor {
            hash,
            entry,
            part_number: 1,
            refcount: 1,
            source: BlobSource::Archive,
        };

        let mut out = Vec::new();
        read_blob_verified(&mut f, &path, &blob, CodecKind::Lzx, &mut out).unwrap();
        assert_eq!(out, data);

        // Flip one byte inside a compressed chunk body.
        let flip = (entry.offset + entry.chunk_table_size() + 3) as usize;
        f.get_mut()[flip] ^= 0x01;
        let err = read_blob_verified(&mut f, &path, &blob, CodecKind::Lzx, &mut out).unwrap_err();
        use crate::error::ErrorKind;
        assert!(matches!(
            err.kind(),
            ErrorKind::DecompressionFailed | ErrorKind::InvalidResourceHash
        ));
    }

    #[test]
    fn declared_size_is_enforced() {
        let (mut f, path) = mem();
        let mut w = ResourceWriter::new(&mut f, &path, CodecKind::None, 100).unwrap();
        w.write(&[0u8; 42]).unwrap();
        assert!(w.finish(0).is_err());
    }
}
