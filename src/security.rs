//! Per-image security descriptor table.
//!
//! Descriptors are opaque Windows self-relative security descriptors; inodes
//! reference them by index (−1 = none). Duplicate descriptors share an index
//! via SHA-1 interning.
//!
//! # On-disk prelude layout (head of every metadata resource)
//!
//! ```text
//! Offset  Size   Field
//!    0      4    total_length  bytes 0..end of last descriptor
//!    4      4    count
//!    8    N×8    descriptor sizes (u64 each)
//!   ...    ...   descriptors, concatenated
//!   ...    ...   zero padding to an 8-byte boundary
//! ```
//!
//! # NTFS fixup
//!
//! Some host ACL validators reject a descriptor whose *last* component is an
//! empty DACL or SACL. Before such a descriptor is handed to an NTFS target,
//! the owner SID (or, failing that, the group SID) is relocated to the tail
//! by appending a copy and repointing its offset. Descriptors with neither
//! SID relocatable pass through unchanged.

use std::borrow::Cow;
use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, WimError};
use crate::integrity::{sha1_of, Sha1Hash};

/// Self-relative security descriptor header size.
const SD_HEADER_LEN: usize = 20;
/// ACL header size; an empty ACL is exactly this long.
const ACL_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct SecurityTable {
    descriptors: Vec<Vec<u8>>,
    by_hash: HashMap<Sha1Hash, usize>,
}

impl SecurityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, id: i32) -> Option<&[u8]> {
        if id < 0 {
            return None;
        }
        self.descriptors.get(id as usize).map(|d| d.as_slice())
    }

    /// Intern a descriptor, returning its index. Duplicates (by SHA-1 of
    /// the raw bytes) share an index.
    pub fn intern(&mut self, descriptor: &[u8]) -> i32 {
        let hash = sha1_of(descriptor);
        if let Some(&i) = self.by_hash.get(&hash) {
            return i as i32;
        }
        let i = self.descriptors.len();
        self.descriptors.push(descriptor.to_vec());
        self.by_hash.insert(hash, i);
        i as i32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let sizes_len = self.descriptors.len() * 8;
        let data_len: usize = self.descriptors.iter().map(|d| d.len()).sum();
        let total = 8 + sizes_len + data_len;

        let mut out = Vec::with_capacity(total + 8);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(self.descriptors.len() as u32).to_le_bytes());
        for d in &self.descriptors {
            out.extend_from_slice(&(d.len() as u64).to_le_bytes());
        }
        for d in &self.descriptors {
            out.extend_from_slice(d);
        }
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out
    }

    /// Parse the prelude of a metadata resource. Returns the table and the
    /// number of bytes consumed (including alignment padding).
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(WimError::InvalidSecurityData {
                detail: "security table shorter than its fixed fields".into(),
            });
        }
        let total = LittleEndian::read_u32(&data[0..4]) as usize;
        let count = LittleEndian::read_u32(&data[4..8]) as usize;
        if total < 8 + count * 8 || total > data.len() {
            return Err(WimError::InvalidSecurityData {
                detail: format!("security table length {total} inconsistent with count {count}"),
            });
        }

        let mut sizes = Vec::with_capacity(count);
        let mut pos = 8;
        for _ in 0..count {
            sizes.push(LittleEndian::read_u64(&data[pos..pos + 8]) as usize);
            pos += 8;
        }

        let mut table = Self::new();
        for (i, &size) in sizes.iter().enumerate() {
            if pos + size > total {
                return Err(WimError::InvalidSecurityData {
                    detail: format!("descriptor {i} overruns the security table"),
                });
            }
            let d = &data[pos..pos + size];
            table.descriptors.push(d.to_vec());
            table.by_hash.insert(sha1_of(d), i);
            pos += size;
        }
        if pos != total {
            return Err(WimError::InvalidSecurityData {
                detail: "trailing bytes inside the security table".into(),
            });
        }

        let consumed = total.next_multiple_of(8).min(data.len());
        Ok((table, consumed))
    }
}

// ── Descriptor fixup ─────────────────────────────────────────────────────────

struct SdView<'a> {
    raw: &'a [u8],
    owner: u32,
    group: u32,
    sacl: u32,
    dacl: u32,
}

impl<'a> SdView<'a> {
    fn parse(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < SD_HEADER_LEN {
            return Err(WimError::InvalidSecurityData {
                detail: "descriptor shorter than its header".into(),
            });
        }
        let view = Self {
            raw,
            owner: LittleEndian::read_u32(&raw[4..8]),
            group: LittleEndian::read_u32(&raw[8..12]),
            sacl: LittleEndian::read_u32(&raw[12..16]),
            dacl: LittleEndian::read_u32(&raw[16..20]),
        };
        for off in [view.owner, view.group, view.sacl, view.dacl] {
            if off != 0 && ((off as usize) < SD_HEADER_LEN || off as usize >= raw.len()) {
                return Err(WimError::InvalidSecurityData {
                    detail: "component offset out of bounds".into(),
                });
            }
        }
        Ok(view)
    }

    fn sid_len(&self, offset: u32) -> Result<usize> {
        let off = offset as usize;
        if off + 8 > self.raw.len() {
            return Err(WimError::InvalidSecurityData {
                detail: "SID offset out of bounds".into(),
            });
        }
        let sub_count = self.raw[off + 1] as usize;
        let len = 8 + 4 * sub_count;
        if off + len > self.raw.len() {
            return Err(WimError::InvalidSecurityData {
                detail: "SID overruns descriptor".into(),
            });
        }
        Ok(len)
    }

    fn acl_is_empty(&self, offset: u32) -> Result<bool> {
        let off = offset as usize;
        if off + ACL_HEADER_LEN > self.raw.len() {
            return Err(WimError::InvalidSecurityData {
                detail: "ACL offset out of bounds".into(),
            });
        }
        let acl_size = LittleEndian::read_u16(&self.raw[off + 2..off + 4]) as usize;
        let ace_count = LittleEndian::read_u16(&self.raw[off + 4..off + 6]);
        Ok(acl_size == ACL_HEADER_LEN && ace_count == 0)
    }
}

/// Rewrite a descriptor whose final component is an empty DACL or SACL by
/// relocating the owner (or group) SID to the tail. Returns the input
/// unchanged when no rewrite is needed or possible.
pub fn fixup_descriptor(raw: &[u8]) -> Result<Cow<'_, [u8]>> {
    let sd = SdView::parse(raw)?;

    // Which component sits last?
    let components = [sd.owner, sd.group, sd.sacl, sd.dacl];
    let last = components.iter().copied().max().unwrap_or(0);
    if last == 0 {
        return Ok(Cow::Borrowed(raw));
    }
    let last_is_empty_acl = (last == sd.dacl && sd.dacl != 0 && sd.acl_is_empty(sd.dacl)?)
        || (last == sd.sacl && sd.sacl != 0 && sd.acl_is_empty(sd.sacl)?);
    if !last_is_empty_acl {
        return Ok(Cow::Borrowed(raw));
    }

    // Prefer relocating the owner SID; fall back to the group SID. A SID
    // already at the tail is not relocatable.
    let (sid_offset, header_field) = if sd.owner != 0 && sd.owner != last {
        (sd.owner, 4usize)
    } else if sd.group != 0 && sd.group != last {
        (sd.group, 8usize)
    } else {
        return Ok(Cow::Borrowed(raw));
    };
    let sid_len = sd.sid_len(sid_offset)?;

    let mut out = raw.to_vec();
    let new_offset = out.len() as u32;
    out.extend_from_slice(&raw[sid_offset as usize..sid_offset as usize + sid_len]);
    LittleEndian::write_u32(&mut out[header_field..header_field + 4], new_offset);
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal self-relative descriptor: header, owner SID, group SID, then
    /// an (optionally empty) DACL last.
    fn build_sd(empty_dacl_last: bool) -> Vec<u8> {
        let mut d = vec![0u8; SD_HEADER_LEN];
        d[0] = 1; // revision
        LittleEndian::write_u16(&mut d[2..4], 0x8004); // SE_DACL_PRESENT | SE_SELF_RELATIVE

        // Owner SID: S-1-5-21-x-y (2 sub-authorities -> 16 bytes).
        let owner_off = d.len() as u32;
        d.extend_from_slice(&[1, 2, 0, 0, 0, 0, 0, 5]);
        d.extend_from_slice(&21u32.to_le_bytes());
        d.extend_from_slice(&1000u32.to_le_bytes());

        // Group SID: S-1-1-0 (1 sub-authority -> 12 bytes).
        let group_off = d.len() as u32;
        d.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 1]);
        d.extend_from_slice(&0u32.to_le_bytes());

        let dacl_off = d.len() as u32;
        if empty_dacl_last {
            // Empty ACL: 8-byte header, zero ACEs.
            d.extend_from_slice(&[2, 0, 8, 0, 0, 0, 0, 0]);
        }
        LittleEndian::write_u32(&mut d[4..8], owner_off);
        LittleEndian::write_u32(&mut d[8..12], group_off);
        if empty_dacl_last {
            LittleEndian::write_u32(&mut d[16..20], dacl_off);
        }
        d
    }

    #[test]
    fn intern_dedupes() {
        let mut t = SecurityTable::new();
        let a = build_sd(false);
        let b = build_sd(true);
        assert_eq!(t.intern(&a), 0);
        assert_eq!(t.intern(&b), 1);
        assert_eq!(t.intern(&a), 0);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn table_roundtrip() {
        let mut t = SecurityTable::new();
        t.intern(&build_sd(false));
        t.intern(&build_sd(true));
        let bytes = t.to_bytes();
        assert_eq!(bytes.len() % 8, 0);

        let (parsed, consumed) = SecurityTable::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(0), Some(&build_sd(false)[..]));
        assert_eq!(parsed.get(1), Some(&build_sd(true)[..]));
        assert_eq!(parsed.get(-1), None);
    }

    #[test]
    fn empty_table_is_eight_bytes_plus_nothing() {
        let t = SecurityTable::new();
        let bytes = t.to_bytes();
        let (parsed, consumed) = SecurityTable::from_bytes(&bytes).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(consumed, 8);
    }

    #[test]
    fn fixup_relocates_owner_before_trailing_empty_dacl() {
        let sd = build_sd(true);
        let fixed = fixup_descriptor(&sd).unwrap();
        let fixed = fixed.as_ref();
        assert_ne!(fixed, &sd[..]);
        // Owner offset now points at the tail copy.
        let owner_off = LittleEndian::read_u32(&fixed[4..8]) as usize;
        assert_eq!(owner_off, sd.len());
        assert_eq!(&fixed[owner_off..owner_off + 8], &[1, 2, 0, 0, 0, 0, 0, 5]);
        // Re-running the fixup leaves a SID at the tail: unchanged.
        let again = fixup_descriptor(fixed).unwrap();
        assert_eq!(again.as_ref(), fixed);
    }

    #[test]
    fn fixup_leaves_ordinary_descriptors_alone() {
        let sd = build_sd(false);
        let fixed = fixup_descriptor(&sd).unwrap();
        assert_eq!(fixed.as_ref(), &sd[..]);
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        assert!(fixup_descriptor(&[0u8; 4]).is_err());
        let mut sd = build_sd(true);
        // Point the owner SID outside the descriptor.
        LittleEndian::write_u32(&mut sd[4..8], 0xffff);
        assert!(fixup_descriptor(&sd).is_err());
    }
}
