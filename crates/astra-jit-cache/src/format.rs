//! On-disk layout of the translation cache and profile files.
//!
//! Both files share the same outer envelope: the whole payload is prefixed
//! with a 16-byte xxh3-128 digest of every byte after the digest, then the
//! digest+payload is deflate-compressed at the fastest setting. The cache
//! payload is `header ++ entry-info segment ++ code segment ++ relocation
//! segment ++ jump-table snapshot`; the profile payload is a flat record
//! array. Any mismatch on read (digest, magic, version, feature flags,
//! segment lengths) invalidates the file rather than failing the caller.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use xxhash_rust::xxh3::xxh3_128;

use crate::error::{CacheError, Result};
use crate::io::{ReadLeExt, WriteLeExt};

pub const CACHE_MAGIC: &[u8; 8] = b"ASTRAJTC";
pub const CACHE_VERSION: u32 = 1;

pub const PROFILE_MAGIC: &[u8; 8] = b"ASTRAPRF";
pub const PROFILE_VERSION: u32 = 1;

/// xxh3-128 digest prefix length.
pub const DIGEST_SIZE: usize = 16;

/// `magic + version + feature flags + three segment lengths`.
pub const HEADER_SIZE: usize = 8 + 4 + 8 + 4 + 4 + 4;

/// Fixed-width per-function record: `address u64 + quality u8 + code length
/// u32 + relocation count u32`.
pub const ENTRY_INFO_SIZE: usize = 17;

/// Leading header of the cache payload. Fully determines whether a loaded
/// cache is usable on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    /// Host CPU capability bits the cached code was compiled against.
    pub feature_flags: u64,
    pub infos_len: u32,
    pub code_len: u32,
    pub relocs_len: u32,
}

impl CacheHeader {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_bytes(CACHE_MAGIC)?;
        w.write_i32_le(CACHE_VERSION as i32)?;
        w.write_u64_le(self.feature_flags)?;
        w.write_i32_le(self.infos_len as i32)?;
        w.write_i32_le(self.code_len as i32)?;
        w.write_i32_le(self.relocs_len as i32)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != CACHE_MAGIC {
            return Err(CacheError::InvalidMagic);
        }
        let version = r.read_i32_le()? as u32;
        if version != CACHE_VERSION {
            return Err(CacheError::UnsupportedVersion(version));
        }
        let feature_flags = r.read_u64_le()?;
        let infos_len = read_segment_len(r)?;
        let code_len = read_segment_len(r)?;
        let relocs_len = read_segment_len(r)?;
        Ok(Self {
            feature_flags,
            infos_len,
            code_len,
            relocs_len,
        })
    }
}

fn read_segment_len<R: Read>(r: &mut R) -> Result<u32> {
    let len = r.read_i32_le()?;
    u32::try_from(len).map_err(|_| CacheError::Corrupt("negative segment length"))
}

/// One cached function, in append order. The record order matches the order
/// of the function's bytes in the code segment and of its relocations in the
/// relocation segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub address: u64,
    pub high_quality: bool,
    pub code_len: u32,
    pub reloc_count: u32,
}

impl EntryInfo {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.address)?;
        w.write_u8(self.high_quality as u8)?;
        w.write_u32_le(self.code_len)?;
        w.write_u32_le(self.reloc_count)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let address = r.read_u64_le()?;
        let high_quality = match r.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(CacheError::Corrupt("invalid quality flag")),
        };
        let code_len = r.read_u32_le()?;
        let reloc_count = r.read_u32_le()?;
        Ok(Self {
            address,
            high_quality,
            code_len,
            reloc_count,
        })
    }
}

/// Digest-prefix and compress a payload for writing.
pub fn seal_envelope(payload: &[u8]) -> Result<Vec<u8>> {
    let digest = xxh3_128(payload).to_le_bytes();
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(DIGEST_SIZE + payload.len() / 2),
        Compression::fast(),
    );
    encoder.write_all(&digest)?;
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Decompress a file image and verify its digest prefix, returning the
/// payload bytes after the digest.
pub fn open_envelope(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    DeflateDecoder::new(compressed)
        .read_to_end(&mut raw)
        .map_err(|_| CacheError::Corrupt("deflate stream"))?;
    if raw.len() < DIGEST_SIZE {
        return Err(CacheError::Corrupt("payload shorter than digest"));
    }
    let (digest, payload) = raw.split_at(DIGEST_SIZE);
    if xxh3_128(payload).to_le_bytes() != digest {
        return Err(CacheError::DigestMismatch);
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let header = CacheHeader {
            feature_flags: 0x0000_0001_8000_0042,
            infos_len: 34,
            code_len: 4096,
            relocs_len: 26,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(CacheHeader::decode(&mut Cursor::new(&buf)).unwrap(), header);
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let header = CacheHeader {
            feature_flags: 0,
            infos_len: 0,
            code_len: 0,
            relocs_len: 0,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            CacheHeader::decode(&mut Cursor::new(&bad_magic)),
            Err(CacheError::InvalidMagic)
        ));

        let mut bad_version = buf.clone();
        bad_version[8] = 99;
        assert!(matches!(
            CacheHeader::decode(&mut Cursor::new(&bad_version)),
            Err(CacheError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn entry_info_is_fixed_width() {
        let info = EntryInfo {
            address: 0x8000_1000,
            high_quality: true,
            code_len: 128,
            reloc_count: 3,
        };
        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), ENTRY_INFO_SIZE);
        assert_eq!(EntryInfo::decode(&mut Cursor::new(&buf)).unwrap(), info);
    }

    #[test]
    fn seal_open_round_trip() {
        let payload = b"the quick brown fox".repeat(50);
        let sealed = seal_envelope(&payload).unwrap();
        assert_eq!(open_envelope(&sealed).unwrap(), payload);
    }

    #[test]
    fn open_detects_flipped_payload_byte() {
        let sealed = seal_envelope(b"some cached machine code").unwrap();
        let mut raw = Vec::new();
        DeflateDecoder::new(sealed.as_slice())
            .read_to_end(&mut raw)
            .unwrap();
        // Flip a payload byte past the digest, then recompress without
        // fixing the digest up.
        raw[DIGEST_SIZE + 3] ^= 0x40;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&raw).unwrap();
        let resealed = encoder.finish().unwrap();
        assert!(matches!(open_envelope(&resealed), Err(CacheError::DigestMismatch)));
    }
}
