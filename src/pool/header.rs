//! Self-describing slot header: the only record of which logical file a
//! pooled handle belongs to, so path association survives restarts without
//! an external index.
//!
//! Layout (big-endian u32 fields):
//!   bytes 0..512    null-terminated owning path (max 511 usable bytes)
//!   bytes 512..516  open flags
//!   bytes 516..524  digest, two u32 lanes over bytes 0..516
//! Data region starts at byte 4096 (one sector).

use thiserror::Error;

use crate::vfs::{OpenFlags, SECTOR_SIZE};

pub const HEADER_MAX_PATH_SIZE: usize = 512;
pub const HEADER_OFFSET_FLAGS: usize = HEADER_MAX_PATH_SIZE;
pub const HEADER_OFFSET_DIGEST: usize = HEADER_OFFSET_FLAGS + 4;
/// Digest input: path bytes + flag bytes, digest excluded.
pub const HEADER_CORPUS_SIZE: usize = HEADER_OFFSET_DIGEST;
pub const HEADER_SIZE: usize = HEADER_OFFSET_DIGEST + 8;
/// First data byte of every slot; everything before it is header.
pub const HEADER_OFFSET_DATA: u64 = SECTOR_SIZE as u64;

/// Digest of the all-zero corpus, i.e. an unassociated slot. Checked (and
/// written) explicitly so torn zero-writes cannot masquerade as a valid
/// association.
const EMPTY_DIGEST: [u32; 2] = [0xfecc_5f80, 0xacce_c037];

/// Two-lane multiplicative hash over the header corpus. Integrity check
/// against torn writes and bit rot, not a cryptographic digest.
pub fn compute_digest(corpus: &[u8]) -> [u32; 2] {
    debug_assert_eq!(corpus.len(), HEADER_CORPUS_SIZE);
    if corpus[0] == 0 {
        return EMPTY_DIGEST;
    }
    let mut h1: u32 = 0xdead_beef;
    let mut h2: u32 = 0x41c6_ce57;
    for &b in corpus {
        let v = (b as u32).wrapping_mul(307);
        h1 = h1.wrapping_mul(31).wrapping_add(v);
        h2 = h2.wrapping_mul(31).wrapping_add(v);
    }
    [h1, h2]
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header digest mismatch")]
    DigestMismatch,
    #[error("header path is not valid utf-8")]
    BadPath,
    #[error("path too long for slot header ({0} bytes, max 511)")]
    PathTooLong(usize),
}

/// Decoded association state of one slot header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotHeader {
    Unassociated,
    Associated { path: String, flags: OpenFlags },
}

impl SlotHeader {
    pub fn associated(path: &str, flags: OpenFlags) -> Result<Self, HeaderError> {
        if path.is_empty() || path.len() >= HEADER_MAX_PATH_SIZE {
            return Err(HeaderError::PathTooLong(path.len()));
        }
        Ok(SlotHeader::Associated {
            path: path.to_string(),
            flags,
        })
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], HeaderError> {
        let mut buf = [0u8; HEADER_SIZE];
        if let SlotHeader::Associated { path, flags } = self {
            let bytes = path.as_bytes();
            if bytes.is_empty() || bytes.len() >= HEADER_MAX_PATH_SIZE {
                return Err(HeaderError::PathTooLong(bytes.len()));
            }
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[HEADER_OFFSET_FLAGS..HEADER_OFFSET_DIGEST]
                .copy_from_slice(&flags.bits().to_be_bytes());
        }
        let digest = compute_digest(&buf[..HEADER_CORPUS_SIZE]);
        buf[HEADER_OFFSET_DIGEST..HEADER_OFFSET_DIGEST + 4]
            .copy_from_slice(&digest[0].to_be_bytes());
        buf[HEADER_OFFSET_DIGEST + 4..HEADER_SIZE].copy_from_slice(&digest[1].to_be_bytes());
        Ok(buf)
    }

    /// Decode and verify. Digest mismatch means the slot is corrupted and
    /// must be reset by the caller; it is never a valid association.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        let stored = [
            u32::from_be_bytes(buf[HEADER_OFFSET_DIGEST..HEADER_OFFSET_DIGEST + 4].try_into().expect("digest lane")),
            u32::from_be_bytes(buf[HEADER_OFFSET_DIGEST + 4..HEADER_SIZE].try_into().expect("digest lane")),
        ];
        if stored != compute_digest(&buf[..HEADER_CORPUS_SIZE]) {
            return Err(HeaderError::DigestMismatch);
        }
        let path_len = buf[..HEADER_MAX_PATH_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HEADER_MAX_PATH_SIZE);
        if path_len == 0 {
            return Ok(SlotHeader::Unassociated);
        }
        let path =
            std::str::from_utf8(&buf[..path_len]).map_err(|_| HeaderError::BadPath)?;
        let flags = u32::from_be_bytes(
            buf[HEADER_OFFSET_FLAGS..HEADER_OFFSET_DIGEST]
                .try_into()
                .expect("flag bytes"),
        );
        Ok(SlotHeader::Associated {
            path: path.to_string(),
            flags: OpenFlags::from_bits_retain(flags),
        })
    }
}
