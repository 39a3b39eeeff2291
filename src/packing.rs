//! Packing engine seam (spec.md §6): registered codecs keyed by a small
//! integer tag, each able to pack/unpack cleartext and to report whether a
//! given entry is unpackable by all users (needed for access/group files,
//! which must be readable without per-reader key material).
//!
//! The real system's codecs perform encryption, signing, and key-wrapping;
//! those crypto engines are out of scope here (spec.md §1). This module
//! provides the trait seam plus the one codec the directory core actually
//! drives itself: [`PlainWithIntegrity`], used for directory blocks, access
//! files, and group files (spec.md §4.3.1 precondition 4).

use thiserror::Error;

/// A registered codec tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PackTag(pub u8);

/// The fixed codec directory blocks, access files, and group files use.
pub const PLAIN_WITH_INTEGRITY: PackTag = PackTag(1);

#[derive(Debug, Error)]
pub enum PackError {
    #[error("corrupt block: {0}")]
    Corrupt(&'static str),
}

/// A registered packing codec.
///
/// Mirrors the `Pack`/`Unpack` seam of spec.md §6: `pack` produces the
/// on-store ciphertext (here, cleartext plus an integrity tag) for a
/// cleartext buffer; `unpack` is its inverse and validates the tag.
pub trait Packer: Send + Sync {
    fn tag(&self) -> PackTag;

    fn pack(&self, cleartext: &[u8]) -> Vec<u8>;

    fn unpack(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PackError>;

    /// `true` if any reader, regardless of keys, can unpack this data. Only
    /// [`PlainWithIntegrity`] answers `true`; this is what makes access and
    /// group files servable to the access evaluator without involving the
    /// key service.
    fn unpackable_by_all(&self) -> bool;
}

/// Plain bytes plus a checksum trailer, used for directory blocks and for
/// access/group files (which must be unpackable by all per spec.md §4.3.1).
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainWithIntegrity;

impl PlainWithIntegrity {
    fn checksum(data: &[u8]) -> u32 {
        // FNV-1a: cheap, stable, sufficient for an integrity trailer over an
        // already-trusted in-memory transport; the real system's signatures
        // live in the packing/crypto engines this crate does not implement.
        let mut hash: u32 = 0x811c9dc5;
        for &b in data {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x01000193);
        }
        hash
    }
}

impl Packer for PlainWithIntegrity {
    fn tag(&self) -> PackTag {
        PLAIN_WITH_INTEGRITY
    }

    fn pack(&self, cleartext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(cleartext.len() + 4);
        out.extend_from_slice(cleartext);
        out.extend_from_slice(&Self::checksum(cleartext).to_le_bytes());
        out
    }

    fn unpack(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PackError> {
        if ciphertext.len() < 4 {
            return Err(PackError::Corrupt("truncated integrity trailer"));
        }
        let split = ciphertext.len() - 4;
        let (body, trailer) = ciphertext.split_at(split);
        let want = u32::from_le_bytes(trailer.try_into().unwrap());
        if Self::checksum(body) != want {
            return Err(PackError::Corrupt("integrity mismatch"));
        }
        Ok(body.to_vec())
    }

    fn unpackable_by_all(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let p = PlainWithIntegrity;
        let packed = p.pack(b"hello");
        assert_eq!(p.unpack(&packed).unwrap(), b"hello");
    }

    #[test]
    fn detects_corruption() {
        let p = PlainWithIntegrity;
        let mut packed = p.pack(b"hello");
        *packed.last_mut().unwrap() ^= 0xff;
        assert!(p.unpack(&packed).is_err());
    }

    #[test]
    fn unpackable_by_all() {
        assert!(PlainWithIntegrity.unpackable_by_all());
    }
}
