//! SHA3-256d hash writer.
//!
//! Identifiers are computed by streaming a canonical little-endian
//! serialization into `HashWriter` and finalizing it twice through
//! SHA3-256. Variable length fields are prefixed with a compact size.

use sha3::{Digest, Sha3_256};

use crate::types::Hash256;

/// Incremental writer producing a `Hash256`.
#[derive(Clone, Default)]
pub struct HashWriter {
    inner: Sha3_256,
}

impl HashWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Sha3_256::new() }
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(bytes);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.write(&[v])
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn write_hash(&mut self, h: &Hash256) -> &mut Self {
        self.write(h.as_bytes())
    }

    /// Bitcoin-style compact size prefix.
    pub fn write_compact_size(&mut self, n: u64) -> &mut Self {
        if n < 0xfd {
            self.write_u8(n as u8)
        } else if n <= 0xffff {
            self.write_u8(0xfd);
            self.write(&(n as u16).to_le_bytes())
        } else if n <= 0xffff_ffff {
            self.write_u8(0xfe);
            self.write_u32(n as u32)
        } else {
            self.write_u8(0xff);
            self.write_u64(n)
        }
    }

    /// Length-prefixed byte string.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_compact_size(bytes.len() as u64);
        self.write(bytes)
    }

    #[must_use]
    pub fn finalize(self) -> Hash256 {
        let first = self.inner.finalize();
        let second = Sha3_256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Hash256(out)
    }
}

/// One-shot SHA3-256d of `data`.
#[must_use]
pub fn hash256(data: &[u8]) -> Hash256 {
    let mut w = HashWriter::new();
    w.write(data);
    w.finalize()
}
