//! # Pluggable Encryption Capability
//!
//! Cipher implementations are outside the core; the codec and heap only
//! depend on the [`Encryptor`] contract. When no encryptor is configured the
//! database runs in plaintext mode and the padding/encryption steps are
//! no-ops.
//!
//! Text content is zero-padded up to the cipher's block size before
//! `encrypt` runs, and truncated back after `decrypt`. The schema layer
//! rounds string field widths up to a block multiple when an encryptor is
//! active so ciphertext always fits the fixed record slot.

use eyre::Result;

/// Block-cipher capability. Implementations must encrypt/decrypt in place
/// over buffers whose length is a multiple of the block size.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, buf: &mut [u8]) -> Result<()>;
    fn decrypt(&self, buf: &mut [u8]) -> Result<()>;
    fn block_size_bits(&self) -> usize;
}

/// Block size in bytes for an encryptor.
pub fn block_len(enc: &dyn Encryptor) -> usize {
    (enc.block_size_bits() / 8).max(1)
}

/// Rounds `len` up to the next multiple of `block`.
pub fn align_to_block(len: usize, block: usize) -> usize {
    if block <= 1 {
        return len;
    }
    len.div_ceil(block) * block
}
