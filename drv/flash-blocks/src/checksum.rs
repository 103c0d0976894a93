// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image signature checksum.
//!
//! The bootloader decides whether there is a runnable user program by
//! summing the first seven words of its vector table together with a
//! checksum word stored later in the same write-block. The checksum is the
//! two's complement of the seven-word sum, so the total is zero exactly when
//! the vectors are the ones the checksum was computed over.
//!
//! [`VectorSignature`] is the default [`ChecksumHook`]. Targets with their
//! own signing scheme install a different one with
//! [`crate::FlashBlockManager::with_checksum`].

use drv_flash_api::{ChecksumHook, DeviceFault};
use zerocopy::byteorder::little_endian as le;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// Vector table entries covered by the checksum.
pub const VECTOR_WORDS: usize = 7;

/// Size in bytes of the checksummed part of the vector table.
pub const VECTOR_BYTES: usize = VECTOR_WORDS * 4;

/// The checksummed head of a user program's vector table.
#[derive(Copy, Clone, Debug, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct VectorHead {
    pub words: [le::U32; VECTOR_WORDS],
}

impl VectorHead {
    /// Reads the vector head from the start of `bytes`, which must hold at
    /// least [`VECTOR_BYTES`].
    pub fn read(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(head, _rest)| head)
    }

    /// Wrapping sum of the vector words.
    pub fn sum(&self) -> u32 {
        self.words
            .iter()
            .fold(0u32, |acc, w| acc.wrapping_add(w.get()))
    }

    /// The checksum word that makes this vector head valid.
    pub fn signature(&self) -> u32 {
        self.sum().wrapping_neg()
    }

    /// Checks `checksum` against this vector head.
    pub fn is_signed_by(&self, checksum: u32) -> bool {
        self.sum().wrapping_add(checksum) == 0
    }
}

/// Seven-word vector table signature.
#[derive(Copy, Clone, Debug, Default)]
pub struct VectorSignature;

impl ChecksumHook for VectorSignature {
    fn signature(&mut self, boot: &[u8]) -> Result<u32, DeviceFault> {
        VectorHead::read(boot)
            .map(|head| head.signature())
            .ok_or(DeviceFault)
    }

    fn verify(&self, boot: &[u8], checksum: u32) -> bool {
        VectorHead::read(boot).is_some_and(|head| head.is_signed_by(checksum))
    }
}
