// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader flash block manager.
//!
//! Firmware updates arrive as a stream of small, arbitrarily addressed
//! writes. Flash wants to be programmed in larger aligned units, and each
//! unit only once per erase. This crate sits between the two: writes are
//! merged into a write-block sized buffer (seeded from the current flash
//! contents, so bytes nobody wrote keep their old value) and the buffer is
//! programmed when a write moves on to a different block, or when the
//! session ends.
//!
//! # The boot block
//!
//! The first write-block of the user program holds its vector table and the
//! signature checksum slot. It gets its own buffer, which is _not_ flushed
//! when writes move elsewhere. It's only programmed in
//! [`FlashBlockManager::done`], after
//! [`FlashBlockManager::write_checksum`] has computed a checksum over its
//! final contents. A session that dies before that point leaves the old
//! checksum in place. A session that dies after the vectors were erased but
//! before `done` leaves an image that fails
//! [`FlashBlockManager::verify_checksum`], and the bootloader stays resident.
//!
//! # Ownership
//!
//! Everything here is synchronous and single-threaded. The manager owns the
//! device and every hook installed on it, and there's no way to start a
//! second flash operation while one is outstanding because every operation
//! takes `&mut self`.

#![cfg_attr(not(test), no_std)]

pub mod checksum;

use checksum::{VectorSignature, VECTOR_BYTES};
use core::ops::RangeInclusive;
use drv_flash_api::{
    BlockDecrypt, ChecksumHook, FlashDevice, FlashError, FlashLayout,
    NoDecrypt, NoWatchdog, VerifyPolicy, Watchdog,
};
use ringbuf::{ringbuf, ringbuf_entry};
use static_assertions::const_assert;

/// Default granularity at which writes are batched before programming.
pub const WRITE_BLOCK_SIZE: usize = 1024;

/// Default offset of the checksum word within the boot block.
pub const CHECKSUM_OFFSET: u32 = 0x3f8;

/// Flash is programmed one little-endian word at a time.
const WORD: usize = 4;

const_assert!(CHECKSUM_OFFSET as usize >= VECTOR_BYTES);
const_assert!(CHECKSUM_OFFSET as usize + WORD <= WRITE_BLOCK_SIZE);
const_assert!(WRITE_BLOCK_SIZE % WORD == 0);

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Reinit,
    OutOfRange { addr: u32, len: usize },
    Erase { sector: u8, start: u32 },
    EraseFailed { sector: u8 },
    Switch { from: u32, to: u32 },
    Load { base: u32, boot: bool },
    Program { base: u32 },
    DecryptFailed { base: u32 },
    ProgramFailed { addr: u32 },
    VerifyMismatch { addr: u32, expected: u32, actual: u32 },
    Checksum(u32),
    ChecksumFailed,
    Done,
}

// Unit tests share one ring across threads, so give them room.
const TRACE_DEPTH: usize = if cfg!(test) { 512 } else { 32 };

ringbuf!(Trace, TRACE_DEPTH, Trace::None);

/// Build-time configuration that isn't part of the layout table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockConfig {
    /// Offset of the checksum word from the start of the first sector. Must
    /// be word aligned, clear of the checksummed vectors, and inside the
    /// first write-block.
    pub checksum_offset: u32,
    pub verify: VerifyPolicy,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            checksum_offset: CHECKSUM_OFFSET,
            verify: VerifyPolicy::Fatal,
        }
    }
}

/// A write-block's worth of pending data.
struct Block<const N: usize> {
    base: u32,
    data: [u8; N],
    /// Set once the decryption hook has run over `data`, so the boot block
    /// (decrypted early, for its checksum) isn't decrypted twice.
    decrypted: bool,
}

impl<const N: usize> Block<N> {
    /// Starts a block at `base` with the current flash contents.
    fn read(device: &impl FlashDevice, base: u32) -> Self {
        let mut data = [0; N];
        device.read(base, &mut data);
        Self {
            base,
            data,
            decrypted: false,
        }
    }
}

/// The collaborators that touch hardware, kept apart from the block buffers
/// so that a buffer can be programmed while borrowed out of its slot.
struct Hardware<D, W, C> {
    device: D,
    watchdog: W,
    decrypt: C,
}

impl<D: FlashDevice, W: Watchdog, C: BlockDecrypt> Hardware<D, W, C> {
    fn decrypt<const N: usize>(
        &mut self,
        block: &mut Block<N>,
    ) -> Result<(), FlashError> {
        if !block.decrypted {
            self.decrypt
                .decrypt(block.base, &mut block.data)
                .map_err(|_| {
                    ringbuf_entry!(Trace::DecryptFailed { base: block.base });
                    FlashError::DecryptFailed
                })?;
            block.decrypted = true;
        }
        Ok(())
    }

    fn program<const N: usize>(
        &mut self,
        block: &mut Block<N>,
        verify: VerifyPolicy,
    ) -> Result<(), FlashError> {
        ringbuf_entry!(Trace::Program { base: block.base });
        self.decrypt(block)?;

        for (i, chunk) in block.data.chunks_exact(WORD).enumerate() {
            self.watchdog.service();

            // The block lies inside the layout, so this can't wrap.
            let addr = block.base + (i * WORD) as u32;
            let expected =
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.device.program_word(addr, expected).map_err(|_| {
                ringbuf_entry!(Trace::ProgramFailed { addr });
                FlashError::ProgramFailed
            })?;

            let mut readback = [0; WORD];
            self.device.read(addr, &mut readback);
            let actual = u32::from_le_bytes(readback);
            if actual != expected {
                ringbuf_entry!(Trace::VerifyMismatch {
                    addr,
                    expected,
                    actual
                });
                if verify == VerifyPolicy::Fatal {
                    return Err(FlashError::VerifyMismatch);
                }
            }
        }
        Ok(())
    }
}

/// Coalesces writes into write-blocks of `BLOCK` bytes and commits them to
/// the flash described by a [`FlashLayout`].
pub struct FlashBlockManager<
    'a,
    D,
    W = NoWatchdog,
    C = NoDecrypt,
    S = VectorSignature,
    const BLOCK: usize = WRITE_BLOCK_SIZE,
> {
    layout: FlashLayout<'a>,
    config: BlockConfig,
    hw: Hardware<D, W, C>,
    checksum: S,
    /// The block currently collecting writes anywhere but the boot block.
    generic: Option<Block<BLOCK>>,
    /// The first write-block of the user program, held until `done`.
    boot: Option<Block<BLOCK>>,
}

impl<'a, D: FlashDevice, const BLOCK: usize>
    FlashBlockManager<'a, D, NoWatchdog, NoDecrypt, VectorSignature, BLOCK>
{
    /// Creates a manager with both block buffers empty.
    ///
    /// Fails with [`FlashError::Misaligned`] if `BLOCK` isn't a whole number
    /// of program words, if the layout doesn't start and end on a `BLOCK`
    /// boundary, or if the checksum slot doesn't fit in the boot block.
    pub fn new(
        layout: FlashLayout<'a>,
        device: D,
        config: BlockConfig,
    ) -> Result<Self, FlashError> {
        let block = BLOCK as u64;
        let offset = config.checksum_offset as usize;
        if BLOCK == 0
            || BLOCK % WORD != 0
            || u64::from(layout.start()) % block != 0
            || (u64::from(layout.end()) + 1) % block != 0
            || offset % WORD != 0
            || offset < VECTOR_BYTES
            || offset + WORD > BLOCK
        {
            return Err(FlashError::Misaligned);
        }

        Ok(Self {
            layout,
            config,
            hw: Hardware {
                device,
                watchdog: NoWatchdog,
                decrypt: NoDecrypt,
            },
            checksum: VectorSignature,
            generic: None,
            boot: None,
        })
    }
}

impl<'a, D, W, C, S, const BLOCK: usize>
    FlashBlockManager<'a, D, W, C, S, BLOCK>
where
    D: FlashDevice,
    W: Watchdog,
    C: BlockDecrypt,
    S: ChecksumHook,
{
    /// Replaces the keep-alive hook serviced during long loops.
    pub fn with_watchdog<W2: Watchdog>(
        self,
        watchdog: W2,
    ) -> FlashBlockManager<'a, D, W2, C, S, BLOCK> {
        FlashBlockManager {
            layout: self.layout,
            config: self.config,
            hw: Hardware {
                device: self.hw.device,
                watchdog,
                decrypt: self.hw.decrypt,
            },
            checksum: self.checksum,
            generic: self.generic,
            boot: self.boot,
        }
    }

    /// Installs a hook that decrypts each write-block before it is
    /// programmed.
    pub fn with_decrypt<C2: BlockDecrypt>(
        self,
        decrypt: C2,
    ) -> FlashBlockManager<'a, D, W, C2, S, BLOCK> {
        FlashBlockManager {
            layout: self.layout,
            config: self.config,
            hw: Hardware {
                device: self.hw.device,
                watchdog: self.hw.watchdog,
                decrypt,
            },
            checksum: self.checksum,
            generic: self.generic,
            boot: self.boot,
        }
    }

    /// Replaces the vector table signature with a target-specific one.
    pub fn with_checksum<S2: ChecksumHook>(
        self,
        checksum: S2,
    ) -> FlashBlockManager<'a, D, W, C, S2, BLOCK> {
        FlashBlockManager {
            layout: self.layout,
            config: self.config,
            hw: self.hw,
            checksum,
            generic: self.generic,
            boot: self.boot,
        }
    }

    /// Drops any buffered data without programming it.
    pub fn reinit(&mut self) {
        ringbuf_entry!(Trace::Reinit);
        self.generic = None;
        self.boot = None;
    }

    pub fn device(&self) -> &D {
        &self.hw.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.hw.device
    }

    pub fn into_device(self) -> D {
        self.hw.device
    }

    /// The lowest address available to the user program. Everything below
    /// it belongs to the bootloader.
    pub fn user_prog_base(&self) -> u32 {
        self.layout.start()
    }

    /// Whether there is unprogrammed data buffered for the boot block.
    pub fn boot_block_pending(&self) -> bool {
        self.boot.is_some()
    }

    /// Base of the generic block currently collecting writes, if any.
    pub fn pending_block(&self) -> Option<u32> {
        self.generic.as_ref().map(|b| b.base)
    }

    fn check(
        &self,
        addr: u32,
        len: usize,
    ) -> Result<RangeInclusive<usize>, FlashError> {
        self.layout.check_range(addr, len).map_err(|e| {
            ringbuf_entry!(Trace::OutOfRange { addr, len });
            e
        })
    }

    fn block_base(addr: u32) -> u32 {
        addr - addr % BLOCK as u32
    }

    /// Erases every sector touched by `len` bytes starting at `addr`.
    ///
    /// The first sector that fails to erase aborts the call; sectors before
    /// it stay erased.
    pub fn erase(&mut self, addr: u32, len: usize) -> Result<(), FlashError> {
        let sectors = self.check(addr, len)?;

        for sector in &self.layout.sectors()[sectors] {
            self.hw.watchdog.service();
            ringbuf_entry!(Trace::Erase {
                sector: sector.number,
                start: sector.start
            });
            self.hw
                .device
                .erase_sector(sector.start, sector.size)
                .map_err(|_| {
                    ringbuf_entry!(Trace::EraseFailed {
                        sector: sector.number
                    });
                    FlashError::EraseFailed
                })?;
        }
        Ok(())
    }

    /// Buffers `data` for programming at `addr`.
    ///
    /// Data for the boot block is held until [`Self::done`]. Data for any
    /// other block is held until a write lands in a different block, at
    /// which point the buffered block is programmed first. A write that
    /// straddles a block boundary is split across both.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check(addr, data.len())?;

        let mut base = Self::block_base(addr);
        let mut offset = (addr - base) as usize;
        let mut remaining = data;
        loop {
            self.hw.watchdog.service();

            let block = self.load(base)?;
            let n = usize::min(remaining.len(), BLOCK - offset);
            block.data[offset..][..n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];

            if remaining.is_empty() {
                return Ok(());
            }
            // Bytes remain, so `check` has already placed the next block
            // inside the layout.
            base += BLOCK as u32;
            offset = 0;
        }
    }

    /// Returns the buffer for the block at `base`, switching blocks if
    /// needed.
    ///
    /// The boot block and the generic block live in separate slots, so
    /// moving between them never flushes anything. Moving the generic slot
    /// to a new block programs whatever it held.
    fn load(&mut self, base: u32) -> Result<&mut Block<BLOCK>, FlashError> {
        let boot = base == self.layout.start();
        let slot = if boot { &mut self.boot } else { &mut self.generic };

        let cached = matches!(slot, Some(b) if b.base == base);
        if !cached {
            if let Some(mut old) = slot.take() {
                ringbuf_entry!(Trace::Switch {
                    from: old.base,
                    to: base
                });
                if let Err(e) = self.hw.program(&mut old, self.config.verify) {
                    *slot = Some(old);
                    return Err(e);
                }
            }
            ringbuf_entry!(Trace::Load { base, boot });
        }

        let device = &self.hw.device;
        Ok(slot.get_or_insert_with(|| Block::read(device, base)))
    }

    /// Signs the buffered boot block with the checksum hook and writes the
    /// result into the checksum slot.
    ///
    /// Does nothing if the boot block wasn't written this session: the
    /// vectors in flash are whatever they were, and so is their checksum.
    pub fn write_checksum(&mut self) -> Result<(), FlashError> {
        let Some(boot) = self.boot.as_mut() else {
            return Ok(());
        };

        // The checksum has to cover the plaintext vectors.
        self.hw.decrypt(boot)?;

        let signature = self.checksum.signature(&boot.data).map_err(|_| {
            ringbuf_entry!(Trace::ChecksumFailed);
            FlashError::ChecksumFailed
        })?;
        ringbuf_entry!(Trace::Checksum(signature));

        let addr = self.layout.start() + self.config.checksum_offset;
        self.write(addr, &signature.to_le_bytes())
    }

    /// Checks the vectors and checksum currently in flash (not in any
    /// buffer).
    pub fn verify_checksum(&self) -> bool {
        let mut boot = [0; BLOCK];
        self.hw.device.read(self.layout.start(), &mut boot);

        // `new` keeps the slot word aligned and inside the block.
        let slot = self.config.checksum_offset as usize;
        let checksum = u32::from_le_bytes([
            boot[slot],
            boot[slot + 1],
            boot[slot + 2],
            boot[slot + 3],
        ]);
        self.checksum.verify(&boot, checksum)
    }

    /// Programs everything still buffered, boot block first.
    ///
    /// A block is only released once it has been programmed; on failure it
    /// stays buffered and the error is returned.
    pub fn done(&mut self) -> Result<(), FlashError> {
        let verify = self.config.verify;
        for slot in [&mut self.boot, &mut self.generic] {
            if let Some(block) = slot.as_mut() {
                self.hw.program(block, verify)?;
                *slot = None;
            }
        }
        ringbuf_entry!(Trace::Done);
        Ok(())
    }
}
