// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mock flash device.
//!
//! A RAM-backed [`FlashDevice`] for exercising the block manager on a host.
//! It models NOR semantics closely enough to catch the mistakes that matter
//! (programming without erasing, programming the same word twice) and
//! records every operation so tests can check ordering. It makes no attempt
//! at realistic timing.

use drv_flash_api::{DeviceFault, FlashDevice};

/// Erased flash reads back as all ones.
pub const ERASED: u8 = 0xff;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Erase { start: u32, size: u32 },
    Program { addr: u32, word: u32 },
}

#[derive(Debug)]
pub struct MemFlash {
    base: u32,
    mem: Vec<u8>,
    ops: Vec<Op>,
    fail_erase_at: Option<u32>,
    fail_program_at: Option<u32>,
    corrupt_program_at: Option<u32>,
}

impl MemFlash {
    /// Creates `size` bytes of erased flash starting at `base`.
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            mem: vec![ERASED; size],
            ops: Vec::new(),
            fail_erase_at: None,
            fail_program_at: None,
            corrupt_program_at: None,
        }
    }

    /// Creates flash pre-loaded with `contents` (as if programmed by an
    /// earlier session), with an empty operation log.
    pub fn with_contents(base: u32, contents: &[u8]) -> Self {
        let mut flash = Self::new(base, contents.len());
        flash.mem.copy_from_slice(contents);
        flash
    }

    /// Current contents of `len` bytes at `addr`.
    pub fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        let off = self.offset(addr);
        &self.mem[off..off + len]
    }

    /// Overwrites memory directly, bypassing the operation log and NOR
    /// semantics. Useful for planting a corrupt image.
    pub fn poke(&mut self, addr: u32, data: &[u8]) {
        let off = self.offset(addr);
        self.mem[off..off + data.len()].copy_from_slice(data);
    }

    /// Every erase and program, in the order they were issued.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Addresses of programmed words, in programming order.
    pub fn programmed(&self) -> impl Iterator<Item = u32> + '_ {
        self.ops.iter().filter_map(|op| match op {
            Op::Program { addr, .. } => Some(*addr),
            Op::Erase { .. } => None,
        })
    }

    /// Sector start addresses that have been erased, in order.
    pub fn erased(&self) -> impl Iterator<Item = u32> + '_ {
        self.ops.iter().filter_map(|op| match op {
            Op::Erase { start, .. } => Some(*start),
            Op::Program { .. } => None,
        })
    }

    /// Makes the erase of the sector starting at `start` fail.
    pub fn fail_erase_at(&mut self, start: u32) {
        self.fail_erase_at = Some(start);
    }

    /// Makes programming the word at `addr` fail.
    pub fn fail_program_at(&mut self, addr: u32) {
        self.fail_program_at = Some(addr);
    }

    /// Makes programming the word at `addr` report success but store the
    /// wrong value.
    pub fn corrupt_program_at(&mut self, addr: u32) {
        self.corrupt_program_at = Some(addr);
    }

    fn offset(&self, addr: u32) -> usize {
        let off = addr
            .checked_sub(self.base)
            .unwrap_or_else(|| panic!("{addr:#x} is below flash"))
            as usize;
        assert!(off <= self.mem.len(), "{addr:#x} is above flash");
        off
    }
}

impl FlashDevice for MemFlash {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        buf.copy_from_slice(self.bytes(addr, buf.len()));
    }

    fn program_word(
        &mut self,
        addr: u32,
        word: u32,
    ) -> Result<(), DeviceFault> {
        assert_eq!(addr % 4, 0, "unaligned program at {addr:#x}");
        self.ops.push(Op::Program { addr, word });
        if self.fail_program_at == Some(addr) {
            return Err(DeviceFault);
        }

        let stored = if self.corrupt_program_at == Some(addr) {
            word ^ 1
        } else {
            word
        };
        let off = self.offset(addr);
        for (cell, b) in self.mem[off..off + 4]
            .iter_mut()
            .zip(stored.to_le_bytes())
        {
            // NOR flash can only clear bits.
            *cell &= b;
        }
        Ok(())
    }

    fn erase_sector(
        &mut self,
        start: u32,
        size: u32,
    ) -> Result<(), DeviceFault> {
        self.ops.push(Op::Erase { start, size });
        if self.fail_erase_at == Some(start) {
            return Err(DeviceFault);
        }
        let off = self.offset(start);
        self.mem[off..off + size as usize].fill(ERASED);
        Ok(())
    }
}
