// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the bootloader flash block manager.
//!
//! This holds the pieces shared between the block manager and the things it
//! talks to: the flash layout table, the error codes, and the collaborator
//! traits a target implements to plug in its flash controller, its watchdog,
//! and (optionally) an at-rest decryption step or its own image signature.

#![no_std]

use core::ops::RangeInclusive;
use num_derive::FromPrimitive;

/// Errors that can be produced by the flash block manager.
///
/// These are deliberately fieldless so they fit in a register; the
/// addresses involved are recorded in the block manager's trace ringbuf.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum FlashError {
    /// The requested range is not entirely inside the layout table. This
    /// includes anything touching the bootloader's own region.
    OutOfRange = 1,
    EraseFailed,
    ProgramFailed,
    /// A programmed word did not read back as written.
    VerifyMismatch,
    DecryptFailed,
    /// A block base or write size that doesn't line up with the write-block
    /// or program-word granularity.
    Misaligned,
    /// The checksum hook couldn't sign the boot block.
    ChecksumFailed,
}

impl From<FlashError> for u32 {
    fn from(e: FlashError) -> Self {
        e as u32
    }
}

impl FlashError {
    pub fn from_code(code: u32) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(code)
    }
}

/// Opaque failure from the device-specific erase/program primitives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceFault;

/// One physical erase sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashSector {
    pub start: u32,
    pub size: u32,
    /// Hardware sector number, as the flash controller knows it.
    pub number: u8,
}

impl FlashSector {
    pub const fn new(start: u32, size: u32, number: u8) -> Self {
        Self {
            start,
            size,
            number,
        }
    }

    /// Last address inside this sector.
    pub const fn end(&self) -> u32 {
        self.start + (self.size - 1)
    }

    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayoutError {
    Empty,
    ZeroSizedSector { index: usize },
    /// Sector `index` doesn't begin where sector `index - 1` ends.
    NotContiguous { index: usize },
    /// Sector `index` runs off the end of the 32-bit address space.
    Overflow { index: usize },
}

/// The programmable flash, as an ordered table of erase sectors.
///
/// Everything below the first sector belongs to the bootloader; everything
/// above the last doesn't exist. Both are off limits to erase and write.
#[derive(Copy, Clone, Debug)]
pub struct FlashLayout<'a> {
    sectors: &'a [FlashSector],
}

impl<'a> FlashLayout<'a> {
    /// Checks that `sectors` is non-empty, contiguous, and strictly
    /// increasing. This is `const` so that a layout table can be checked at
    /// compile time:
    ///
    /// ```
    /// use drv_flash_api::{FlashLayout, FlashSector};
    ///
    /// const SECTORS: [FlashSector; 2] = [
    ///     FlashSector::new(0x4000, 0x800, 8),
    ///     FlashSector::new(0x4800, 0x800, 9),
    /// ];
    ///
    /// const LAYOUT: FlashLayout<'static> = match FlashLayout::new(&SECTORS) {
    ///     Ok(layout) => layout,
    ///     Err(_) => panic!("bad flash layout"),
    /// };
    /// assert_eq!(LAYOUT.end(), 0x4fff);
    /// ```
    pub const fn new(sectors: &'a [FlashSector]) -> Result<Self, LayoutError> {
        if sectors.is_empty() {
            return Err(LayoutError::Empty);
        }

        let mut i = 0;
        while i < sectors.len() {
            let s = &sectors[i];
            if s.size == 0 {
                return Err(LayoutError::ZeroSizedSector { index: i });
            }
            if s.start.checked_add(s.size - 1).is_none() {
                return Err(LayoutError::Overflow { index: i });
            }
            if i > 0 {
                let prev = &sectors[i - 1];
                if prev.end() as u64 + 1 != s.start as u64 {
                    return Err(LayoutError::NotContiguous { index: i });
                }
            }
            i += 1;
        }

        Ok(Self { sectors })
    }

    pub fn sectors(&self) -> &'a [FlashSector] {
        self.sectors
    }

    /// The lowest address available to the user program.
    pub const fn start(&self) -> u32 {
        self.sectors[0].start
    }

    /// The last programmable address (inclusive).
    pub const fn end(&self) -> u32 {
        self.sectors[self.sectors.len() - 1].end()
    }

    /// Finds the index of the sector containing `addr`.
    pub fn sector_index(&self, addr: u32) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains(addr))
    }

    /// Validates a `len`-byte access starting at `addr`, returning the
    /// inclusive range of sector indices it covers.
    ///
    /// A zero length is rejected, as is any range whose last byte would lie
    /// past [`FlashLayout::end`] (including ranges that would wrap the
    /// address space).
    pub fn check_range(
        &self,
        addr: u32,
        len: usize,
    ) -> Result<RangeInclusive<usize>, FlashError> {
        let last_offset =
            u32::try_from(len.checked_sub(1).ok_or(FlashError::OutOfRange)?)
                .map_err(|_| FlashError::OutOfRange)?;
        if addr > self.end() || last_offset > self.end() - addr {
            return Err(FlashError::OutOfRange);
        }

        let first = self.sector_index(addr).ok_or(FlashError::OutOfRange)?;
        let last = self
            .sector_index(addr + last_offset)
            .ok_or(FlashError::OutOfRange)?;
        Ok(first..=last)
    }
}

/// Device-specific flash primitives.
///
/// Implementations are expected to block until the operation is finished;
/// the block manager never has more than one outstanding.
pub trait FlashDevice {
    /// Copies the current contents of flash at `addr` into `buf`.
    fn read(&self, addr: u32, buf: &mut [u8]);

    /// Programs one 32-bit word. `addr` is word aligned and inside a sector
    /// that has been erased since it was last programmed.
    fn program_word(&mut self, addr: u32, word: u32) -> Result<(), DeviceFault>;

    /// Erases the sector spanning `size` bytes from `start`.
    fn erase_sector(&mut self, start: u32, size: u32)
        -> Result<(), DeviceFault>;
}

/// Keep-alive hook, serviced from inside every loop whose duration scales
/// with the amount of data being erased or programmed.
pub trait Watchdog {
    fn service(&mut self);
}

impl<F: FnMut()> Watchdog for F {
    fn service(&mut self) {
        self()
    }
}

/// For targets (and hosts) without a watchdog.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn service(&mut self) {}
}

/// Optional at-rest decryption, applied to a complete write-block just
/// before it is programmed.
pub trait BlockDecrypt {
    fn decrypt(&mut self, base: u32, data: &mut [u8])
        -> Result<(), DeviceFault>;
}

/// Data is programmed as received.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoDecrypt;

impl BlockDecrypt for NoDecrypt {
    fn decrypt(
        &mut self,
        _base: u32,
        _data: &mut [u8],
    ) -> Result<(), DeviceFault> {
        Ok(())
    }
}

/// Signs the user program so the bootloader can tell whether it's safe to
/// start.
///
/// Both methods are handed the first write-block of the user program. When
/// signing, that's the plaintext about to be programmed; when checking, it's
/// what is currently in flash, checksum slot included. The default signature
/// lives in `drv-flash-blocks`.
pub trait ChecksumHook {
    /// The word to store in the checksum slot.
    fn signature(&mut self, boot: &[u8]) -> Result<u32, DeviceFault>;

    /// Whether `checksum` is a valid signature for `boot`.
    fn verify(&self, boot: &[u8], checksum: u32) -> bool;
}

/// What to do when a programmed word doesn't read back as written.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum VerifyPolicy {
    /// Abort the flush with [`FlashError::VerifyMismatch`].
    #[default]
    Fatal,
    /// Record the mismatch in the trace ringbuf and keep going. Only useful
    /// during board bring-up.
    TraceOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTORS: [FlashSector; 2] = [
        FlashSector::new(0x4000, 0x800, 8),
        FlashSector::new(0x4800, 0x800, 9),
    ];

    fn layout() -> FlashLayout<'static> {
        FlashLayout::new(&SECTORS).unwrap()
    }

    #[test]
    fn bounds() {
        let l = layout();
        assert_eq!(l.start(), 0x4000);
        assert_eq!(l.end(), 0x4fff);
        assert_eq!(l.sector_index(0x3fff), None);
        assert_eq!(l.sector_index(0x4000), Some(0));
        assert_eq!(l.sector_index(0x47ff), Some(0));
        assert_eq!(l.sector_index(0x4800), Some(1));
        assert_eq!(l.sector_index(0x5000), None);
    }

    #[test]
    fn check_range_spans_sectors() {
        let l = layout();
        assert_eq!(l.check_range(0x4000, 4), Ok(0..=0));
        assert_eq!(l.check_range(0x47fe, 4), Ok(0..=1));
        assert_eq!(l.check_range(0x4000, 0x1000), Ok(0..=1));
    }

    #[test]
    fn check_range_rejects() {
        let l = layout();
        // bootloader region
        assert_eq!(l.check_range(0x3ffc, 8), Err(FlashError::OutOfRange));
        // zero length
        assert_eq!(l.check_range(0x4000, 0), Err(FlashError::OutOfRange));
        // one past the end
        assert_eq!(l.check_range(0x4000, 0x1001), Err(FlashError::OutOfRange));
        assert_eq!(l.check_range(0x5000, 1), Err(FlashError::OutOfRange));
        // wraps the address space
        assert_eq!(
            l.check_range(0x4800, usize::MAX),
            Err(FlashError::OutOfRange)
        );
    }

    #[test]
    fn layout_validation() {
        assert_eq!(FlashLayout::new(&[]).unwrap_err(), LayoutError::Empty);
        assert_eq!(
            FlashLayout::new(&[
                FlashSector::new(0x4000, 0x800, 8),
                FlashSector::new(0x5000, 0x800, 9),
            ])
            .unwrap_err(),
            LayoutError::NotContiguous { index: 1 }
        );
        assert_eq!(
            FlashLayout::new(&[FlashSector::new(0x4000, 0, 8)]).unwrap_err(),
            LayoutError::ZeroSizedSector { index: 0 }
        );
        assert_eq!(
            FlashLayout::new(&[FlashSector::new(0xffff_f000, 0x2000, 0)])
                .unwrap_err(),
            LayoutError::Overflow { index: 0 }
        );
    }

    #[test]
    fn error_codes_round_trip() {
        for e in [
            FlashError::OutOfRange,
            FlashError::EraseFailed,
            FlashError::ProgramFailed,
            FlashError::VerifyMismatch,
            FlashError::DecryptFailed,
            FlashError::Misaligned,
            FlashError::ChecksumFailed,
        ] {
            assert_eq!(FlashError::from_code(u32::from(e)), Some(e));
        }
        assert_eq!(FlashError::from_code(0), None);
    }
}
