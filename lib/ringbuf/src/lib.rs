// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for target-side drivers
//!
//! A ring buffer is a fixed-size static array of recent events. It is the
//! logging facility for code that can't assume a console, an allocator, or
//! even a working clock: entries are cheap to record, are never lost to a
//! full queue (the oldest entry is overwritten instead), and can be read
//! back out of a halted target with a debugger.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the macros that leave the name of the buffer
//! implicit, you can only have one per module.
//!
//! ## Creating a ring buffer
//!
//! ```
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     Erased { start: u32 },
//! }
//!
//! ringbuf::ringbuf!(Trace, 16, Trace::None);
//!
//! ringbuf::ringbuf_entry!(Trace::Erased { start: 0x4000 });
//! ```
//!
//! A named buffer is declared and used the same way:
//!
//! ```
//! ringbuf::ringbuf!(MY_RINGBUF, u32, 16, 0);
//! ringbuf::ringbuf_entry!(MY_RINGBUF, 0x1de);
//! ```
//!
//! Recording the same payload from the same line twice in a row does not
//! consume a second slot; the `count` of the existing entry goes up instead.
//! This keeps a tight polling loop from flushing everything interesting out
//! of the buffer.
//!
//! ## Inspecting a ring buffer
//!
//! With symbols loaded, GDB can print the static directly:
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print drv_flash_blocks::__RINGBUF
//! ```
//!
//! From code (typically tests), [`Ringbuf::iter`] walks the live entries
//! from oldest to newest.

#![cfg_attr(not(test), no_std)]

/// Re-exported so that code generated by the macros is guaranteed to be able
/// to find it.
pub use spin::Mutex;

/// Declares a static ring of `N` entries of `Type`, each starting out as
/// `expr`: `ringbuf!(NAME, Type, N, expr)`.
///
/// `NAME` is a `Mutex<Ringbuf<Type, N>>` and defaults to `__RINGBUF` when
/// left out.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Mutex<$crate::Ringbuf<$t, $n>> =
            $crate::Mutex::new($crate::Ringbuf::new($init));
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Records `expr` in a ring declared with [`ringbuf!`]:
/// `ringbuf_entry!(NAME, expr)`, or `ringbuf_entry!(expr)` for `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // The payload is evaluated before the lock is taken, so it may
        // itself record into the same ring.
        let (p, buf) = ($payload, &$buf);
        $crate::Ringbuf::entry(
            &mut *$crate::Mutex::lock(buf),
            line!() as u16,
            p,
        );
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single [`Ringbuf`] entry. `count` is the number of consecutive times
/// this `(line, payload)` pair was recorded; a `count` of zero marks a slot
/// that has never been written.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. See the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // Before the first insertion `last` is None; treating that as an
        // out-of-range index makes the reuse check below miss and the
        // wrapping increment land on slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let next = last.wrapping_add(1);
            if next >= self.buffer.len() {
                0
            } else {
                next
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over the recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => N,
        };
        (0..N)
            .map(move |i| &self.buffer[(start + i) % N])
            .filter(|ent| ent.count != 0)
    }

    /// Returns the most recently recorded payload, if any.
    pub fn latest(&self) -> Option<T> {
        self.last.map(|ndx| self.buffer[ndx].payload)
    }
}
