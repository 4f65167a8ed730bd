// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! A fixed-capacity, mutex-protected byte ring buffer with snapshot-read
//! semantics, grounded on the log capsule's entry/page bookkeeping this
//! crate draws on — simplified from that capsule's flash-backed,
//! entry-framed log to a plain in-memory byte ring, since the command
//! protocol's `LOG_READ_*` opcodes move raw bytes, not framed entries.

use std::fmt::Write as _;
use std::sync::Mutex;

/// Fixed ring capacity (§4.G).
pub const CAPACITY: usize = 32 * 1024;

struct Inner {
    buf: Box<[u8; CAPACITY]>,
    write_cursor: usize,
    total_written: u64,
    /// Set once `total_written` has exceeded `CAPACITY`, i.e. the ring has
    /// overwritten its own oldest byte at least once.
    wrapped: bool,
    read_cursor: usize,
    /// Bytes remaining to be drained from `read_cursor`, fixed at the most
    /// recent `start_read()`.
    unread: usize,
}

/// A byte ring buffer of fixed capacity [`CAPACITY`]. Writers always
/// succeed, overwriting the oldest bytes once full; readers consume a
/// snapshot taken at `start_read()` without observing concurrent writes.
pub struct LogRing {
    inner: Mutex<Inner>,
}

impl LogRing {
    pub fn new() -> Self {
        LogRing {
            inner: Mutex::new(Inner {
                buf: Box::new([0u8; CAPACITY]),
                write_cursor: 0,
                total_written: 0,
                wrapped: false,
                read_cursor: 0,
                unread: 0,
            }),
        }
    }

    /// Appends `bytes`, overwriting the oldest data if the ring is full.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for &b in bytes {
            let cursor = inner.write_cursor;
            inner.buf[cursor] = b;
            inner.write_cursor = (cursor + 1) % CAPACITY;
            inner.total_written += 1;
            if inner.total_written > CAPACITY as u64 {
                inner.wrapped = true;
            }
        }
    }

    /// Formats `args` and appends the resulting bytes, the way the rest of
    /// the firmware's `log::*` calls would push a diagnostic line without
    /// hand-assembling a buffer.
    pub fn log(&self, args: std::fmt::Arguments) {
        let mut line = String::new();
        let _ = line.write_fmt(args);
        self.write(line.as_bytes());
    }

    /// Snapshots the read cursor to the oldest available byte.
    pub fn start_read(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_cursor = if inner.wrapped { inner.write_cursor } else { 0 };
        inner.unread = if inner.wrapped {
            CAPACITY
        } else {
            inner.write_cursor
        };
    }

    /// Returns up to `max` bytes from the read cursor, advancing it. Empty
    /// once the snapshot taken by `start_read()` is exhausted.
    pub fn read_chunk(&self, max: usize) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        let n = max.min(inner.unread);
        let mut out = Vec::with_capacity(n);
        let mut cursor = inner.read_cursor;
        for _ in 0..n {
            out.push(inner.buf[cursor]);
            cursor = (cursor + 1) % CAPACITY;
        }
        inner.read_cursor = cursor;
        inner.unread -= n;
        out
    }

    /// Bytes left in the snapshot taken by the most recent `start_read()`.
    pub fn remaining(&self) -> usize {
        self.inner.lock().unwrap().unread
    }

    /// Resets both cursors and the wrapped flag; does not zero the backing
    /// buffer (stale bytes are unreachable once cursors reset).
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_cursor = 0;
        inner.total_written = 0;
        inner.wrapped = false;
        inner.read_cursor = 0;
        inner.unread = 0;
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}
