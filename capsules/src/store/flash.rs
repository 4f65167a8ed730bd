// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Program Store — Flash variant: a chunked write session over a
//! page-erasable backing region, with the first page reserved for a size
//! header written last so a torn write reads back as "no program" rather
//! than a partial one.
//!
//! Grounded on the nonvolatile-storage capsule's page-buffer-then-flush
//! shape and the app-loader capsule's chunked-write-to-flash-region
//! protocol, generalized from an external-flash-peripheral client callback
//! style into a synchronous, mutex-serialized session (this crate's
//! components are std-threaded, not deferred-call-driven).

use std::sync::Mutex;

use log::{error, warn};

use odkey_kernel::hil::{Owner, ProgramStore};
use odkey_kernel::StoreError;

use super::SessionState;

pub const PAGE_SIZE: usize = 4096;
pub const TOTAL_SIZE: usize = 1024 * 1024;
/// Usable program capacity once the header page is reserved.
pub const MAX_PROGRAM_LEN: u32 = (TOTAL_SIZE - PAGE_SIZE) as u32;

/// The raw erasable/programmable region a [`FlashProgramStore`] is built
/// over. Implementations model real NOR flash: `erase_pages` resets pages to
/// the erased pattern, `write_page` programs exactly one page, and reads
/// never fail.
pub trait FlashBackend: Send + Sync {
    fn total_pages(&self) -> usize {
        TOTAL_SIZE / PAGE_SIZE
    }
    fn erase_pages(&self, first_page: usize, count: usize);
    fn write_page(&self, page: usize, data: &[u8; PAGE_SIZE]);
    fn read(&self, offset: usize, out: &mut [u8]);
}

struct Session {
    state: SessionState,
    owner: Owner,
    expected_len: u32,
    bytes_written: u32,
    next_data_page: usize,
    accumulator: Vec<u8>,
}

impl Session {
    fn new() -> Self {
        Session {
            state: SessionState::Idle,
            owner: Owner::None,
            expected_len: 0,
            bytes_written: 0,
            next_data_page: 1,
            accumulator: Vec::with_capacity(PAGE_SIZE),
        }
    }
}

pub struct FlashProgramStore<B: FlashBackend> {
    backend: B,
    session: Mutex<Session>,
}

impl<B: FlashBackend> FlashProgramStore<B> {
    pub fn new(backend: B) -> Self {
        FlashProgramStore {
            backend,
            session: Mutex::new(Session::new()),
        }
    }

    fn header_value(&self) -> u32 {
        let mut header = [0u8; 4];
        self.backend.read(0, &mut header);
        u32::from_le_bytes(header)
    }
}

impl<B: FlashBackend> ProgramStore for FlashProgramStore<B> {
    fn start(&self, expected_len: u32, owner: Owner) -> Result<(), StoreError> {
        if expected_len == 0 || expected_len > MAX_PROGRAM_LEN {
            return Err(StoreError::BadSize);
        }
        let data_pages = expected_len.div_ceil(PAGE_SIZE as u32) as usize;
        let mut session = self.session.lock().unwrap();
        // An explicit interrupt: a start from any owner is always legal and
        // discards whatever session (if any) was previously in progress.
        self.backend.erase_pages(0, 1 + data_pages);
        session.state = SessionState::Writing;
        session.owner = owner;
        session.expected_len = expected_len;
        session.bytes_written = 0;
        session.next_data_page = 1;
        session.accumulator.clear();
        Ok(())
    }

    fn write_chunk(&self, data: &[u8], owner: Owner) -> Result<(), StoreError> {
        let mut session = self.session.lock().unwrap();
        if session.state != SessionState::Writing {
            return Err(StoreError::StateMismatch);
        }
        if session.owner != owner {
            return Err(StoreError::SourceMismatch);
        }
        if session.bytes_written as u64 + data.len() as u64 > session.expected_len as u64 {
            session.state = SessionState::Error;
            warn!("flash store: write would overflow expected_len, latching Error");
            return Err(StoreError::OverflowExpected);
        }

        session.accumulator.extend_from_slice(data);
        session.bytes_written += data.len() as u32;
        while session.accumulator.len() >= PAGE_SIZE {
            let mut page = [0u8; PAGE_SIZE];
            page.copy_from_slice(&session.accumulator[..PAGE_SIZE]);
            let page_index = session.next_data_page;
            self.backend.write_page(page_index, &page);
            session.next_data_page += 1;
            session.accumulator.drain(..PAGE_SIZE);
        }
        Ok(())
    }

    fn finish(&self, final_len: u32, owner: Owner) -> Result<(), StoreError> {
        let mut session = self.session.lock().unwrap();
        if session.state != SessionState::Writing {
            return Err(StoreError::StateMismatch);
        }
        if session.owner != owner {
            return Err(StoreError::SourceMismatch);
        }
        if session.bytes_written < final_len {
            session.state = SessionState::Error;
            error!("flash store: finish with bytes_written < final_len, latching Error");
            return Err(StoreError::BadSize);
        }

        if !session.accumulator.is_empty() {
            let mut page = [0u8; PAGE_SIZE];
            let n = session.accumulator.len();
            page[..n].copy_from_slice(&session.accumulator);
            let page_index = session.next_data_page;
            self.backend.write_page(page_index, &page);
            session.next_data_page += 1;
            session.accumulator.clear();
        }

        let mut header = [0u8; PAGE_SIZE];
        header[..4].copy_from_slice(&final_len.to_le_bytes());
        self.backend.write_page(0, &header);

        session.state = SessionState::Idle;
        session.owner = Owner::None;
        Ok(())
    }

    fn erase(&self) -> Result<(), StoreError> {
        let mut session = self.session.lock().unwrap();
        self.backend.erase_pages(0, self.backend.total_pages());
        *session = Session::new();
        Ok(())
    }

    fn get(&self) -> Option<(Vec<u8>, u32)> {
        let len = self.header_value();
        if len == 0 || len > MAX_PROGRAM_LEN {
            return None;
        }
        let mut bytes = vec![0u8; len as usize];
        self.backend.read(PAGE_SIZE, &mut bytes);
        Some((bytes, len))
    }

    fn is_committed(&self) -> bool {
        let len = self.header_value();
        len > 0 && len <= MAX_PROGRAM_LEN
    }

    fn expected_len(&self) -> u32 {
        self.session.lock().unwrap().expected_len
    }

    fn bytes_written(&self) -> u32 {
        self.session.lock().unwrap().bytes_written
    }
}

/// An in-process [`FlashBackend`] over a plain byte buffer — stands in for
/// a real NOR flash peripheral in tests and in any host-side tooling that
/// doesn't have physical flash.
pub struct MemoryFlashBackend {
    region: Mutex<Vec<u8>>,
}

impl MemoryFlashBackend {
    pub fn new() -> Self {
        MemoryFlashBackend {
            region: Mutex::new(vec![0u8; TOTAL_SIZE]),
        }
    }
}

impl Default for MemoryFlashBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashBackend for MemoryFlashBackend {
    fn erase_pages(&self, first_page: usize, count: usize) {
        let mut region = self.region.lock().unwrap();
        let start = first_page * PAGE_SIZE;
        let end = (first_page + count) * PAGE_SIZE;
        region[start..end].fill(0);
    }

    fn write_page(&self, page: usize, data: &[u8; PAGE_SIZE]) {
        let mut region = self.region.lock().unwrap();
        let start = page * PAGE_SIZE;
        region[start..start + PAGE_SIZE].copy_from_slice(data);
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        let region = self.region.lock().unwrap();
        out.copy_from_slice(&region[offset..offset + out.len()]);
    }
}
