// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Program Store — RAM variant: the same session protocol as
//! [`super::flash`] without page alignment, for ephemeral (not persisted
//! across reboot) programs. `erase()` simply zeroes the backing buffer and
//! the recorded size.

use std::sync::Mutex;

use log::warn;

use odkey_kernel::hil::{Owner, ProgramStore};
use odkey_kernel::StoreError;

use super::SessionState;

pub const MAX_PROGRAM_LEN: u32 = 1024 * 1024;

struct Session {
    state: SessionState,
    owner: Owner,
    expected_len: u32,
    bytes_written: u32,
    committed_len: u32,
    buffer: Vec<u8>,
}

impl Session {
    fn new() -> Self {
        Session {
            state: SessionState::Idle,
            owner: Owner::None,
            expected_len: 0,
            bytes_written: 0,
            committed_len: 0,
            buffer: Vec::new(),
        }
    }
}

/// A volatile, RAM-backed program store: same owner/session contract as the
/// flash variant, but with no page accumulator and no persistence.
pub struct RamProgramStore {
    session: Mutex<Session>,
}

impl RamProgramStore {
    pub fn new() -> Self {
        RamProgramStore {
            session: Mutex::new(Session::new()),
        }
    }
}

impl Default for RamProgramStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramStore for RamProgramStore {
    fn start(&self, expected_len: u32, owner: Owner) -> Result<(), StoreError> {
        if expected_len == 0 || expected_len > MAX_PROGRAM_LEN {
            return Err(StoreError::BadSize);
        }
        let mut session = self.session.lock().unwrap();
        session.state = SessionState::Writing;
        session.owner = owner;
        session.expected_len = expected_len;
        session.bytes_written = 0;
        session.buffer = Vec::with_capacity(expected_len as usize);
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
            warn!("ram store: write would overflow expected_len, latching Error");
            return Err(StoreError::OverflowExpected);
        }
        session.buffer.extend_from_slice(data);
        session.bytes_written += data.len() as u32;
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
            return Err(StoreError::BadSize);
        }
        session.buffer.truncate(final_len as usize);
        session.committed_len = final_len;
        session.state = SessionState::Idle;
        session.owner = Owner::None;
        Ok(())
    }

    fn erase(&self) -> Result<(), StoreError> {
        let mut session = self.session.lock().unwrap();
        *session = Session::new();
        Ok(())
    }

    fn get(&self) -> Option<(Vec<u8>, u32)> {
        let session = self.session.lock().unwrap();
        if session.committed_len == 0 {
            return None;
        }
        Some((session.buffer.clone(), session.committed_len))
    }

    fn is_committed(&self) -> bool {
        self.session.lock().unwrap().committed_len > 0
    }

    fn expected_len(&self) -> u32 {
        self.session.lock().unwrap().expected_len
    }

    fn bytes_written(&self) -> u32 {
        self.session.lock().unwrap().bytes_written
    }
}
