// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Hardware/host interface layer: the capability traits the VM and the rest
//! of the core are built against, and the small value types shared across
//! every boundary (HID reports, the owner tag, config values).
//!
//! Nothing in this module performs I/O. Concrete implementations (a real USB
//! stack, a real flash region, a real config partition) live outside this
//! crate; tests substitute in-memory fakes.

use crate::error::{ConfigError, StoreError};

/// Maximum simultaneously held non-modifier keycodes in one HID report.
pub const MAX_HELD_KEYS: usize = 6;

/// An 8-byte USB HID keyboard report: modifier byte, a reserved byte (always
/// zero), and up to six keycodes (zero-padded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HidReport {
    pub modifier: u8,
    pub keycodes: [u8; MAX_HELD_KEYS],
}

impl HidReport {
    pub const RELEASE_ALL: HidReport = HidReport {
        modifier: 0,
        keycodes: [0; MAX_HELD_KEYS],
    };

    pub fn new(modifier: u8, keys: &[u8]) -> Self {
        let mut keycodes = [0u8; MAX_HELD_KEYS];
        let n = keys.len().min(MAX_HELD_KEYS);
        keycodes[..n].copy_from_slice(&keys[..n]);
        HidReport { modifier, keycodes }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.modifier;
        out[2..8].copy_from_slice(&self.keycodes);
        out
    }

    pub fn is_release_all(&self) -> bool {
        *self == Self::RELEASE_ALL
    }
}

/// Capability injected into the VM: deliver a HID report to the host.
/// Implementations are expected to serialize concurrent callers themselves
/// (e.g. by internally queueing reports to a single USB endpoint).
pub trait EmitHidReport {
    fn emit(&self, report: HidReport) -> Result<(), ()>;
}

/// Capability injected into the VM task: suspend for up to `ms` milliseconds
/// or until `halt` becomes observable, whichever comes first. Returns `true`
/// if the wait elapsed in full, `false` if it was cut short by halt.
pub trait DelayClock {
    fn delay_ms(&self, ms: u16, halt: &dyn Fn() -> bool) -> bool;
}

/// Identity of whichever transport currently owns a program-store write
/// session or the command bus's transfer state. A tagged variant rather than
/// a pointer, so ownership is testable without impersonating a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Owner {
    #[default]
    None,
    Usb,
    Http,
}

/// The session-oriented, chunked-write contract a program store (flash- or
/// RAM-backed) presents to its callers. `start`/`write_chunk`/`finish` must
/// be called in that order by a single owner; a `start` from a different
/// owner explicitly interrupts a prior session.
pub trait ProgramStore {
    /// Begin a new write session of `expected_len` bytes, owned by `owner`.
    /// Legal from any lifecycle state; interrupts any session held by a
    /// different owner.
    fn start(&self, expected_len: u32, owner: Owner) -> Result<(), StoreError>;

    /// Append `data` to the in-progress session owned by `owner`.
    fn write_chunk(&self, data: &[u8], owner: Owner) -> Result<(), StoreError>;

    /// Commit the session owned by `owner`: flush any partial page, verify
    /// the total written, and write the size header.
    fn finish(&self, final_len: u32, owner: Owner) -> Result<(), StoreError>;

    /// Erase the entire backing region and return to `Owner::None`.
    fn erase(&self) -> Result<(), StoreError>;

    /// Returns the committed program's bytes and length, or `None` if the
    /// store holds no committed program.
    fn get(&self) -> Option<(Vec<u8>, u32)>;

    /// `true` iff the store's header records a nonzero size within range.
    fn is_committed(&self) -> bool;

    /// Expected total length of the session currently (or most recently) in
    /// progress; `0` if no session has ever started.
    fn expected_len(&self) -> u32;

    /// Bytes written so far in the current session.
    fn bytes_written(&self) -> u32;
}

/// A typed value read from or written to the config key-value store. Mirrors
/// the type table in the config KV contract: fixed-width signed/unsigned
/// integers, a UTF-8 string, or an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Str(String),
    Blob(Vec<u8>),
}

impl ConfigValue {
    /// The wire type tag used in the `CONFIG_SET_START`/`CONFIG_GET_START`
    /// payloads.
    pub fn type_tag(&self) -> u8 {
        match self {
            ConfigValue::I8(_) => 0,
            ConfigValue::U8(_) => 1,
            ConfigValue::I16(_) => 2,
            ConfigValue::U16(_) => 3,
            ConfigValue::I32(_) => 4,
            ConfigValue::U32(_) => 5,
            ConfigValue::I64(_) => 6,
            ConfigValue::U64(_) => 7,
            ConfigValue::Str(_) => 8,
            ConfigValue::Blob(_) => 9,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ConfigValue::I8(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U8(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I16(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U16(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I32(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U32(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I64(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U64(v) => v.to_le_bytes().to_vec(),
            ConfigValue::Str(s) => s.as_bytes().to_vec(),
            ConfigValue::Blob(b) => b.clone(),
        }
    }
}

/// Maximum length of a string or blob config value (§6).
pub const CONFIG_VALUE_MAX_LEN: usize = 1024;
/// Config keys are 1-15 bytes, zero-terminated within a 16-byte field.
pub const CONFIG_KEY_MAX_LEN: usize = 15;

/// Persistent typed key-value store consumed (not implemented) by the core.
/// Keys are 1-15 byte names; `commit` makes prior `set_by_type`/`erase_key`
/// calls durable.
pub trait ConfigStore {
    fn get_by_type(&self, key: &str) -> Result<ConfigValue, ConfigError>;
    fn set_by_type(&self, key: &str, value: ConfigValue) -> Result<(), ConfigError>;
    fn erase_key(&self, key: &str) -> Result<(), ConfigError>;
    fn commit(&self) -> Result<(), ConfigError>;
}
