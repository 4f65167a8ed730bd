// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Error taxonomy for the ODKeyScript core.
//!
//! Each enum corresponds to one failure domain in the engineered interior
//! (VM, program store, command bus, config store). Layers above translate a
//! lower error into their own vocabulary through `From`, the way a bus
//! handler turns a store error into a wire-level `ERROR` response without the
//! store ever knowing about the bus.

use thiserror::Error;

/// Errors raised while stepping the VM or validating a program image.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("opcode {0:#04x} is not recognized")]
    InvalidOpcode(u8),
    #[error("operand value is out of range for its opcode")]
    InvalidOperand,
    #[error("program counter or operand address is out of bounds")]
    InvalidAddress,
    #[error("emitting a HID report failed")]
    HidEmit,
    #[error("program image is malformed")]
    InvalidProgram,
}

/// Errors raised by the byte reader when an operand read runs past the end
/// of the program image. Distinct from [`VmError`] because the reader has no
/// opcode context; callers fold it into `VmError::InvalidAddress`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("read of {width} bytes at offset {offset} exceeds program length {len}")]
pub struct InvalidAddress {
    pub offset: u32,
    pub width: u32,
    pub len: u32,
}

impl From<InvalidAddress> for VmError {
    fn from(_: InvalidAddress) -> Self {
        VmError::InvalidAddress
    }
}

/// Errors raised by a program store session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("store has no committed program")]
    NotInitialized,
    #[error("expected length is zero or exceeds the store's maximum size")]
    BadSize,
    #[error("write would exceed the session's expected length")]
    OverflowExpected,
    #[error("operation is not legal in the session's current lifecycle state")]
    StateMismatch,
    #[error("caller is not the session's current owner")]
    SourceMismatch,
    #[error("backing storage I/O failed")]
    BackingIoFailure,
}

/// Errors raised while parsing or dispatching a command-bus packet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("packet is malformed")]
    MalformedPacket,
    #[error("opcode {0:#04x} is not recognized")]
    UnknownOpcode(u8),
    #[error("command is not legal in the bus's current transfer state")]
    TransferStateMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised by the config key-value store contract.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("key must be 1-15 bytes")]
    KeyLengthInvalid,
    #[error("stored value type does not match requested type")]
    TypeMismatch,
    #[error("value exceeds the maximum allowed size")]
    ValueTooLarge,
    #[error("key is not present in the store")]
    KeyNotFound,
}
