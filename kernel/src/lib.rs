// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Platform-independent types for the ODKeyScript firmware core: the byte
//! reader, the VM's pure step function, the error taxonomy, and the HIL
//! traits concrete components (in the `capsules` crate) are built against.
//!
//! Nothing here touches a thread, a mutex, or an I/O handle — that is the
//! `capsules` crate's job. This crate is the part of the design that is
//! testable by construction.

pub mod byte_reader;
pub mod error;
pub mod hil;
pub mod vm;

pub use error::{BusError, ConfigError, StoreError, VmError};
pub use hil::{ConfigStore, ConfigValue, DelayClock, EmitHidReport, HidReport, Owner, ProgramStore};
pub use vm::{Lifecycle, VmState, VmStats};
