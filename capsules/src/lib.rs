// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Concrete, stateful components built on `odkey_kernel`'s traits: the VM
//! execution task, the button controller, the two program store variants,
//! the log ring, the command bus, and the handlers binding them together.
//!
//! Everything that touches a thread, a mutex, or a condvar lives here; the
//! pure interpreter and the HIL traits it's built against stay in
//! `odkey_kernel`.

pub mod bus;
pub mod button;
pub mod handlers;
pub mod log_ring;
pub mod store;
pub mod vm_task;

#[cfg(any(test, feature = "test-util"))]
pub mod test;
