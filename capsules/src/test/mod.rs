// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! In-memory fakes shared between this crate's own unit tests and any
//! downstream integration tests (`capsules/tests/`). Gated the same way the
//! kernel test fakes capsule gates its fixtures: available under `#[cfg(test)]`
//! for in-tree use, and behind the `test-util` feature for out-of-tree reuse.

pub mod fakes;
