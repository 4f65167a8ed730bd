// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Chunked, session-owned write pipelines over a backing byte region, in
//! two variants: [`flash`] (page-aligned, header-committed) and [`ram`]
//! (byte-granular, ephemeral). Both implement
//! [`odkey_kernel::hil::ProgramStore`]; grounded on the chunked-write /
//! size-committed-last shape of the nonvolatile storage and app-loader
//! capsules this crate draws on.

pub mod flash;
pub mod ram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Writing,
    Error,
}
