// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! The ODKeyScript bytecode interpreter: a pure step function over
//! [`VmState`], plus the opcode catalog it implements.
//!
//! `VmState::step` consumes exactly one opcode per call. It is pure with
//! respect to everything except the two injected capabilities
//! ([`EmitHidReport`], [`DelayClock`]), which makes it testable without a USB
//! stack or a clock — see the `test::fakes` module in the `capsules` crate
//! for the fakes used throughout this crate's own tests.

use std::sync::Arc;

use crate::byte_reader::ByteReader;
use crate::error::VmError;
use crate::hil::{DelayClock, EmitHidReport, HidReport, MAX_HELD_KEYS};

/// Opcode bytes, per the catalog in the command protocol's companion
/// document. Operand layouts are documented on each `execute_one` arm.
pub mod opcode {
    pub const KEYDN: u8 = 0x10;
    pub const KEYUP: u8 = 0x11;
    pub const KEYUP_ALL: u8 = 0x12;
    pub const WAIT: u8 = 0x13;
    pub const SET_COUNTER: u8 = 0x14;
    pub const DEC: u8 = 0x15;
    pub const JNZ: u8 = 0x16;
}

/// Number of general-purpose 16-bit counters addressable by `SET_COUNTER`
/// and `DEC`.
pub const COUNTER_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Running,
    Error,
    Finished,
}

/// Run statistics exposed for diagnostics (not required by opcode
/// semantics, but readable without reaching into VM internals).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub instructions_executed: u64,
    pub keys_pressed: u64,
    pub keys_released: u64,
}

/// The VM's full mutable state: program cursor, counters, zero flag, the
/// currently-held HID state, run statistics, and lifecycle.
pub struct VmState {
    program: Arc<[u8]>,
    pc: u32,
    counters: [u16; COUNTER_COUNT],
    zero_flag: bool,
    held_modifier: u8,
    held_keys: Vec<u8>,
    /// Preserved for forward compatibility; no current opcode consults it.
    default_press_time_ms: u16,
    stats: VmStats,
    lifecycle: Lifecycle,
    last_error: Option<VmError>,
}

impl VmState {
    pub fn new(program: Arc<[u8]>) -> Self {
        VmState {
            program,
            pc: 0,
            counters: [0; COUNTER_COUNT],
            zero_flag: false,
            held_modifier: 0,
            held_keys: Vec::with_capacity(MAX_HELD_KEYS),
            default_press_time_ms: 0,
            stats: VmStats::default(),
            lifecycle: Lifecycle::Ready,
            last_error: None,
        }
    }

    /// Arms the VM to begin execution from byte 0. Must be called before the
    /// first `step` of a run.
    pub fn arm(&mut self) {
        self.pc = 0;
        self.counters = [0; COUNTER_COUNT];
        self.zero_flag = false;
        self.held_modifier = 0;
        self.held_keys.clear();
        self.stats = VmStats::default();
        self.lifecycle = Lifecycle::Running;
        self.last_error = None;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn last_error(&self) -> Option<VmError> {
        self.last_error
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn counter(&self, idx: u8) -> u16 {
        self.counters[idx as usize]
    }

    pub fn held_is_empty(&self) -> bool {
        self.held_modifier == 0 && self.held_keys.is_empty()
    }

    fn held_report(&self) -> HidReport {
        HidReport::new(self.held_modifier, &self.held_keys)
    }

    fn clear_held(&mut self) {
        self.held_modifier = 0;
        self.held_keys.clear();
    }

    /// Executes one step. Must only be called while `lifecycle() ==
    /// Running`. Returns the lifecycle after the step: still `Running`, or
    /// the terminal state the VM just entered.
    pub fn step(
        &mut self,
        hid: &dyn EmitHidReport,
        delay: &dyn DelayClock,
        halted: &dyn Fn() -> bool,
    ) -> Lifecycle {
        assert_eq!(self.lifecycle, Lifecycle::Running);

        if self.pc == self.program.len() as u32 {
            if !self.held_is_empty() {
                let _ = hid.emit(HidReport::RELEASE_ALL);
            }
            self.clear_held();
            self.lifecycle = Lifecycle::Finished;
            return self.lifecycle;
        }

        match self.execute_one(hid, delay, halted) {
            Ok(()) => Lifecycle::Running,
            Err(e) => {
                let _ = hid.emit(HidReport::RELEASE_ALL);
                self.clear_held();
                self.lifecycle = Lifecycle::Error;
                self.last_error = Some(e);
                self.lifecycle
            }
        }
    }

    fn execute_one(
        &mut self,
        hid: &dyn EmitHidReport,
        delay: &dyn DelayClock,
        halted: &dyn Fn() -> bool,
    ) -> Result<(), VmError> {
        let mut reader = ByteReader::new(&self.program, self.pc);
        let op = reader.read_u8()?;

        match op {
            opcode::KEYDN => {
                let modifier = reader.read_u8()?;
                let n = reader.read_u8()?;
                if n as usize > MAX_HELD_KEYS {
                    return Err(VmError::InvalidOperand);
                }
                let mut keys = [0u8; MAX_HELD_KEYS];
                reader.read_bytes(n as usize, &mut keys)?;
                self.held_modifier = modifier;
                self.held_keys = keys[..n as usize].to_vec();
                hid.emit(self.held_report()).map_err(|()| VmError::HidEmit)?;
                self.stats.keys_pressed += 1;
                self.zero_flag = false;
            }
            opcode::KEYUP => {
                let modifier = reader.read_u8()?;
                let n = reader.read_u8()?;
                if n as usize > MAX_HELD_KEYS {
                    return Err(VmError::InvalidOperand);
                }
                let mut keys = [0u8; MAX_HELD_KEYS];
                reader.read_bytes(n as usize, &mut keys)?;
                let up = &keys[..n as usize];
                self.held_modifier &= !modifier;
                self.held_keys.retain(|k| !up.contains(k));
                hid.emit(self.held_report()).map_err(|()| VmError::HidEmit)?;
                self.stats.keys_released += 1;
                self.zero_flag = false;
            }
            opcode::KEYUP_ALL => {
                if !self.held_is_empty() {
                    hid.emit(HidReport::RELEASE_ALL)
                        .map_err(|()| VmError::HidEmit)?;
                    self.clear_held();
                    self.stats.keys_released += 1;
                }
                self.zero_flag = false;
            }
            opcode::WAIT => {
                let ms = reader.read_u16le()?;
                delay.delay_ms(ms, halted);
                self.zero_flag = false;
            }
            opcode::SET_COUNTER => {
                let idx = reader.read_u8()?;
                let val = reader.read_u16le()?;
                if idx as usize >= COUNTER_COUNT {
                    return Err(VmError::InvalidAddress);
                }
                self.counters[idx as usize] = val;
                self.zero_flag = false;
            }
            opcode::DEC => {
                let idx = reader.read_u8()?;
                if idx as usize >= COUNTER_COUNT {
                    return Err(VmError::InvalidAddress);
                }
                let slot = &mut self.counters[idx as usize];
                if *slot > 0 {
                    *slot -= 1;
                }
                self.zero_flag = *slot == 0;
                self.pc = reader.pc();
                self.stats.instructions_executed += 1;
                return Ok(());
            }
            opcode::JNZ => {
                let addr = reader.read_u32le()?;
                if !self.zero_flag {
                    if addr >= self.program.len() as u32 {
                        return Err(VmError::InvalidAddress);
                    }
                    self.zero_flag = false;
                    self.stats.instructions_executed += 1;
                    self.pc = addr;
                    return Ok(());
                }
                self.zero_flag = false;
            }
            other => return Err(VmError::InvalidOpcode(other)),
        }

        self.pc = reader.pc();
        self.stats.instructions_executed += 1;
        Ok(())
    }
}
