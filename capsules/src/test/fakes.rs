// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Concrete in-memory stand-ins for every capability trait in this crate,
//! so both unit tests and `capsules/tests/` integration tests can assemble a
//! full `ButtonController`/`VmTask`/`CommandBus` stack without real
//! hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use odkey_kernel::hil::{ConfigError, ConfigStore, ConfigValue, DelayClock, EmitHidReport, HidReport};

use crate::button::{ButtonInput, OneShotTimer};

/// Records every [`HidReport`] emitted to it, in order. Never fails.
#[derive(Default)]
pub struct RecordingHid {
    reports: Mutex<Vec<HidReport>>,
}

impl RecordingHid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<HidReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<HidReport> {
        self.reports.lock().unwrap().last().copied()
    }
}

impl EmitHidReport for RecordingHid {
    fn emit(&self, report: HidReport) -> Result<(), ()> {
        self.reports.lock().unwrap().push(report);
        Ok(())
    }
}

/// A [`DelayClock`] that never actually sleeps: `delay_ms` returns
/// immediately as though the wait elapsed in full. Suitable whenever a
/// test's timing is driven by the test itself rather than real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl DelayClock for NoDelay {
    fn delay_ms(&self, _ms: u16, _halt: &dyn Fn() -> bool) -> bool {
        true
    }
}

/// A plain `HashMap`-backed [`ConfigStore`]; `commit` is a no-op since there
/// is no backing medium to flush to.
#[derive(Default)]
pub struct FakeConfigStore {
    values: Mutex<HashMap<String, ConfigValue>>,
}

impl FakeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for seeding a value before handing the store to the
    /// component under test.
    pub fn seed(&self, key: &str, value: ConfigValue) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }
}

impl ConfigStore for FakeConfigStore {
    fn get_by_type(&self, key: &str) -> Result<ConfigValue, ConfigError> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(ConfigError::KeyNotFound)
    }

    fn set_by_type(&self, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn erase_key(&self, key: &str) -> Result<(), ConfigError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    fn commit(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// A fake GPIO button input: `pressed` and `interrupt_enabled` are plain
/// atomics a test can poke directly. Shared via `Arc` since
/// [`ButtonController`](crate::button::ButtonController) clones its input
/// handle into every timer closure it schedules.
#[derive(Default)]
pub struct FakeButtonInput {
    pub pressed: AtomicBool,
    pub interrupt_enabled: AtomicBool,
}

impl FakeButtonInput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn press(&self) {
        self.pressed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.pressed.store(false, Ordering::SeqCst);
    }
}

impl ButtonInput for Arc<FakeButtonInput> {
    fn is_pressed(&self) -> bool {
        self.pressed.load(Ordering::SeqCst)
    }
    fn enable_interrupt(&self) {
        self.interrupt_enabled.store(true, Ordering::SeqCst);
    }
    fn disable_interrupt(&self) {
        self.interrupt_enabled.store(false, Ordering::SeqCst);
    }
}

/// A [`OneShotTimer`] that runs its callback synchronously on the calling
/// thread instead of after a real delay, for deterministic tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateTimer;

impl OneShotTimer for ImmediateTimer {
    fn schedule(&self, _ms: u32, fire: Box<dyn FnOnce() + Send>) {
        fire();
    }
}

/// A [`DelayClock`] that really sleeps, polling `halt` every couple of
/// milliseconds so a `WAIT` can be cut short promptly. Needed wherever a
/// test actually exercises halt-during-wait, since [`NoDelay`] returns
/// before `halt` is ever consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepingDelay;

impl DelayClock for SleepingDelay {
    fn delay_ms(&self, ms: u16, halt: &dyn Fn() -> bool) -> bool {
        let poll = std::time::Duration::from_millis(2);
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(ms as u64);
        loop {
            if halt() {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }
}
