// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Debounce + hold-to-repeat state machine driving [`VmTask`] from a single
//! GPIO button, grounded on the same "enable/disable interrupt around an
//! edge" shape as the core button driver this crate draws on, generalized
//! from a syscall-facing app notifier into a direct caller of `VmTask`.
//!
//! The three states (`Armed`, `Debouncing`, `AwaitingRepeat`) and their
//! transitions are exactly those of the companion design document; the two
//! capability traits below (`ButtonInput`, `OneShotTimer`) are this crate's
//! stand-ins for the GPIO interrupt pin and virtualized alarm an ISR and a
//! timer callback would use on real hardware.

use std::sync::{Arc, Mutex};

use log::debug;

use odkey_kernel::hil::{ConfigStore, ConfigValue, DelayClock, EmitHidReport, ProgramStore};
use odkey_kernel::Lifecycle;

use crate::vm_task::VmTask;

/// Default debounce window, used when `button_debounce` is unset in config.
pub const DEFAULT_DEBOUNCE_MS: u32 = 50;
/// Default hold-to-repeat delay, used when `button_repeat` is unset.
pub const DEFAULT_REPEAT_MS: u32 = 225;

/// The GPIO capability the controller is built against: an active-low input
/// with edge-triggered interrupt enable/disable. Implementations must be
/// safe to call `is_pressed`/`disable_interrupt` from interrupt context.
/// Implementors are expected to be a cheap, shareable handle (e.g. an
/// `Arc<...>` around the real GPIO pin) since the controller clones it into
/// every timer closure it schedules.
pub trait ButtonInput: Clone + Send + Sync {
    /// `true` when the button is physically pressed (post active-low
    /// resolution — callers never see the raw electrical level).
    fn is_pressed(&self) -> bool;
    fn enable_interrupt(&self);
    fn disable_interrupt(&self);
}

/// A one-shot timer capability: schedule a single callback after `ms`
/// milliseconds. Only one outstanding timer is ever scheduled by the
/// controller at a time. Implementors are expected to be a cheap, shareable
/// handle, for the same reason as [`ButtonInput`].
pub trait OneShotTimer: Clone + Send + Sync {
    fn schedule(&self, ms: u32, fire: Box<dyn FnOnce() + Send>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Armed,
    Debouncing,
    AwaitingRepeat,
}

struct Inner {
    state: State,
    /// Bumped on every state-entering transition; a timer fire stamped with
    /// a stale generation is a no-op. Guards against a debounce timer firing
    /// after a spurious re-arm, or a repeat timer firing after the button
    /// has since been released and re-armed.
    generation: u64,
}

/// Drives [`VmTask`] from button edges, running whatever program is
/// currently committed in `store` on each recognized press. Construct once
/// per device; `arm()` performs the initial interrupt enable.
pub struct ButtonController<B, T, S, H, D>
where
    B: ButtonInput + 'static,
    T: OneShotTimer + 'static,
    S: ProgramStore + Send + Sync + 'static,
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    input: B,
    timer: T,
    store: Arc<S>,
    vm_task: Arc<VmTask<H, D>>,
    debounce_ms: u32,
    repeat_ms: u32,
    inner: Arc<Mutex<Inner>>,
}

impl<B, T, S, H, D> ButtonController<B, T, S, H, D>
where
    B: ButtonInput + 'static,
    T: OneShotTimer + 'static,
    S: ProgramStore + Send + Sync + 'static,
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    pub fn new(
        input: B,
        timer: T,
        store: Arc<S>,
        vm_task: Arc<VmTask<H, D>>,
        config: &dyn ConfigStore,
    ) -> Self {
        let debounce_ms = read_u32_default(config, "button_debounce", DEFAULT_DEBOUNCE_MS);
        let repeat_ms = read_u32_default(config, "button_repeat", DEFAULT_REPEAT_MS);
        ButtonController {
            input,
            timer,
            store,
            vm_task,
            debounce_ms,
            repeat_ms,
            inner: Arc::new(Mutex::new(Inner {
                state: State::Armed,
                generation: 0,
            })),
        }
    }

    /// Enables the interrupt; call once after construction.
    pub fn arm(&self) {
        self.input.enable_interrupt();
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn debug_state(&self) -> &'static str {
        match self.inner.lock().unwrap().state {
            State::Armed => "armed",
            State::Debouncing => "debouncing",
            State::AwaitingRepeat => "awaiting_repeat",
        }
    }

    /// Called from interrupt context on a falling edge.
    pub fn on_edge(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Armed {
            // Presses during an active press/run cycle are silently
            // dropped; there is no queue.
            return;
        }
        self.input.disable_interrupt();
        inner.state = State::Debouncing;
        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);
        debug!("button: edge observed, debouncing for {}ms", self.debounce_ms);
        self.schedule(self.debounce_ms, generation);
    }

    fn schedule(&self, ms: u32, generation: u64) {
        let this = self.clone_handle();
        self.timer
            .schedule(ms, Box::new(move || this.on_timer_fire(generation)));
    }

    fn clone_handle(&self) -> ButtonController<B, T, S, H, D> {
        ButtonController {
            input: self.input.clone(),
            timer: self.timer.clone(),
            store: Arc::clone(&self.store),
            vm_task: Arc::clone(&self.vm_task),
            debounce_ms: self.debounce_ms,
            repeat_ms: self.repeat_ms,
            inner: Arc::clone(&self.inner),
        }
    }

    fn on_timer_fire(&self, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return; // stale timer from a state we've since left
        }
        if !self.input.is_pressed() {
            inner.state = State::Armed;
            self.input.enable_interrupt();
            debug!("button: released before timer fired, re-arming");
            return;
        }
        drop(inner);
        self.try_run_program(generation);
    }

    /// Fetches the committed flash program and starts it. If no program is
    /// committed, or `VmTask` is unexpectedly busy, behaves as though the
    /// run completed immediately so the controller never gets stuck.
    fn try_run_program(&self, generation: u64) {
        let program = self.store.get().map(|(bytes, _len)| Arc::<[u8]>::from(bytes));
        let started = match program {
            Some(bytes) => {
                let this = self.clone_handle();
                self.vm_task.start(
                    bytes,
                    Some(move |_lifecycle: Lifecycle| this.on_program_complete(generation)),
                )
            }
            None => false,
        };
        if !started {
            self.on_program_complete(generation);
        }
    }

    /// Invoked once the VM's run (successful or otherwise) naturally
    /// completes. Never invoked on halt, and never invoked twice for the
    /// same press.
    fn on_program_complete(&self, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return;
        }
        if self.input.is_pressed() {
            inner.state = State::AwaitingRepeat;
            inner.generation += 1;
            let next_generation = inner.generation;
            drop(inner);
            debug!("button: still held, scheduling repeat in {}ms", self.repeat_ms);
            self.schedule(self.repeat_ms, next_generation);
        } else {
            inner.state = State::Armed;
            drop(inner);
            self.input.enable_interrupt();
            debug!("button: released, re-armed");
        }
    }
}

fn read_u32_default(config: &dyn ConfigStore, key: &str, default: u32) -> u32 {
    match config.get_by_type(key) {
        Ok(ConfigValue::U32(v)) => v,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use odkey_kernel::hil::{ConfigError, HidReport, Owner};
    use odkey_kernel::StoreError;

    struct FakeInput {
        pressed: AtomicBool,
        interrupt_enabled: AtomicBool,
    }

    impl ButtonInput for Arc<FakeInput> {
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

    /// Fires synchronously on the calling thread rather than after a real
    /// delay, so these tests are deterministic and fast.
    #[derive(Clone)]
    struct ImmediateTimer;
    impl OneShotTimer for ImmediateTimer {
        fn schedule(&self, _ms: u32, fire: Box<dyn FnOnce() + Send>) {
            fire();
        }
    }

    struct FakeStore {
        program: StdMutex<Option<Vec<u8>>>,
    }
    impl ProgramStore for FakeStore {
        fn start(&self, _expected_len: u32, _owner: Owner) -> Result<(), StoreError> {
            Ok(())
        }
        fn write_chunk(&self, _data: &[u8], _owner: Owner) -> Result<(), StoreError> {
            Ok(())
        }
        fn finish(&self, _final_len: u32, _owner: Owner) -> Result<(), StoreError> {
            Ok(())
        }
        fn erase(&self) -> Result<(), StoreError> {
            *self.program.lock().unwrap() = None;
            Ok(())
        }
        fn get(&self) -> Option<(Vec<u8>, u32)> {
            self.program.lock().unwrap().clone().map(|b| {
                let len = b.len() as u32;
                (b, len)
            })
        }
        fn is_committed(&self) -> bool {
            self.program.lock().unwrap().is_some()
        }
        fn expected_len(&self) -> u32 {
            0
        }
        fn bytes_written(&self) -> u32 {
            0
        }
    }

    struct NoopHid;
    impl EmitHidReport for NoopHid {
        fn emit(&self, _report: HidReport) -> Result<(), ()> {
            Ok(())
        }
    }

    #[derive(Clone)]
    struct NoDelay;
    impl DelayClock for NoDelay {
        fn delay_ms(&self, _ms: u16, _halt: &dyn Fn() -> bool) -> bool {
            true
        }
    }

    struct EmptyConfig;
    impl ConfigStore for EmptyConfig {
        fn get_by_type(&self, _key: &str) -> Result<odkey_kernel::hil::ConfigValue, ConfigError> {
            Err(ConfigError::KeyNotFound)
        }
        fn set_by_type(&self, _key: &str, _value: odkey_kernel::hil::ConfigValue) -> Result<(), ConfigError> {
            Ok(())
        }
        fn erase_key(&self, _key: &str) -> Result<(), ConfigError> {
            Ok(())
        }
        fn commit(&self) -> Result<(), ConfigError> {
            Ok(())
        }
    }

    fn make_controller(
        program: Option<Vec<u8>>,
    ) -> (
        ButtonController<Arc<FakeInput>, ImmediateTimer, FakeStore, NoopHid, NoDelay>,
        Arc<FakeInput>,
    ) {
        let input = Arc::new(FakeInput {
            pressed: AtomicBool::new(false),
            interrupt_enabled: AtomicBool::new(false),
        });
        let store = Arc::new(FakeStore {
            program: StdMutex::new(program),
        });
        let vm_task = Arc::new(VmTask::new(NoDelay));
        vm_task.init(NoopHid).unwrap();
        let controller = ButtonController::new(
            input.clone(),
            ImmediateTimer,
            store,
            vm_task,
            &EmptyConfig,
        );
        (controller, input)
    }

    #[test]
    fn press_with_no_program_rearms_immediately() {
        let (controller, input) = make_controller(None);
        controller.arm();
        input.pressed.store(true, Ordering::SeqCst);
        controller.on_edge();
        assert_eq!(controller.debug_state(), "armed");
        assert!(input.interrupt_enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn release_during_debounce_is_spurious() {
        let (controller, input) = make_controller(Some(vec![0x12]));
        controller.arm();
        // Edge taken, but button already released by the time the
        // (immediate) debounce timer fires.
        controller.on_edge();
        assert_eq!(controller.debug_state(), "armed");
        assert!(input.interrupt_enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn release_during_run_rearms_on_completion_instead_of_repeating() {
        let (controller, input) = make_controller(Some(vec![0x12]));
        controller.arm();
        input.pressed.store(true, Ordering::SeqCst);
        controller.on_edge();
        // The program (a single KEYUP_ALL) is now running asynchronously on
        // VmTask's dedicated worker thread. Release before it completes.
        input.pressed.store(false, Ordering::SeqCst);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while controller.debug_state() != "armed" && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(controller.debug_state(), "armed");
        assert!(input.interrupt_enabled.load(Ordering::SeqCst));
    }
}
