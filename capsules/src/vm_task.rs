// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Single-slot execution engine wrapping [`VmState`] with a dedicated worker
//! thread, cancellation, and a completion callback.
//!
//! Grounded on the single-dedicated-task idiom used throughout the codebase
//! this crate draws on (one worker draining one request queue) and on the
//! suspend-until-elapsed-or-cancelled shape of a virtualized alarm: `WAIT` is
//! the only point at which a halt request is observed promptly, the same way
//! an alarm client only observes a stopped virtual alarm at its next fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, warn};

use odkey_kernel::hil::HidReport;
use odkey_kernel::{DelayClock, EmitHidReport, Lifecycle, VmState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// `init` has not yet been called; `start` always fails.
    Uninit,
    Idle,
    Running,
}

type CompletionCallback = Box<dyn FnOnce(Lifecycle) + Send + 'static>;

struct PendingStart {
    program: Arc<[u8]>,
    on_complete: Option<CompletionCallback>,
}

struct Inner<H> {
    hid: Option<Arc<H>>,
    state: TaskState,
    pending: Option<PendingStart>,
}

struct Shared<H> {
    mutex: Mutex<Inner<H>>,
    cv: Condvar,
    halt_requested: AtomicBool,
}

/// Wraps one [`VmState`] and a dedicated worker thread that runs it to
/// completion. At most one execution is ever in flight; a second `start`
/// while `Running` fails synchronously (the caller — the button controller
/// or a command handler — is responsible for checking `is_running` first).
pub struct VmTask<H, D>
where
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    shared: Arc<Shared<H>>,
    delay: D,
}

impl<H, D> VmTask<H, D>
where
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    pub fn new(delay: D) -> Self {
        VmTask {
            shared: Arc::new(Shared {
                mutex: Mutex::new(Inner {
                    hid: None,
                    state: TaskState::Uninit,
                    pending: None,
                }),
                cv: Condvar::new(),
                halt_requested: AtomicBool::new(false),
            }),
            delay,
        }
    }

    /// One-shot: wires in the HID emission capability and spawns the
    /// worker thread. Fails if already initialized.
    pub fn init(&self, hid: H) -> Result<(), VmTaskError> {
        {
            let mut inner = self.shared.mutex.lock().unwrap();
            if inner.state != TaskState::Uninit {
                return Err(VmTaskError::AlreadyInitialized);
            }
            inner.hid = Some(Arc::new(hid));
            inner.state = TaskState::Idle;
        }

        let shared = Arc::clone(&self.shared);
        let delay = self.delay.clone();
        thread::Builder::new()
            .name("odkey-vm-task".into())
            .spawn(move || run_worker(shared, delay))
            .map_err(|_| VmTaskError::WorkerSpawnFailed)?;
        Ok(())
    }

    /// Enqueues `program` for execution. Returns `false` without effect if
    /// the task is uninitialized or already running; `on_complete`, if
    /// given, is invoked exactly once at natural completion (`Finished` or
    /// `Error`) and never on halt.
    pub fn start<F>(&self, program: Arc<[u8]>, on_complete: Option<F>) -> bool
    where
        F: FnOnce(Lifecycle) + Send + 'static,
    {
        let mut inner = self.shared.mutex.lock().unwrap();
        if inner.state != TaskState::Idle {
            return false;
        }
        inner.pending = Some(PendingStart {
            program,
            on_complete: on_complete.map(|f| Box::new(f) as CompletionCallback),
        });
        self.shared.cv.notify_all();
        true
    }

    pub fn is_running(&self) -> bool {
        let inner = self.shared.mutex.lock().unwrap();
        inner.state == TaskState::Running
    }

    /// Requests cancellation and blocks until the task is observably
    /// `Idle`. Returns immediately if no program is running.
    pub fn halt(&self) {
        let mut inner = self.shared.mutex.lock().unwrap();
        if inner.state != TaskState::Running {
            return;
        }
        self.shared.halt_requested.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        while inner.state == TaskState::Running {
            inner = self.shared.cv.wait(inner).unwrap();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmTaskError {
    #[error("VM task has already been initialized")]
    AlreadyInitialized,
    #[error("failed to spawn the VM task's worker thread")]
    WorkerSpawnFailed,
}

fn run_worker<H, D>(shared: Arc<Shared<H>>, delay: D)
where
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + 'static,
{
    loop {
        let (program, hid, on_complete) = {
            let mut inner = shared.mutex.lock().unwrap();
            loop {
                if let Some(pending) = inner.pending.take() {
                    inner.state = TaskState::Running;
                    let hid = inner.hid.clone().expect("worker only runs once initialized");
                    break (pending.program, hid, pending.on_complete);
                }
                inner = shared.cv.wait(inner).unwrap();
            }
        };

        shared.halt_requested.store(false, Ordering::SeqCst);
        debug!("vm_task: starting program of {} bytes", program.len());

        let mut vm = VmState::new(program);
        vm.arm();
        let halted = || shared.halt_requested.load(Ordering::SeqCst);

        let mut lifecycle = Lifecycle::Running;
        let mut cancelled = false;
        while lifecycle == Lifecycle::Running {
            lifecycle = vm.step(hid.as_ref(), &delay, &halted);
            if lifecycle != Lifecycle::Running {
                break;
            }
            if halted() {
                // Cooperative cancellation: VM Core only observes halt
                // inside WAIT, so the run loop itself must cut the program
                // short and provide the release-all guarantee belt-and-
                // braces, since VM Core believes it is still Running.
                warn!("vm_task: halted before natural completion");
                let _ = hid.emit(HidReport::RELEASE_ALL);
                cancelled = true;
                break;
            }
        }

        if let Some(e) = vm.last_error() {
            warn!("vm_task: program terminated with error: {e}");
        }

        {
            let mut inner = shared.mutex.lock().unwrap();
            inner.state = TaskState::Idle;
            shared.cv.notify_all();
        }

        if !cancelled {
            if let Some(cb) = on_complete {
                cb(lifecycle);
            }
        }
    }
}
