// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Cross-module integration scenarios: real stores, a real `VmTask`, and
//! the real `CommandBus`/`Handlers` wiring, exercised together the way a
//! firmware binary would assemble them. Unit-level detail already covered
//! inside each module (exact flash page/header bytes, ring wraparound,
//! debounce/repeat transitions) is not re-derived here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use odkey_capsules::bus::{self, opcode, CommandBus, Packet, ResponseSink, Transfer, PAYLOAD_SIZE, RESP_ERROR, RESP_OK};
use odkey_capsules::button::ButtonController;
use odkey_capsules::handlers::Handlers;
use odkey_capsules::log_ring::LogRing;
use odkey_capsules::store::flash::{FlashProgramStore, MemoryFlashBackend};
use odkey_capsules::store::ram::RamProgramStore;
use odkey_capsules::test::fakes::{
    FakeButtonInput, FakeConfigStore, ImmediateTimer, NoDelay, RecordingHid, SleepingDelay,
};
use odkey_capsules::vm_task::VmTask;

use odkey_kernel::hil::Owner;
use odkey_kernel::Lifecycle;

fn packet(opc: u8, payload: &[u8]) -> Packet {
    let mut bytes = [0u8; bus::PACKET_SIZE];
    bytes[0] = opc;
    let n = payload.len().min(PAYLOAD_SIZE);
    bytes[4..4 + n].copy_from_slice(&payload[..n]);
    Packet::from_bytes(&bytes)
}

struct RecordingSink {
    responses: Mutex<Vec<Packet>>,
}

impl RecordingSink {
    fn new() -> Self {
        RecordingSink {
            responses: Mutex::new(Vec::new()),
        }
    }

    fn wait_for(&self, n: usize) -> Vec<Packet> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let responses = self.responses.lock().unwrap();
                if responses.len() >= n {
                    return responses.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {n} bus responses");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl ResponseSink for RecordingSink {
    fn send(&self, response: Packet) {
        self.responses.lock().unwrap().push(response);
    }
}

type TestHandlers = Handlers<FlashProgramStore<MemoryFlashBackend>, RamProgramStore, FakeConfigStore, RecordingHid, NoDelay>;

fn wire_bus() -> (Arc<TestHandlers>, Arc<VmTask<RecordingHid, NoDelay>>, CommandBus, Arc<RecordingSink>) {
    let flash = Arc::new(FlashProgramStore::new(MemoryFlashBackend::new()));
    let ram = Arc::new(RamProgramStore::new());
    let config = Arc::new(FakeConfigStore::new());
    let log = Arc::new(LogRing::new());
    let vm_task = Arc::new(VmTask::new(NoDelay));
    vm_task.init(RecordingHid::new()).unwrap();

    let handlers = Arc::new(Handlers::new(flash, ram, config, log, Arc::clone(&vm_task)));
    let sink = Arc::new(RecordingSink::new());
    let bus = CommandBus::new(Arc::clone(&handlers), Arc::clone(&sink));
    (handlers, vm_task, bus, sink)
}

/// S4: a program uploaded over the wire protocol in many small chunks
/// round-trips through the real flash store and is byte-identical on
/// readback, driven entirely through `CommandBus` packets rather than
/// calling `ProgramStore` directly.
#[test]
fn s4_flash_round_trip_over_the_wire() {
    let (_handlers, _vm_task, bus, sink) = wire_bus();

    let payload = vec![0x42u8; 5000];
    assert!(bus.enqueue(packet(opcode::FLASH_PROG_WRITE_START, &5000u32.to_le_bytes())));
    let mut expected = 1;
    let responses = sink.wait_for(expected);
    assert_eq!(responses[expected - 1].opcode, RESP_OK);

    for chunk in payload.chunks(60) {
        assert!(bus.enqueue(packet(opcode::FLASH_PROG_WRITE_CHUNK, chunk)));
        expected += 1;
    }
    assert!(bus.enqueue(packet(opcode::FLASH_PROG_WRITE_FINISH, &5000u32.to_le_bytes())));
    expected += 1;

    let responses = sink.wait_for(expected);
    assert!(responses.iter().all(|p| p.opcode == RESP_OK));
    assert_eq!(bus.transfer_state(), Transfer::Idle);

    assert!(bus.enqueue(packet(opcode::FLASH_PROG_READ_START, &[])));
    expected += 1;
    let responses = sink.wait_for(expected);
    let total_len = u32::from_le_bytes(responses[expected - 1].payload[0..4].try_into().unwrap());
    assert_eq!(total_len, 5000);

    let mut collected = Vec::new();
    loop {
        assert!(bus.enqueue(packet(opcode::FLASH_PROG_READ_CHUNK, &[])));
        expected += 1;
        let responses = sink.wait_for(expected);
        let chunk = responses[expected - 1].payload;
        let remaining = 5000usize.saturating_sub(collected.len());
        if remaining == 0 {
            break;
        }
        let take = remaining.min(60);
        collected.extend_from_slice(&chunk[..take]);
        if take < 60 {
            break;
        }
    }
    assert_eq!(collected, payload);
    // The last chunk (exactly 20 of 60 bytes real) is the terminal one; the
    // bus must have returned to Idle without a separate stop opcode.
    assert_eq!(bus.transfer_state(), Transfer::Idle);
}

/// S5: a second writer (RAM program, a distinct target) interrupting an
/// in-flight flash upload latches `TransferStateMismatch` on the flash
/// session's continuation packets, observable as an `Error` transfer once
/// the stale owner tries to keep writing.
#[test]
fn s5_owner_interruption_through_the_bus() {
    let (_handlers, _vm_task, bus, sink) = wire_bus();

    bus.enqueue(packet(opcode::FLASH_PROG_WRITE_START, &1000u32.to_le_bytes()));
    bus.enqueue(packet(opcode::FLASH_PROG_WRITE_CHUNK, &[0u8; 60]));
    let mut responses = sink.wait_for(2);
    assert!(responses.iter().all(|p| p.opcode == RESP_OK));

    // A RAM upload starts concurrently; the bus's `Transfer` state moves to
    // ProgramWriting(Ram), so the stale flash CHUNK below is now illegal.
    bus.enqueue(packet(opcode::RAM_PROG_WRITE_START, &4u32.to_le_bytes()));
    responses = sink.wait_for(3);
    assert_eq!(responses[2].opcode, RESP_OK);
    assert_eq!(bus.transfer_state(), Transfer::ProgramWriting(bus::StoreTarget::Ram));

    bus.enqueue(packet(opcode::FLASH_PROG_WRITE_CHUNK, &[0u8; 60]));
    responses = sink.wait_for(4);
    assert_eq!(responses[3].opcode, RESP_ERROR);
    assert!(matches!(bus.transfer_state(), Transfer::Error(_)));
}

/// S6: halting a running VM during a `WAIT` stops it promptly, emits a
/// release-all, and never invokes the completion callback.
#[test]
fn s6_halt_during_wait_skips_completion_callback() {
    let hid = Arc::new(RecordingHid::new());
    let vm_task = Arc::new(VmTask::new(SleepingDelay));
    // VmTask::init takes ownership of the HID sink; keep our own handle via
    // a second Arc so the test can inspect reports after halting.
    struct SharedHid(Arc<RecordingHid>);
    impl odkey_kernel::hil::EmitHidReport for SharedHid {
        fn emit(&self, report: odkey_kernel::hil::HidReport) -> Result<(), ()> {
            self.0.emit(report)
        }
    }
    vm_task.init(SharedHid(Arc::clone(&hid))).unwrap();

    // KEYDN modifier=0 key=0x04, then a 2-second WAIT.
    let program: Arc<[u8]> = Arc::from(vec![0x10, 0x00, 0x01, 0x04, 0x13, 0xD0, 0x07].into_boxed_slice());
    let completed = Arc::new(AtomicBool::new(false));
    let completed_clone = Arc::clone(&completed);
    assert!(vm_task.start(program, Some(move |_lifecycle: Lifecycle| {
        completed_clone.store(true, Ordering::SeqCst);
    })));

    // Give the worker thread time to enter the WAIT.
    std::thread::sleep(Duration::from_millis(50));
    assert!(vm_task.is_running());

    vm_task.halt();
    assert!(!vm_task.is_running());
    assert!(!completed.load(Ordering::SeqCst));
    assert_eq!(hid.last(), Some(odkey_kernel::hil::HidReport::RELEASE_ALL));
}

/// Once a press starts a run, no further run is started until that run's
/// completion callback has fired: a second physical edge arriving while
/// `VmTask` is genuinely busy executing (a real `WAIT`, not an immediate
/// fake) is dropped rather than queued or interleaved.
#[test]
fn button_never_starts_a_second_run_before_the_first_completes() {
    let input = FakeButtonInput::new();
    let store = Arc::new(RamProgramStore::new());
    // KEYDN key=0x04; WAIT 200ms; KEYUP_ALL.
    let program = vec![0x10, 0x00, 0x01, 0x04, 0x13, 0xC8, 0x00, 0x12];
    store.start(program.len() as u32, Owner::Usb).unwrap();
    store.write_chunk(&program, Owner::Usb).unwrap();
    store.finish(program.len() as u32, Owner::Usb).unwrap();

    let vm_task = Arc::new(VmTask::new(SleepingDelay));
    vm_task.init(RecordingHid::new()).unwrap();

    let config = FakeConfigStore::new();
    let controller = ButtonController::new(
        Arc::clone(&input),
        ImmediateTimer,
        Arc::clone(&store),
        Arc::clone(&vm_task),
        &config,
    );
    controller.arm();

    input.press();
    controller.on_edge();

    let deadline = Instant::now() + Duration::from_secs(1);
    while !vm_task.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(vm_task.is_running());

    // A second physical edge while still running is dropped; the
    // controller's `ButtonInput` never sees `enable_interrupt` again until
    // the first run's completion callback re-arms it.
    controller.on_edge();
    assert!(vm_task.is_running());
    assert_eq!(controller.debug_state(), "debouncing");
    assert!(!input.interrupt_enabled.load(Ordering::SeqCst));

    input.release();
    let deadline = Instant::now() + Duration::from_secs(2);
    while controller.debug_state() != "armed" && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(controller.debug_state(), "armed");
    assert!(!vm_task.is_running());
}
