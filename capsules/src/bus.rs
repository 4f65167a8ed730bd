// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Command Bus: parses fixed-size host packets, tracks the one in-flight
//! transfer, dispatches into a [`CommandHandlers`] implementation, and
//! frames the response — the same queue-then-worker-drains shape as the
//! app-loader capsule's chunked upload driver, generalized from one opcode
//! family to the full FLASH/RAM/CONFIG/LOG catalog below.
//!
//! The bus is deliberately dumb about *how* an operation is carried out: it
//! only knows which [`Transfer`] state a given opcode requires and which
//! [`CommandHandlers`] method to call. All storage, config, and VM-task
//! semantics live in [`crate::handlers`].

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use odkey_kernel::BusError;

use crate::handlers::CommandHandlers;

pub const PACKET_SIZE: usize = 64;
pub const PAYLOAD_SIZE: usize = 60;

/// Wire opcodes, grouped by the target they act on (§4.H).
pub mod opcode {
    pub const FLASH_PROG_WRITE_START: u8 = 0x20;
    pub const FLASH_PROG_WRITE_CHUNK: u8 = 0x21;
    pub const FLASH_PROG_WRITE_FINISH: u8 = 0x22;
    pub const FLASH_PROG_READ_START: u8 = 0x23;
    pub const FLASH_PROG_READ_CHUNK: u8 = 0x24;
    pub const FLASH_PROG_EXECUTE: u8 = 0x25;

    pub const RAM_PROG_WRITE_START: u8 = 0x26;
    pub const RAM_PROG_WRITE_CHUNK: u8 = 0x27;
    pub const RAM_PROG_WRITE_FINISH: u8 = 0x28;
    pub const RAM_PROG_READ_START: u8 = 0x29;
    pub const RAM_PROG_READ_CHUNK: u8 = 0x2a;
    pub const RAM_PROG_EXECUTE: u8 = 0x2b;

    pub const CONFIG_SET_START: u8 = 0x30;
    pub const CONFIG_SET_DATA: u8 = 0x31;
    pub const CONFIG_SET_FINISH: u8 = 0x32;
    pub const CONFIG_GET_START: u8 = 0x33;
    pub const CONFIG_GET_DATA: u8 = 0x34;
    pub const CONFIG_DELETE: u8 = 0x35;

    pub const LOG_READ_START: u8 = 0x40;
    pub const LOG_READ_CHUNK: u8 = 0x41;
    pub const LOG_READ_STOP: u8 = 0x42;
    pub const LOG_CLEAR: u8 = 0x43;
}

pub const RESP_OK: u8 = 0x10;
pub const RESP_ERROR: u8 = 0x11;

/// Depth of the bus's inbound work queue. Packets that arrive while it is
/// full are dropped silently (§4.H) rather than backpressuring the host.
pub const QUEUE_DEPTH: usize = 16;

/// A single 64-byte wire packet: a one-byte opcode (or response code), three
/// reserved bytes, and a 60-byte payload.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub opcode: u8,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Packet {
    pub fn from_bytes(bytes: &[u8; PACKET_SIZE]) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[4..PACKET_SIZE]);
        Packet {
            opcode: bytes[0],
            payload,
        }
    }

    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut out = [0u8; PACKET_SIZE];
        out[0] = self.opcode;
        out[4..PACKET_SIZE].copy_from_slice(&self.payload);
        out
    }

    fn ok(payload: &[u8]) -> Self {
        let mut p = Packet {
            opcode: RESP_OK,
            payload: [0u8; PAYLOAD_SIZE],
        };
        let n = payload.len().min(PAYLOAD_SIZE);
        p.payload[..n].copy_from_slice(&payload[..n]);
        p
    }

    fn error() -> Self {
        Packet {
            opcode: RESP_ERROR,
            payload: [0u8; PAYLOAD_SIZE],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTarget {
    Flash,
    Ram,
}

/// The bus's one piece of cross-packet state: which chunked exchange, if
/// any, is in progress. `Error` retains the `BusError` that latched it so a
/// caller (or a log line) can see *why* without re-deriving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Idle,
    ProgramWriting(StoreTarget),
    ProgramReading(StoreTarget),
    ConfigSetting,
    ConfigGetting,
    LogStreaming,
    Error(BusError),
}

/// Delivers a response packet back to its transport. Implemented by
/// whatever owns the actual USB/HTTP endpoint; out of scope here.
pub trait ResponseSink: Send + Sync {
    fn send(&self, response: Packet);
}

enum Family {
    /// Always legal; resets `Transfer` (including out of `Error`) and, on
    /// success, enters the state named alongside it.
    Start(Transfer),
    /// Legal only while `Transfer` equals the accompanying state.
    Continuation(Transfer),
    /// Legal only while `Transfer` is `Idle`; not part of any chunked
    /// session.
    Standalone,
}

fn family(opc: u8) -> Option<Family> {
    use opcode::*;
    use Family::*;
    Some(match opc {
        FLASH_PROG_WRITE_START => Start(Transfer::ProgramWriting(StoreTarget::Flash)),
        FLASH_PROG_WRITE_CHUNK | FLASH_PROG_WRITE_FINISH => {
            Continuation(Transfer::ProgramWriting(StoreTarget::Flash))
        }
        FLASH_PROG_READ_START => Start(Transfer::ProgramReading(StoreTarget::Flash)),
        FLASH_PROG_READ_CHUNK => Continuation(Transfer::ProgramReading(StoreTarget::Flash)),
        FLASH_PROG_EXECUTE => Standalone,

        RAM_PROG_WRITE_START => Start(Transfer::ProgramWriting(StoreTarget::Ram)),
        RAM_PROG_WRITE_CHUNK | RAM_PROG_WRITE_FINISH => {
            Continuation(Transfer::ProgramWriting(StoreTarget::Ram))
        }
        RAM_PROG_READ_START => Start(Transfer::ProgramReading(StoreTarget::Ram)),
        RAM_PROG_READ_CHUNK => Continuation(Transfer::ProgramReading(StoreTarget::Ram)),
        RAM_PROG_EXECUTE => Standalone,

        CONFIG_SET_START => Start(Transfer::ConfigSetting),
        CONFIG_SET_DATA | CONFIG_SET_FINISH => Continuation(Transfer::ConfigSetting),
        CONFIG_GET_START => Start(Transfer::ConfigGetting),
        CONFIG_GET_DATA => Continuation(Transfer::ConfigGetting),
        CONFIG_DELETE => Standalone,

        LOG_READ_START => Start(Transfer::LogStreaming),
        LOG_READ_CHUNK | LOG_READ_STOP => Continuation(Transfer::LogStreaming),
        LOG_CLEAR => Standalone,

        _ => return None,
    })
}

/// Parses packets, enforces `Transfer` legality, and dispatches into a
/// [`CommandHandlers`] on a dedicated worker thread so a slow handler (e.g.
/// a flash page write) never blocks the USB interrupt path that feeds the
/// queue.
pub struct CommandBus {
    queue: SyncSender<Packet>,
    transfer: Arc<Mutex<Transfer>>,
}

impl CommandBus {
    pub fn new<C, R>(handlers: Arc<C>, response_sink: Arc<R>) -> Self
    where
        C: CommandHandlers + 'static,
        R: ResponseSink + 'static,
    {
        let (tx, rx): (SyncSender<Packet>, Receiver<Packet>) = sync_channel(QUEUE_DEPTH);
        let transfer = Arc::new(Mutex::new(Transfer::Idle));
        let worker_transfer = Arc::clone(&transfer);

        thread::Builder::new()
            .name("odkey-command-bus".into())
            .spawn(move || {
                for packet in rx.iter() {
                    let response = process(&worker_transfer, handlers.as_ref(), packet);
                    response_sink.send(response);
                }
            })
            .expect("failed to spawn command bus worker");

        CommandBus {
            queue: tx,
            transfer,
        }
    }

    /// Enqueues `packet` for asynchronous processing. Returns `false`
    /// (dropping the packet) if the queue is full rather than blocking the
    /// caller, matching the bus's "drop under load" contract.
    pub fn enqueue(&self, packet: Packet) -> bool {
        match self.queue.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("command bus: queue full, dropping packet (opcode {:#04x})", packet.opcode);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("command bus: worker thread gone, dropping packet");
                false
            }
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn transfer_state(&self) -> Transfer {
        *self.transfer.lock().unwrap()
    }
}

fn process(transfer_lock: &Mutex<Transfer>, handlers: &dyn CommandHandlers, packet: Packet) -> Packet {
    let Some(fam) = family(packet.opcode) else {
        warn!("command bus: unknown opcode {:#04x}", packet.opcode);
        latch(transfer_lock, BusError::UnknownOpcode(packet.opcode));
        return Packet::error();
    };

    match fam {
        Family::Start(entering) => {
            let result = dispatch(handlers, packet.opcode, &packet.payload);
            match result {
                Ok((response, _completes)) => {
                    *transfer_lock.lock().unwrap() = entering;
                    response
                }
                Err(e) => {
                    latch(transfer_lock, e);
                    Packet::error()
                }
            }
        }
        Family::Continuation(required) => {
            if *transfer_lock.lock().unwrap() != required {
                debug!("command bus: opcode {:#04x} rejected, transfer state mismatch", packet.opcode);
                latch(transfer_lock, BusError::TransferStateMismatch);
                return Packet::error();
            }
            match dispatch(handlers, packet.opcode, &packet.payload) {
                Ok((response, completes)) => {
                    if completes {
                        *transfer_lock.lock().unwrap() = Transfer::Idle;
                    }
                    response
                }
                Err(e) => {
                    latch(transfer_lock, e);
                    Packet::error()
                }
            }
        }
        Family::Standalone => {
            if *transfer_lock.lock().unwrap() != Transfer::Idle {
                latch(transfer_lock, BusError::TransferStateMismatch);
                return Packet::error();
            }
            match dispatch(handlers, packet.opcode, &packet.payload) {
                Ok((response, _completes)) => response,
                Err(e) => {
                    latch(transfer_lock, e);
                    Packet::error()
                }
            }
        }
    }
}

fn latch(transfer_lock: &Mutex<Transfer>, e: BusError) {
    warn!("command bus: latching Error transfer state: {e}");
    *transfer_lock.lock().unwrap() = Transfer::Error(e);
}

/// Dispatches one opcode into its handler. The returned `bool` is only
/// consulted for `Family::Continuation` opcodes: it tells `process` whether
/// this call ends the in-flight transfer, either because it's an explicit
/// `*_FINISH`/`*_STOP` or because a chunked read just delivered its last
/// chunk.
fn dispatch(handlers: &dyn CommandHandlers, opc: u8, payload: &[u8; PAYLOAD_SIZE]) -> Result<(Packet, bool), BusError> {
    use opcode::*;
    Ok(match opc {
        FLASH_PROG_WRITE_START => {
            let len = u32_le(payload, 0);
            handlers.flash_write_start(len)?;
            (Packet::ok(&[]), false)
        }
        FLASH_PROG_WRITE_CHUNK => {
            handlers.flash_write_chunk(payload)?;
            (Packet::ok(&[]), false)
        }
        FLASH_PROG_WRITE_FINISH => {
            let len = u32_le(payload, 0);
            handlers.flash_write_finish(len)?;
            (Packet::ok(&[]), true)
        }
        FLASH_PROG_READ_START => {
            let len = handlers.flash_read_start()?;
            (Packet::ok(&len.to_le_bytes()), false)
        }
        FLASH_PROG_READ_CHUNK => {
            let (chunk, done) = handlers.flash_read_chunk();
            (Packet::ok(&chunk), done)
        }
        FLASH_PROG_EXECUTE => {
            handlers.flash_execute()?;
            (Packet::ok(&[]), false)
        }

        RAM_PROG_WRITE_START => {
            let len = u32_le(payload, 0);
            handlers.ram_write_start(len)?;
            (Packet::ok(&[]), false)
        }
        RAM_PROG_WRITE_CHUNK => {
            handlers.ram_write_chunk(payload)?;
            (Packet::ok(&[]), false)
        }
        RAM_PROG_WRITE_FINISH => {
            let len = u32_le(payload, 0);
            handlers.ram_write_finish(len)?;
            (Packet::ok(&[]), true)
        }
        RAM_PROG_READ_START => {
            let len = handlers.ram_read_start()?;
            (Packet::ok(&len.to_le_bytes()), false)
        }
        RAM_PROG_READ_CHUNK => {
            let (chunk, done) = handlers.ram_read_chunk();
            (Packet::ok(&chunk), done)
        }
        RAM_PROG_EXECUTE => {
            handlers.ram_execute()?;
            (Packet::ok(&[]), false)
        }

        CONFIG_SET_START => {
            let type_tag = payload[0];
            let len = u32_le(payload, 1);
            let mut key = [0u8; 16];
            key.copy_from_slice(&payload[5..21]);
            handlers.config_set_start(type_tag, len, key)?;
            (Packet::ok(&[]), false)
        }
        CONFIG_SET_DATA => {
            handlers.config_set_data(payload)?;
            (Packet::ok(&[]), false)
        }
        CONFIG_SET_FINISH => {
            handlers.config_set_finish()?;
            (Packet::ok(&[]), true)
        }
        CONFIG_GET_START => {
            let mut key = [0u8; 16];
            key.copy_from_slice(&payload[0..16]);
            let (type_tag, len, first) = handlers.config_get_start(key)?;
            let mut resp = Vec::with_capacity(5 + first.len());
            resp.push(type_tag);
            resp.extend_from_slice(&len.to_le_bytes());
            resp.extend_from_slice(&first);
            (Packet::ok(&resp), false)
        }
        CONFIG_GET_DATA => {
            let (chunk, done) = handlers.config_get_data();
            (Packet::ok(&chunk), done)
        }
        CONFIG_DELETE => {
            let mut key = [0u8; 16];
            key.copy_from_slice(&payload[0..16]);
            handlers.config_delete(key)?;
            (Packet::ok(&[]), false)
        }

        LOG_READ_START => {
            handlers.log_read_start()?;
            (Packet::ok(&[]), false)
        }
        LOG_READ_CHUNK => {
            let (chunk, done) = handlers.log_read_chunk();
            (Packet::ok(&chunk), done)
        }
        LOG_READ_STOP => {
            handlers.log_read_stop()?;
            (Packet::ok(&[]), true)
        }
        LOG_CLEAR => {
            handlers.log_clear()?;
            (Packet::ok(&[]), false)
        }

        other => return Err(BusError::UnknownOpcode(other)),
    })
}

fn u32_le(payload: &[u8; PAYLOAD_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap())
}
