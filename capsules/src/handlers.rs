// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright ODKey Firmware Contributors 2026.

//! Command Handlers: thin adapters binding [`crate::bus::CommandBus`]
//! operations to the two Program Stores, the Config KV store, [`VmTask`],
//! and the Log Ring. Upload-start handlers halt the VM first so no
//! execution is ever reading a store's backing memory while it is about to
//! be mutated, mirroring the kv-driver capsule's validate-then-dispatch
//! adapter shape this crate draws on.

use std::sync::{Arc, Mutex};

use log::debug;

use odkey_kernel::hil::{ConfigStore, ConfigValue, DelayClock, EmitHidReport, Owner, ProgramStore};
use odkey_kernel::{BusError, ConfigError, StoreError};

use crate::log_ring::LogRing;
use crate::vm_task::VmTask;

/// Semantic operations the command bus dispatches into, one per wire
/// opcode family. Implemented once by [`Handlers`]; kept as a trait so
/// `CommandBus` can be tested against a fake independent of real stores.
pub trait CommandHandlers: Send + Sync {
    fn flash_write_start(&self, expected_len: u32) -> Result<(), BusError>;
    fn flash_write_chunk(&self, data: &[u8]) -> Result<(), BusError>;
    fn flash_write_finish(&self, final_len: u32) -> Result<(), BusError>;
    fn flash_read_start(&self) -> Result<u32, BusError>;
    /// Returns the next chunk and whether it was the last one in the read
    /// (so the caller can return the bus to `Idle` without a separate stop
    /// opcode).
    fn flash_read_chunk(&self) -> (Vec<u8>, bool);
    fn flash_execute(&self) -> Result<(), BusError>;

    fn ram_write_start(&self, expected_len: u32) -> Result<(), BusError>;
    fn ram_write_chunk(&self, data: &[u8]) -> Result<(), BusError>;
    fn ram_write_finish(&self, final_len: u32) -> Result<(), BusError>;
    fn ram_read_start(&self) -> Result<u32, BusError>;
    fn ram_read_chunk(&self) -> (Vec<u8>, bool);
    fn ram_execute(&self) -> Result<(), BusError>;

    fn config_set_start(&self, type_tag: u8, len: u32, key: [u8; 16]) -> Result<(), BusError>;
    fn config_set_data(&self, data: &[u8]) -> Result<(), BusError>;
    fn config_set_finish(&self) -> Result<(), BusError>;
    fn config_get_start(&self, key: [u8; 16]) -> Result<(u8, u32, Vec<u8>), BusError>;
    fn config_get_data(&self) -> (Vec<u8>, bool);
    fn config_delete(&self, key: [u8; 16]) -> Result<(), BusError>;

    fn log_read_start(&self) -> Result<(), BusError>;
    fn log_read_chunk(&self) -> (Vec<u8>, bool);
    fn log_read_stop(&self) -> Result<(), BusError>;
    fn log_clear(&self) -> Result<(), BusError>;
}

/// Progress state for an in-flight chunked read, kept in the handler since
/// the bus's own `Transfer` only records *which* read is in progress, not
/// how far it has gotten.
#[derive(Default)]
struct ReadCursor {
    total_len: u32,
    sent: u32,
}

#[derive(Default)]
struct ConfigSetSession {
    type_tag: u8,
    len: u32,
    key: [u8; 16],
    buffer: Vec<u8>,
}

#[derive(Default)]
struct HandlerState {
    flash_read: ReadCursor,
    ram_read: ReadCursor,
    config_set: Option<ConfigSetSession>,
    config_get: ReadCursor,
    config_get_buffer: Vec<u8>,
}

/// Binds a [`VmTask`], both program stores, a [`ConfigStore`], and a
/// [`LogRing`] into the [`CommandHandlers`] the bus dispatches into.
pub struct Handlers<FS, RS, CS, H, D>
where
    FS: ProgramStore + Send + Sync + 'static,
    RS: ProgramStore + Send + Sync + 'static,
    CS: ConfigStore + Send + Sync + 'static,
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    flash: Arc<FS>,
    ram: Arc<RS>,
    config: Arc<CS>,
    log: Arc<LogRing>,
    vm_task: Arc<VmTask<H, D>>,
    state: Mutex<HandlerState>,
}

impl<FS, RS, CS, H, D> Handlers<FS, RS, CS, H, D>
where
    FS: ProgramStore + Send + Sync + 'static,
    RS: ProgramStore + Send + Sync + 'static,
    CS: ConfigStore + Send + Sync + 'static,
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    pub fn new(
        flash: Arc<FS>,
        ram: Arc<RS>,
        config: Arc<CS>,
        log: Arc<LogRing>,
        vm_task: Arc<VmTask<H, D>>,
    ) -> Self {
        Handlers {
            flash,
            ram,
            config,
            log,
            vm_task,
            state: Mutex::new(HandlerState::default()),
        }
    }

    fn write_start(store: &dyn ProgramStore, expected_len: u32) -> Result<(), BusError> {
        store.start(expected_len, Owner::Usb)?;
        Ok(())
    }

    /// The wire `*_WRITE_CHUNK` packet always carries a 60-byte payload
    /// field; only `min(60, expected_len - bytes_written)` of it is ever
    /// meaningful; the rest is padding the sender doesn't bother trimming.
    fn write_chunk(store: &dyn ProgramStore, data: &[u8]) -> Result<(), BusError> {
        let remaining = store.expected_len().saturating_sub(store.bytes_written());
        let take = (data.len() as u32).min(remaining) as usize;
        store.write_chunk(&data[..take], Owner::Usb)?;
        Ok(())
    }

    fn write_finish(store: &dyn ProgramStore, final_len: u32) -> Result<(), BusError> {
        store.finish(final_len, Owner::Usb)?;
        Ok(())
    }

    fn read_start(store: &dyn ProgramStore, cursor: &mut ReadCursor) -> Result<u32, BusError> {
        let (_, len) = store.get().ok_or(StoreError::NotInitialized)?;
        cursor.total_len = len;
        cursor.sent = 0;
        Ok(len)
    }

    fn read_chunk(store: &dyn ProgramStore, cursor: &mut ReadCursor) -> (Vec<u8>, bool) {
        let Some((bytes, _)) = store.get() else {
            return (Vec::new(), true);
        };
        let start = cursor.sent as usize;
        if start >= bytes.len() {
            return (Vec::new(), true);
        }
        let end = (start + 60).min(bytes.len());
        cursor.sent = end as u32;
        let mut chunk = bytes[start..end].to_vec();
        chunk.resize(60, 0);
        (chunk, end >= bytes.len())
    }

    fn execute(&self, store: &dyn ProgramStore) -> Result<(), BusError> {
        if self.vm_task.is_running() {
            return Err(BusError::TransferStateMismatch);
        }
        let (bytes, _) = store.get().ok_or(StoreError::NotInitialized)?;
        self.vm_task.start(Arc::from(bytes), None::<fn(odkey_kernel::Lifecycle)>);
        Ok(())
    }
}

impl<FS, RS, CS, H, D> CommandHandlers for Handlers<FS, RS, CS, H, D>
where
    FS: ProgramStore + Send + Sync + 'static,
    RS: ProgramStore + Send + Sync + 'static,
    CS: ConfigStore + Send + Sync + 'static,
    H: EmitHidReport + Send + Sync + 'static,
    D: DelayClock + Send + Sync + Clone + 'static,
{
    fn flash_write_start(&self, expected_len: u32) -> Result<(), BusError> {
        self.vm_task.halt();
        Self::write_start(self.flash.as_ref(), expected_len)
    }

    fn flash_write_chunk(&self, data: &[u8]) -> Result<(), BusError> {
        Self::write_chunk(self.flash.as_ref(), data)
    }

    fn flash_write_finish(&self, final_len: u32) -> Result<(), BusError> {
        Self::write_finish(self.flash.as_ref(), final_len)
    }

    fn flash_read_start(&self) -> Result<u32, BusError> {
        let mut state = self.state.lock().unwrap();
        Self::read_start(self.flash.as_ref(), &mut state.flash_read)
    }

    fn flash_read_chunk(&self) -> (Vec<u8>, bool) {
        let mut state = self.state.lock().unwrap();
        Self::read_chunk(self.flash.as_ref(), &mut state.flash_read)
    }

    fn flash_execute(&self) -> Result<(), BusError> {
        self.execute(self.flash.as_ref())
    }

    fn ram_write_start(&self, expected_len: u32) -> Result<(), BusError> {
        self.vm_task.halt();
        Self::write_start(self.ram.as_ref(), expected_len)
    }

    fn ram_write_chunk(&self, data: &[u8]) -> Result<(), BusError> {
        Self::write_chunk(self.ram.as_ref(), data)
    }

    fn ram_write_finish(&self, final_len: u32) -> Result<(), BusError> {
        Self::write_finish(self.ram.as_ref(), final_len)
    }

    fn ram_read_start(&self) -> Result<u32, BusError> {
        let mut state = self.state.lock().unwrap();
        Self::read_start(self.ram.as_ref(), &mut state.ram_read)
    }

    fn ram_read_chunk(&self) -> (Vec<u8>, bool) {
        let mut state = self.state.lock().unwrap();
        Self::read_chunk(self.ram.as_ref(), &mut state.ram_read)
    }

    fn ram_execute(&self) -> Result<(), BusError> {
        self.execute(self.ram.as_ref())
    }

    fn config_set_start(&self, type_tag: u8, len: u32, key: [u8; 16]) -> Result<(), BusError> {
        if len as usize > odkey_kernel::hil::CONFIG_VALUE_MAX_LEN {
            return Err(ConfigError::ValueTooLarge.into());
        }
        let mut state = self.state.lock().unwrap();
        state.config_set = Some(ConfigSetSession {
            type_tag,
            len,
            key,
            buffer: Vec::with_capacity(len as usize),
        });
        Ok(())
    }

    fn config_set_data(&self, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .config_set
            .as_mut()
            .ok_or(BusError::TransferStateMismatch)?;
        let remaining = (session.len as usize).saturating_sub(session.buffer.len());
        let take = data.len().min(remaining);
        session.buffer.extend_from_slice(&data[..take]);
        Ok(())
    }

    fn config_set_finish(&self) -> Result<(), BusError> {
        let session = {
            let mut state = self.state.lock().unwrap();
            state
                .config_set
                .take()
                .ok_or(BusError::TransferStateMismatch)?
        };
        let key = decode_key(&session.key)?;
        let value = decode_config_value(session.type_tag, &session.buffer)?;
        self.config.set_by_type(&key, value)?;
        self.config.commit()?;
        debug!("command bus: committed config key {key:?}");
        Ok(())
    }

    fn config_get_start(&self, key: [u8; 16]) -> Result<(u8, u32, Vec<u8>), BusError> {
        let key = decode_key(&key)?;
        let value = self.config.get_by_type(&key)?;
        let type_tag = value.type_tag();
        let encoded = value.encode();
        let len = encoded.len() as u32;

        let mut state = self.state.lock().unwrap();
        state.config_get_buffer = encoded.clone();
        state.config_get.total_len = len;
        state.config_get.sent = (len.min(55)) as u32;

        let mut first = encoded;
        first.truncate(55);
        Ok((type_tag, len, first))
    }

    fn config_get_data(&self) -> (Vec<u8>, bool) {
        let mut state = self.state.lock().unwrap();
        let start = state.config_get.sent as usize;
        let buffer = state.config_get_buffer.clone();
        if start >= buffer.len() {
            return (Vec::new(), true);
        }
        let end = (start + 60).min(buffer.len());
        state.config_get.sent = end as u32;
        let mut chunk = buffer[start..end].to_vec();
        chunk.resize(60, 0);
        (chunk, end >= buffer.len())
    }

    fn config_delete(&self, key: [u8; 16]) -> Result<(), BusError> {
        let key = decode_key(&key)?;
        self.config.erase_key(&key)?;
        self.config.commit()?;
        Ok(())
    }

    fn log_read_start(&self) -> Result<(), BusError> {
        self.log.start_read();
        Ok(())
    }

    fn log_read_chunk(&self) -> (Vec<u8>, bool) {
        let chunk = self.log.read_chunk(60);
        (chunk, self.log.remaining() == 0)
    }

    fn log_read_stop(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn log_clear(&self) -> Result<(), BusError> {
        self.log.clear();
        Ok(())
    }
}

fn decode_key(raw: &[u8; 16]) -> Result<String, BusError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if end == 0 || end > odkey_kernel::hil::CONFIG_KEY_MAX_LEN {
        return Err(ConfigError::KeyLengthInvalid.into());
    }
    std::str::from_utf8(&raw[..end])
        .map(|s| s.to_string())
        .map_err(|_| ConfigError::KeyLengthInvalid.into())
}

fn decode_config_value(type_tag: u8, bytes: &[u8]) -> Result<ConfigValue, BusError> {
    fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], BusError> {
        bytes
            .try_into()
            .map_err(|_| BusError::from(ConfigError::TypeMismatch))
    }
    Ok(match type_tag {
        0 => ConfigValue::I8(i8::from_le_bytes(fixed(bytes)?)),
        1 => ConfigValue::U8(u8::from_le_bytes(fixed(bytes)?)),
        2 => ConfigValue::I16(i16::from_le_bytes(fixed(bytes)?)),
        3 => ConfigValue::U16(u16::from_le_bytes(fixed(bytes)?)),
        4 => ConfigValue::I32(i32::from_le_bytes(fixed(bytes)?)),
        5 => ConfigValue::U32(u32::from_le_bytes(fixed(bytes)?)),
        6 => ConfigValue::I64(i64::from_le_bytes(fixed(bytes)?)),
        7 => ConfigValue::U64(u64::from_le_bytes(fixed(bytes)?)),
        8 => ConfigValue::Str(
            std::str::from_utf8(bytes)
                .map_err(|_| ConfigError::TypeMismatch)?
                .to_string(),
        ),
        9 => ConfigValue::Blob(bytes.to_vec()),
        _ => return Err(ConfigError::TypeMismatch.into()),
    })
}
