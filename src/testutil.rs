// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Test doubles shared by the unit tests.

use crate::engine::Core;
use crate::error::{Result, SinkError};
use crate::input::{InputNewData, InputStream};
use crate::memblock::MemChunk;
use crate::monitor::MonitorOutput;
use crate::port::DevicePort;
use crate::sink::{SinkBackend, SinkHooks, SinkState, VolumeRequest};
use crate::volume::ChannelVolume;
use parking_lot::Mutex;
use std::sync::Arc;

pub fn s16_chunk(samples: &[i16]) -> MemChunk {
    MemChunk::from_vec(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
}

pub fn s16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Plays one chunk once, keeping a reference to its block afterwards.
pub struct ChunkStream {
    chunk: MemChunk,
    underrun: usize,
}

impl ChunkStream {
    pub fn new(chunk: MemChunk) -> Self {
        Self { chunk, underrun: 0 }
    }

    /// A stream of `nbytes` zero bytes; 0 makes a stream that never has
    /// data.
    pub fn silence_bytes(nbytes: usize) -> Self {
        Self::new(MemChunk::from_vec(vec![0; nbytes]))
    }

    pub fn with_underrun(mut self, nbytes: usize) -> Self {
        self.underrun = nbytes;
        self
    }
}

impl InputStream for ChunkStream {
    fn peek(&mut self, length: usize) -> Option<MemChunk> {
        if self.chunk.length == 0 {
            return None;
        }
        Some(self.chunk.slice(0, length.min(self.chunk.length)))
    }

    fn drop_bytes(&mut self, nbytes: usize) {
        let n = nbytes.min(self.chunk.length);
        self.chunk.index += n;
        self.chunk.length -= n;
    }

    fn underrun_for(&self) -> usize {
        self.underrun
    }
}

/// Silent stream that records every suspend notification it receives.
pub struct SuspendRecorder {
    seen: Arc<Mutex<Vec<bool>>>,
}

impl SuspendRecorder {
    pub fn new() -> (Self, Arc<Mutex<Vec<bool>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

impl InputStream for SuspendRecorder {
    fn peek(&mut self, _length: usize) -> Option<MemChunk> {
        None
    }

    fn drop_bytes(&mut self, _nbytes: usize) {}

    fn suspend_within_thread(&mut self, suspended: bool) {
        self.seen.lock().push(suspended);
    }
}

/// Monitor output that keeps every chunk it is given.
pub struct CollectingOutput {
    chunks: Arc<Mutex<Vec<MemChunk>>>,
}

impl CollectingOutput {
    pub fn new() -> (Self, Arc<Mutex<Vec<MemChunk>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                chunks: Arc::clone(&chunks),
            },
            chunks,
        )
    }
}

impl MonitorOutput for CollectingOutput {
    fn push(&mut self, chunk: &MemChunk) {
        self.chunks.lock().push(chunk.clone());
    }
}

/// What a [`RecordingBackend`] was asked to do, plus the answers it gives.
#[derive(Debug, Default)]
pub struct BackendLog {
    pub states: Vec<SinkState>,
    pub set_volume_calls: Vec<ChannelVolume>,
    pub written: Vec<ChannelVolume>,
    pub mutes: Vec<bool>,
    pub ports: Vec<String>,
    pub rates: Vec<u32>,
    /// Returned by `get_volume` when set.
    pub hw_volume: Option<ChannelVolume>,
    pub hw_muted: Option<bool>,
    pub accept_rate: bool,
    pub fail_state: bool,
    /// Leave the device at unity and ask for the whole volume in software.
    pub soft_split: bool,
}

#[derive(Clone)]
pub struct RecordingBackend {
    hooks: SinkHooks,
    latency: u64,
    log: Arc<Mutex<BackendLog>>,
}

impl RecordingBackend {
    pub fn new(hooks: SinkHooks) -> Self {
        Self {
            hooks,
            latency: 0,
            log: Arc::new(Mutex::new(BackendLog::default())),
        }
    }

    pub fn with_latency(usec: u64) -> Self {
        let mut backend = Self::new(SinkHooks::empty());
        backend.latency = usec;
        backend
    }

    /// Hardware volume with deferred writes and a fixed device latency.
    pub fn deferred(latency: u64) -> Self {
        let mut backend = Self::new(SinkHooks::SET_VOLUME | SinkHooks::WRITE_VOLUME);
        backend.latency = latency;
        backend
    }

    /// Hardware volume, mute and ports, applied immediately.
    pub fn hardware() -> Self {
        Self::new(
            SinkHooks::SET_VOLUME
                | SinkHooks::GET_VOLUME
                | SinkHooks::SET_MUTE
                | SinkHooks::GET_MUTE
                | SinkHooks::SET_PORT,
        )
    }

    pub fn log(&self) -> Arc<Mutex<BackendLog>> {
        Arc::clone(&self.log)
    }
}

impl SinkBackend for RecordingBackend {
    fn hooks(&self) -> SinkHooks {
        self.hooks
    }

    fn set_state(&mut self, state: SinkState) -> Result<()> {
        let mut log = self.log.lock();
        if log.fail_state {
            return Err(SinkError::Backend(format!("refusing state {}", state)));
        }
        log.states.push(state);
        Ok(())
    }

    fn get_volume(&mut self, volume: &mut VolumeRequest) {
        if let Some(hw) = self.log.lock().hw_volume {
            volume.real_volume = hw;
        }
    }

    fn set_volume(&mut self, volume: &mut VolumeRequest) {
        let mut log = self.log.lock();
        log.set_volume_calls.push(volume.real_volume);
        if log.soft_split {
            volume.soft_volume = volume.real_volume;
        }
    }

    fn write_volume(&mut self, hw_volume: &ChannelVolume) {
        self.log.lock().written.push(*hw_volume);
    }

    fn get_mute(&mut self) -> Option<bool> {
        self.log.lock().hw_muted
    }

    fn set_mute(&mut self, muted: bool) {
        self.log.lock().mutes.push(muted);
    }

    fn set_port(&mut self, port: &DevicePort) -> Result<()> {
        self.log.lock().ports.push(port.name.clone());
        Ok(())
    }

    fn update_rate(&mut self, rate: u32) -> bool {
        let mut log = self.log.lock();
        log.rates.push(rate);
        log.accept_rate
    }

    fn latency(&mut self) -> u64 {
        self.latency
    }
}

/// Creates (but does not put) a silent input called `name` on `sink`.
pub fn new_input(core: &mut Core, sink: u32, name: &str) -> u32 {
    core.input_new(InputNewData::new(sink, ChunkStream::silence_bytes(0)).with_name(name))
        .unwrap()
}
