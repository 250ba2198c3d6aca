// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thread-side sink state and the message dispatcher.

use super::message::{Reply, SinkMessage, VolumeSync};
use super::volume_change::VolumeChangeQueue;
use super::Notice;
use crate::clock::Clock;
use crate::error::SinkError;
use crate::input::{InputState, ThreadInput};
use crate::memblock::{MemChunk, MAX_BLOCK_SIZE};
use crate::monitor::MonitorThread;
use crate::sample::SampleSpec;
use crate::sink::latency::{ABSOLUTE_MAX_LATENCY, ABSOLUTE_MIN_LATENCY, DEFAULT_FIXED_LATENCY};
use crate::sink::{SharedBackend, SinkFlags, SinkHooks, SinkState, VolumeRequest};
use crate::volume::ChannelVolume;
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything needed to build the thread-side state of a new sink.
pub(crate) struct ThreadInit {
    pub index: u32,
    pub name: String,
    pub sample_spec: SampleSpec,
    pub flags: SinkFlags,
    pub hooks: SinkHooks,
    pub backend: SharedBackend,
    pub clock: Arc<dyn Clock>,
    pub notices: Sender<Notice>,
    pub safety_margin: u64,
    pub extra_delay: u64,
    pub mono_downmix: bool,
    pub soft_volume: ChannelVolume,
    pub muted: bool,
}

/// Sink state owned by the IO thread.
///
/// Drivers get a `&mut SinkThread` from [`SinkDriver::process`](super::SinkDriver::process)
/// and use it to render audio and to handle rewinds.
pub struct SinkThread {
    pub(crate) index: u32,
    pub(crate) name: String,
    pub(crate) sample_spec: SampleSpec,
    pub(crate) flags: SinkFlags,
    pub(crate) hooks: SinkHooks,
    pub(crate) backend: SharedBackend,
    clock: Arc<dyn Clock>,
    notices: Sender<Notice>,

    pub(crate) state: SinkState,
    pub(crate) soft_volume: ChannelVolume,
    pub(crate) soft_muted: bool,

    requested_latency_valid: bool,
    requested_latency: Option<u64>,
    pub(crate) min_latency: u64,
    pub(crate) max_latency: u64,
    pub(crate) fixed_latency: u64,
    pub(crate) max_rewind: usize,
    pub(crate) max_request: usize,
    pub(crate) rewind_nbytes: usize,
    pub(crate) rewind_requested: bool,
    pub(crate) latency_offset: i64,

    pub(crate) current_hw_volume: ChannelVolume,
    pub(crate) volume_changes: VolumeChangeQueue,

    pub(crate) inputs: BTreeMap<u32, Box<ThreadInput>>,
    pub(crate) monitor: MonitorThread,
    pub(crate) silence: MemChunk,
    pub(crate) mono_downmix: bool,
}

impl SinkThread {
    pub(crate) fn new(init: ThreadInit) -> Self {
        let fixed_latency = if init.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            0
        } else {
            DEFAULT_FIXED_LATENCY
        };
        let silence_len = init.sample_spec.frame_align(MAX_BLOCK_SIZE);

        let mut monitor = MonitorThread::new();
        monitor.set_latency_range(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY);
        monitor.set_fixed_latency(fixed_latency);

        Self {
            index: init.index,
            name: init.name,
            sample_spec: init.sample_spec,
            flags: init.flags,
            hooks: init.hooks,
            backend: init.backend,
            clock: init.clock,
            notices: init.notices,
            state: SinkState::Init,
            soft_volume: init.soft_volume,
            soft_muted: init.muted,
            requested_latency_valid: false,
            requested_latency: None,
            min_latency: ABSOLUTE_MIN_LATENCY,
            max_latency: ABSOLUTE_MAX_LATENCY,
            fixed_latency,
            max_rewind: 0,
            max_request: 0,
            rewind_nbytes: 0,
            rewind_requested: false,
            latency_offset: 0,
            current_hw_volume: ChannelVolume::norm(init.sample_spec.channels),
            volume_changes: VolumeChangeQueue::new(init.safety_margin, init.extra_delay),
            inputs: BTreeMap::new(),
            monitor,
            silence: MemChunk::silence(&init.sample_spec, silence_len),
            mono_downmix: init.mono_downmix,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    pub fn flags(&self) -> SinkFlags {
        self.flags
    }

    pub fn soft_volume(&self) -> &ChannelVolume {
        &self.soft_volume
    }

    pub fn soft_muted(&self) -> bool {
        self.soft_muted
    }

    pub fn current_hw_volume(&self) -> &ChannelVolume {
        &self.current_hw_volume
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn max_request(&self) -> usize {
        self.max_request
    }

    pub fn latency_range(&self) -> (u64, u64) {
        (self.min_latency, self.max_latency)
    }

    pub fn fixed_latency(&self) -> u64 {
        self.fixed_latency
    }

    pub fn rewind_requested(&self) -> bool {
        self.rewind_requested
    }

    pub fn rewind_nbytes(&self) -> usize {
        self.rewind_nbytes
    }

    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn pending_volume_changes(&self) -> usize {
        self.volume_changes.len()
    }

    /// Asks the main thread to re-read hardware volume and mute.
    pub fn notify_volume_and_mute_changed(&self) {
        if self.notices.send(Notice::UpdateVolumeAndMute(self.index)).is_err() {
            debug!("Sink {}: main side gone, dropping volume notice", self.name);
        }
    }

    pub fn process_msg(&mut self, msg: SinkMessage) -> Reply {
        trace!("Sink {} processing {}", self.name, msg.name());

        match msg {
            SinkMessage::AddInput(input) => {
                self.add_input(input);
                Reply::Done
            }
            SinkMessage::RemoveInput(index) => {
                self.remove_input(index);
                Reply::Done
            }
            SinkMessage::StartMove(index) => Reply::Input(self.start_move(index)),
            SinkMessage::FinishMove(input) => {
                self.finish_move(input);
                Reply::Done
            }
            SinkMessage::SetVolumeSynced(sync) => self.set_volume_synced(sync),
            SinkMessage::SetVolume(sync) => {
                self.adopt_soft_volume(&sync.soft_volume);
                self.sync_input_volumes(&sync.inputs);
                Reply::Done
            }
            SinkMessage::SyncVolumes(inputs) => {
                self.sync_input_volumes(&inputs);
                Reply::Done
            }
            SinkMessage::GetVolume {
                real_volume,
                soft_volume,
            } => {
                let mut req = VolumeRequest {
                    real_volume,
                    soft_volume,
                };
                if self.flags.contains(SinkFlags::DEFERRED_VOLUME)
                    && self.hooks.contains(SinkHooks::GET_VOLUME)
                {
                    self.backend.lock().get_volume(&mut req);
                    self.volume_changes.flush();
                    self.current_hw_volume = req.real_volume.divide(&req.soft_volume);
                }
                // The backend may have reset the soft volume.
                self.adopt_soft_volume(&req.soft_volume);
                Reply::HwVolume {
                    real_volume: req.real_volume,
                    soft_volume: req.soft_volume,
                }
            }
            SinkMessage::SetMute(muted) => {
                if self.soft_muted != muted {
                    self.soft_muted = muted;
                    self.request_rewind(None);
                }
                if self.flags.contains(SinkFlags::DEFERRED_VOLUME)
                    && self.hooks.contains(SinkHooks::SET_MUTE)
                {
                    self.backend.lock().set_mute(muted);
                }
                Reply::Done
            }
            SinkMessage::GetMute(mut muted) => {
                if self.flags.contains(SinkFlags::DEFERRED_VOLUME)
                    && self.hooks.contains(SinkHooks::GET_MUTE)
                {
                    if let Some(m) = self.backend.lock().get_mute() {
                        muted = m;
                    }
                }
                Reply::Muted(muted)
            }
            SinkMessage::SetState(state) => {
                self.set_state(state);
                Reply::Done
            }
            SinkMessage::Detach => {
                self.detach_all();
                Reply::Done
            }
            SinkMessage::Attach => {
                self.attach_all();
                Reply::Done
            }
            SinkMessage::GetRequestedLatency => {
                // The main thread sees the maximum where the IO thread sees
                // "no request".
                let usec = self.requested_latency().unwrap_or(self.max_latency);
                Reply::Usec(usec)
            }
            SinkMessage::SetLatencyRange { min, max } => {
                self.set_latency_range(min, max);
                Reply::Done
            }
            SinkMessage::GetLatencyRange => Reply::LatencyRange {
                min: self.min_latency,
                max: self.max_latency,
            },
            SinkMessage::SetFixedLatency(usec) => {
                self.set_fixed_latency(usec);
                Reply::Done
            }
            SinkMessage::GetFixedLatency => Reply::Usec(self.fixed_latency),
            SinkMessage::GetMaxRewind => Reply::Bytes(self.max_rewind),
            SinkMessage::SetMaxRewind(nbytes) => {
                self.set_max_rewind(nbytes);
                Reply::Done
            }
            SinkMessage::GetMaxRequest => Reply::Bytes(self.max_request),
            SinkMessage::SetMaxRequest(nbytes) => {
                self.set_max_request(nbytes);
                Reply::Done
            }
            SinkMessage::SetPort(port) => {
                let result = if self.hooks.contains(SinkHooks::SET_PORT) {
                    self.backend.lock().set_port(&port)
                } else {
                    Err(SinkError::NotImplemented)
                };
                Reply::Status(result)
            }
            SinkMessage::SetLatencyOffset(offset) => {
                self.latency_offset = offset;
                Reply::Done
            }
            SinkMessage::GetLatency => Reply::Usec(self.latency()),
            SinkMessage::SetFlags(flags) => {
                self.flags = flags;
                Reply::Done
            }
            SinkMessage::UpdateRate(rate) => {
                self.sample_spec.rate = rate;
                Reply::Done
            }
            SinkMessage::SetInputState { index, state } => {
                self.set_input_state(index, state);
                Reply::Done
            }
            SinkMessage::SetInputSoftVolume { index, volume } => {
                let changed = match self.inputs.get_mut(&index) {
                    Some(i) if i.soft_volume != volume => {
                        i.soft_volume = volume;
                        true
                    }
                    _ => false,
                };
                if changed {
                    self.request_rewind(None);
                }
                Reply::Done
            }
            SinkMessage::SetInputMute { index, muted } => {
                let changed = match self.inputs.get_mut(&index) {
                    Some(i) if i.muted != muted => {
                        i.muted = muted;
                        true
                    }
                    _ => false,
                };
                if changed {
                    self.request_rewind(None);
                }
                Reply::Done
            }
            SinkMessage::SetInputRequestedLatency { index, usec } => {
                Reply::Usec(self.set_input_requested_latency(index, usec).unwrap_or(0))
            }
            SinkMessage::AddMonitorOutput(mut entry) => {
                entry.output.update_max_rewind(self.max_rewind);
                self.monitor.add_output(*entry);
                self.invalidate_requested_latency(true);
                Reply::Done
            }
            SinkMessage::RemoveMonitorOutput(id) => {
                self.monitor.remove_output(id);
                self.invalidate_requested_latency(true);
                Reply::Done
            }
            SinkMessage::SetMonitorState(state) => {
                self.monitor.state = state;
                Reply::Done
            }
            SinkMessage::Render(length) => {
                self.process_pending_rewind();
                Reply::Chunk(self.render(length))
            }
            SinkMessage::RenderFull(length) => {
                self.process_pending_rewind();
                Reply::Chunk(self.render_full(length))
            }
            SinkMessage::ProcessRewind(nbytes) => {
                self.process_rewind(nbytes);
                Reply::Done
            }
            SinkMessage::Shutdown => Reply::Done,
        }
    }

    fn set_volume_synced(&mut self, sync: VolumeSync) -> Reply {
        let mut req = VolumeRequest {
            real_volume: sync.real_volume,
            soft_volume: sync.soft_volume,
        };

        if self.flags.contains(SinkFlags::DEFERRED_VOLUME) {
            if self.hooks.contains(SinkHooks::SET_VOLUME) {
                self.backend.lock().set_volume(&mut req);
            }
            self.volume_change_push(&req.real_volume, &req.soft_volume);
        }

        self.adopt_soft_volume(&req.soft_volume);
        self.sync_input_volumes(&sync.inputs);

        Reply::HwVolume {
            real_volume: req.real_volume,
            soft_volume: req.soft_volume,
        }
    }

    fn adopt_soft_volume(&mut self, volume: &ChannelVolume) {
        if self.soft_volume != *volume {
            self.soft_volume = *volume;
            self.request_rewind(None);
        }
    }

    fn sync_input_volumes(&mut self, volumes: &[(u32, ChannelVolume)]) {
        let mut changed = false;
        for (index, volume) in volumes {
            if let Some(i) = self.inputs.get_mut(index) {
                if i.soft_volume != *volume {
                    i.soft_volume = *volume;
                    changed = true;
                }
            }
        }
        if changed {
            self.request_rewind(None);
        }
    }

    fn set_state(&mut self, state: SinkState) {
        let suspend_change = (self.state == SinkState::Suspended && state.is_opened())
            || (self.state.is_opened() && state == SinkState::Suspended);

        debug!("Sink {} IO state {} => {}", self.name, self.state, state);
        self.state = state;

        if state == SinkState::Suspended {
            self.rewind_nbytes = 0;
            self.rewind_requested = false;
        }

        if suspend_change {
            let suspended = state == SinkState::Suspended;
            for i in self.inputs.values_mut() {
                i.stream.suspend_within_thread(suspended);
            }
        }
    }

    fn link_sync_neighbours(&mut self, index: u32, prev: Option<u32>, next: Option<u32>) {
        if let Some(p) = prev.and_then(|p| self.inputs.get_mut(&p)) {
            p.sync_next = Some(index);
        }
        if let Some(n) = next.and_then(|n| self.inputs.get_mut(&n)) {
            n.sync_prev = Some(index);
        }
    }

    fn unlink_sync_neighbours(&mut self, prev: Option<u32>, next: Option<u32>) {
        if let Some(p) = prev.and_then(|p| self.inputs.get_mut(&p)) {
            p.sync_next = next;
        }
        if let Some(n) = next.and_then(|n| self.inputs.get_mut(&n)) {
            n.sync_prev = prev;
        }
    }

    fn attach_input(&mut self, mut input: Box<ThreadInput>) -> u32 {
        let index = input.index;
        debug_assert!(!input.attached);
        input.attached = true;
        input.stream.attach();
        self.inputs.insert(index, input);
        index
    }

    fn add_input(&mut self, input: Box<ThreadInput>) {
        let (prev, next) = (input.sync_prev, input.sync_next);
        let requested = input.requested_sink_latency;
        let index = self.attach_input(input);
        self.link_sync_neighbours(index, prev, next);

        if requested.is_some() {
            self.set_input_requested_latency(index, requested);
        }

        let (max_rewind, max_request) = (self.max_rewind, self.max_request);
        if let Some(i) = self.inputs.get_mut(&index) {
            i.stream.update_max_rewind(max_rewind);
            i.stream.update_max_request(max_request);
        }
    }

    fn detach_input(&mut self, index: u32) -> Option<Box<ThreadInput>> {
        let mut input = self.inputs.remove(&index)?;
        self.unlink_sync_neighbours(input.sync_prev, input.sync_next);
        if input.attached {
            input.attached = false;
            input.stream.detach();
        }
        Some(input)
    }

    fn remove_input(&mut self, index: u32) {
        if self.detach_input(index).is_none() {
            return;
        }
        self.invalidate_requested_latency(true);
        self.request_rewind(None);
    }

    fn start_move(&mut self, index: u32) -> Option<Box<ThreadInput>> {
        let linked = self.inputs.get(&index)?.state.is_linked();
        if linked {
            // Give back what the sink has buffered but not yet played.
            let latency = self.latency();
            let nbytes = self.sample_spec.usec_to_bytes(latency);
            if nbytes > 0 {
                if let Some(i) = self.inputs.get_mut(&index) {
                    i.stream.process_rewind(nbytes);
                }
            }
        }

        let mut input = self.detach_input(index)?;
        input.sync_prev = None;
        input.sync_next = None;

        self.invalidate_requested_latency(true);
        debug!("Requesting rewind due to started move");
        self.request_rewind(None);
        Some(input)
    }

    fn finish_move(&mut self, input: Box<ThreadInput>) {
        let corked = input.state == InputState::Corked;
        let requested = input.requested_sink_latency;
        let index = self.attach_input(input);

        if !corked {
            // Skip what the sink already has buffered.
            let latency = self.latency();
            let nbytes = self.sample_spec.usec_to_bytes(latency);
            if nbytes > 0 {
                if let Some(i) = self.inputs.get_mut(&index) {
                    i.stream.drop_bytes(nbytes);
                }
            }
            debug!("Requesting rewind due to finished move");
            self.request_rewind(Some(nbytes));
        }

        if requested.is_some() {
            self.set_input_requested_latency(index, requested);
        }

        let (max_rewind, max_request) = (self.max_rewind, self.max_request);
        if let Some(i) = self.inputs.get_mut(&index) {
            i.stream.update_max_rewind(max_rewind);
            i.stream.update_max_request(max_request);
        }
    }

    /// Applies a cork state change to an input and every input in its sync
    /// group.
    fn set_input_state(&mut self, index: u32, state: InputState) {
        let Some(input) = self.inputs.get(&index) else {
            return;
        };

        let mut group = vec![index];
        let mut cursor = input.sync_prev;
        while let Some(p) = cursor {
            group.push(p);
            cursor = self.inputs.get(&p).and_then(|i| i.sync_prev);
        }
        cursor = input.sync_next;
        while let Some(n) = cursor {
            group.push(n);
            cursor = self.inputs.get(&n).and_then(|i| i.sync_next);
        }

        let mut rewind = false;
        for idx in group {
            if let Some(i) = self.inputs.get_mut(&idx) {
                if i.state == state {
                    continue;
                }
                let corking = state == InputState::Corked && i.state == InputState::Running;
                let uncorking = i.state == InputState::Corked && state == InputState::Running;
                if corking || uncorking {
                    debug!(
                        "Requesting rewind due to {}",
                        if corking { "corking" } else { "uncorking" }
                    );
                    rewind = true;
                }
                i.state = state;
            }
        }

        if rewind {
            self.request_rewind(None);
        }
    }

    pub(crate) fn detach_all(&mut self) {
        for i in self.inputs.values_mut() {
            if i.attached {
                i.attached = false;
                i.stream.detach();
            }
        }
    }

    pub(crate) fn attach_all(&mut self) {
        for i in self.inputs.values_mut() {
            if !i.attached {
                i.attached = true;
                i.stream.attach();
            }
        }
    }

    /// Sink latency in microseconds as seen from the IO thread, including the
    /// port latency offset.
    pub fn latency(&mut self) -> u64 {
        if self.state == SinkState::Suspended || !self.flags.contains(SinkFlags::LATENCY) {
            return 0;
        }

        let usec = self.backend.lock().latency();
        if self.latency_offset < 0 && self.latency_offset.unsigned_abs() > usec {
            0
        } else {
            usec.saturating_add_signed(self.latency_offset)
        }
    }

    /// Smallest latency any input or monitor output asked for, clamped to
    /// the latency range. `None` means nobody cares.
    pub fn requested_latency(&mut self) -> Option<u64> {
        if !self.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            return Some(self.fixed_latency.clamp(self.min_latency, self.max_latency));
        }

        if self.requested_latency_valid {
            return self.requested_latency;
        }

        let mut result = self
            .inputs
            .values()
            .filter_map(|i| i.requested_sink_latency)
            .min();

        if let Some(monitor) = self.monitor.requested_latency() {
            result = Some(result.map_or(monitor, |r| r.min(monitor)));
        }

        let result = result.map(|r| r.clamp(self.min_latency, self.max_latency));

        if self.state.is_linked() {
            self.requested_latency = result;
            self.requested_latency_valid = true;
        }

        result
    }

    pub(crate) fn set_input_requested_latency(
        &mut self,
        index: u32,
        usec: Option<u64>,
    ) -> Option<u64> {
        let usec = if self.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            usec
        } else {
            Some(self.fixed_latency)
        };
        let usec = usec.map(|u| u.clamp(self.min_latency, self.max_latency));

        if let Some(i) = self.inputs.get_mut(&index) {
            i.requested_sink_latency = usec;
        }
        self.invalidate_requested_latency(true);
        usec
    }

    /// Forgets the cached requested latency and tells the backend and the
    /// inputs about the new value. Non-dynamic sinks only react when
    /// `dynamic` is false.
    pub(crate) fn invalidate_requested_latency(&mut self, dynamic: bool) {
        if self.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            self.requested_latency_valid = false;
        } else if dynamic {
            return;
        }

        if !self.state.is_linked() {
            return;
        }

        let latency = self.requested_latency();
        if self.hooks.contains(SinkHooks::UPDATE_REQUESTED_LATENCY) {
            self.backend.lock().update_requested_latency(latency);
        }
        for i in self.inputs.values_mut() {
            i.stream.update_sink_requested_latency(latency);
        }
    }

    pub(crate) fn set_latency_range(&mut self, min: u64, max: u64) {
        if self.min_latency == min && self.max_latency == max {
            return;
        }

        self.min_latency = min;
        self.max_latency = max;

        if self.state.is_linked() {
            for i in self.inputs.values_mut() {
                i.stream.update_sink_latency_range(min, max);
            }
        }

        self.invalidate_requested_latency(false);
        self.monitor.set_latency_range(min, max);
    }

    pub(crate) fn set_fixed_latency(&mut self, usec: u64) {
        if self.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            debug_assert_eq!(usec, 0);
            self.fixed_latency = 0;
            self.monitor.set_fixed_latency(0);
            return;
        }

        if self.fixed_latency == usec {
            return;
        }

        self.fixed_latency = usec;

        if self.state.is_linked() {
            for i in self.inputs.values_mut() {
                i.stream.update_sink_fixed_latency(usec);
            }
        }

        self.invalidate_requested_latency(false);
        self.monitor.set_fixed_latency(usec);
    }

    pub(crate) fn set_max_rewind(&mut self, nbytes: usize) {
        if self.max_rewind == nbytes {
            return;
        }

        self.max_rewind = nbytes;

        if self.state.is_linked() {
            for i in self.inputs.values_mut() {
                i.stream.update_max_rewind(nbytes);
            }
        }

        self.monitor.set_max_rewind(nbytes);
    }

    pub(crate) fn set_max_request(&mut self, nbytes: usize) {
        if self.max_request == nbytes {
            return;
        }

        self.max_request = nbytes;

        if self.state.is_linked() {
            for i in self.inputs.values_mut() {
                i.stream.update_max_request(nbytes);
            }
        }
    }

    /// Asks the driver to rewind `nbytes` (all of `max_rewind` for `None`).
    /// A smaller request never shrinks one that is already pending.
    pub fn request_rewind(&mut self, nbytes: Option<usize>) {
        if self.state == SinkState::Suspended {
            return;
        }

        let nbytes = nbytes.unwrap_or(self.max_rewind).min(self.max_rewind);

        if self.rewind_requested && nbytes <= self.rewind_nbytes {
            return;
        }

        self.rewind_nbytes = nbytes;
        self.rewind_requested = true;

        if self.hooks.contains(SinkHooks::REQUEST_REWIND) {
            self.backend.lock().request_rewind(nbytes);
        }
    }

    /// Tells every input and the monitor that the last `nbytes` of rendered
    /// audio were thrown away.
    pub fn process_rewind(&mut self, nbytes: usize) {
        if !self.rewind_requested && nbytes == 0 {
            return;
        }

        self.rewind_nbytes = 0;
        self.rewind_requested = false;

        if nbytes > 0 {
            debug!("Processing rewind of {} bytes", nbytes);
            if self.flags.contains(SinkFlags::DEFERRED_VOLUME) {
                self.volume_change_rewind(nbytes);
            }
        }

        for i in self.inputs.values_mut() {
            i.stream.process_rewind(nbytes);
        }

        if nbytes > 0 && self.monitor.is_linked() {
            self.monitor.process_rewind(nbytes);
        }
    }

    /// Acknowledges a pending rewind request when nothing buffered can be
    /// rewound.
    pub fn process_pending_rewind(&mut self) {
        if self.rewind_requested {
            self.process_rewind(0);
        }
    }

    /// Lets inputs that ran dry handle their underrun. Returns how many of
    /// the `left_to_play` bytes are still real audio.
    pub fn process_input_underruns(&mut self, left_to_play: usize) -> usize {
        let mut result = 0;

        for i in self.inputs.values_mut() {
            let uf = i.stream.underrun_for();
            if uf == 0 {
                continue;
            }
            if uf >= left_to_play {
                if i.stream.process_underrun() {
                    continue;
                }
            } else if uf > result {
                result = uf;
            }
        }

        if result > 0 {
            debug!(
                "Found underrun {} bytes ago ({} bytes ahead in playback buffer)",
                result,
                left_to_play - result
            );
        }

        left_to_play - result
    }

    fn volume_change_push(&mut self, real: &ChannelVolume, soft: &ChannelVolume) {
        let hw_volume = real.divide(soft);
        let latency = self.latency();
        let now = self.clock.now_usec();
        let current = self.current_hw_volume;
        self.volume_changes.push(hw_volume, &current, latency, now);
    }

    fn volume_change_rewind(&mut self, nbytes: usize) {
        let rewound = self.sample_spec.bytes_to_usec(nbytes);
        let latency = self.latency();
        let now = self.clock.now_usec();
        let current = self.current_hw_volume;
        self.volume_changes.rewind(rewound, &current, latency, now);
        self.apply_volume_changes();
    }

    /// Writes every due hardware volume change. Returns whether the hardware
    /// was written and the time in µs until the next pending change.
    pub fn apply_volume_changes(&mut self) -> (bool, u64) {
        if !self.state.is_linked() || self.volume_changes.is_empty() {
            return (false, 0);
        }

        let now = self.clock.now_usec();
        let (applied, usec_to_next) = self.volume_changes.apply(now);

        match applied {
            Some(volume) => {
                self.current_hw_volume = volume;
                if self.hooks.contains(SinkHooks::WRITE_VOLUME) {
                    self.backend.lock().write_volume(&volume);
                }
                (true, usec_to_next)
            }
            None => (false, usec_to_next),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        name: &str,
        sample_spec: SampleSpec,
        backend: Box<dyn crate::sink::SinkBackend>,
        clock: Arc<dyn Clock>,
        notices: Sender<Notice>,
    ) -> Self {
        let hooks = backend.hooks();
        Self::new(ThreadInit {
            index: 0,
            name: name.to_string(),
            sample_spec,
            flags: SinkFlags::empty(),
            hooks,
            backend: Arc::new(parking_lot::Mutex::new(backend)),
            clock,
            notices,
            safety_margin: 8_000,
            extra_delay: 0,
            mono_downmix: false,
            soft_volume: ChannelVolume::norm(sample_spec.channels),
            muted: false,
        })
    }
}
