// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sink inputs: the streams a sink mixes.
//!
//! A [`SinkInput`] is the main-thread object. The audio itself comes from an
//! [`InputStream`] that is handed to the sink's IO thread when the input is
//! put, wrapped in a [`ThreadInput`] together with the volume and state the
//! mixer needs.

use crate::engine::{Core, EventKind, Facility};
use crate::error::{Result, SinkError};
use crate::format::FormatInfo;
use crate::memblock::MemChunk;
use crate::proplist::{self, Proplist};
use crate::sample::{ChannelMap, SampleSpec};
use crate::thread::SinkMessage;
use crate::volume::ChannelVolume;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Producer side of a sink input. All methods run on the sink's IO thread.
pub trait InputStream: Send {
    /// Up to `length` bytes of audio without consuming them. `None` when
    /// nothing is available.
    fn peek(&mut self, length: usize) -> Option<MemChunk>;

    /// Consume `nbytes` bytes.
    fn drop_bytes(&mut self, nbytes: usize);

    fn attach(&mut self) {}

    fn detach(&mut self) {}

    fn suspend_within_thread(&mut self, _suspended: bool) {}

    /// The sink threw away the last `nbytes` it rendered; they have to be
    /// produced again.
    fn process_rewind(&mut self, _nbytes: usize) {}

    fn update_max_rewind(&mut self, _nbytes: usize) {}

    fn update_max_request(&mut self, _nbytes: usize) {}

    fn update_sink_requested_latency(&mut self, _usec: Option<u64>) {}

    fn update_sink_latency_range(&mut self, _min: u64, _max: u64) {}

    fn update_sink_fixed_latency(&mut self, _usec: u64) {}

    /// Bytes since the stream ran out of data, 0 if it has not.
    fn underrun_for(&self) -> usize {
        0
    }

    /// Returns true if the underrun was dealt with and needs no rewind.
    fn process_underrun(&mut self) -> bool {
        false
    }
}

bitflags! {
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        const DONT_MOVE = 0x0001;
        const START_CORKED = 0x0002;
        /// Does not keep the sink from auto-suspending.
        const DONT_INHIBIT_AUTO_SUSPEND = 0x0004;
        /// Killed instead of paused when the sink suspends.
        const KILL_ON_SUSPEND = 0x0008;
        /// Compressed audio that must reach the device untouched.
        const PASSTHROUGH = 0x0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputState {
    Init,
    Running,
    Corked,
    Unlinked,
}

impl InputState {
    pub fn is_linked(self) -> bool {
        matches!(self, InputState::Running | InputState::Corked)
    }
}

/// IO-thread view of an input.
pub struct ThreadInput {
    pub(crate) index: u32,
    pub(crate) stream: Box<dyn InputStream>,
    pub(crate) state: InputState,
    pub(crate) soft_volume: ChannelVolume,
    pub(crate) muted: bool,
    pub(crate) requested_sink_latency: Option<u64>,
    pub(crate) sync_prev: Option<u32>,
    pub(crate) sync_next: Option<u32>,
    pub(crate) attached: bool,
}

impl ThreadInput {
    pub(crate) fn new(
        index: u32,
        stream: Box<dyn InputStream>,
        state: InputState,
        soft_volume: ChannelVolume,
        muted: bool,
    ) -> Self {
        Self {
            index,
            stream,
            state,
            soft_volume,
            muted,
            requested_sink_latency: None,
            sync_prev: None,
            sync_next: None,
            attached: false,
        }
    }
}

impl fmt::Debug for ThreadInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadInput")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("soft_volume", &self.soft_volume)
            .field("muted", &self.muted)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

/// Everything needed to create a sink input.
pub struct InputNewData {
    pub sink: u32,
    pub stream: Option<Box<dyn InputStream>>,
    pub driver: Option<String>,
    pub proplist: Proplist,
    /// Defaults to the sink's sample spec.
    pub sample_spec: Option<SampleSpec>,
    pub channel_map: Option<ChannelMap>,
    pub format: FormatInfo,
    /// A mono volume is spread over all channels.
    pub volume: Option<ChannelVolume>,
    /// When false and the sink uses flat volume, `volume` is relative to the
    /// sink volume.
    pub volume_is_absolute: bool,
    pub volume_factor_items: BTreeMap<String, ChannelVolume>,
    pub muted: bool,
    pub save_volume: bool,
    pub save_muted: bool,
    pub flags: InputFlags,
    pub requested_latency: Option<u64>,
    /// Play in lock-step with this input.
    pub sync_with: Option<u32>,
}

impl InputNewData {
    pub fn new(sink: u32, stream: impl InputStream + 'static) -> Self {
        Self {
            sink,
            stream: Some(Box::new(stream)),
            driver: None,
            proplist: Proplist::new(),
            sample_spec: None,
            channel_map: None,
            format: FormatInfo::pcm(),
            volume: None,
            volume_is_absolute: false,
            volume_factor_items: BTreeMap::new(),
            muted: false,
            save_volume: false,
            save_muted: false,
            flags: InputFlags::empty(),
            requested_latency: None,
            sync_with: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.proplist.set(proplist::MEDIA_NAME, name);
        self
    }

    pub fn with_volume(mut self, volume: ChannelVolume, absolute: bool) -> Self {
        self.volume = Some(volume);
        self.volume_is_absolute = absolute;
        self
    }

    pub fn add_volume_factor(&mut self, key: &str, factor: ChannelVolume) {
        self.volume_factor_items.insert(key.to_string(), factor);
    }
}

/// Main-thread side of a sink input.
pub struct SinkInput {
    pub(crate) index: u32,
    pub(crate) driver: Option<String>,
    pub(crate) proplist: Proplist,
    pub(crate) sink: Option<u32>,
    pub(crate) origin_sink: Option<u32>,
    pub(crate) state: InputState,
    pub(crate) flags: InputFlags,
    pub(crate) sample_spec: SampleSpec,
    pub(crate) channel_map: ChannelMap,
    pub(crate) format: FormatInfo,

    pub(crate) volume: ChannelVolume,
    pub(crate) reference_ratio: ChannelVolume,
    pub(crate) real_ratio: ChannelVolume,
    pub(crate) soft_volume: ChannelVolume,
    pub(crate) volume_factor: ChannelVolume,
    pub(crate) volume_factor_items: BTreeMap<String, ChannelVolume>,
    pub(crate) muted: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) save_sink: bool,

    pub(crate) sync_prev: Option<u32>,
    pub(crate) sync_next: Option<u32>,
    pub(crate) requested_latency: Option<u64>,
    /// Held here before `put` and while moving between sinks.
    pub(crate) thread: Option<Box<ThreadInput>>,
}

impl SinkInput {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> Option<&str> {
        self.proplist.get(proplist::MEDIA_NAME)
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn proplist(&self) -> &Proplist {
        &self.proplist
    }

    pub fn sink(&self) -> Option<u32> {
        self.sink
    }

    pub fn origin_sink(&self) -> Option<u32> {
        self.origin_sink
    }

    pub fn state(&self) -> InputState {
        self.state
    }

    pub fn flags(&self) -> InputFlags {
        self.flags
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn format(&self) -> &FormatInfo {
        &self.format
    }

    pub fn volume(&self) -> &ChannelVolume {
        &self.volume
    }

    pub fn reference_ratio(&self) -> &ChannelVolume {
        &self.reference_ratio
    }

    pub fn real_ratio(&self) -> &ChannelVolume {
        &self.real_ratio
    }

    pub fn soft_volume(&self) -> &ChannelVolume {
        &self.soft_volume
    }

    pub fn volume_factor(&self) -> &ChannelVolume {
        &self.volume_factor
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn save_volume(&self) -> bool {
        self.save_volume
    }

    pub fn save_muted(&self) -> bool {
        self.save_muted
    }

    pub fn save_sink(&self) -> bool {
        self.save_sink
    }

    pub fn is_passthrough(&self) -> bool {
        self.flags.contains(InputFlags::PASSTHROUGH) || !self.format.is_pcm()
    }

    pub fn is_moving(&self) -> bool {
        self.state.is_linked() && self.sink.is_none()
    }

    fn set_real_ratio(&mut self, ratio: &ChannelVolume) {
        self.real_ratio = *ratio;
        self.soft_volume = self.real_ratio.multiply(&self.volume_factor);
    }
}

impl fmt::Debug for SinkInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkInput")
            .field("index", &self.index)
            .field("sink", &self.sink)
            .field("state", &self.state)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

fn merged_factor(channels: u8, items: &BTreeMap<String, ChannelVolume>) -> ChannelVolume {
    items
        .values()
        .fold(ChannelVolume::norm(channels), |acc, v| acc.multiply(v))
}

fn fit_volume(volume: &ChannelVolume, channels: u8) -> Result<ChannelVolume> {
    if !volume.is_valid() {
        return Err(SinkError::InvalidVolume);
    }
    if volume.channels() == channels {
        Ok(*volume)
    } else if volume.channels() == 1 {
        Ok(ChannelVolume::new(channels, volume.get(0)))
    } else {
        Err(SinkError::IncompatibleVolume)
    }
}

impl Core {
    /// Input whose origin sink shares its volume with the master, if `index`
    /// is such a proxy.
    pub(crate) fn shared_origin(&self, index: u32) -> Option<u32> {
        let origin = self.inputs.get(&index)?.origin_sink?;
        self.sinks
            .get(&origin)
            .filter(|s| s.flags.contains(crate::sink::SinkFlags::SHARE_VOLUME_WITH_MASTER))
            .map(|_| origin)
    }

    /// Creates an input attached to `data.sink` in the `Init` state.
    pub fn input_new(&mut self, mut data: InputNewData) -> Result<u32> {
        let sink = data.sink;
        let (sink_spec, sink_map, sink_has_inputs, sink_reference) = {
            let s = self.linked_sink(sink)?;
            (
                s.sample_spec,
                s.channel_map.clone(),
                !s.inputs.is_empty(),
                s.reference_volume,
            )
        };

        let stream = data
            .stream
            .take()
            .ok_or_else(|| SinkError::Refused("sink input has no stream".into()))?;

        let sample_spec = data.sample_spec.unwrap_or(sink_spec);
        if !sample_spec.is_valid() {
            return Err(SinkError::InvalidSampleSpec);
        }
        let channel_map = match data.channel_map.take() {
            Some(map) => map,
            None if sample_spec.channels == sink_spec.channels => sink_map.clone(),
            None => ChannelMap::init_auto(sample_spec.channels).ok_or(SinkError::InvalidChannelMap)?,
        };
        if !channel_map.is_valid() {
            return Err(SinkError::InvalidChannelMap);
        }
        if channel_map.channels() != sample_spec.channels {
            return Err(SinkError::ChannelMapMismatch {
                map: channel_map.channels(),
                spec: sample_spec.channels,
            });
        }

        let passthrough = data.flags.contains(InputFlags::PASSTHROUGH) || !data.format.is_pcm();
        if !data.format.is_pcm() && !self.sink_check_format(sink, &data.format)? {
            return Err(SinkError::Refused(format!(
                "sink {} does not support {}",
                sink, data.format
            )));
        }
        if passthrough && sink_has_inputs {
            return Err(SinkError::Refused("passthrough needs an unused sink".into()));
        }
        if self.sink_is_passthrough(sink) {
            return Err(SinkError::Refused("sink is playing a passthrough stream".into()));
        }

        let channels = sample_spec.channels;
        let mut volume = match data.volume {
            Some(v) => fit_volume(&v, channels)?,
            None => ChannelVolume::norm(channels),
        };
        if passthrough {
            volume = ChannelVolume::norm(channels);
        } else if !data.volume_is_absolute && self.sink_flat_volume_enabled(sink) {
            volume = volume.multiply(&sink_reference.remap(&sink_map, &channel_map));
        }

        for v in data.volume_factor_items.values() {
            if !v.is_compatible(&sample_spec) {
                return Err(SinkError::IncompatibleVolume);
            }
        }
        let volume_factor = merged_factor(channels, &data.volume_factor_items);

        let (sync_prev, sync_next) = match data.sync_with {
            Some(base) => {
                let b = self.get_input(base)?;
                if b.sink != Some(sink) {
                    return Err(SinkError::Refused("sync peer is on another sink".into()));
                }
                (Some(base), b.sync_next)
            }
            None => (None, None),
        };

        let index = self.next_input_index;
        self.next_input_index += 1;

        let mut thread = ThreadInput::new(
            index,
            stream,
            InputState::Init,
            ChannelVolume::norm(channels),
            data.muted,
        );
        thread.requested_sink_latency = data.requested_latency;

        let input = SinkInput {
            index,
            driver: data.driver,
            proplist: data.proplist,
            sink: Some(sink),
            origin_sink: None,
            state: InputState::Init,
            flags: data.flags,
            sample_spec,
            channel_map,
            format: data.format,
            volume,
            reference_ratio: volume,
            real_ratio: volume,
            soft_volume: ChannelVolume::norm(channels),
            volume_factor,
            volume_factor_items: data.volume_factor_items,
            muted: data.muted,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            save_sink: false,
            sync_prev,
            sync_next,
            requested_latency: data.requested_latency,
            thread: Some(Box::new(thread)),
        };

        if let Some(p) = sync_prev.and_then(|p| self.inputs.get_mut(&p)) {
            p.sync_next = Some(index);
        }
        if let Some(n) = sync_next.and_then(|n| self.inputs.get_mut(&n)) {
            n.sync_prev = Some(index);
        }

        info!(
            "Created input {} \"{}\" on sink {} with sample spec {} and channel map {}",
            index,
            input.name().unwrap_or("(null)"),
            sink,
            input.sample_spec,
            input.channel_map
        );

        self.inputs.insert(index, input);
        self.get_sink_mut(sink)?.inputs.insert(index);
        Ok(index)
    }

    /// Starts playback of an input: hands its stream to the IO thread and
    /// settles the volumes.
    pub fn input_put(&mut self, index: u32) -> Result<()> {
        let (sink, state, save_volume, passthrough) = {
            let i = self.get_input(index)?;
            if i.state != InputState::Init {
                return Err(SinkError::Refused(format!("input {} was already put", index)));
            }
            let state = if i.flags.contains(InputFlags::START_CORKED) {
                InputState::Corked
            } else {
                InputState::Running
            };
            (i.sink.ok_or(SinkError::NotLinked)?, state, i.save_volume, i.is_passthrough())
        };
        self.linked_sink(sink)?;

        let shared = self.shared_origin(index).is_some();
        self.get_input_mut(index)?.state = state;
        if state == InputState::Corked {
            self.get_sink_mut(sink)?.n_corked += 1;
        }

        if self.sink_flat_volume_enabled(sink) {
            self.set_volume_inner(sink, None, false, save_volume)?;
        } else {
            let i = self.get_input_mut(index)?;
            if shared {
                debug_assert!(i.volume.is_norm());
                i.reference_ratio = ChannelVolume::norm(i.reference_ratio.channels());
            }
            let volume = i.volume;
            i.set_real_ratio(&volume);
        }

        let thread = {
            let i = self.get_input_mut(index)?;
            let mut t = i.thread.take().ok_or(SinkError::NotLinked)?;
            t.state = state;
            t.soft_volume = i.soft_volume;
            t.muted = i.muted;
            t.sync_prev = i.sync_prev;
            t.sync_next = i.sync_next;
            t
        };
        self.get_sink_mut(sink)?.send(SinkMessage::AddInput(thread))?;
        self.sync_shared_volume(sink)?;

        self.post(Facility::SinkInput, EventKind::New, index);

        if passthrough {
            self.sink_enter_passthrough(sink)?;
        }
        self.sink_update_status(sink)?;
        debug!("Input {} linked to sink {} ({:?})", index, sink, state);
        Ok(())
    }

    /// Removes an input. Safe to call on inputs that were never put and on
    /// inputs that are being moved.
    pub fn input_unlink(&mut self, index: u32) -> Result<()> {
        let Some(i) = self.inputs.get_mut(&index) else {
            return Ok(());
        };
        let linked = i.state.is_linked();
        let old_state = i.state;
        let sink = i.sink.take();
        let origin = i.origin_sink.take();
        let passthrough = i.is_passthrough();
        let (prev, next) = (i.sync_prev.take(), i.sync_next.take());
        i.state = InputState::Unlinked;

        if let Some(p) = prev.and_then(|p| self.inputs.get_mut(&p)) {
            p.sync_next = next;
        }
        if let Some(n) = next.and_then(|n| self.inputs.get_mut(&n)) {
            n.sync_prev = prev;
        }

        if let Some(sink) = sink {
            let sink_linked = match self.sinks.get_mut(&sink) {
                Some(s) => {
                    s.inputs.remove(&index);
                    if old_state == InputState::Corked {
                        s.n_corked -= 1;
                    }
                    s.state.is_linked()
                }
                None => false,
            };

            if linked && sink_linked {
                if self.sink_flat_volume_enabled(sink) {
                    self.set_volume_inner(sink, None, false, false)?;
                }
                self.get_sink_mut(sink)?.send(SinkMessage::RemoveInput(index))?;
                self.sync_shared_volume(sink)?;
                if passthrough {
                    self.sink_leave_passthrough(sink)?;
                }
            }
        }

        if let Some(origin) = origin {
            if let Some(s) = self.sinks.get_mut(&origin) {
                if s.input_to_master == Some(index) {
                    s.input_to_master = None;
                }
            }
        }

        self.inputs.remove(&index);

        if linked {
            self.post(Facility::SinkInput, EventKind::Remove, index);
            info!("Freed input {}", index);
        }

        if let Some(sink) = sink {
            if self.sinks.get(&sink).is_some_and(|s| s.state.is_linked()) {
                self.sink_update_status(sink)?;
            }
        }
        Ok(())
    }

    pub fn input_kill(&mut self, index: u32) -> Result<()> {
        debug!("Killing input {}", index);
        self.input_unlink(index)
    }

    /// Inputs playing in lock-step with `index`, `index` included.
    fn sync_group(&self, index: u32) -> Vec<u32> {
        let mut group = vec![index];
        let mut cursor = self.inputs.get(&index).and_then(|i| i.sync_prev);
        while let Some(p) = cursor {
            group.push(p);
            cursor = self.inputs.get(&p).and_then(|i| i.sync_prev);
        }
        cursor = self.inputs.get(&index).and_then(|i| i.sync_next);
        while let Some(n) = cursor {
            group.push(n);
            cursor = self.inputs.get(&n).and_then(|i| i.sync_next);
        }
        group
    }

    /// Pauses or resumes an input and its sync group.
    pub fn input_cork(&mut self, index: u32, cork: bool) -> Result<()> {
        let i = self.get_input(index)?;
        if !i.state.is_linked() {
            return Err(SinkError::NotLinked);
        }
        let state = if cork {
            InputState::Corked
        } else {
            InputState::Running
        };
        if i.state == state {
            return Ok(());
        }
        let sink = i.sink;

        for member in self.sync_group(index) {
            let Some(m) = self.inputs.get_mut(&member) else {
                continue;
            };
            if m.state == state {
                continue;
            }
            m.state = state;
            if let Some(t) = m.thread.as_mut() {
                t.state = state;
            }
            if let Some(s) = sink.and_then(|s| self.sinks.get_mut(&s)) {
                if cork {
                    s.n_corked += 1;
                } else {
                    s.n_corked -= 1;
                }
            }
            self.post(Facility::SinkInput, EventKind::Change, member);
        }

        if let Some(sink) = sink {
            self.get_sink_mut(sink)?
                .send(SinkMessage::SetInputState { index, state })?;
            self.sink_update_status(sink)?;
        }
        Ok(())
    }

    /// Sets the volume of an input. With flat volumes and `absolute` false the
    /// volume is relative to the sink volume.
    pub fn input_set_volume(
        &mut self,
        index: u32,
        volume: &ChannelVolume,
        save: bool,
        absolute: bool,
    ) -> Result<()> {
        let i = self.get_input(index)?;
        if !i.state.is_linked() {
            return Err(SinkError::NotLinked);
        }
        let sink = i.sink.ok_or(SinkError::NotLinked)?;

        if i.is_passthrough() && !volume.is_norm() {
            warn!("Cannot change volume of passthrough input {}", index);
            return Err(SinkError::Refused("passthrough input volume is fixed".into()));
        }

        let channels = i.sample_spec.channels;
        let mut v = if volume.is_compatible(&i.sample_spec) {
            *volume
        } else if volume.is_valid() && volume.channels() == 1 {
            i.volume.scale(volume.max())
        } else {
            return Err(SinkError::IncompatibleVolume);
        };
        debug_assert_eq!(v.channels(), channels);

        let flat = self.sink_flat_volume_enabled(sink);
        if !absolute && flat {
            let s = self.get_sink(sink)?;
            let i = self.get_input(index)?;
            v = v.multiply(&s.reference_volume.remap(&s.channel_map, &i.channel_map));
        }

        let i = self.get_input_mut(index)?;
        if i.volume == v {
            i.save_volume = i.save_volume || save;
            return Ok(());
        }
        i.volume = v;
        i.save_volume = save;

        if flat {
            self.set_volume_inner(sink, None, true, save)?;
        } else {
            i.set_real_ratio(&v);
            let soft = i.soft_volume;
            self.get_sink_mut(sink)?.send(SinkMessage::SetInputSoftVolume {
                index,
                volume: soft,
            })?;
        }

        self.post(Facility::SinkInput, EventKind::Change, index);
        Ok(())
    }

    pub fn input_set_mute(&mut self, index: u32, muted: bool, save: bool) -> Result<()> {
        let i = self.get_input_mut(index)?;
        if !i.state.is_linked() {
            return Err(SinkError::NotLinked);
        }
        if i.muted == muted {
            i.save_muted = i.save_muted || save;
            return Ok(());
        }
        i.muted = muted;
        i.save_muted = save;

        let target = i.sink;
        match target {
            Some(sink) => {
                self.get_sink_mut(sink)?
                    .send(SinkMessage::SetInputMute { index, muted })?;
            }
            None => {
                if let Some(t) = i.thread.as_mut() {
                    t.muted = muted;
                }
            }
        }
        self.post(Facility::SinkInput, EventKind::Change, index);
        Ok(())
    }

    fn input_apply_volume_factor(&mut self, index: u32) -> Result<()> {
        let i = self.get_input_mut(index)?;
        i.volume_factor = merged_factor(i.sample_spec.channels, &i.volume_factor_items);
        i.soft_volume = i.real_ratio.multiply(&i.volume_factor);
        let soft = i.soft_volume;

        let target = i.sink.filter(|_| i.state.is_linked());
        match target {
            Some(sink) => {
                self.get_sink_mut(sink)?.send(SinkMessage::SetInputSoftVolume {
                    index,
                    volume: soft,
                })?;
            }
            _ => {
                if let Some(t) = i.thread.as_mut() {
                    t.soft_volume = soft;
                }
            }
        }
        Ok(())
    }

    /// Adds a named internal gain on top of the user volume.
    pub fn input_add_volume_factor(
        &mut self,
        index: u32,
        key: &str,
        factor: &ChannelVolume,
    ) -> Result<()> {
        let i = self.get_input_mut(index)?;
        if !factor.is_compatible(&i.sample_spec) {
            return Err(SinkError::IncompatibleVolume);
        }
        i.volume_factor_items.insert(key.to_string(), *factor);
        self.input_apply_volume_factor(index)
    }

    pub fn input_remove_volume_factor(&mut self, index: u32, key: &str) -> Result<()> {
        if self
            .get_input_mut(index)?
            .volume_factor_items
            .remove(key)
            .is_none()
        {
            return Err(SinkError::NoEntity);
        }
        self.input_apply_volume_factor(index)
    }

    /// Returns the latency that was actually configured.
    pub fn input_set_requested_latency(
        &mut self,
        index: u32,
        usec: Option<u64>,
    ) -> Result<Option<u64>> {
        let i = self.get_input_mut(index)?;
        i.requested_latency = usec;

        match (i.sink, i.state.is_linked()) {
            (Some(sink), true) => {
                let reply = self
                    .get_sink_mut(sink)?
                    .send(SinkMessage::SetInputRequestedLatency { index, usec })?;
                Ok(Some(reply.into_usec()).filter(|u| *u > 0))
            }
            _ => {
                if let Some(t) = i.thread.as_mut() {
                    t.requested_sink_latency = usec;
                }
                Ok(usec)
            }
        }
    }

    pub fn input_may_move(&self, index: u32) -> Result<bool> {
        let i = self.get_input(index)?;
        Ok(i.state.is_linked()
            && !i.flags.contains(InputFlags::DONT_MOVE)
            && i.sync_prev.is_none()
            && i.sync_next.is_none())
    }

    /// Detaches an input from its sink. The input keeps playing nowhere until
    /// [`input_finish_move`](Self::input_finish_move) or
    /// [`input_fail_move`](Self::input_fail_move).
    pub fn input_start_move(&mut self, index: u32) -> Result<()> {
        if !self.input_may_move(index)? {
            return Err(SinkError::Refused(format!("input {} cannot be moved", index)));
        }
        let i = self.get_input_mut(index)?;
        let sink = i.sink.take().ok_or(SinkError::NotLinked)?;
        let corked = i.state == InputState::Corked;
        let passthrough = i.is_passthrough();

        let s = self.get_sink_mut(sink)?;
        s.inputs.remove(&index);
        if corked {
            s.n_corked -= 1;
        }

        if passthrough {
            self.sink_leave_passthrough(sink)?;
        }
        if self.sink_flat_volume_enabled(sink) {
            self.set_volume_inner(sink, None, false, false)?;
        }

        let thread = self
            .get_sink_mut(sink)?
            .send(SinkMessage::StartMove(index))?
            .into_input();
        self.get_input_mut(index)?.thread = thread;
        self.sync_shared_volume(sink)?;
        self.sink_update_status(sink)?;

        debug!("Input {} started moving away from sink {}", index, sink);
        Ok(())
    }

    /// True if moving `index` to `dest` would not close a loop of filter
    /// sinks.
    fn input_may_move_to(&self, index: u32, dest: u32) -> Result<()> {
        let Some(origin) = self.get_input(index)?.origin_sink else {
            return Ok(());
        };
        let mut cursor = Some(dest);
        while let Some(s) = cursor {
            if s == origin {
                return Err(SinkError::Cycle);
            }
            cursor = self
                .sinks
                .get(&s)
                .and_then(|s| s.input_to_master)
                .and_then(|i| self.inputs.get(&i))
                .and_then(|i| i.sink);
        }
        Ok(())
    }

    pub fn input_finish_move(&mut self, index: u32, dest: u32, save: bool) -> Result<()> {
        let i = self.get_input(index)?;
        if !i.is_moving() || i.thread.is_none() {
            return Err(SinkError::Refused(format!("input {} is not moving", index)));
        }
        let passthrough = i.is_passthrough();
        let format = i.format.clone();
        let rate = i.sample_spec.rate;

        let d = self.linked_sink(dest)?;
        if passthrough && !d.inputs.is_empty() {
            return Err(SinkError::Refused("passthrough needs an unused sink".into()));
        }
        let dest_rate = d.sample_spec.rate;
        self.input_may_move_to(index, dest)?;
        if self.sink_is_passthrough(dest) {
            return Err(SinkError::Refused("sink is playing a passthrough stream".into()));
        }
        if !format.is_pcm() && !self.sink_check_format(dest, &format)? {
            return Err(SinkError::Refused(format!("sink {} does not support {}", dest, format)));
        }

        if rate != dest_rate {
            self.sink_update_rate(dest, rate, passthrough)?;
        }

        let i = self.get_input_mut(index)?;
        i.sink = Some(dest);
        i.save_sink = save;
        let corked = i.state == InputState::Corked;
        let s = self.get_sink_mut(dest)?;
        s.inputs.insert(index);
        if corked {
            s.n_corked += 1;
        }

        self.update_volume_due_to_moving(index, dest)?;

        let thread = {
            let i = self.get_input_mut(index)?;
            let mut t = i.thread.take().ok_or(SinkError::NotLinked)?;
            t.state = i.state;
            t.soft_volume = i.soft_volume;
            t.muted = i.muted;
            t
        };
        self.get_sink_mut(dest)?.send(SinkMessage::FinishMove(thread))?;
        self.sync_shared_volume(dest)?;
        self.sink_update_status(dest)?;

        if passthrough {
            self.sink_enter_passthrough(dest)?;
        }

        self.post(Facility::SinkInput, EventKind::Change, index);
        debug!("Input {} finished moving to sink {}", index, dest);
        Ok(())
    }

    /// Gives up on a move. The input is killed.
    pub fn input_fail_move(&mut self, index: u32) -> Result<()> {
        warn!("Moving input {} failed", index);
        self.input_kill(index)
    }

    pub fn input_move_to(&mut self, index: u32, dest: u32, save: bool) -> Result<()> {
        if self.get_input(index)?.sink == Some(dest) {
            return Ok(());
        }
        self.linked_sink(dest)?;
        self.input_may_move_to(index, dest)?;

        self.input_start_move(index)?;
        if let Err(e) = self.input_finish_move(index, dest, save) {
            self.input_fail_move(index)?;
            return Err(e);
        }
        Ok(())
    }

    /// Recomputes the volumes of a moved input (and, for the proxy input of a
    /// volume sharing filter, of everything behind it) for its new sink.
    fn update_volume_due_to_moving(&mut self, index: u32, dest: u32) -> Result<()> {
        let sink = self.get_input(index)?.sink.ok_or(SinkError::NotLinked)?;
        let flat = self.sink_flat_volume_enabled(sink);

        if let Some(origin) = self.shared_origin(index) {
            let root = self.sink_get_master(sink).ok_or(SinkError::NotLinked)?;

            if !flat {
                let i = self.get_input_mut(index)?;
                let old = i.volume;
                i.volume = ChannelVolume::norm(i.volume.channels());
                i.reference_ratio = ChannelVolume::norm(i.reference_ratio.channels());
                if i.volume != old {
                    self.post(Facility::SinkInput, EventKind::Change, index);
                }
            }

            let (root_reference, root_real, root_map) = {
                let r = self.get_sink(root)?;
                (r.reference_volume, r.real_volume, r.channel_map.clone())
            };
            let o = self.get_sink_mut(origin)?;
            let old = o.reference_volume;
            o.reference_volume = root_reference.remap(&root_map, &o.channel_map);
            o.real_volume = root_real.remap(&root_map, &o.channel_map);
            debug_assert!(o.soft_volume.is_norm());
            if o.reference_volume != old {
                self.post(Facility::Sink, EventKind::Change, origin);
            }

            let children: Vec<u32> = self.get_sink(origin)?.inputs.iter().copied().collect();
            for child in children {
                self.update_volume_due_to_moving(child, dest)?;
            }
        } else {
            let (reference, sink_map) = {
                let s = self.get_sink(sink)?;
                (s.reference_volume, s.channel_map.clone())
            };
            let i = self.get_input_mut(index)?;
            let old = i.volume;
            if flat {
                i.volume = reference
                    .remap(&sink_map, &i.channel_map)
                    .multiply(&i.reference_ratio);
            } else {
                i.volume = i.reference_ratio;
                let ratio = i.reference_ratio;
                i.set_real_ratio(&ratio);
            }
            if i.volume != old {
                self.post(Facility::SinkInput, EventKind::Change, index);
            }
        }

        if sink == dest && flat {
            let save = self.get_input(index)?.save_volume;
            self.set_volume_inner(sink, None, false, save)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::format::Encoding;
    use crate::sink::{SinkNewData, SinkState};
    use crate::testutil::{new_input, ChunkStream};
    use crate::volume::Volume;

    fn core_with_sink(name: &str) -> (Core, u32) {
        let mut core = Core::new(CoreConfig::default());
        let idx = core.sink_new(SinkNewData::new(name)).unwrap();
        core.sink_put(idx).unwrap();
        (core, idx)
    }

    #[test]
    fn test_new_requires_linked_sink() {
        let mut core = Core::new(CoreConfig::default());
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        let data = InputNewData::new(idx, ChunkStream::silence_bytes(0));
        assert_eq!(core.input_new(data).unwrap_err(), SinkError::NotLinked);
    }

    #[test]
    fn test_put_runs_sink_and_unlink_idles_it() {
        let (mut core, sink) = core_with_sink("out");
        let input = new_input(&mut core, sink, "music");
        assert_eq!(core.input(input).unwrap().state(), InputState::Init);
        assert!(core.sink(sink).unwrap().inputs().any(|i| i == input));

        core.input_put(input).unwrap();
        assert_eq!(core.input(input).unwrap().state(), InputState::Running);
        assert_eq!(core.sink(sink).unwrap().state(), SinkState::Running);

        core.input_unlink(input).unwrap();
        assert!(core.input(input).is_none());
        assert_eq!(core.sink(sink).unwrap().state(), SinkState::Idle);
        assert_eq!(core.sink(sink).unwrap().inputs().count(), 0);
    }

    #[test]
    fn test_cork_updates_sink_status() {
        let (mut core, sink) = core_with_sink("out");
        let input = new_input(&mut core, sink, "music");
        core.input_put(input).unwrap();

        core.input_cork(input, true).unwrap();
        assert_eq!(core.sink(sink).unwrap().n_corked(), 1);
        assert_eq!(core.sink(sink).unwrap().state(), SinkState::Idle);
        assert_eq!(core.sink_used_by(sink).unwrap(), 0);
        assert_eq!(core.sink_linked_by(sink).unwrap(), 1);

        core.input_cork(input, false).unwrap();
        assert_eq!(core.sink(sink).unwrap().n_corked(), 0);
        assert_eq!(core.sink(sink).unwrap().state(), SinkState::Running);
    }

    #[test]
    fn test_start_corked() {
        let (mut core, sink) = core_with_sink("out");
        let mut data = InputNewData::new(sink, ChunkStream::silence_bytes(0));
        data.flags = InputFlags::START_CORKED;
        let input = core.input_new(data).unwrap();
        core.input_put(input).unwrap();
        assert_eq!(core.input(input).unwrap().state(), InputState::Corked);
        assert_eq!(core.sink(sink).unwrap().state(), SinkState::Idle);
    }

    #[test]
    fn test_mono_volume_is_spread() {
        let (mut core, sink) = core_with_sink("out");
        let data = InputNewData::new(sink, ChunkStream::silence_bytes(0))
            .with_volume(ChannelVolume::new(1, Volume(0x8000)), true);
        let input = core.input_new(data).unwrap();
        assert_eq!(
            core.input(input).unwrap().volume(),
            &ChannelVolume::new(2, Volume(0x8000))
        );

        let data = InputNewData::new(sink, ChunkStream::silence_bytes(0))
            .with_volume(ChannelVolume::new(3, Volume(0x8000)), true);
        assert_eq!(core.input_new(data).unwrap_err(), SinkError::IncompatibleVolume);
    }

    #[test]
    fn test_volume_factor_multiplies_soft_volume() {
        let (mut core, sink) = core_with_sink("out");
        let input = new_input(&mut core, sink, "music");
        core.input_put(input).unwrap();

        let half = ChannelVolume::new(2, Volume(0x8000));
        core.input_add_volume_factor(input, "ducking", &half).unwrap();
        let i = core.input(input).unwrap();
        assert_eq!(i.volume_factor(), &half);
        assert_eq!(i.soft_volume(), &i.real_ratio().multiply(&half));
        assert!(i.volume().is_norm());

        core.input_remove_volume_factor(input, "ducking").unwrap();
        assert!(core.input(input).unwrap().volume_factor().is_norm());
        assert_eq!(
            core.input_remove_volume_factor(input, "ducking"),
            Err(SinkError::NoEntity)
        );
    }

    #[test]
    fn test_passthrough_rules() {
        let (mut core, sink) = core_with_sink("out");

        let mut data = InputNewData::new(sink, ChunkStream::silence_bytes(0));
        data.flags = InputFlags::PASSTHROUGH;
        let pt = core.input_new(data).unwrap();
        core.input_put(pt).unwrap();
        assert!(core.sink_is_passthrough(sink));

        let other = InputNewData::new(sink, ChunkStream::silence_bytes(0));
        assert!(matches!(core.input_new(other), Err(SinkError::Refused(_))));

        let half = ChannelVolume::new(2, Volume(0x8000));
        assert!(matches!(
            core.input_set_volume(pt, &half, false, true),
            Err(SinkError::Refused(_))
        ));

        let mut data = InputNewData::new(sink, ChunkStream::silence_bytes(0));
        data.format = FormatInfo::new(Encoding::Ac3Iec61937);
        assert!(matches!(core.input_new(data), Err(SinkError::Refused(_))));
    }

    #[test]
    fn test_move_between_sinks() {
        let (mut core, a) = core_with_sink("a");
        let b = core.sink_new(SinkNewData::new("b")).unwrap();
        core.sink_put(b).unwrap();

        let input = new_input(&mut core, a, "music");
        core.input_put(input).unwrap();

        core.input_move_to(input, b, true).unwrap();
        let i = core.input(input).unwrap();
        assert_eq!(i.sink(), Some(b));
        assert!(i.save_sink());
        assert_eq!(core.sink(a).unwrap().inputs().count(), 0);
        assert_eq!(core.sink(a).unwrap().state(), SinkState::Idle);
        assert_eq!(core.sink(b).unwrap().state(), SinkState::Running);
    }

    #[test]
    fn test_dont_move_and_sync_groups_stay() {
        let (mut core, a) = core_with_sink("a");
        let b = core.sink_new(SinkNewData::new("b")).unwrap();
        core.sink_put(b).unwrap();

        let mut data = InputNewData::new(a, ChunkStream::silence_bytes(0));
        data.flags = InputFlags::DONT_MOVE;
        let pinned = core.input_new(data).unwrap();
        core.input_put(pinned).unwrap();
        assert!(matches!(core.input_move_to(pinned, b, false), Err(SinkError::Refused(_))));
        assert_eq!(core.input(pinned).unwrap().sink(), Some(a));

        let first = new_input(&mut core, a, "first");
        let mut data = InputNewData::new(a, ChunkStream::silence_bytes(0));
        data.sync_with = Some(first);
        let second = core.input_new(data).unwrap();
        assert_eq!(core.input(first).unwrap().sync_next, Some(second));
        assert!(!core.input_may_move(first).unwrap());

        core.input_put(first).unwrap();
        core.input_put(second).unwrap();
        core.input_cork(second, true).unwrap();
        assert_eq!(core.input(first).unwrap().state(), InputState::Corked);
        assert_eq!(core.sink(a).unwrap().n_corked(), 2);

        core.input_unlink(first).unwrap();
        assert_eq!(core.input(second).unwrap().sync_prev, None);
        assert_eq!(core.sink(a).unwrap().n_corked(), 1);
    }

    #[test]
    fn test_moving_input_can_be_killed() {
        let (mut core, a) = core_with_sink("a");
        let input = new_input(&mut core, a, "music");
        core.input_put(input).unwrap();

        core.input_start_move(input).unwrap();
        assert!(core.input(input).unwrap().is_moving());
        core.input_fail_move(input).unwrap();
        assert!(core.input(input).is_none());
    }

    #[test]
    fn test_requested_latency_before_and_after_put() {
        let mut core = Core::new(CoreConfig::default());
        let mut data = SinkNewData::new("out");
        data.flags = crate::sink::SinkFlags::DYNAMIC_LATENCY;
        let sink = core.sink_new(data).unwrap();
        core.sink_put(sink).unwrap();

        let input = new_input(&mut core, sink, "music");
        assert_eq!(core.input_set_requested_latency(input, Some(20_000)).unwrap(), Some(20_000));
        core.input_put(input).unwrap();
        assert_eq!(core.sink_get_requested_latency(sink).unwrap(), 20_000);

        assert_eq!(core.input_set_requested_latency(input, Some(100)).unwrap(), Some(500));
        assert_eq!(core.sink_get_requested_latency(sink).unwrap(), 500);
    }
}
