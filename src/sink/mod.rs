// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sinks: construction, linking, metadata, ports and formats.
//!
//! The volume model lives in [`volume`], the state machine in [`state`] and
//! the latency API in [`latency`]. All of them are methods on
//! [`Core`](crate::Core) because they walk sinks and inputs together.

mod backend;
pub mod latency;
mod state;
mod volume;

pub use backend::{NullBackend, SinkBackend, SinkHooks, VolumeRequest};
pub(crate) use backend::SharedBackend;
pub use state::{ClearSwitchCause, SuspendPolicy};

use crate::engine::{Core, EventKind, Facility, HookResult, SinkNewHook};
use crate::error::{Result, SinkError};
use crate::format::FormatInfo;
use crate::monitor::Monitor;
use crate::namereg::NameKind;
use crate::port::{self, DevicePort};
use crate::proplist::{self, Proplist, UpdateMode};
use crate::sample::{ChannelMap, SampleSpec};
use crate::thread::{Reply, SinkDriver, SinkMessage, SinkThread, ThreadInit, ThreadLink, VolumeSync};
use crate::volume::{ChannelVolume, Volume};
use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

bitflags! {
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SinkFlags: u32 {
        /// Supports hardware volume control.
        const HW_VOLUME_CTRL = 0x0001;
        /// Supports latency querying.
        const LATENCY = 0x0002;
        /// A hardware sink, as opposed to a virtual one.
        const HARDWARE = 0x0004;
        const NETWORK = 0x0008;
        const HW_MUTE_CTRL = 0x0010;
        /// Volume can be translated to dB.
        const DECIBEL_VOLUME = 0x0020;
        /// The sink volume follows the loudest input.
        const FLAT_VOLUME = 0x0040;
        /// Latency adapts to what the inputs ask for.
        const DYNAMIC_LATENCY = 0x0080;
        const SET_FORMATS = 0x0100;
        /// Hardware volume changes are timed to the audio on the IO thread.
        const DEFERRED_VOLUME = 0x0200;
        /// A filter sink whose volume is its master's volume.
        const SHARE_VOLUME_WITH_MASTER = 0x0400;
    }
}

bitflags! {
    /// Reasons a sink is suspended. The sink runs only when none are set.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SuspendCause: u32 {
        const USER = 0x0001;
        const APPLICATION = 0x0002;
        const IDLE = 0x0004;
        const SESSION = 0x0008;
        const PASSTHROUGH = 0x0010;
        /// Suspended to switch the sample rate.
        const SWITCH = 0x0020;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkState {
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl SinkState {
    pub fn is_linked(self) -> bool {
        matches!(self, SinkState::Idle | SinkState::Running | SinkState::Suspended)
    }

    pub fn is_opened(self) -> bool {
        matches!(self, SinkState::Idle | SinkState::Running)
    }

    pub fn is_running(self) -> bool {
        self == SinkState::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SinkState::Init => "INIT",
            SinkState::Idle => "IDLE",
            SinkState::Running => "RUNNING",
            SinkState::Suspended => "SUSPENDED",
            SinkState::Unlinked => "UNLINKED",
        }
    }
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to construct a sink.
pub struct SinkNewData {
    pub name: String,
    /// Fail instead of picking a free variant when the name is taken.
    pub namereg_fail: bool,
    /// Free-form identifier of whoever created the sink.
    pub driver: Option<String>,
    pub proplist: Proplist,
    /// Defaults to the core's default sample spec.
    pub sample_spec: Option<SampleSpec>,
    /// Defaults to the standard map for the channel count.
    pub channel_map: Option<ChannelMap>,
    /// Defaults to the core setting.
    pub alternate_sample_rate: Option<u32>,
    /// Initial volume. Leaving it unset resets `save_volume`.
    pub volume: Option<ChannelVolume>,
    pub muted: Option<bool>,
    pub save_volume: bool,
    pub save_muted: bool,
    pub flags: SinkFlags,
    pub suspend_cause: SuspendCause,
    pub ports: BTreeMap<String, DevicePort>,
    pub active_port: Option<String>,
    pub save_port: bool,
    /// Re-read volume and mute from the backend on every query.
    pub refresh_volume: bool,
    pub refresh_muted: bool,
    pub backend: Option<Box<dyn SinkBackend>>,
    pub io_driver: Option<Box<dyn SinkDriver>>,
}

impl SinkNewData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namereg_fail: true,
            driver: None,
            proplist: Proplist::new(),
            sample_spec: None,
            channel_map: None,
            alternate_sample_rate: None,
            volume: None,
            muted: None,
            save_volume: false,
            save_muted: false,
            flags: SinkFlags::empty(),
            suspend_cause: SuspendCause::empty(),
            ports: BTreeMap::new(),
            active_port: None,
            save_port: false,
            refresh_volume: false,
            refresh_muted: false,
            backend: None,
            io_driver: None,
        }
    }

    pub fn with_backend(mut self, backend: impl SinkBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn with_driver(mut self, driver: impl SinkDriver + 'static) -> Self {
        self.io_driver = Some(Box::new(driver));
        self
    }

    pub fn add_port(&mut self, port: DevicePort) {
        self.ports.insert(port.name.clone(), port);
    }
}

impl fmt::Debug for SinkNewData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkNewData")
            .field("name", &self.name)
            .field("sample_spec", &self.sample_spec)
            .field("channel_map", &self.channel_map)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Main-thread side of a sink.
pub struct Sink {
    pub(crate) index: u32,
    pub(crate) name: String,
    pub(crate) driver: Option<String>,
    pub(crate) proplist: Proplist,
    pub(crate) priority: u32,
    pub(crate) flags: SinkFlags,
    pub(crate) state: SinkState,
    pub(crate) suspend_cause: SuspendCause,
    pub(crate) mixer_dirty: Arc<AtomicBool>,

    pub(crate) sample_spec: SampleSpec,
    pub(crate) channel_map: ChannelMap,
    pub(crate) default_sample_rate: u32,
    pub(crate) alternate_sample_rate: u32,

    pub(crate) reference_volume: ChannelVolume,
    pub(crate) real_volume: ChannelVolume,
    pub(crate) soft_volume: ChannelVolume,
    pub(crate) muted: bool,
    pub(crate) base_volume: Volume,
    pub(crate) n_volume_steps: u32,
    pub(crate) refresh_volume: bool,
    pub(crate) refresh_muted: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) save_port: bool,
    pub(crate) saved_volume: Option<ChannelVolume>,
    pub(crate) saved_save_volume: bool,

    pub(crate) inputs: BTreeSet<u32>,
    pub(crate) n_corked: u32,
    pub(crate) input_to_master: Option<u32>,
    pub(crate) monitor: Monitor,

    pub(crate) ports: BTreeMap<String, DevicePort>,
    pub(crate) active_port: Option<String>,
    pub(crate) latency_offset: i64,

    pub(crate) backend: SharedBackend,
    pub(crate) hooks: SinkHooks,
    pub(crate) thread: ThreadLink,
    pub(crate) io_driver: Option<Box<dyn SinkDriver>>,
}

impl Sink {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn proplist(&self) -> &Proplist {
        &self.proplist
    }

    pub fn description(&self) -> Option<&str> {
        self.proplist.get(proplist::DEVICE_DESCRIPTION)
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn flags(&self) -> SinkFlags {
        self.flags
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn suspend_cause(&self) -> SuspendCause {
        self.suspend_cause
    }

    /// Flag an implementor sets when the mixer may have been changed while
    /// the session was away. Settings are restored on the next resume.
    pub fn mixer_dirty_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.mixer_dirty)
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn default_sample_rate(&self) -> u32 {
        self.default_sample_rate
    }

    pub fn alternate_sample_rate(&self) -> u32 {
        self.alternate_sample_rate
    }

    pub fn reference_volume(&self) -> &ChannelVolume {
        &self.reference_volume
    }

    pub fn real_volume(&self) -> &ChannelVolume {
        &self.real_volume
    }

    pub fn soft_volume(&self) -> &ChannelVolume {
        &self.soft_volume
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn base_volume(&self) -> Volume {
        self.base_volume
    }

    pub fn n_volume_steps(&self) -> u32 {
        self.n_volume_steps
    }

    pub fn save_volume(&self) -> bool {
        self.save_volume
    }

    pub fn save_muted(&self) -> bool {
        self.save_muted
    }

    pub fn save_port(&self) -> bool {
        self.save_port
    }

    pub fn inputs(&self) -> impl Iterator<Item = u32> + '_ {
        self.inputs.iter().copied()
    }

    pub fn n_corked(&self) -> u32 {
        self.n_corked
    }

    pub fn input_to_master(&self) -> Option<u32> {
        self.input_to_master
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn ports(&self) -> &BTreeMap<String, DevicePort> {
        &self.ports
    }

    pub fn active_port(&self) -> Option<&DevicePort> {
        self.active_port.as_ref().and_then(|p| self.ports.get(p))
    }

    pub fn latency_offset(&self) -> i64 {
        self.latency_offset
    }

    pub(crate) fn send(&mut self, msg: SinkMessage) -> Result<Reply> {
        self.thread.send(msg)
    }

    /// The thread-side state, while the sink has not been put yet.
    pub(crate) fn local_thread(&mut self) -> Option<&mut SinkThread> {
        match &mut self.thread {
            ThreadLink::Local(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn volume_request(&self) -> VolumeRequest {
        VolumeRequest {
            real_volume: self.real_volume,
            soft_volume: self.soft_volume,
        }
    }

    pub(crate) fn apply_volume_request(&mut self, req: VolumeRequest) {
        self.real_volume = req.real_volume;
        self.soft_volume = req.soft_volume;
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Creates a sink in the `Init` state and registers its name and the
    /// name of its monitor.
    pub fn sink_new(&mut self, mut data: SinkNewData) -> Result<u32> {
        let index = self.next_sink_index;
        let name = self
            .namereg
            .register(&data.name, NameKind::Sink, index, data.namereg_fail)?;
        data.name = name.clone();

        match self.build_sink(index, data) {
            Ok(sink) => {
                info!(
                    "Created sink {} \"{}\" with sample spec {} and channel map {}",
                    index, sink.name, sink.sample_spec, sink.channel_map
                );
                if let Some(d) = sink.description() {
                    info!("    description = \"{}\"", d);
                }
                self.sinks.insert(index, sink);
                self.next_sink_index += 1;
                Ok(index)
            }
            Err(e) => {
                self.namereg.unregister(&name);
                Err(e)
            }
        }
    }

    fn build_sink(&mut self, index: u32, mut data: SinkNewData) -> Result<Sink> {
        if fire_hooks(&mut self.sink_new_hooks, &mut data) == HookResult::Cancel {
            return Err(SinkError::HookRejected);
        }

        let sample_spec = data.sample_spec.unwrap_or(self.config.default_sample_spec);
        if !sample_spec.is_valid() {
            return Err(SinkError::InvalidSampleSpec);
        }

        let channel_map = match data.channel_map.take() {
            Some(map) => map,
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

        debug_assert!(
            data.volume.is_none() || !data.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER)
        );
        let volume = match data.volume {
            Some(v) => v,
            None => {
                data.save_volume = false;
                ChannelVolume::norm(sample_spec.channels)
            }
        };
        if !volume.is_valid() {
            return Err(SinkError::InvalidVolume);
        }
        if !volume.is_compatible(&sample_spec) {
            return Err(SinkError::IncompatibleVolume);
        }
        let muted = data.muted.unwrap_or_else(|| {
            data.save_muted = false;
            false
        });

        proplist::device_init_description(&mut data.proplist);
        proplist::device_init_icon(&mut data.proplist, true);
        proplist::device_init_intended_roles(&mut data.proplist);

        if fire_hooks(&mut self.sink_fixate_hooks, &mut data) == HookResult::Cancel {
            return Err(SinkError::HookRejected);
        }

        let mut alternate_sample_rate = data
            .alternate_sample_rate
            .unwrap_or(self.config.alternate_sample_rate);
        if alternate_sample_rate == sample_spec.rate {
            warn!(
                "Default and alternate sample rates are the same ({} Hz), disabling switching",
                sample_spec.rate
            );
            alternate_sample_rate = 0;
        }

        let backend = data.backend.take().unwrap_or_else(|| Box::new(NullBackend));
        let hooks = backend.hooks();
        let backend = backend::share(backend);

        let mut flags = data.flags
            - (SinkFlags::HW_VOLUME_CTRL | SinkFlags::HW_MUTE_CTRL | SinkFlags::DEFERRED_VOLUME);
        if hooks.contains(SinkHooks::SET_VOLUME) {
            flags |= SinkFlags::HW_VOLUME_CTRL;
        }
        if hooks.contains(SinkHooks::SET_MUTE) {
            flags |= SinkFlags::HW_MUTE_CTRL;
        }
        if hooks.contains(SinkHooks::WRITE_VOLUME) {
            flags |= SinkFlags::DEFERRED_VOLUME;
        }

        let (active_port, save_port) = match data.active_port.as_ref() {
            Some(p) if data.ports.contains_key(p) => (Some(p.clone()), data.save_port),
            _ => (port::highest_priority(&data.ports).map(|p| p.name.clone()), false),
        };
        let latency_offset = active_port
            .as_ref()
            .and_then(|p| data.ports.get(p))
            .map(|p| p.latency_offset)
            .unwrap_or(0);

        let monitor_name = format!("{}.monitor", data.name);
        let monitor_description = format!(
            "Monitor of {}",
            data.proplist
                .get(proplist::DEVICE_DESCRIPTION)
                .unwrap_or(&data.name)
        );

        let soft_volume = ChannelVolume::norm(sample_spec.channels);
        let thread = SinkThread::new(ThreadInit {
            index,
            name: data.name.clone(),
            sample_spec,
            flags,
            hooks,
            backend: Arc::clone(&backend),
            clock: Arc::clone(&self.clock),
            notices: self.notice_tx.clone(),
            safety_margin: self.config.deferred_volume_safety_margin_usec,
            extra_delay: self.config.deferred_volume_extra_delay_usec,
            mono_downmix: self.config.mono_downmix,
            soft_volume,
            muted,
        });

        let monitor_name = self
            .namereg
            .register(&monitor_name, NameKind::Source, index, false)?;
        let monitor = Monitor::new(
            monitor_name,
            monitor_description,
            data.driver.clone(),
            sample_spec,
            channel_map.clone(),
            flags,
            data.suspend_cause,
        );

        Ok(Sink {
            index,
            name: data.name,
            driver: data.driver,
            priority: proplist::device_init_priority(&data.proplist),
            proplist: data.proplist,
            flags,
            state: SinkState::Init,
            suspend_cause: data.suspend_cause,
            mixer_dirty: Arc::new(AtomicBool::new(false)),
            sample_spec,
            channel_map,
            default_sample_rate: sample_spec.rate,
            alternate_sample_rate,
            reference_volume: volume,
            real_volume: volume,
            soft_volume,
            muted,
            base_volume: Volume::NORM,
            n_volume_steps: Volume::NORM.0 + 1,
            refresh_volume: data.refresh_volume,
            refresh_muted: data.refresh_muted,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            save_port,
            saved_volume: None,
            saved_save_volume: false,
            inputs: BTreeSet::new(),
            n_corked: 0,
            input_to_master: None,
            monitor,
            ports: data.ports,
            active_port,
            latency_offset,
            backend,
            hooks,
            thread: ThreadLink::Local(Box::new(thread)),
            io_driver: data.io_driver,
        })
    }

    /// Finishes construction: settles volume flags, starts the IO thread
    /// and moves the sink to `Idle` (or `Suspended` if a cause is set).
    pub fn sink_put(&mut self, index: u32) -> Result<()> {
        let flat_volumes = self.config.flat_volumes;
        let share = {
            let s = self.get_sink_mut(index)?;
            if s.state != SinkState::Init {
                return Err(SinkError::Refused(format!("sink {} was already put", s.name)));
            }

            if !s.flags.contains(SinkFlags::HW_VOLUME_CTRL)
                && !s.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER)
            {
                s.flags |= SinkFlags::DECIBEL_VOLUME;
            }
            if s.flags.contains(SinkFlags::DECIBEL_VOLUME) && flat_volumes {
                s.flags |= SinkFlags::FLAT_VOLUME;
            }
            s.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER)
        };

        if share {
            let root = self
                .sink_get_master(index)
                .ok_or_else(|| SinkError::Refused("volume sharing sink has no master".into()))?;
            let (reference, real, root_map) = {
                let r = self.get_sink(root)?;
                (r.reference_volume, r.real_volume, r.channel_map.clone())
            };
            let s = self.get_sink_mut(index)?;
            s.reference_volume = reference.remap(&root_map, &s.channel_map);
            s.real_volume = real.remap(&root_map, &s.channel_map);
        } else {
            let s = self.get_sink_mut(index)?;
            s.reference_volume = s.real_volume;
        }

        {
            let s = self.get_sink_mut(index)?;
            let (soft, real, muted, flags) = (s.soft_volume, s.real_volume, s.muted, s.flags);
            let offset = s.latency_offset;
            s.monitor.flags = flags & (SinkFlags::LATENCY | SinkFlags::DYNAMIC_LATENCY);
            if let Some(t) = s.local_thread() {
                t.latency_offset = offset;
                t.soft_volume = soft;
                t.soft_muted = muted;
                t.current_hw_volume = soft.multiply(&real);
                t.flags = flags;
            }

            let driver = s.io_driver.take();
            s.thread.start(driver)?;
        }

        let initial = if self.get_sink(index)?.suspend_cause.is_empty() {
            SinkState::Idle
        } else {
            SinkState::Suspended
        };
        self.sink_set_state(index, initial)?;
        self.monitor_put(index)?;

        self.post(Facility::Sink, EventKind::New, index);
        let s = self.get_sink(index)?;
        info!("Sink {} \"{}\" linked ({})", index, s.name, s.state);
        Ok(())
    }

    /// Tears a sink down. Safe to call more than once and on sinks that
    /// were never put.
    pub fn sink_unlink(&mut self, index: u32) -> Result<()> {
        let Some(s) = self.sinks.get(&index) else {
            return Ok(());
        };
        let linked = s.state.is_linked();
        let inputs: Vec<u32> = s.inputs.iter().copied().collect();

        for i in inputs {
            if let Err(e) = self.input_kill(i) {
                warn!("Failed to kill input {} of sink {}: {}", i, index, e);
                self.inputs.remove(&i);
            }
        }

        if linked {
            if let Err(e) = self.sink_set_state(index, SinkState::Unlinked) {
                warn!("Failed to move sink {} to UNLINKED: {}", index, e);
            }
        }

        self.monitor_unlink(index)?;

        let Some(mut s) = self.sinks.remove(&index) else {
            return Ok(());
        };
        s.state = SinkState::Unlinked;
        s.thread.stop();
        self.namereg.unregister(&s.name);

        if let Some(proxy) = s.input_to_master.take() {
            if let Some(i) = self.inputs.get_mut(&proxy) {
                i.origin_sink = None;
            }
        }

        if linked {
            self.post(Facility::Sink, EventKind::Remove, index);
            info!("Freed sink {} \"{}\"", index, s.name);
        }
        Ok(())
    }

    /// Connects a volume-sharing filter sink to the proxy input that feeds
    /// its master, or clears the connection.
    pub fn sink_set_input_to_master(&mut self, filter: u32, input: Option<u32>) -> Result<()> {
        self.get_sink(filter)?;

        if let Some(old) = self.get_sink_mut(filter)?.input_to_master.take() {
            if let Some(i) = self.inputs.get_mut(&old) {
                i.origin_sink = None;
            }
        }

        let Some(input) = input else {
            return Ok(());
        };

        let mut cursor = self.get_input(input)?.sink;
        while let Some(s) = cursor {
            if s == filter {
                return Err(SinkError::Cycle);
            }
            cursor = self
                .sinks
                .get(&s)
                .and_then(|s| s.input_to_master)
                .and_then(|i| self.inputs.get(&i))
                .and_then(|i| i.sink);
        }

        self.get_input_mut(input)?.origin_sink = Some(filter);
        self.get_sink_mut(filter)?.input_to_master = Some(input);
        Ok(())
    }

    pub fn sink_update_proplist(
        &mut self,
        index: u32,
        mode: UpdateMode,
        p: &Proplist,
    ) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        s.proplist.update(mode, p);
        let linked = s.state.is_linked();
        if linked {
            self.post(Facility::Sink, EventKind::Change, index);
        }
        Ok(())
    }

    pub fn sink_set_description(&mut self, index: u32, description: Option<&str>) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        let old = s.proplist.get(proplist::DEVICE_DESCRIPTION);
        if old == description {
            return Ok(());
        }

        match description {
            Some(d) => s.proplist.set(proplist::DEVICE_DESCRIPTION, d),
            None => {
                s.proplist.unset(proplist::DEVICE_DESCRIPTION);
            }
        }

        let monitor_description = format!("Monitor Source of {}", description.unwrap_or(&s.name));
        s.monitor.set_description(&monitor_description);
        let (linked, monitor_linked) = (s.state.is_linked(), s.monitor.state.is_linked());

        if linked {
            info!("Changed description of sink {} to \"{}\"", index, description.unwrap_or(""));
            self.post(Facility::Sink, EventKind::Change, index);
        }
        if monitor_linked {
            self.post(Facility::Source, EventKind::Change, index);
        }
        Ok(())
    }

    /// Switches to the port called `name`.
    pub fn sink_set_port(&mut self, index: u32, name: &str, save: bool) -> Result<()> {
        let s = self.get_sink_mut(index)?;

        if !s.hooks.contains(SinkHooks::SET_PORT) {
            debug!("set_port() operation not implemented for sink {} \"{}\"", s.index, s.name);
            return Err(SinkError::NotImplemented);
        }

        let port = s.ports.get(name).cloned().ok_or(SinkError::NoEntity)?;

        if s.active_port.as_deref() == Some(name) {
            s.save_port = s.save_port || save;
            return Ok(());
        }

        if s.flags.contains(SinkFlags::DEFERRED_VOLUME) {
            s.send(SinkMessage::SetPort(port.clone()))?.into_status()?;
        } else {
            s.backend.lock().set_port(&port)?;
        }

        info!("Changed port of sink {} \"{}\" to {}", s.index, s.name, port.name);
        s.active_port = Some(port.name.clone());
        s.save_port = save;

        self.post(Facility::Sink, EventKind::Change, index);
        self.sink_set_latency_offset(index, port.latency_offset)
    }

    /// Formats the sink can play. Plain PCM unless the backend says more.
    pub fn sink_get_formats(&mut self, index: u32) -> Result<Vec<FormatInfo>> {
        let s = self.get_sink_mut(index)?;
        if s.hooks.contains(SinkHooks::GET_FORMATS) {
            if let Some(formats) = s.backend.lock().get_formats() {
                return Ok(formats);
            }
        }
        Ok(vec![FormatInfo::pcm()])
    }

    pub fn sink_set_formats(&mut self, index: u32, formats: &[FormatInfo]) -> Result<bool> {
        let s = self.get_sink_mut(index)?;
        if !s.hooks.contains(SinkHooks::SET_FORMATS) {
            return Ok(false);
        }
        Ok(s.backend.lock().set_formats(formats))
    }

    /// True if any sink format accepts `format`.
    pub fn sink_check_format(&mut self, index: u32, format: &FormatInfo) -> Result<bool> {
        Ok(self
            .sink_get_formats(index)?
            .iter()
            .any(|f| f.is_compatible(format)))
    }

    /// The subset of `formats` the sink accepts, in the sink's order of
    /// preference.
    pub fn sink_check_formats(
        &mut self,
        index: u32,
        formats: &[FormatInfo],
    ) -> Result<Vec<FormatInfo>> {
        let sink_formats = self.sink_get_formats(index)?;
        let mut out = Vec::new();
        for f_sink in &sink_formats {
            for f_in in formats {
                if f_sink.is_compatible(f_in) {
                    out.push(f_in.clone());
                }
            }
        }
        Ok(out)
    }

    /// Changes the `LATENCY` and `DYNAMIC_LATENCY` flags at runtime.
    pub fn sink_update_flags(&mut self, index: u32, mask: SinkFlags, value: SinkFlags) -> Result<()> {
        let allowed = SinkFlags::LATENCY | SinkFlags::DYNAMIC_LATENCY;
        if !(mask - allowed).is_empty() {
            return Err(SinkError::Refused(format!("flags {:?} cannot be changed", mask - allowed)));
        }

        let s = self.get_sink_mut(index)?;
        let old = s.flags;
        s.flags = (s.flags - mask) | (value & mask);
        if s.flags == old {
            return Ok(());
        }

        if s.flags.contains(SinkFlags::LATENCY) != old.contains(SinkFlags::LATENCY) {
            debug!(
                "Sink {}: LATENCY flag {}",
                s.name,
                if s.flags.contains(SinkFlags::LATENCY) { "enabled" } else { "disabled" }
            );
        }
        if s.flags.contains(SinkFlags::DYNAMIC_LATENCY) != old.contains(SinkFlags::DYNAMIC_LATENCY) {
            debug!(
                "Sink {}: DYNAMIC_LATENCY flag {}",
                s.name,
                if s.flags.contains(SinkFlags::DYNAMIC_LATENCY) { "enabled" } else { "disabled" }
            );
        }

        let flags = s.flags;
        s.monitor.flags = (s.monitor.flags - mask) | (value & mask);
        s.send(SinkMessage::SetFlags(flags))?;
        self.post(Facility::Sink, EventKind::Change, index);

        let origins: Vec<u32> = self
            .get_sink(index)?
            .inputs
            .iter()
            .filter_map(|i| self.inputs.get(i).and_then(|i| i.origin_sink))
            .collect();
        for origin in origins {
            self.sink_update_flags(origin, mask, value)?;
        }
        Ok(())
    }

    /// Copies the volumes of `index` and its inputs into a message payload.
    pub(crate) fn volume_snapshot(&self, index: u32) -> Result<VolumeSync> {
        let s = self.get_sink(index)?;
        let inputs = s
            .inputs
            .iter()
            .filter_map(|i| self.inputs.get(i).map(|input| (*i, input.soft_volume)))
            .collect();
        Ok(VolumeSync {
            real_volume: s.real_volume,
            soft_volume: s.soft_volume,
            inputs,
        })
    }
}

fn fire_hooks(hooks: &mut [SinkNewHook], data: &mut SinkNewData) -> HookResult {
    for hook in hooks.iter_mut() {
        match hook(data) {
            HookResult::Continue => {}
            HookResult::Stop => return HookResult::Continue,
            HookResult::Cancel => return HookResult::Cancel,
        }
    }
    HookResult::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::engine::Core;
    use crate::format::{Encoding, PropValue, FORMAT_RATE};
    use crate::sample::SampleFormat;
    use crate::input::InputNewData;
    use crate::testutil::{ChunkStream, RecordingBackend};

    fn core() -> Core {
        Core::new(CoreConfig::default())
    }

    #[test]
    fn test_channel_map_mismatch_leaves_no_registry_entry() {
        let mut core = core();
        let mut data = SinkNewData::new("bad");
        data.sample_spec = Some(SampleSpec::new(SampleFormat::S16le, 44100, 2));
        data.channel_map = Some(ChannelMap::mono());

        assert_eq!(
            core.sink_new(data).unwrap_err(),
            SinkError::ChannelMapMismatch { map: 1, spec: 2 }
        );
        assert!(core.sink_by_name("bad").is_none());
        assert_eq!(core.sinks().count(), 0);

        // The name is free again.
        let idx = core.sink_new(SinkNewData::new("bad")).unwrap();
        assert_eq!(core.sink(idx).unwrap().name(), "bad");
    }

    #[test]
    fn test_new_fills_defaults() {
        let mut core = core();
        let mut data = SinkNewData::new("out");
        data.proplist.set(proplist::DEVICE_PRODUCT_NAME, "Speakers");
        let idx = core.sink_new(data).unwrap();

        let s = core.sink(idx).unwrap();
        assert_eq!(s.state(), SinkState::Init);
        assert_eq!(s.channel_map(), &ChannelMap::stereo());
        assert!(s.reference_volume().is_norm());
        assert_eq!(s.description(), Some("Speakers"));
        assert_eq!(s.monitor().name(), "out.monitor");
        assert_eq!(s.monitor().description(), Some("Monitor of Speakers"));
        assert_eq!(s.alternate_sample_rate(), 48_000);
    }

    #[test]
    fn test_name_taken() {
        let mut core = core();
        core.sink_new(SinkNewData::new("out")).unwrap();
        assert_eq!(
            core.sink_new(SinkNewData::new("out")).unwrap_err(),
            SinkError::NameTaken("out".into())
        );

        let mut data = SinkNewData::new("out");
        data.namereg_fail = false;
        let idx = core.sink_new(data).unwrap();
        assert_eq!(core.sink(idx).unwrap().name(), "out.2");
    }

    #[test]
    fn test_hook_can_cancel_construction() {
        let mut core = core();
        core.add_sink_new_hook(Box::new(|data: &mut SinkNewData| {
            if data.name.starts_with("blocked") {
                HookResult::Cancel
            } else {
                HookResult::Continue
            }
        }));
        assert_eq!(
            core.sink_new(SinkNewData::new("blocked")).unwrap_err(),
            SinkError::HookRejected
        );
        assert!(core.sink_by_name("blocked").is_none());
        assert!(core.sink_new(SinkNewData::new("fine")).is_ok());
    }

    #[test]
    fn test_put_and_unlink() {
        let mut core = core();
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        core.sink_put(idx).unwrap();

        let s = core.sink(idx).unwrap();
        assert_eq!(s.state(), SinkState::Idle);
        assert!(s.flags().contains(SinkFlags::DECIBEL_VOLUME | SinkFlags::FLAT_VOLUME));
        assert!(core.sink_put(idx).is_err());

        core.take_events();
        core.sink_unlink(idx).unwrap();
        assert!(core.sink(idx).is_none());
        assert!(core.sink_by_name("out").is_none());
        assert!(core
            .events()
            .iter()
            .any(|e| e.facility == Facility::Sink && e.kind == EventKind::Remove && e.index == idx));

        core.sink_unlink(idx).unwrap();
    }

    #[test]
    fn test_unlink_continues_past_failed_input() {
        let mut core = core();
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        core.sink_put(idx).unwrap();
        let input = core
            .input_new(InputNewData::new(idx, ChunkStream::silence_bytes(0)))
            .unwrap();
        core.input_put(input).unwrap();

        // Every message to the sink fails from here on.
        core.get_sink_mut(idx).unwrap().thread.stop();
        core.take_events();

        core.sink_unlink(idx).unwrap();
        assert!(core.sink(idx).is_none());
        assert!(core.input(input).is_none());
        assert!(core.sink_by_name("out").is_none());
        assert!(core
            .events()
            .iter()
            .any(|e| e.facility == Facility::Sink && e.kind == EventKind::Remove && e.index == idx));
    }

    #[test]
    fn test_unlink_unput_sink() {
        let mut core = core();
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        core.sink_unlink(idx).unwrap();
        assert!(core.sink(idx).is_none());
        assert!(core.events().is_empty());
    }

    #[test]
    fn test_set_port() {
        let mut core = core();

        let mut data = SinkNewData::new("plain");
        data.add_port(DevicePort::new("speaker", "Speaker", 10));
        let plain = core.sink_new(data).unwrap();
        core.sink_put(plain).unwrap();
        assert_eq!(core.sink_set_port(plain, "speaker", false), Err(SinkError::NotImplemented));

        let mut data = SinkNewData::new("hw").with_backend(RecordingBackend::hardware());
        data.add_port(DevicePort::new("speaker", "Speaker", 10));
        data.add_port(DevicePort::new("headphones", "Headphones", 20).with_latency_offset(3_000));
        let hw = core.sink_new(data).unwrap();
        core.sink_put(hw).unwrap();

        assert_eq!(core.sink(hw).unwrap().active_port().unwrap().name, "headphones");
        assert_eq!(core.sink_set_port(hw, "hdmi", false), Err(SinkError::NoEntity));

        core.sink_set_port(hw, "speaker", true).unwrap();
        let s = core.sink(hw).unwrap();
        assert_eq!(s.active_port().unwrap().name, "speaker");
        assert!(s.save_port());
        assert_eq!(s.latency_offset(), 0);

        core.sink_set_port(hw, "headphones", false).unwrap();
        assert_eq!(core.sink(hw).unwrap().latency_offset(), 3_000);
    }

    #[test]
    fn test_set_description_updates_monitor() {
        let mut core = core();
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        core.sink_put(idx).unwrap();
        core.take_events();

        core.sink_set_description(idx, Some("Desk")).unwrap();
        let s = core.sink(idx).unwrap();
        assert_eq!(s.description(), Some("Desk"));
        assert_eq!(s.monitor().description(), Some("Monitor Source of Desk"));
        assert_eq!(core.events().len(), 2);

        core.sink_set_description(idx, Some("Desk")).unwrap();
        assert_eq!(core.events().len(), 2);
    }

    #[test]
    fn test_format_checks() {
        let mut core = core();
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();

        let mut pcm = FormatInfo::pcm();
        pcm.set(FORMAT_RATE, PropValue::Fixed("48000".into()));
        let ac3 = FormatInfo::new(Encoding::Ac3Iec61937);

        assert!(core.sink_check_format(idx, &pcm).unwrap());
        assert!(!core.sink_check_format(idx, &ac3).unwrap());
        assert_eq!(core.sink_check_formats(idx, &[ac3, pcm.clone()]).unwrap(), vec![pcm]);
        assert!(!core.sink_set_formats(idx, &[]).unwrap());
    }

    #[test]
    fn test_update_flags() {
        let mut core = core();
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        core.sink_put(idx).unwrap();

        assert!(core
            .sink_update_flags(idx, SinkFlags::HARDWARE, SinkFlags::HARDWARE)
            .is_err());

        core.sink_update_flags(idx, SinkFlags::LATENCY, SinkFlags::LATENCY).unwrap();
        let s = core.sink(idx).unwrap();
        assert!(s.flags().contains(SinkFlags::LATENCY));
        assert!(s.monitor().flags().contains(SinkFlags::LATENCY));
    }

    #[test]
    fn test_input_to_master_rejects_cycles() {
        let mut core = core();
        let master = core.sink_new(SinkNewData::new("master")).unwrap();
        core.sink_put(master).unwrap();

        let mut data = SinkNewData::new("filter");
        data.flags = SinkFlags::SHARE_VOLUME_WITH_MASTER;
        let filter = core.sink_new(data).unwrap();

        let proxy = crate::testutil::new_input(&mut core, master, "proxy");
        core.sink_set_input_to_master(filter, Some(proxy)).unwrap();
        core.sink_put(filter).unwrap();
        core.input_put(proxy).unwrap();
        assert_eq!(core.sink_get_master(filter), Some(master));

        // An input on the filter cannot become the master edge of its own
        // master chain.
        let looped = crate::testutil::new_input(&mut core, filter, "looped");
        core.input_put(looped).unwrap();
        assert_eq!(
            core.sink_set_input_to_master(master, Some(looped)),
            Err(SinkError::Cycle)
        );
    }
}
