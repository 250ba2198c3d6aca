// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The engine core: arena of sinks and sink inputs, name registry,
//! subscription events and extension hooks.

use crate::clock::{Clock, MonotonicClock};
use crate::config::CoreConfig;
use crate::error::{Result, SinkError};
use crate::input::SinkInput;
use crate::namereg::{NameKind, NameRegistry};
use crate::sink::{Sink, SinkNewData, SuspendPolicy};
use crate::thread::{self, Notice};
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, trace};

/// Object class a subscription event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    Sink,
    /// A sink's monitor. Uses the index of the sink.
    Source,
    SinkInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    New,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub facility: Facility,
    pub kind: EventKind,
    pub index: u32,
}

/// Outcome of a construction hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    Continue,
    /// Skip the remaining hooks.
    Stop,
    /// Abort construction.
    Cancel,
}

pub type SinkNewHook = Box<dyn FnMut(&mut SinkNewData) -> HookResult + Send>;

/// Owner of every sink and sink input.
///
/// All methods must be called from the thread that owns the `Core`; IO
/// threads are reached through messages only.
pub struct Core {
    pub(crate) config: CoreConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) namereg: NameRegistry,
    pub(crate) sinks: BTreeMap<u32, Sink>,
    pub(crate) inputs: BTreeMap<u32, SinkInput>,
    pub(crate) next_sink_index: u32,
    pub(crate) next_input_index: u32,
    pub(crate) next_output_id: u32,
    events: Vec<SubscriptionEvent>,
    pub(crate) notice_tx: Sender<Notice>,
    notice_rx: Receiver<Notice>,
    pub(crate) sink_new_hooks: Vec<SinkNewHook>,
    pub(crate) sink_fixate_hooks: Vec<SinkNewHook>,
    pub(crate) suspend_policy: Option<Box<dyn SuspendPolicy>>,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: CoreConfig, clock: Arc<dyn Clock>) -> Self {
        let (notice_tx, notice_rx) = thread::notice_channel();
        Self {
            config,
            clock,
            namereg: NameRegistry::new(),
            sinks: BTreeMap::new(),
            inputs: BTreeMap::new(),
            next_sink_index: 0,
            next_input_index: 0,
            next_output_id: 0,
            events: Vec::new(),
            notice_tx,
            notice_rx,
            sink_new_hooks: Vec::new(),
            sink_fixate_hooks: Vec::new(),
            suspend_policy: None,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Runs before a new sink's data is validated.
    pub fn add_sink_new_hook(&mut self, hook: SinkNewHook) {
        self.sink_new_hooks.push(hook);
    }

    /// Runs after defaults are filled in, right before the sink is built.
    pub fn add_sink_fixate_hook(&mut self, hook: SinkNewHook) {
        self.sink_fixate_hooks.push(hook);
    }

    pub fn set_suspend_policy(&mut self, policy: Option<Box<dyn SuspendPolicy>>) {
        self.suspend_policy = policy;
    }

    pub fn sink(&self, index: u32) -> Option<&Sink> {
        self.sinks.get(&index)
    }

    pub fn sink_by_name(&self, name: &str) -> Option<&Sink> {
        self.namereg
            .get(name, NameKind::Sink)
            .and_then(|i| self.sinks.get(&i))
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Sink> {
        self.sinks.values()
    }

    pub fn input(&self, index: u32) -> Option<&SinkInput> {
        self.inputs.get(&index)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &SinkInput> {
        self.inputs.values()
    }

    pub(crate) fn get_sink(&self, index: u32) -> Result<&Sink> {
        self.sinks.get(&index).ok_or(SinkError::NoSuchSink(index))
    }

    pub(crate) fn get_sink_mut(&mut self, index: u32) -> Result<&mut Sink> {
        self.sinks.get_mut(&index).ok_or(SinkError::NoSuchSink(index))
    }

    pub(crate) fn get_input(&self, index: u32) -> Result<&SinkInput> {
        self.inputs.get(&index).ok_or(SinkError::NoSuchInput(index))
    }

    pub(crate) fn get_input_mut(&mut self, index: u32) -> Result<&mut SinkInput> {
        self.inputs.get_mut(&index).ok_or(SinkError::NoSuchInput(index))
    }

    /// Linked sink or `NotLinked`.
    pub(crate) fn linked_sink(&self, index: u32) -> Result<&Sink> {
        let s = self.get_sink(index)?;
        if !s.state.is_linked() {
            return Err(SinkError::NotLinked);
        }
        Ok(s)
    }

    pub(crate) fn post(&mut self, facility: Facility, kind: EventKind, index: u32) {
        trace!("Event {:?} {:?} #{}", facility, kind, index);
        self.events.push(SubscriptionEvent {
            facility,
            kind,
            index,
        });
    }

    /// Events queued since the last [`take_events`](Self::take_events).
    pub fn events(&self) -> &[SubscriptionEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Handles notices posted by IO threads. Returns how many were handled.
    pub fn dispatch_notices(&mut self) -> usize {
        let mut n = 0;
        while let Ok(notice) = self.notice_rx.try_recv() {
            n += 1;
            match notice {
                Notice::UpdateVolumeAndMute(index) => {
                    let linked = self.sinks.get(&index).is_some_and(|s| s.state.is_linked());
                    if !linked {
                        continue;
                    }
                    debug!("Re-reading volume and mute of sink {}", index);
                    if let Err(e) = self.sink_get_volume(index, true) {
                        debug!("Failed to refresh volume of sink {}: {}", index, e);
                    }
                    if let Err(e) = self.sink_get_mute(index, true) {
                        debug!("Failed to refresh mute of sink {}: {}", index, e);
                    }
                }
            }
        }
        n
    }

    /// Unlinks every sink, stopping all IO threads.
    pub fn unlink_all(&mut self) {
        let indices: Vec<u32> = self.sinks.keys().copied().collect();
        for index in indices {
            if let Err(e) = self.sink_unlink(index) {
                debug!("Failed to unlink sink {}: {}", index, e);
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.unlink_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sink::SinkNewData;

    #[test]
    fn test_events_are_drained() {
        let mut core = Core::with_clock(CoreConfig::default(), Arc::new(ManualClock::new(0)));
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        assert!(core.events().is_empty());

        core.sink_put(idx).unwrap();
        let events = core.take_events();
        assert!(events.contains(&SubscriptionEvent {
            facility: Facility::Sink,
            kind: EventKind::New,
            index: idx,
        }));
        assert!(events.contains(&SubscriptionEvent {
            facility: Facility::Source,
            kind: EventKind::New,
            index: idx,
        }));
        assert!(core.events().is_empty());
    }

    #[test]
    fn test_lookup_errors() {
        let mut core = Core::new(CoreConfig::default());
        assert_eq!(core.get_sink(3).unwrap_err(), SinkError::NoSuchSink(3));
        assert_eq!(core.get_input(4).unwrap_err(), SinkError::NoSuchInput(4));
        assert!(core.sink_by_name("nope").is_none());

        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        assert_eq!(core.linked_sink(idx).unwrap_err(), SinkError::NotLinked);
        assert_eq!(core.sink_by_name("out").unwrap().index(), idx);
    }

    #[test]
    fn test_unlink_all() {
        let mut core = Core::new(CoreConfig::default());
        for name in ["a", "b", "c"] {
            let idx = core.sink_new(SinkNewData::new(name)).unwrap();
            core.sink_put(idx).unwrap();
        }
        core.unlink_all();
        assert_eq!(core.sinks().count(), 0);
        assert!(core.namereg.is_empty());
    }
}
