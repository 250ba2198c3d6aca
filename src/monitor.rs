// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The monitor of a sink: a capture-side mirror of everything it plays.
//!
//! [`Monitor`] is the main-thread half owned by the [`Sink`](crate::sink::Sink).
//! [`MonitorThread`] lives inside the sink's IO-thread state and hands each
//! rendered chunk to the registered [`MonitorOutput`]s.

use crate::engine::{Core, EventKind, Facility};
use crate::error::{Result, SinkError};
use crate::memblock::MemChunk;
use crate::sample::{ChannelMap, SampleSpec};
use crate::sink::{SinkFlags, SinkState, SuspendCause};
use crate::thread::SinkMessage;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Consumer of monitored audio. Runs on the sink's IO thread.
pub trait MonitorOutput: Send {
    fn push(&mut self, chunk: &MemChunk);

    /// The last `nbytes` pushed are being replaced.
    fn process_rewind(&mut self, _nbytes: usize) {}

    /// Latency this output wants from the sink, if any.
    fn requested_latency(&self) -> Option<u64> {
        None
    }

    fn update_max_rewind(&mut self, _nbytes: usize) {}
}

pub(crate) struct MonitorOutputEntry {
    pub id: u32,
    pub output: Box<dyn MonitorOutput>,
    /// Receives only this input's pre-mix audio.
    pub direct_on_input: Option<u32>,
}

impl MonitorOutputEntry {
    pub fn new(id: u32, output: Box<dyn MonitorOutput>, direct_on_input: Option<u32>) -> Self {
        Self {
            id,
            output,
            direct_on_input,
        }
    }
}

impl fmt::Debug for MonitorOutputEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOutputEntry")
            .field("id", &self.id)
            .field("direct_on_input", &self.direct_on_input)
            .finish_non_exhaustive()
    }
}

/// IO-thread half of the monitor.
pub(crate) struct MonitorThread {
    pub(crate) state: SinkState,
    outputs: Vec<MonitorOutputEntry>,
    min_latency: u64,
    max_latency: u64,
    fixed_latency: u64,
    max_rewind: usize,
}

impl MonitorThread {
    pub fn new() -> Self {
        Self {
            state: SinkState::Init,
            outputs: Vec::new(),
            min_latency: 0,
            max_latency: 0,
            fixed_latency: 0,
            max_rewind: 0,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.state.is_linked()
    }

    pub fn latency_range(&self) -> (u64, u64) {
        (self.min_latency, self.max_latency)
    }

    pub fn fixed_latency(&self) -> u64 {
        self.fixed_latency
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn requested_latency(&self) -> Option<u64> {
        if !self.is_linked() {
            return None;
        }
        self.outputs
            .iter()
            .filter_map(|o| o.output.requested_latency())
            .min()
    }

    pub fn add_output(&mut self, entry: MonitorOutputEntry) {
        self.outputs.push(entry);
    }

    pub fn remove_output(&mut self, id: u32) {
        self.outputs.retain(|o| o.id != id);
    }

    pub fn set_latency_range(&mut self, min: u64, max: u64) {
        self.min_latency = min;
        self.max_latency = max;
    }

    pub fn set_fixed_latency(&mut self, usec: u64) {
        self.fixed_latency = usec;
    }

    pub fn set_max_rewind(&mut self, nbytes: usize) {
        self.max_rewind = nbytes;
        for o in &mut self.outputs {
            o.output.update_max_rewind(nbytes);
        }
    }

    pub fn process_rewind(&mut self, nbytes: usize) {
        for o in &mut self.outputs {
            o.output.process_rewind(nbytes);
        }
    }

    pub fn has_direct_outputs(&self, input: u32) -> bool {
        self.outputs
            .iter()
            .any(|o| o.direct_on_input == Some(input))
    }

    pub fn post_direct(&mut self, input: u32, chunk: &MemChunk) {
        if self.state == SinkState::Suspended {
            return;
        }
        for o in &mut self.outputs {
            if o.direct_on_input == Some(input) {
                o.output.push(chunk);
            }
        }
    }

    /// Hands the final mix to every output that is not bound to an input.
    pub fn post(&mut self, chunk: &MemChunk) {
        if self.state == SinkState::Suspended {
            return;
        }
        for o in &mut self.outputs {
            if o.direct_on_input.is_none() {
                o.output.push(chunk);
            }
        }
    }
}

/// Main-thread half of the monitor.
#[derive(Debug)]
pub struct Monitor {
    name: String,
    description: String,
    driver: Option<String>,
    pub(crate) sample_spec: SampleSpec,
    channel_map: ChannelMap,
    pub(crate) flags: SinkFlags,
    pub(crate) state: SinkState,
    pub(crate) suspend_cause: SuspendCause,
    outputs: BTreeMap<u32, Option<u32>>,
}

impl Monitor {
    pub(crate) fn new(
        name: String,
        description: String,
        driver: Option<String>,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        flags: SinkFlags,
        suspend_cause: SuspendCause,
    ) -> Self {
        Self {
            name,
            description,
            driver,
            sample_spec,
            channel_map,
            flags: flags & (SinkFlags::LATENCY | SinkFlags::DYNAMIC_LATENCY),
            state: SinkState::Init,
            suspend_cause,
            outputs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        Some(self.description.as_str()).filter(|d| !d.is_empty())
    }

    pub(crate) fn set_description(&mut self, description: &str) {
        self.description = description.to_string();
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
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

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Outputs that keep the sink from auto-suspending.
    pub fn check_suspend(&self) -> usize {
        if !self.state.is_linked() {
            return 0;
        }
        self.outputs.len()
    }
}

impl Core {
    pub(crate) fn monitor_put(&mut self, sink: u32) -> Result<()> {
        let s = self.get_sink_mut(sink)?;
        s.monitor.state = SinkState::Init;
        self.monitor_sync_suspend(sink)?;
        self.post(Facility::Source, EventKind::New, sink);
        Ok(())
    }

    pub(crate) fn monitor_unlink(&mut self, sink: u32) -> Result<()> {
        let s = self.get_sink_mut(sink)?;
        if !s.monitor.state.is_linked() {
            return Ok(());
        }

        s.monitor.state = SinkState::Unlinked;
        s.monitor.outputs.clear();
        if !s.thread.is_gone() {
            s.send(SinkMessage::SetMonitorState(SinkState::Unlinked))?;
        }
        debug!("Unlinked monitor {}", s.monitor.name);
        self.post(Facility::Source, EventKind::Remove, sink);
        Ok(())
    }

    /// Derives the monitor state from the sink state and the monitor's own
    /// suspend causes.
    pub(crate) fn monitor_sync_suspend(&mut self, sink: u32) -> Result<()> {
        let s = self.get_sink_mut(sink)?;
        if s.monitor.state == SinkState::Unlinked {
            return Ok(());
        }

        let state = if s.state == SinkState::Suspended || !s.monitor.suspend_cause.is_empty() {
            SinkState::Suspended
        } else if s.monitor.outputs.is_empty() {
            SinkState::Idle
        } else {
            SinkState::Running
        };

        if s.monitor.state == state {
            return Ok(());
        }

        debug!("Monitor {} state {} => {}", s.monitor.name, s.monitor.state, state);
        let was_linked = s.monitor.state.is_linked();
        s.monitor.state = state;
        s.send(SinkMessage::SetMonitorState(state))?;
        if was_linked {
            self.post(Facility::Source, EventKind::Change, sink);
        }
        Ok(())
    }

    /// Suspends or resumes only the monitor.
    pub fn monitor_suspend(&mut self, sink: u32, suspend: bool, cause: SuspendCause) -> Result<()> {
        debug_assert!(!cause.is_empty());
        let s = self.linked_sink(sink)?;
        if !s.monitor.state.is_linked() {
            return Err(SinkError::NotLinked);
        }

        let s = self.get_sink_mut(sink)?;
        if suspend {
            s.monitor.suspend_cause |= cause;
        } else {
            s.monitor.suspend_cause -= cause;
        }
        self.monitor_sync_suspend(sink)
    }

    /// Registers a consumer of the sink's monitor. With `direct_on_input`
    /// the output receives that input's audio before mixing instead of the
    /// mix.
    pub fn monitor_add_output(
        &mut self,
        sink: u32,
        output: Box<dyn MonitorOutput>,
        direct_on_input: Option<u32>,
    ) -> Result<u32> {
        let s = self.linked_sink(sink)?;
        if !s.monitor.state.is_linked() {
            return Err(SinkError::NotLinked);
        }
        if let Some(input) = direct_on_input {
            if !s.inputs.contains(&input) {
                return Err(SinkError::NoSuchInput(input));
            }
        }

        let id = self.next_output_id;
        self.next_output_id += 1;

        let s = self.get_sink_mut(sink)?;
        s.send(SinkMessage::AddMonitorOutput(Box::new(MonitorOutputEntry::new(
            id,
            output,
            direct_on_input,
        ))))?;
        s.monitor.outputs.insert(id, direct_on_input);
        info!("Added output {} to monitor {}", id, s.monitor.name);

        self.monitor_sync_suspend(sink)?;
        Ok(id)
    }

    pub fn monitor_remove_output(&mut self, sink: u32, id: u32) -> Result<()> {
        let s = self.get_sink_mut(sink)?;
        if s.monitor.outputs.remove(&id).is_none() {
            return Err(SinkError::NoEntity);
        }
        s.send(SinkMessage::RemoveMonitorOutput(id))?;
        self.monitor_sync_suspend(sink)
    }
}
