// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sink state machine: state changes, suspend causes, bulk moves, sample
//! rate switching and passthrough mode.

use super::{Sink, SinkFlags, SinkHooks, SinkState, SuspendCause};
use crate::engine::{Core, EventKind, Facility};
use crate::error::Result;
use crate::input::{InputFlags, InputState};
use crate::sample::RATE_MAX;
use crate::thread::SinkMessage;
use crate::volume::{ChannelVolume, Volume};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Hook run after a sink entered `Suspended` because of a suspend request.
pub trait SuspendPolicy: Send {
    fn after_suspend(&mut self, sink: &mut Sink, cause: SuspendCause);
}

/// Drops the `SWITCH` cause once the sink is suspended, so a rate switch
/// never keeps a sink asleep on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearSwitchCause;

impl SuspendPolicy for ClearSwitchCause {
    fn after_suspend(&mut self, sink: &mut Sink, _cause: SuspendCause) {
        if sink.suspend_cause.contains(SuspendCause::SWITCH) {
            debug!("Clearing SWITCH suspend cause of sink {}", sink.name);
            sink.suspend_cause -= SuspendCause::SWITCH;
        }
    }
}

impl Core {
    pub(crate) fn sink_set_state(&mut self, index: u32, state: SinkState) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        if s.state == state {
            return Ok(());
        }

        let original = s.state;
        let suspend_change = (original == SinkState::Suspended && state.is_opened())
            || (original.is_opened() && state == SinkState::Suspended);

        if s.hooks.contains(SinkHooks::SET_STATE) {
            s.backend.lock().set_state(state)?;
        }

        if let Err(e) = s.send(SinkMessage::SetState(state)) {
            if s.hooks.contains(SinkHooks::SET_STATE) {
                if let Err(e) = s.backend.lock().set_state(original) {
                    warn!("Failed to restore state {} of sink {}: {}", original, s.name, e);
                }
            }
            return Err(e);
        }

        debug!("Sink {}: state {} -> {}", s.name, original, state);
        s.state = state;

        // Unlinking posts its own removal event; the first transition out of
        // Init is announced by put.
        if state != SinkState::Unlinked && original != SinkState::Init {
            self.post(Facility::Sink, EventKind::Change, index);
        }

        if suspend_change {
            if state == SinkState::Suspended {
                let doomed: Vec<u32> = self
                    .get_sink(index)?
                    .inputs
                    .iter()
                    .copied()
                    .filter(|i| {
                        self.inputs
                            .get(i)
                            .is_some_and(|i| i.flags.contains(InputFlags::KILL_ON_SUSPEND))
                    })
                    .collect();
                for i in doomed {
                    self.input_kill(i)?;
                }
            }
            self.monitor_sync_suspend(index)?;
        }
        Ok(())
    }

    /// Moves an opened sink between `Idle` and `Running` according to how
    /// many inputs are playing. Suspended sinks are left alone.
    pub fn sink_update_status(&mut self, index: u32) -> Result<()> {
        if self.linked_sink(index)?.state == SinkState::Suspended {
            return Ok(());
        }
        let state = if self.sink_used_by(index)? > 0 {
            SinkState::Running
        } else {
            SinkState::Idle
        };
        self.sink_set_state(index, state)
    }

    /// Sets or clears `cause`. The sink is suspended while any cause is set.
    pub fn sink_suspend(&mut self, index: u32, suspend: bool, cause: SuspendCause) -> Result<()> {
        debug_assert!(!cause.is_empty());
        self.linked_sink(index)?;

        let s = self.get_sink_mut(index)?;
        if suspend {
            s.suspend_cause |= cause;
            s.monitor.suspend_cause |= cause;
        } else {
            s.suspend_cause -= cause;
            s.monitor.suspend_cause -= cause;
        }

        if !s.suspend_cause.contains(SuspendCause::SESSION) && s.take_mixer_dirty() {
            debug!("Mixer of sink {} is accessible again, restoring settings", s.name);
            self.restore_mixer(index)?;
        }

        let s = self.get_sink(index)?;
        if (s.state == SinkState::Suspended) == !s.suspend_cause.is_empty() {
            return Ok(());
        }
        debug!("Suspend cause of sink {} is {:?}", s.name, s.suspend_cause);

        if !s.suspend_cause.is_empty() {
            self.sink_set_state(index, SinkState::Suspended)?;
            if let (Some(policy), Some(s)) = (self.suspend_policy.as_mut(), self.sinks.get_mut(&index)) {
                policy.after_suspend(s, cause);
            }
            Ok(())
        } else {
            let state = if self.sink_used_by(index)? > 0 {
                SinkState::Running
            } else {
                SinkState::Idle
            };
            self.sink_set_state(index, state)
        }
    }

    /// Pushes the main-thread port, mute and volume back to the hardware.
    fn restore_mixer(&mut self, index: u32) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        let deferred = s.flags.contains(SinkFlags::DEFERRED_VOLUME);

        if let Some(port) = s.active_port().cloned() {
            if s.hooks.contains(SinkHooks::SET_PORT) {
                if deferred {
                    return s.send(SinkMessage::SetPort(port))?.into_status();
                }
                return s.backend.lock().set_port(&port);
            }
        }

        if deferred {
            let muted = s.muted;
            s.send(SinkMessage::SetMute(muted))?;
            let sync = self.volume_snapshot(index)?;
            self.get_sink_mut(index)?
                .send(SinkMessage::SetVolumeSynced(sync))?;
            return Ok(());
        }

        if s.hooks.contains(SinkHooks::SET_MUTE) {
            let muted = s.muted;
            s.backend.lock().set_mute(muted);
        }
        if s.hooks.contains(SinkHooks::SET_VOLUME) {
            let mut req = s.volume_request();
            s.backend.lock().set_volume(&mut req);
            s.apply_volume_request(req);
        }
        Ok(())
    }

    /// Applies `sink_suspend` to every linked sink. Returns the last error.
    pub fn sink_suspend_all(&mut self, suspend: bool, cause: SuspendCause) -> Result<()> {
        let linked: Vec<u32> = self
            .sinks
            .values()
            .filter(|s| s.state.is_linked())
            .map(|s| s.index)
            .collect();

        let mut result = Ok(());
        for index in linked {
            if let Err(e) = self.sink_suspend(index, suspend, cause) {
                warn!("Failed to change suspend state of sink {}: {}", index, e);
                result = Err(e);
            }
        }
        result
    }

    /// Inputs that are not corked. Monitor outputs do not count.
    pub fn sink_used_by(&self, index: u32) -> Result<u32> {
        let s = self.get_sink(index)?;
        let n = s.inputs.len() as u32;
        debug_assert!(n >= s.n_corked);
        Ok(n.saturating_sub(s.n_corked))
    }

    /// Inputs plus monitor outputs.
    pub fn sink_linked_by(&self, index: u32) -> Result<u32> {
        let s = self.get_sink(index)?;
        Ok(s.inputs.len() as u32 + s.monitor.n_outputs() as u32)
    }

    /// Streams that keep the sink from being suspended for idleness.
    pub fn sink_check_suspend(&self, index: u32) -> Result<u32> {
        let s = self.get_sink(index)?;
        if !s.state.is_linked() {
            return Ok(0);
        }

        let busy = s
            .inputs
            .iter()
            .filter_map(|i| self.inputs.get(i))
            .filter(|i| i.state.is_linked())
            .filter(|i| i.state != InputState::Corked)
            .filter(|i| !i.flags.contains(InputFlags::DONT_INHIBIT_AUTO_SUSPEND))
            .count();
        Ok((busy + s.monitor.check_suspend()) as u32)
    }

    /// Starts moving every movable input away from the sink. Inputs that
    /// refuse stay where they are.
    pub fn sink_move_all_start(&mut self, index: u32) -> Result<VecDeque<u32>> {
        let inputs: Vec<u32> = self.get_sink(index)?.inputs.iter().copied().collect();
        let mut queue = VecDeque::with_capacity(inputs.len());
        for i in inputs {
            match self.input_start_move(i) {
                Ok(()) => queue.push_back(i),
                Err(e) => debug!("Input {} stays on sink {}: {}", i, index, e),
            }
        }
        Ok(queue)
    }

    /// Lands the inputs from [`sink_move_all_start`](Self::sink_move_all_start)
    /// on `dest`. Inputs that cannot move there are killed.
    pub fn sink_move_all_finish(
        &mut self,
        dest: u32,
        mut queue: VecDeque<u32>,
        save: bool,
    ) -> Result<()> {
        while let Some(i) = queue.pop_front() {
            if let Err(e) = self.input_finish_move(i, dest, save) {
                debug!("Input {} cannot move to sink {}: {}", i, dest, e);
                self.input_fail_move(i)?;
            }
        }
        Ok(())
    }

    pub fn sink_move_all_fail(&mut self, mut queue: VecDeque<u32>) -> Result<()> {
        while let Some(i) = queue.pop_front() {
            self.input_fail_move(i)?;
        }
        Ok(())
    }

    /// Tries to switch the sink to a rate suiting a stream at `rate`.
    ///
    /// Regular streams choose between the default and alternate rate,
    /// passthrough streams get their own rate. Returns `Ok(false)` when the
    /// switch is refused or not needed.
    pub fn sink_update_rate(&mut self, index: u32, rate: u32, passthrough: bool) -> Result<bool> {
        let s = self.linked_sink(index)?;
        if !s.hooks.contains(SinkHooks::UPDATE_RATE) {
            return Ok(false);
        }

        let default_rate = s.default_sample_rate;
        let alternate_rate = s.alternate_sample_rate;

        if alternate_rate == 0 || default_rate == alternate_rate {
            debug!("Sink {} has no alternate sample rate", s.name);
            return Ok(false);
        }
        if s.state.is_running() {
            info!("Cannot update rate, sink is running, will keep using {} Hz", s.sample_spec.rate);
            return Ok(false);
        }
        if s.monitor.state.is_running() {
            info!("Cannot update rate, monitor source is running");
            return Ok(false);
        }
        if !(8000..=RATE_MAX).contains(&rate) {
            return Ok(false);
        }

        let desired_rate = if passthrough {
            rate
        } else {
            let use_alternate = if default_rate % 4000 != 0 {
                alternate_rate % 4000 == 0 && rate % 4000 == 0
            } else {
                alternate_rate % 11025 == 0 && rate % 11025 == 0
            };
            if use_alternate {
                alternate_rate
            } else {
                default_rate
            }
        };

        if desired_rate == s.sample_spec.rate {
            return Ok(false);
        }
        if !passthrough && self.sink_used_by(index)? > 0 {
            return Ok(false);
        }

        debug!("Suspending sink {} to change the sample rate", s.name);
        self.sink_suspend(index, true, SuspendCause::IDLE)?;

        let s = self.get_sink_mut(index)?;
        let switched = s.backend.lock().update_rate(desired_rate);
        if switched {
            s.sample_spec.rate = desired_rate;
            s.send(SinkMessage::UpdateRate(desired_rate))?;
            if !passthrough {
                s.monitor.sample_spec.rate = desired_rate;
            }
            info!("Changed sample rate of sink {} to {} Hz", s.name, desired_rate);
            self.post(Facility::Sink, EventKind::Change, index);
        }

        self.sink_suspend(index, false, SuspendCause::IDLE)?;
        Ok(switched)
    }

    /// True while the sink plays exactly one input and that input is
    /// passthrough.
    pub fn sink_is_passthrough(&self, index: u32) -> bool {
        let Some(s) = self.sinks.get(&index) else {
            return false;
        };
        if s.inputs.len() != 1 {
            return false;
        }
        s.inputs
            .iter()
            .next()
            .and_then(|i| self.inputs.get(i))
            .is_some_and(|i| i.is_passthrough())
    }

    /// Silences the monitor and pins the volume to unity, remembering the
    /// previous volume for [`sink_leave_passthrough`](Self::sink_leave_passthrough).
    pub fn sink_enter_passthrough(&mut self, index: u32) -> Result<()> {
        debug!("Sink {} enters passthrough mode, suspending its monitor", index);
        self.monitor_suspend(index, true, SuspendCause::PASSTHROUGH)?;

        let saved = self.sink_get_volume(index, true)?;
        let s = self.get_sink_mut(index)?;
        s.saved_volume = Some(saved);
        s.saved_save_volume = s.save_volume;
        let unity = ChannelVolume::new(s.sample_spec.channels, s.base_volume.min(Volume::NORM));

        self.set_volume_inner(index, Some(&unity), true, false)?;
        Ok(())
    }

    pub fn sink_leave_passthrough(&mut self, index: u32) -> Result<()> {
        debug!("Sink {} leaves passthrough mode, resuming its monitor", index);
        self.monitor_suspend(index, false, SuspendCause::PASSTHROUGH)?;

        let s = self.get_sink_mut(index)?;
        let saved = s.saved_volume.take();
        let save = std::mem::take(&mut s.saved_save_volume);
        if let Some(volume) = saved {
            self.set_volume_inner(index, Some(&volume), true, save)?;
        }
        Ok(())
    }
}

impl Sink {
    /// Clears the mixer-dirty flag, returning whether it was set.
    fn take_mixer_dirty(&self) -> bool {
        self.mixer_dirty
            .swap(false, std::sync::atomic::Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::input::InputNewData;
    use crate::sink::SinkNewData;
    use crate::testutil::{
        new_input, ChunkStream, CollectingOutput, RecordingBackend, SuspendRecorder,
    };
    use std::sync::atomic::Ordering;

    fn put_sink(core: &mut Core, data: SinkNewData) -> u32 {
        let idx = core.sink_new(data).unwrap();
        core.sink_put(idx).unwrap();
        idx
    }

    fn play(core: &mut Core, sink: u32, name: &str) -> u32 {
        let idx = new_input(core, sink, name);
        core.input_put(idx).unwrap();
        idx
    }

    fn input_with_flags(core: &mut Core, sink: u32, flags: InputFlags) -> u32 {
        let mut data = InputNewData::new(sink, ChunkStream::silence_bytes(0));
        data.flags = flags;
        let idx = core.input_new(data).unwrap();
        core.input_put(idx).unwrap();
        idx
    }

    fn rate_sink(core: &mut Core, accept: bool) -> (u32, RecordingBackend) {
        let backend = RecordingBackend::new(SinkHooks::UPDATE_RATE);
        backend.log().lock().accept_rate = accept;
        let idx = put_sink(core, SinkNewData::new("out").with_backend(backend.clone()));
        (idx, backend)
    }

    #[test]
    fn test_suspend_causes_stack() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));

        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        let s = core.sink(idx).unwrap();
        assert_eq!(s.state(), SinkState::Suspended);
        assert_eq!(s.monitor().state(), SinkState::Suspended);

        core.sink_suspend(idx, true, SuspendCause::APPLICATION).unwrap();
        core.sink_suspend(idx, false, SuspendCause::USER).unwrap();
        let s = core.sink(idx).unwrap();
        assert_eq!(s.state(), SinkState::Suspended);
        assert_eq!(s.suspend_cause(), SuspendCause::APPLICATION);

        core.sink_suspend(idx, false, SuspendCause::APPLICATION).unwrap();
        let s = core.sink(idx).unwrap();
        assert_eq!(s.state(), SinkState::Idle);
        assert!(s.suspend_cause().is_empty());
        assert_eq!(s.monitor().state(), SinkState::Idle);
    }

    #[test]
    fn test_resume_picks_running_when_used() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));
        play(&mut core, idx, "music");
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Running);

        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Suspended);

        core.sink_suspend(idx, false, SuspendCause::USER).unwrap();
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Running);
    }

    #[test]
    fn test_surviving_input_sees_suspend_and_resume() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));
        let (stream, seen) = SuspendRecorder::new();
        let input = core.input_new(InputNewData::new(idx, stream)).unwrap();
        core.input_put(input).unwrap();

        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        assert_eq!(*seen.lock(), vec![true]);
        assert!(core.input(input).is_some());

        core.sink_suspend(idx, false, SuspendCause::USER).unwrap();
        assert_eq!(*seen.lock(), vec![true, false]);
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Running);
    }

    #[test]
    fn test_suspend_kills_flagged_inputs() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));
        let doomed = input_with_flags(&mut core, idx, InputFlags::KILL_ON_SUSPEND);
        let kept = input_with_flags(&mut core, idx, InputFlags::empty());

        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        assert!(core.input(doomed).is_none());
        assert!(core.input(kept).is_some());
        assert_eq!(core.sink(idx).unwrap().inputs().collect::<Vec<_>>(), vec![kept]);
    }

    #[test]
    fn test_state_hook_failure_keeps_state() {
        let mut core = Core::new(CoreConfig::default());
        let backend = RecordingBackend::new(SinkHooks::SET_STATE);
        let log = backend.log();
        let idx = put_sink(&mut core, SinkNewData::new("out").with_backend(backend));
        assert_eq!(log.lock().states, vec![SinkState::Idle]);

        log.lock().fail_state = true;
        assert!(core.sink_suspend(idx, true, SuspendCause::USER).is_err());
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Idle);

        log.lock().fail_state = false;
        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Suspended);
        assert_eq!(log.lock().states, vec![SinkState::Idle, SinkState::Suspended]);
    }

    #[test]
    fn test_change_events() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));
        core.take_events();

        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        let events = core.take_events();
        assert!(events.contains(&crate::engine::SubscriptionEvent {
            facility: Facility::Sink,
            kind: EventKind::Change,
            index: idx,
        }));

        // Already suspended: nothing to announce.
        core.sink_suspend(idx, true, SuspendCause::APPLICATION).unwrap();
        assert!(core.events().is_empty());
    }

    #[test]
    fn test_suspend_all() {
        let mut core = Core::new(CoreConfig::default());
        let a = put_sink(&mut core, SinkNewData::new("a"));
        let b = put_sink(&mut core, SinkNewData::new("b"));
        let unput = core.sink_new(SinkNewData::new("c")).unwrap();

        core.sink_suspend_all(true, SuspendCause::SESSION).unwrap();
        assert_eq!(core.sink(a).unwrap().state(), SinkState::Suspended);
        assert_eq!(core.sink(b).unwrap().state(), SinkState::Suspended);
        assert_eq!(core.sink(unput).unwrap().state(), SinkState::Init);

        core.sink_suspend_all(false, SuspendCause::SESSION).unwrap();
        assert_eq!(core.sink(a).unwrap().state(), SinkState::Idle);
    }

    #[test]
    fn test_clear_switch_cause_policy() {
        let mut core = Core::new(CoreConfig::default());
        core.set_suspend_policy(Some(Box::new(ClearSwitchCause)));
        let idx = put_sink(&mut core, SinkNewData::new("out"));

        core.sink_suspend(idx, true, SuspendCause::SWITCH | SuspendCause::USER)
            .unwrap();
        let s = core.sink(idx).unwrap();
        assert_eq!(s.state(), SinkState::Suspended);
        assert_eq!(s.suspend_cause(), SuspendCause::USER);
    }

    #[test]
    fn test_mixer_restored_when_session_returns() {
        let mut core = Core::new(CoreConfig::default());
        let backend = RecordingBackend::hardware();
        let log = backend.log();
        let idx = put_sink(&mut core, SinkNewData::new("out").with_backend(backend));

        core.sink_suspend(idx, true, SuspendCause::SESSION).unwrap();
        core.sink(idx)
            .unwrap()
            .mixer_dirty_handle()
            .store(true, Ordering::Release);
        let mutes_before = log.lock().mutes.len();
        let volumes_before = log.lock().set_volume_calls.len();

        core.sink_suspend(idx, false, SuspendCause::SESSION).unwrap();
        assert_eq!(log.lock().mutes.len(), mutes_before + 1);
        assert_eq!(log.lock().set_volume_calls.len(), volumes_before + 1);
        assert!(!core
            .sink(idx)
            .unwrap()
            .mixer_dirty_handle()
            .load(Ordering::Acquire));
    }

    #[test]
    fn test_counters() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));
        let playing = play(&mut core, idx, "a");
        input_with_flags(&mut core, idx, InputFlags::DONT_INHIBIT_AUTO_SUSPEND);
        core.input_cork(playing, true).unwrap();

        assert_eq!(core.sink_used_by(idx).unwrap(), 1);
        assert_eq!(core.sink_linked_by(idx).unwrap(), 2);
        assert_eq!(core.sink_check_suspend(idx).unwrap(), 0);

        let (out, _chunks) = CollectingOutput::new();
        core.monitor_add_output(idx, Box::new(out), None).unwrap();
        assert_eq!(core.sink_linked_by(idx).unwrap(), 3);
        assert_eq!(core.sink_check_suspend(idx).unwrap(), 1);

        core.input_cork(playing, false).unwrap();
        assert_eq!(core.sink_check_suspend(idx).unwrap(), 2);
    }

    #[test]
    fn test_move_all() {
        let mut core = Core::new(CoreConfig::default());
        let from = put_sink(&mut core, SinkNewData::new("from"));
        let to = put_sink(&mut core, SinkNewData::new("to"));
        let a = play(&mut core, from, "a");
        let b = play(&mut core, from, "b");
        let pinned = input_with_flags(&mut core, from, InputFlags::DONT_MOVE);

        let queue = core.sink_move_all_start(from).unwrap();
        assert_eq!(queue, VecDeque::from(vec![a, b]));
        assert_eq!(core.sink(from).unwrap().inputs().collect::<Vec<_>>(), vec![pinned]);

        core.sink_move_all_finish(to, queue, true).unwrap();
        assert_eq!(core.sink(to).unwrap().inputs().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(core.input(a).unwrap().sink(), Some(to));
        assert!(core.input(a).unwrap().save_sink());
        assert_eq!(core.sink(to).unwrap().state(), SinkState::Running);
    }

    #[test]
    fn test_move_all_fail_kills() {
        let mut core = Core::new(CoreConfig::default());
        let from = put_sink(&mut core, SinkNewData::new("from"));
        let a = play(&mut core, from, "a");

        let queue = core.sink_move_all_start(from).unwrap();
        core.sink_move_all_fail(queue).unwrap();
        assert!(core.input(a).is_none());
        assert_eq!(core.sink(from).unwrap().state(), SinkState::Idle);
    }

    #[test]
    fn test_update_rate_picks_alternate_family() {
        let mut core = Core::new(CoreConfig::default());
        let (idx, backend) = rate_sink(&mut core, true);
        let log = backend.log();
        assert_eq!(core.sink(idx).unwrap().sample_spec().rate, 44_100);

        // 32 kHz belongs to the 48 kHz family.
        assert!(core.sink_update_rate(idx, 32_000, false).unwrap());
        let s = core.sink(idx).unwrap();
        assert_eq!(s.sample_spec().rate, 48_000);
        assert_eq!(s.monitor().sample_spec().rate, 48_000);
        assert_eq!(s.state(), SinkState::Idle);
        assert!(s.suspend_cause().is_empty());

        assert!(!core.sink_update_rate(idx, 96_000, false).unwrap());

        assert!(core.sink_update_rate(idx, 22_050, false).unwrap());
        assert_eq!(core.sink(idx).unwrap().sample_spec().rate, 44_100);
        assert_eq!(log.lock().rates, vec![48_000, 44_100]);
    }

    #[test]
    fn test_update_rate_refusals() {
        let mut core = Core::new(CoreConfig::default());

        let plain = put_sink(&mut core, SinkNewData::new("plain"));
        assert!(!core.sink_update_rate(plain, 48_000, false).unwrap());

        let (idx, backend) = rate_sink(&mut core, true);
        assert!(!core.sink_update_rate(idx, 4_000, true).unwrap());
        assert!(!core.sink_update_rate(idx, RATE_MAX + 1, true).unwrap());

        play(&mut core, idx, "busy");
        assert_eq!(core.sink(idx).unwrap().state(), SinkState::Running);
        assert!(!core.sink_update_rate(idx, 48_000, false).unwrap());
        assert!(backend.log().lock().rates.is_empty());

        let mut data = SinkNewData::new("same").with_backend(RecordingBackend::new(SinkHooks::UPDATE_RATE));
        data.alternate_sample_rate = Some(44_100);
        let same = put_sink(&mut core, data);
        assert!(!core.sink_update_rate(same, 48_000, false).unwrap());
    }

    #[test]
    fn test_update_rate_backend_refuses() {
        let mut core = Core::new(CoreConfig::default());
        let (idx, backend) = rate_sink(&mut core, false);

        assert!(!core.sink_update_rate(idx, 48_000, false).unwrap());
        let s = core.sink(idx).unwrap();
        assert_eq!(s.sample_spec().rate, 44_100);
        assert_eq!(s.state(), SinkState::Idle);
        assert_eq!(backend.log().lock().rates, vec![48_000]);
    }

    #[test]
    fn test_passthrough_rate_is_taken_verbatim() {
        let mut core = Core::new(CoreConfig::default());
        let (idx, _backend) = rate_sink(&mut core, true);
        assert!(core.sink_update_rate(idx, 32_000, true).unwrap());
        let s = core.sink(idx).unwrap();
        assert_eq!(s.sample_spec().rate, 32_000);
        assert_eq!(s.monitor().sample_spec().rate, 44_100);
    }
}
