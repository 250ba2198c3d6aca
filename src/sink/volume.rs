// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sink volume model.
//!
//! Every sink carries three volumes. The *reference* volume is what the user
//! set. The *real* volume is the overall gain applied to the device, and the
//! *soft* volume is the part of it the IO thread applies in software. With
//! flat volumes the real volume follows the loudest input and every input
//! keeps two ratios: `reference_ratio = volume / reference` and
//! `real_ratio = volume / real`.
//!
//! Filter sinks with `SHARE_VOLUME_WITH_MASTER` have no volume of their own.
//! They mirror the root of their chain, so every operation here first walks
//! up to the root and then recurses down through the proxy inputs.

use super::{SinkFlags, SinkHooks};
use crate::engine::{Core, EventKind, Facility};
use crate::error::{Result, SinkError};
use crate::sample::ChannelMap;
use crate::thread::SinkMessage;
use crate::volume::{ChannelVolume, Volume};
use tracing::{debug, warn};

impl Core {
    /// Root of the volume sharing chain `index` belongs to. `None` when a
    /// sharing sink has no master edge.
    pub fn sink_get_master(&self, index: u32) -> Option<u32> {
        let mut cursor = index;
        loop {
            let s = self.sinks.get(&cursor)?;
            if !s.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER) {
                return Some(cursor);
            }
            let proxy = s.input_to_master?;
            cursor = self.inputs.get(&proxy)?.sink?;
        }
    }

    pub fn sink_flat_volume_enabled(&self, index: u32) -> bool {
        self.sink_get_master(index)
            .and_then(|m| self.sinks.get(&m))
            .is_some_and(|s| s.flags.contains(SinkFlags::FLAT_VOLUME))
    }

    /// True if the sink is a filter feeding another sink.
    pub fn sink_is_filter(&self, index: u32) -> bool {
        self.sinks
            .get(&index)
            .is_some_and(|s| s.input_to_master.is_some())
    }

    /// Linked origin sink of a volume sharing proxy input.
    fn linked_proxy_origin(&self, input: u32) -> Option<u32> {
        self.shared_origin(input)
            .filter(|o| self.sinks.get(o).is_some_and(|s| s.state.is_linked()))
    }

    fn input_list(&self, sink: u32) -> Vec<u32> {
        self.sinks
            .get(&sink)
            .map(|s| s.inputs.iter().copied().collect())
            .unwrap_or_default()
    }

    fn set_input_volume_direct(&mut self, input: u32, volume: ChannelVolume) -> Result<()> {
        let i = self.get_input_mut(input)?;
        if i.volume == volume {
            return Ok(());
        }
        i.volume = volume;
        self.post(Facility::SinkInput, EventKind::Change, input);
        Ok(())
    }

    fn compute_reference_ratio(&mut self, input: u32) -> Result<()> {
        let i = self.get_input(input)?;
        let sink = i.sink.ok_or(SinkError::NotLinked)?;
        let s = self.get_sink(sink)?;
        let remapped = s.reference_volume.remap(&s.channel_map, &i.channel_map);

        let mut ratio = i.reference_ratio;
        for c in 0..i.sample_spec.channels as usize {
            if remapped.get(c).is_muted() {
                continue;
            }
            // Keep the old ratio if it still yields the same volume.
            if ratio.get(c).multiply(remapped.get(c)) == i.volume.get(c) {
                continue;
            }
            ratio.set(c, i.volume.get(c).divide(remapped.get(c)));
        }

        self.get_input_mut(input)?.reference_ratio = ratio;
        Ok(())
    }

    fn compute_reference_ratios(&mut self, sink: u32) -> Result<()> {
        for input in self.input_list(sink) {
            self.compute_reference_ratio(input)?;
            if let Some(origin) = self.linked_proxy_origin(input) {
                self.compute_reference_ratios(origin)?;
            }
        }
        Ok(())
    }

    fn compute_real_ratios(&mut self, sink: u32) -> Result<()> {
        let (real, sink_map) = {
            let s = self.get_sink(sink)?;
            (s.real_volume, s.channel_map.clone())
        };

        for input in self.input_list(sink) {
            if let Some(origin) = self.linked_proxy_origin(input) {
                let i = self.get_input_mut(input)?;
                i.real_ratio = ChannelVolume::norm(i.real_ratio.channels());
                i.soft_volume = i.volume_factor;
                self.compute_real_ratios(origin)?;
                continue;
            }

            let i = self.get_input_mut(input)?;
            let remapped = real.remap(&sink_map, &i.channel_map);
            for c in 0..i.sample_spec.channels as usize {
                if remapped.get(c).is_muted() {
                    i.soft_volume.set(c, Volume::MUTED);
                    continue;
                }
                if i.real_ratio.get(c).multiply(remapped.get(c)) != i.volume.get(c) {
                    let ratio = i.volume.get(c).divide(remapped.get(c));
                    i.real_ratio.set(c, ratio);
                }
                let soft = i.real_ratio.get(c).multiply(i.volume_factor.get(c));
                i.soft_volume.set(c, soft);
            }
        }
        Ok(())
    }

    fn get_maximum_input_volume(
        &self,
        sink: u32,
        max: &mut ChannelVolume,
        map: &ChannelMap,
    ) -> Result<()> {
        for input in self.input_list(sink) {
            if let Some(origin) = self.linked_proxy_origin(input) {
                self.get_maximum_input_volume(origin, max, map)?;
                continue;
            }
            let i = self.get_input(input)?;
            let remapped = i.volume.remap_minimal_impact(max, &i.channel_map, map);
            *max = max.merge(&remapped);
        }
        Ok(())
    }

    /// True if any input, looking through filter sinks, is a real stream.
    fn has_inputs(&self, sink: u32) -> bool {
        self.input_list(sink)
            .into_iter()
            .any(|input| match self.linked_proxy_origin(input) {
                Some(origin) => self.has_inputs(origin),
                None => true,
            })
    }

    fn update_real_volume(
        &mut self,
        sink: u32,
        volume: &ChannelVolume,
        map: &ChannelMap,
    ) -> Result<()> {
        let flat = self.sink_flat_volume_enabled(sink);
        let s = self.get_sink_mut(sink)?;
        s.real_volume = volume.remap(map, &s.channel_map);
        let (real, sink_map) = (s.real_volume, s.channel_map.clone());

        for input in self.input_list(sink) {
            let Some(origin) = self.linked_proxy_origin(input) else {
                continue;
            };
            if flat {
                let i = self.get_input(input)?;
                let new_volume = real.remap(&sink_map, &i.channel_map);
                if new_volume != i.volume {
                    self.set_input_volume_direct(input, new_volume)?;
                    self.compute_reference_ratio(input)?;
                }
            }
            self.update_real_volume(origin, volume, map)?;
        }
        Ok(())
    }

    fn compute_real_volume(&mut self, sink: u32) -> Result<()> {
        let (reference, map) = {
            let s = self.get_sink(sink)?;
            (s.reference_volume, s.channel_map.clone())
        };

        if !self.has_inputs(sink) {
            // Nothing to follow; fall back to the reference volume.
            return self.update_real_volume(sink, &reference, &map);
        }

        let mut real = ChannelVolume::muted(map.channels());
        self.get_maximum_input_volume(sink, &mut real, &map)?;
        self.update_real_volume(sink, &real, &map)?;
        self.compute_real_ratios(sink)
    }

    fn propagate_reference_volume(&mut self, sink: u32) -> Result<()> {
        let (reference, sink_map) = {
            let s = self.get_sink(sink)?;
            (s.reference_volume, s.channel_map.clone())
        };

        for input in self.input_list(sink) {
            if let Some(origin) = self.linked_proxy_origin(input) {
                self.propagate_reference_volume(origin)?;
                continue;
            }
            let i = self.get_input(input)?;
            let new_volume = reference
                .remap(&sink_map, &i.channel_map)
                .multiply(&i.reference_ratio);
            self.set_input_volume_direct(input, new_volume)?;
        }
        Ok(())
    }

    /// Returns true if the reference volume changed, or if `sink` shares its
    /// volume and the change still has to reach the filters below it.
    fn update_reference_volume(
        &mut self,
        sink: u32,
        volume: &ChannelVolume,
        map: &ChannelMap,
        save: bool,
    ) -> Result<bool> {
        let s = self.get_sink_mut(sink)?;
        let remapped = volume.remap(map, &s.channel_map);
        let changed = remapped != s.reference_volume;
        s.reference_volume = remapped;
        s.save_volume = (!changed && s.save_volume) || save;
        let share = s.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER);

        if changed {
            debug!("Sink {} reference volume now {}", s.name, remapped);
            self.post(Facility::Sink, EventKind::Change, sink);
        } else if !share {
            return Ok(false);
        }

        for input in self.input_list(sink) {
            if let Some(origin) = self.shared_origin(input) {
                self.update_reference_volume(origin, volume, map, false)?;
            }
        }
        Ok(true)
    }

    /// Sets the volume of a sink, or with `None` recomputes it from the
    /// inputs. Returns false if the sink is playing a passthrough stream and
    /// the change was not a reset to unity.
    pub(crate) fn set_volume_inner(
        &mut self,
        index: u32,
        volume: Option<&ChannelVolume>,
        send_msg: bool,
        save: bool,
    ) -> Result<bool> {
        let s = self.linked_sink(index)?;
        if let Some(v) = volume {
            if !v.is_valid() {
                return Err(SinkError::InvalidVolume);
            }
            if v.channels() != 1 && !v.is_compatible(&s.sample_spec) {
                return Err(SinkError::IncompatibleVolume);
            }
        }
        debug_assert!(volume.is_some() || self.sink_flat_volume_enabled(index));

        if self.sink_is_passthrough(index) && !volume.is_some_and(|v| v.is_norm()) {
            warn!("Cannot change volume, sink {} is connected to a passthrough input", index);
            return Ok(false);
        }

        let Some(root) = self.sink_get_master(index) else {
            return Ok(true);
        };
        let root_map = self.get_sink(root)?.channel_map.clone();

        match volume {
            Some(v) => {
                let s = self.get_sink(index)?;
                let new_volume = if v.is_compatible(&s.sample_spec) {
                    *v
                } else {
                    s.reference_volume.scale(v.max())
                };
                let new_volume = new_volume.remap(&s.channel_map, &root_map);

                if self.update_reference_volume(root, &new_volume, &root_map, save)? {
                    if self.sink_flat_volume_enabled(root) {
                        self.propagate_reference_volume(root)?;
                        self.compute_real_volume(root)?;
                    } else {
                        let reference = self.get_sink(root)?.reference_volume;
                        self.update_real_volume(root, &reference, &root_map)?;
                    }
                }
            }
            None => {
                self.compute_real_volume(root)?;

                // Push the reference volume up if the loudest input is now
                // above it.
                let s = self.get_sink(index)?;
                let root_real = self
                    .get_sink(root)?
                    .real_volume
                    .remap(&root_map, &s.channel_map);
                let new_reference = s
                    .reference_volume
                    .merge(&root_real)
                    .remap(&s.channel_map, &root_map);

                self.update_reference_volume(root, &new_reference, &root_map, save)?;
                self.compute_reference_ratios(root)?;
            }
        }

        let r = self.get_sink_mut(root)?;
        if r.hooks.contains(SinkHooks::SET_VOLUME) {
            r.soft_volume = ChannelVolume::norm(r.sample_spec.channels);
            if !r.flags.contains(SinkFlags::DEFERRED_VOLUME) {
                let mut req = r.volume_request();
                r.backend.lock().set_volume(&mut req);
                r.apply_volume_request(req);
            }
        } else {
            r.soft_volume = r.real_volume;
        }

        if send_msg {
            self.sync_shared_volume(root)?;
        }
        Ok(true)
    }

    /// Sets the reference volume of a sink. `None` recomputes the volume from
    /// the inputs and is only valid with flat volumes. A mono volume is
    /// spread over the current channel balance.
    pub fn sink_set_volume(
        &mut self,
        index: u32,
        volume: Option<&ChannelVolume>,
        send_msg: bool,
        save: bool,
    ) -> Result<()> {
        self.linked_sink(index)?;
        if volume.is_none() && !self.sink_flat_volume_enabled(index) {
            return Err(SinkError::Refused(
                "volume can only be recomputed with flat volumes".into(),
            ));
        }
        if self.set_volume_inner(index, volume, send_msg, save)? {
            Ok(())
        } else {
            Err(SinkError::Refused("sink is in passthrough mode".into()))
        }
    }

    /// Sends the volumes of every sink in the sharing tree of `index` to
    /// their IO threads, root first.
    pub(crate) fn sync_shared_volume(&mut self, index: u32) -> Result<()> {
        let Some(root) = self.sink_get_master(index) else {
            return Ok(());
        };
        self.sync_volume_tree(root)
    }

    fn sync_volume_tree(&mut self, sink: u32) -> Result<()> {
        let snapshot = self.volume_snapshot(sink)?;
        let s = self.get_sink_mut(sink)?;
        if !s.thread.is_gone() {
            // A deferred backend may move part of the volume into software.
            let reply = s.send(SinkMessage::SetVolumeSynced(snapshot))?;
            if let Some((real, soft)) = reply.into_hw_volume() {
                s.real_volume = real;
                s.soft_volume = soft;
            }
        }

        for input in self.input_list(sink) {
            if let Some(origin) = self.linked_proxy_origin(input) {
                self.sync_volume_tree(origin)?;
            }
        }
        Ok(())
    }

    /// Overrides the software part of the sink volume. `None` resets it to
    /// unity. Meant for backends that split the volume themselves.
    pub fn sink_set_soft_volume(
        &mut self,
        index: u32,
        volume: Option<&ChannelVolume>,
    ) -> Result<()> {
        let s = self.get_sink(index)?;
        let volume = match volume {
            Some(v) if !v.is_compatible(&s.sample_spec) => {
                return Err(SinkError::IncompatibleVolume);
            }
            Some(v) => *v,
            None => ChannelVolume::norm(s.sample_spec.channels),
        };
        let linked = s.state.is_linked();

        self.get_sink_mut(index)?.soft_volume = volume;
        if linked {
            let snapshot = self.volume_snapshot(index)?;
            self.get_sink_mut(index)?.send(SinkMessage::SetVolume(snapshot))?;
        } else if let Some(t) = self.get_sink_mut(index)?.local_thread() {
            t.soft_volume = volume;
        }
        Ok(())
    }

    /// Reference volume of the sink, re-reading the hardware first when the
    /// sink asks for it or `force_refresh` is set.
    pub fn sink_get_volume(&mut self, index: u32, force_refresh: bool) -> Result<ChannelVolume> {
        let s = self.linked_sink(index)?;
        let refresh = (s.refresh_volume || force_refresh)
            && !s.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER);

        if refresh {
            let s = self.get_sink_mut(index)?;
            let old_real = s.real_volume;

            if !s.flags.contains(SinkFlags::DEFERRED_VOLUME)
                && s.hooks.contains(SinkHooks::GET_VOLUME)
            {
                let mut req = s.volume_request();
                s.backend.lock().get_volume(&mut req);
                s.apply_volume_request(req);
            }

            let reply = s.send(SinkMessage::GetVolume {
                real_volume: s.real_volume,
                soft_volume: s.soft_volume,
            })?;
            if let Some((real, soft)) = reply.into_hw_volume() {
                s.real_volume = real;
                s.soft_volume = soft;
            }

            let (real, map) = (s.real_volume, s.channel_map.clone());
            self.update_real_volume(index, &real, &map)?;
            self.propagate_real_volume(index, &old_real)?;
        }

        Ok(self.get_sink(index)?.reference_volume)
    }

    /// Makes a real volume change that happened outside of our control the
    /// new baseline, keeping the balance between the inputs.
    fn propagate_real_volume(&mut self, sink: u32, old_real: &ChannelVolume) -> Result<bool> {
        let share = self
            .get_sink(sink)?
            .flags
            .contains(SinkFlags::SHARE_VOLUME_WITH_MASTER);

        if !share {
            let s = self.get_sink(sink)?;
            if *old_real == s.real_volume {
                return Ok(false);
            }
            let (real, map) = (s.real_volume, s.channel_map.clone());
            self.update_reference_volume(sink, &real, &map, true)?;
        }

        if self.sink_flat_volume_enabled(sink) {
            let (reference, sink_map) = {
                let s = self.get_sink(sink)?;
                (s.reference_volume, s.channel_map.clone())
            };
            for input in self.input_list(sink) {
                let i = self.get_input_mut(input)?;
                i.reference_ratio = i.real_ratio;
                let new_volume = reference
                    .remap(&sink_map, &i.channel_map)
                    .multiply(&i.reference_ratio);
                self.set_input_volume_direct(input, new_volume)?;

                if let Some(origin) = self.linked_proxy_origin(input) {
                    self.propagate_real_volume(origin, old_real)?;
                }
            }
        }

        if !share {
            self.get_sink_mut(sink)?.save_volume = true;
        }
        Ok(true)
    }

    /// Reports a hardware volume change, e.g. a knob turned on the device.
    pub fn sink_volume_changed(&mut self, index: u32, new_real: &ChannelVolume) -> Result<()> {
        let s = self.linked_sink(index)?;
        if s.flags.contains(SinkFlags::SHARE_VOLUME_WITH_MASTER) {
            return Err(SinkError::Refused("volume sharing sinks have no hardware volume".into()));
        }
        if !new_real.is_compatible(&s.sample_spec) {
            return Err(SinkError::IncompatibleVolume);
        }
        let (old_real, map) = (s.real_volume, s.channel_map.clone());

        debug!("Sink {} hardware volume changed to {}", index, new_real);
        self.update_real_volume(index, new_real, &map)?;
        self.propagate_real_volume(index, &old_real)?;
        Ok(())
    }

    pub fn sink_set_mute(&mut self, index: u32, muted: bool, save: bool) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        let old = s.muted;
        s.muted = muted;
        s.save_muted = (old == muted && s.save_muted) || save;

        if !s.flags.contains(SinkFlags::DEFERRED_VOLUME) && s.hooks.contains(SinkHooks::SET_MUTE) {
            s.backend.lock().set_mute(muted);
        }
        s.send(SinkMessage::SetMute(muted))?;

        if old != muted && s.state.is_linked() {
            debug!("Sink {} mute {}", s.name, if muted { "on" } else { "off" });
            self.post(Facility::Sink, EventKind::Change, index);
        }
        Ok(())
    }

    pub fn sink_get_mute(&mut self, index: u32, force_refresh: bool) -> Result<bool> {
        let s = self.linked_sink(index)?;
        if !(s.refresh_muted || force_refresh) {
            return Ok(s.muted);
        }

        let s = self.get_sink_mut(index)?;
        let old = s.muted;
        if !s.flags.contains(SinkFlags::DEFERRED_VOLUME) && s.hooks.contains(SinkHooks::GET_MUTE) {
            if let Some(m) = s.backend.lock().get_mute() {
                s.muted = m;
            }
        }
        if let Some(m) = s.send(SinkMessage::GetMute(s.muted))?.into_muted() {
            s.muted = m;
        }

        let muted = s.muted;
        if old != muted {
            s.save_muted = true;
            // Keep the soft mute in step.
            s.send(SinkMessage::SetMute(muted))?;
            self.post(Facility::Sink, EventKind::Change, index);
        }
        Ok(muted)
    }

    /// Reports a hardware mute change.
    pub fn sink_mute_changed(&mut self, index: u32, muted: bool) -> Result<()> {
        let s = self.linked_sink(index)?;
        if s.muted == muted {
            return Ok(());
        }
        let s = self.get_sink_mut(index)?;
        s.muted = muted;
        s.save_muted = true;
        self.post(Facility::Sink, EventKind::Change, index);
        Ok(())
    }
}
