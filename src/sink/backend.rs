// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hooks a sink implementor provides.

use super::SinkState;
use crate::error::{Result, SinkError};
use crate::format::FormatInfo;
use crate::port::DevicePort;
use crate::volume::ChannelVolume;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

bitflags! {
    /// Which [`SinkBackend`] hooks are implemented. Hooks that are not
    /// advertised are never called.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SinkHooks: u32 {
        const SET_STATE = 0x0001;
        const GET_VOLUME = 0x0002;
        const SET_VOLUME = 0x0004;
        /// Deferred hardware volume writes. Enables `DEFERRED_VOLUME`.
        const WRITE_VOLUME = 0x0008;
        const GET_MUTE = 0x0010;
        const SET_MUTE = 0x0020;
        const REQUEST_REWIND = 0x0040;
        const UPDATE_REQUESTED_LATENCY = 0x0080;
        const SET_PORT = 0x0100;
        const GET_FORMATS = 0x0200;
        const SET_FORMATS = 0x0400;
        const UPDATE_RATE = 0x0800;
    }
}

/// Volumes handed to the volume hooks. Hooks may rewrite both: a hardware
/// mixer typically snaps `real_volume` to a step it supports and puts the
/// remainder into `soft_volume`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRequest {
    pub real_volume: ChannelVolume,
    pub soft_volume: ChannelVolume,
}

/// Implementor callbacks for one sink.
///
/// The object is shared between the main thread and the sink's IO thread.
/// Volume and mute hooks run on the IO thread when the sink uses deferred
/// volume and on the main thread otherwise; `write_volume`,
/// `request_rewind`, `update_requested_latency` and `latency` always run on
/// the IO thread.
pub trait SinkBackend: Send {
    fn hooks(&self) -> SinkHooks {
        SinkHooks::empty()
    }

    /// Called before a state change is committed. An error aborts it.
    fn set_state(&mut self, _state: SinkState) -> Result<()> {
        Ok(())
    }

    /// Read the hardware volume into `volume.real_volume`.
    fn get_volume(&mut self, _volume: &mut VolumeRequest) {}

    fn set_volume(&mut self, _volume: &mut VolumeRequest) {}

    /// Write a hardware volume that is due now.
    fn write_volume(&mut self, _hw_volume: &ChannelVolume) {}

    fn get_mute(&mut self) -> Option<bool> {
        None
    }

    fn set_mute(&mut self, _muted: bool) {}

    fn request_rewind(&mut self, _nbytes: usize) {}

    fn update_requested_latency(&mut self, _latency: Option<u64>) {}

    fn set_port(&mut self, _port: &DevicePort) -> Result<()> {
        Err(SinkError::NotImplemented)
    }

    fn get_formats(&mut self) -> Option<Vec<FormatInfo>> {
        None
    }

    fn set_formats(&mut self, _formats: &[FormatInfo]) -> bool {
        false
    }

    /// Switch the device to `rate`. Returns false if it cannot.
    fn update_rate(&mut self, _rate: u32) -> bool {
        false
    }

    /// Audio buffered between the mixer and the speaker, in microseconds.
    fn latency(&mut self) -> u64 {
        0
    }
}

/// Backend for sinks that need no callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl SinkBackend for NullBackend {}

pub(crate) type SharedBackend = Arc<Mutex<Box<dyn SinkBackend>>>;

pub(crate) fn share(backend: Box<dyn SinkBackend>) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}
