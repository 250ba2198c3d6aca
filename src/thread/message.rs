// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Messages from the main thread to a sink's IO thread.

use crate::error::Result;
use crate::input::{InputState, ThreadInput};
use crate::memblock::MemChunk;
use crate::monitor::MonitorOutputEntry;
use crate::port::DevicePort;
use crate::sink::{SinkFlags, SinkState};
use crate::volume::ChannelVolume;
use std::sync::mpsc::SyncSender;
use tracing::warn;

/// Main-thread volumes of one sink and its inputs, copied into a message.
#[derive(Debug, Clone)]
pub struct VolumeSync {
    pub real_volume: ChannelVolume,
    pub soft_volume: ChannelVolume,
    /// Soft volume of every input, by input index.
    pub inputs: Vec<(u32, ChannelVolume)>,
}

/// Commands processed by [`SinkThread::process_msg`](super::SinkThread::process_msg).
#[derive(Debug)]
pub enum SinkMessage {
    /// Attach a freshly linked input.
    AddInput(Box<ThreadInput>),
    /// Detach and drop an input that is being unlinked.
    RemoveInput(u32),
    /// Detach an input that is leaving for another sink; replies with it.
    StartMove(u32),
    /// Attach an input arriving from another sink.
    FinishMove(Box<ThreadInput>),
    /// Adopt new volumes, pushing a hardware change on deferred sinks.
    SetVolumeSynced(VolumeSync),
    /// Adopt new soft volumes without touching the hardware.
    SetVolume(VolumeSync),
    /// Adopt new input soft volumes only.
    SyncVolumes(Vec<(u32, ChannelVolume)>),
    /// Read back the volumes, refreshing from hardware on deferred sinks.
    GetVolume {
        real_volume: ChannelVolume,
        soft_volume: ChannelVolume,
    },
    SetMute(bool),
    GetMute(bool),
    SetState(SinkState),
    Detach,
    Attach,
    GetRequestedLatency,
    SetLatencyRange { min: u64, max: u64 },
    GetLatencyRange,
    SetFixedLatency(u64),
    GetFixedLatency,
    GetMaxRewind,
    SetMaxRewind(usize),
    GetMaxRequest,
    SetMaxRequest(usize),
    SetPort(DevicePort),
    SetLatencyOffset(i64),
    GetLatency,
    SetFlags(SinkFlags),
    UpdateRate(u32),
    SetInputState { index: u32, state: InputState },
    SetInputSoftVolume { index: u32, volume: ChannelVolume },
    SetInputMute { index: u32, muted: bool },
    SetInputRequestedLatency { index: u32, usec: Option<u64> },
    AddMonitorOutput(Box<MonitorOutputEntry>),
    RemoveMonitorOutput(u32),
    SetMonitorState(SinkState),
    Render(usize),
    RenderFull(usize),
    ProcessRewind(usize),
    Shutdown,
}

impl SinkMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SinkMessage::AddInput(_) => "add-input",
            SinkMessage::RemoveInput(_) => "remove-input",
            SinkMessage::StartMove(_) => "start-move",
            SinkMessage::FinishMove(_) => "finish-move",
            SinkMessage::SetVolumeSynced(_) => "set-volume-synced",
            SinkMessage::SetVolume(_) => "set-volume",
            SinkMessage::SyncVolumes(_) => "sync-volumes",
            SinkMessage::GetVolume { .. } => "get-volume",
            SinkMessage::SetMute(_) => "set-mute",
            SinkMessage::GetMute(_) => "get-mute",
            SinkMessage::SetState(_) => "set-state",
            SinkMessage::Detach => "detach",
            SinkMessage::Attach => "attach",
            SinkMessage::GetRequestedLatency => "get-requested-latency",
            SinkMessage::SetLatencyRange { .. } => "set-latency-range",
            SinkMessage::GetLatencyRange => "get-latency-range",
            SinkMessage::SetFixedLatency(_) => "set-fixed-latency",
            SinkMessage::GetFixedLatency => "get-fixed-latency",
            SinkMessage::GetMaxRewind => "get-max-rewind",
            SinkMessage::SetMaxRewind(_) => "set-max-rewind",
            SinkMessage::GetMaxRequest => "get-max-request",
            SinkMessage::SetMaxRequest(_) => "set-max-request",
            SinkMessage::SetPort(_) => "set-port",
            SinkMessage::SetLatencyOffset(_) => "set-latency-offset",
            SinkMessage::GetLatency => "get-latency",
            SinkMessage::SetFlags(_) => "set-flags",
            SinkMessage::UpdateRate(_) => "update-rate",
            SinkMessage::SetInputState { .. } => "set-input-state",
            SinkMessage::SetInputSoftVolume { .. } => "set-input-soft-volume",
            SinkMessage::SetInputMute { .. } => "set-input-mute",
            SinkMessage::SetInputRequestedLatency { .. } => "set-input-requested-latency",
            SinkMessage::AddMonitorOutput(_) => "add-monitor-output",
            SinkMessage::RemoveMonitorOutput(_) => "remove-monitor-output",
            SinkMessage::SetMonitorState(_) => "set-monitor-state",
            SinkMessage::Render(_) => "render",
            SinkMessage::RenderFull(_) => "render-full",
            SinkMessage::ProcessRewind(_) => "process-rewind",
            SinkMessage::Shutdown => "shutdown",
        }
    }
}

/// Result of a processed message.
#[derive(Debug)]
pub enum Reply {
    Done,
    Usec(u64),
    Bytes(usize),
    LatencyRange { min: u64, max: u64 },
    HwVolume {
        real_volume: ChannelVolume,
        soft_volume: ChannelVolume,
    },
    Muted(bool),
    Status(Result<()>),
    Input(Option<Box<ThreadInput>>),
    Chunk(MemChunk),
}

fn mismatch(expected: &str, got: &Reply) {
    warn!("Expected {} reply, got {:?}", expected, got);
    debug_assert!(false, "unexpected reply");
}

impl Reply {
    pub fn into_usec(self) -> u64 {
        match self {
            Reply::Usec(usec) => usec,
            other => {
                mismatch("usec", &other);
                0
            }
        }
    }

    pub fn into_bytes(self) -> usize {
        match self {
            Reply::Bytes(n) => n,
            other => {
                mismatch("bytes", &other);
                0
            }
        }
    }

    pub fn into_latency_range(self) -> (u64, u64) {
        match self {
            Reply::LatencyRange { min, max } => (min, max),
            other => {
                mismatch("latency range", &other);
                (0, 0)
            }
        }
    }

    pub fn into_hw_volume(self) -> Option<(ChannelVolume, ChannelVolume)> {
        match self {
            Reply::HwVolume {
                real_volume,
                soft_volume,
            } => Some((real_volume, soft_volume)),
            Reply::Done => None,
            other => {
                mismatch("volume", &other);
                None
            }
        }
    }

    pub fn into_muted(self) -> Option<bool> {
        match self {
            Reply::Muted(m) => Some(m),
            other => {
                mismatch("mute", &other);
                None
            }
        }
    }

    pub fn into_status(self) -> Result<()> {
        match self {
            Reply::Status(r) => r,
            other => {
                mismatch("status", &other);
                Ok(())
            }
        }
    }

    pub fn into_input(self) -> Option<Box<ThreadInput>> {
        match self {
            Reply::Input(i) => i,
            other => {
                mismatch("input", &other);
                None
            }
        }
    }

    pub fn into_chunk(self) -> Option<MemChunk> {
        match self {
            Reply::Chunk(c) => Some(c),
            other => {
                mismatch("chunk", &other);
                None
            }
        }
    }
}

/// A message plus the channel its reply goes to, if the sender waits.
#[derive(Debug)]
pub struct Envelope {
    pub msg: SinkMessage,
    pub ack: Option<SyncSender<Reply>>,
}
