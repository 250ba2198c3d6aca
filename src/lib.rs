// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SinkMix - sink mixing and volume-control engine.
//!
//! A [`Core`] owns sinks and the streams ("sink inputs") feeding them. Each
//! linked sink runs a dedicated IO thread that mixes its inputs, scales them
//! by software volume and distributes the result to the sink's monitor.
//! Control operations run on the thread that owns the `Core` and reach the IO
//! thread only through messages.
//!
//! The volume model supports flat volumes (the sink follows its loudest
//! stream), volume sharing between filter sinks and their master, and
//! deferred hardware volume changes that are timed to hit the hardware
//! together with the audio that was buffered when they were requested.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod input;
pub mod memblock;
pub mod mix;
pub mod monitor;
pub mod namereg;
pub mod port;
pub mod proplist;
pub mod sample;
pub mod sink;
pub mod thread;
pub mod volume;

#[cfg(test)]
mod testutil;

pub use crate::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::config::CoreConfig;
pub use crate::engine::{Core, EventKind, Facility, SubscriptionEvent};
pub use crate::error::SinkError;
pub use crate::format::{Encoding, FormatInfo};
pub use crate::input::{InputFlags, InputNewData, InputState, InputStream};
pub use crate::memblock::{MemBlock, MemChunk};
pub use crate::monitor::MonitorOutput;
pub use crate::port::{DevicePort, PortAvailable};
pub use crate::proplist::Proplist;
pub use crate::sample::{ChannelMap, ChannelPosition, SampleFormat, SampleSpec};
pub use crate::sink::{
    ClearSwitchCause, NullBackend, SinkBackend, SinkFlags, SinkHooks, SinkNewData, SinkState,
    SuspendCause, SuspendPolicy, VolumeRequest,
};
pub use crate::thread::{SinkDriver, SinkThread};
pub use crate::volume::{ChannelVolume, Volume};
