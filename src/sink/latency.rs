// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Latency, rewind and render entry points on the main thread. The
//! bookkeeping itself lives on the IO thread; these methods only clamp
//! arguments and forward them.

use super::{SinkFlags, SinkState};
use crate::engine::Core;
use crate::error::{Result, SinkError};
use crate::memblock::MemChunk;
use crate::thread::SinkMessage;
use tracing::debug;

/// Lowest latency a sink may be configured for, in microseconds.
pub const ABSOLUTE_MIN_LATENCY: u64 = 500;
/// Highest latency a sink may be configured for, in microseconds.
pub const ABSOLUTE_MAX_LATENCY: u64 = 10_000_000;
/// Latency of sinks without `DYNAMIC_LATENCY` until the implementor sets one.
pub const DEFAULT_FIXED_LATENCY: u64 = 250_000;

impl Core {
    /// Current device latency including the port latency offset. Zero for
    /// suspended sinks and sinks that cannot report latency.
    pub fn sink_get_latency(&mut self, index: u32) -> Result<u64> {
        let s = self.linked_sink(index)?;
        if s.state == SinkState::Suspended || !s.flags.contains(SinkFlags::LATENCY) {
            return Ok(0);
        }
        Ok(self
            .get_sink_mut(index)?
            .send(SinkMessage::GetLatency)?
            .into_usec())
    }

    /// Latency the sink is currently asked to run at.
    pub fn sink_get_requested_latency(&mut self, index: u32) -> Result<u64> {
        if self.linked_sink(index)?.state == SinkState::Suspended {
            return Ok(0);
        }
        Ok(self
            .get_sink_mut(index)?
            .send(SinkMessage::GetRequestedLatency)?
            .into_usec())
    }

    /// Sets the range requested latencies are clamped to. A `max` of 0 means
    /// no upper bound.
    pub fn sink_set_latency_range(&mut self, index: u32, min: u64, max: u64) -> Result<()> {
        let min = min.max(ABSOLUTE_MIN_LATENCY);
        let max = if max == 0 || max > ABSOLUTE_MAX_LATENCY {
            ABSOLUTE_MAX_LATENCY
        } else {
            max
        };
        if min > max {
            return Err(SinkError::Refused(format!(
                "latency range {}..{} is empty",
                min, max
            )));
        }

        let s = self.get_sink_mut(index)?;
        debug!("Sink {} latency range {}..{} usec", s.name, min, max);
        s.send(SinkMessage::SetLatencyRange { min, max })?;
        Ok(())
    }

    pub fn sink_get_latency_range(&mut self, index: u32) -> Result<(u64, u64)> {
        Ok(self
            .get_sink_mut(index)?
            .send(SinkMessage::GetLatencyRange)?
            .into_latency_range())
    }

    /// Sets the latency of a sink without `DYNAMIC_LATENCY`. Ignored on
    /// dynamic sinks.
    pub fn sink_set_fixed_latency(&mut self, index: u32, usec: u64) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        if s.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            debug!("Sink {} has dynamic latency, ignoring fixed latency", s.name);
            return Ok(());
        }

        let usec = usec.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY);
        s.send(SinkMessage::SetFixedLatency(usec))?;
        Ok(())
    }

    pub fn sink_get_fixed_latency(&mut self, index: u32) -> Result<u64> {
        let s = self.get_sink_mut(index)?;
        if s.flags.contains(SinkFlags::DYNAMIC_LATENCY) {
            return Ok(0);
        }
        Ok(s.send(SinkMessage::GetFixedLatency)?.into_usec())
    }

    /// Extra latency of the active port, added to what the device reports.
    pub fn sink_set_latency_offset(&mut self, index: u32, offset: i64) -> Result<()> {
        let s = self.get_sink_mut(index)?;
        s.latency_offset = offset;
        s.send(SinkMessage::SetLatencyOffset(offset))?;
        Ok(())
    }

    pub fn sink_set_max_rewind(&mut self, index: u32, nbytes: usize) -> Result<()> {
        self.get_sink_mut(index)?
            .send(SinkMessage::SetMaxRewind(nbytes))?;
        Ok(())
    }

    pub fn sink_get_max_rewind(&mut self, index: u32) -> Result<usize> {
        Ok(self
            .get_sink_mut(index)?
            .send(SinkMessage::GetMaxRewind)?
            .into_bytes())
    }

    pub fn sink_set_max_request(&mut self, index: u32, nbytes: usize) -> Result<()> {
        self.get_sink_mut(index)?
            .send(SinkMessage::SetMaxRequest(nbytes))?;
        Ok(())
    }

    pub fn sink_get_max_request(&mut self, index: u32) -> Result<usize> {
        Ok(self
            .get_sink_mut(index)?
            .send(SinkMessage::GetMaxRequest)?
            .into_bytes())
    }

    /// Tells the inputs and the monitor that the last `nbytes` of rendered
    /// audio were discarded.
    pub fn sink_process_rewind(&mut self, index: u32, nbytes: usize) -> Result<()> {
        self.linked_sink(index)?;
        self.get_sink_mut(index)?
            .send(SinkMessage::ProcessRewind(nbytes))?;
        Ok(())
    }

    /// Renders up to `length` bytes on the IO thread and returns them.
    pub fn sink_render(&mut self, index: u32, length: usize) -> Result<MemChunk> {
        self.linked_sink(index)?;
        self.get_sink_mut(index)?
            .send(SinkMessage::Render(length))?
            .into_chunk()
            .ok_or(SinkError::ThreadGone)
    }

    /// Like [`sink_render`](Self::sink_render) but always returns exactly
    /// `length` bytes.
    pub fn sink_render_full(&mut self, index: u32, length: usize) -> Result<MemChunk> {
        self.linked_sink(index)?;
        self.get_sink_mut(index)?
            .send(SinkMessage::RenderFull(length))?
            .into_chunk()
            .ok_or(SinkError::ThreadGone)
    }

    /// Detaches every input stream, e.g. while the device is reopened.
    pub fn sink_detach(&mut self, index: u32) -> Result<()> {
        self.linked_sink(index)?;
        self.get_sink_mut(index)?.send(SinkMessage::Detach)?;
        Ok(())
    }

    pub fn sink_attach(&mut self, index: u32) -> Result<()> {
        self.linked_sink(index)?;
        self.get_sink_mut(index)?.send(SinkMessage::Attach)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::input::{InputNewData, InputStream};
    use crate::sink::{SinkNewData, SuspendCause};
    use crate::testutil::{new_input, RecordingBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn put_sink(core: &mut Core, data: SinkNewData) -> u32 {
        let idx = core.sink_new(data).unwrap();
        core.sink_put(idx).unwrap();
        idx
    }

    #[test]
    fn test_latency_range_is_clamped() {
        let mut core = Core::new(CoreConfig::default());
        let mut data = SinkNewData::new("out");
        data.flags = SinkFlags::DYNAMIC_LATENCY;
        let idx = put_sink(&mut core, data);

        core.sink_set_latency_range(idx, 0, 0).unwrap();
        assert_eq!(
            core.sink_get_latency_range(idx).unwrap(),
            (ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY)
        );

        core.sink_set_latency_range(idx, 20_000, 100_000).unwrap();
        assert_eq!(core.sink_get_latency_range(idx).unwrap(), (20_000, 100_000));

        assert!(core.sink_set_latency_range(idx, 200_000, 100_000).is_err());
        assert_eq!(core.sink_get_latency_range(idx).unwrap(), (20_000, 100_000));
    }

    #[test]
    fn test_fixed_latency() {
        let mut core = Core::new(CoreConfig::default());
        let fixed = put_sink(&mut core, SinkNewData::new("fixed"));
        assert_eq!(core.sink_get_fixed_latency(fixed).unwrap(), DEFAULT_FIXED_LATENCY);

        core.sink_set_fixed_latency(fixed, 1).unwrap();
        assert_eq!(core.sink_get_fixed_latency(fixed).unwrap(), ABSOLUTE_MIN_LATENCY);
        core.sink_set_fixed_latency(fixed, 20_000_000).unwrap();
        assert_eq!(core.sink_get_fixed_latency(fixed).unwrap(), ABSOLUTE_MAX_LATENCY);

        let mut data = SinkNewData::new("dynamic");
        data.flags = SinkFlags::DYNAMIC_LATENCY;
        let dynamic = put_sink(&mut core, data);
        core.sink_set_fixed_latency(dynamic, 40_000).unwrap();
        assert_eq!(core.sink_get_fixed_latency(dynamic).unwrap(), 0);
    }

    #[test]
    fn test_latency_includes_port_offset() {
        let mut core = Core::new(CoreConfig::default());
        let mut data = SinkNewData::new("out").with_backend(RecordingBackend::with_latency(20_000));
        data.flags = SinkFlags::LATENCY;
        let idx = put_sink(&mut core, data);
        assert_eq!(core.sink_get_latency(idx).unwrap(), 20_000);

        core.sink_set_latency_offset(idx, 5_000).unwrap();
        assert_eq!(core.sink(idx).unwrap().latency_offset(), 5_000);
        assert_eq!(core.sink_get_latency(idx).unwrap(), 25_000);

        core.sink_suspend(idx, true, SuspendCause::USER).unwrap();
        assert_eq!(core.sink_get_latency(idx).unwrap(), 0);

        let silent = put_sink(
            &mut core,
            SinkNewData::new("silent").with_backend(RecordingBackend::with_latency(20_000)),
        );
        assert_eq!(core.sink_get_latency(silent).unwrap(), 0);
    }

    #[test]
    fn test_requested_latency() {
        let mut core = Core::new(CoreConfig::default());
        let fixed = put_sink(&mut core, SinkNewData::new("fixed"));
        assert_eq!(core.sink_get_requested_latency(fixed).unwrap(), DEFAULT_FIXED_LATENCY);

        let mut data = SinkNewData::new("dynamic");
        data.flags = SinkFlags::DYNAMIC_LATENCY;
        let dynamic = put_sink(&mut core, data);
        assert_eq!(
            core.sink_get_requested_latency(dynamic).unwrap(),
            ABSOLUTE_MAX_LATENCY
        );

        let input = new_input(&mut core, dynamic, "music");
        core.input_put(input).unwrap();
        core.input_set_requested_latency(input, Some(30_000)).unwrap();
        assert_eq!(core.sink_get_requested_latency(dynamic).unwrap(), 30_000);

        core.sink_suspend(dynamic, true, SuspendCause::USER).unwrap();
        assert_eq!(core.sink_get_requested_latency(dynamic).unwrap(), 0);
    }

    #[test]
    fn test_rewind_and_request_limits() {
        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));

        core.sink_set_max_rewind(idx, 4096).unwrap();
        core.sink_set_max_request(idx, 1024).unwrap();
        assert_eq!(core.sink_get_max_rewind(idx).unwrap(), 4096);
        assert_eq!(core.sink_get_max_request(idx).unwrap(), 1024);
        core.sink_process_rewind(idx, 512).unwrap();
    }

    #[test]
    fn test_detach_and_attach_reach_streams() {
        struct Counting {
            attached: Arc<AtomicUsize>,
            detached: Arc<AtomicUsize>,
        }
        impl InputStream for Counting {
            fn peek(&mut self, _length: usize) -> Option<MemChunk> {
                None
            }
            fn drop_bytes(&mut self, _nbytes: usize) {}
            fn attach(&mut self) {
                self.attached.fetch_add(1, Ordering::SeqCst);
            }
            fn detach(&mut self) {
                self.detached.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut core = Core::new(CoreConfig::default());
        let idx = put_sink(&mut core, SinkNewData::new("out"));
        let attached = Arc::new(AtomicUsize::new(0));
        let detached = Arc::new(AtomicUsize::new(0));
        let stream = Counting {
            attached: Arc::clone(&attached),
            detached: Arc::clone(&detached),
        };
        let input = core.input_new(InputNewData::new(idx, stream)).unwrap();
        core.input_put(input).unwrap();
        assert_eq!(attached.load(Ordering::SeqCst), 1);

        core.sink_detach(idx).unwrap();
        core.sink_detach(idx).unwrap();
        assert_eq!(detached.load(Ordering::SeqCst), 1);

        core.sink_attach(idx).unwrap();
        assert_eq!(attached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_render_requires_linked_sink() {
        let mut core = Core::new(CoreConfig::default());
        let idx = core.sink_new(SinkNewData::new("out")).unwrap();
        assert_eq!(core.sink_render(idx, 64).unwrap_err(), SinkError::NotLinked);

        core.sink_put(idx).unwrap();
        let out = core.sink_render_full(idx, 64).unwrap();
        assert_eq!(out.length, 64);
        assert!(out.bytes().iter().all(|b| *b == 0));
    }
}
