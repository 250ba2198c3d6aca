// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sinks without a device: audio is rendered at real-time pace and dropped.

use crate::config::NullSinkConfig;
use sinkmix::proplist::DEVICE_DESCRIPTION;
use sinkmix::{
    ChannelVolume, Core, SampleSpec, SinkDriver, SinkError, SinkFlags, SinkNewData, SinkThread,
    Volume,
};
use std::time::Duration;
use tracing::{info, trace};

pub const DRIVER_NAME: &str = "sinkmix-daemon";

/// IO-thread pump that consumes one block per block duration.
pub struct NullSinkDriver {
    block_size: usize,
}

impl NullSinkDriver {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl SinkDriver for NullSinkDriver {
    fn process(&mut self, sink: &mut SinkThread) -> Option<Duration> {
        if !sink.state().is_opened() {
            return None;
        }

        if sink.rewind_requested() {
            sink.process_rewind(0);
        }

        let spec = *sink.sample_spec();
        let length = spec.frame_align(self.block_size).max(spec.frame_size());
        let chunk = sink.render_full(length);
        trace!("null sink {} dropped {} bytes", sink.name(), chunk.length);

        Some(Duration::from_micros(spec.bytes_to_usec(length)))
    }
}

/// Builds the construction data for a configured null sink.
pub fn null_sink_data(config: &NullSinkConfig) -> SinkNewData {
    let spec = SampleSpec::new(config.format, config.rate, config.channels);
    let mut data = SinkNewData::new(config.name.clone())
        .with_driver(NullSinkDriver::new(config.block_size));
    data.driver = Some(DRIVER_NAME.to_string());
    data.sample_spec = Some(spec);
    data.volume = Some(ChannelVolume::new(
        config.channels,
        Volume::from_db(config.volume_db),
    ));
    data.muted = Some(config.muted);
    data.flags = SinkFlags::LATENCY;
    if let Some(description) = &config.description {
        data.proplist.set(DEVICE_DESCRIPTION, description.clone());
    }
    data
}

/// Creates and links a null sink, returning its index.
pub fn create_null_sink(core: &mut Core, config: &NullSinkConfig) -> Result<u32, SinkError> {
    let index = core.sink_new(null_sink_data(config))?;
    if let Err(e) = core.sink_put(index) {
        core.sink_unlink(index)?;
        return Err(e);
    }
    info!(
        "Null sink {} \"{}\" ready ({} Hz, {} channels)",
        index, config.name, config.rate, config.channels
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinkmix::{CoreConfig, SampleFormat, SinkState};

    #[test]
    fn test_sink_data_from_config() {
        let mut config = NullSinkConfig::new("quiet");
        config.description = Some("Quiet".into());
        config.format = SampleFormat::F32le;
        config.rate = 48_000;
        config.channels = 1;
        config.volume_db = -6.0;
        config.muted = true;

        let data = null_sink_data(&config);
        assert_eq!(data.name, "quiet");
        assert_eq!(data.driver.as_deref(), Some(DRIVER_NAME));
        assert_eq!(
            data.sample_spec,
            Some(SampleSpec::new(SampleFormat::F32le, 48_000, 1))
        );
        assert_eq!(data.muted, Some(true));
        assert_eq!(data.proplist.get(DEVICE_DESCRIPTION), Some("Quiet"));
        let volume = data.volume.unwrap();
        assert_eq!(volume.channels(), 1);
        assert!(volume.max() < Volume::NORM);
        assert!(data.io_driver.is_some());
    }

    #[test]
    fn test_create_links_sink() {
        let mut core = Core::new(CoreConfig::default());
        let index = create_null_sink(&mut core, &NullSinkConfig::new("null")).unwrap();

        let sink = core.sink(index).unwrap();
        assert_eq!(sink.state(), SinkState::Idle);
        assert_eq!(sink.driver(), Some(DRIVER_NAME));

        core.unlink_all();
        assert_eq!(core.sink(index).map(|s| s.state()), None);
    }

    #[test]
    fn test_duplicate_name_fails() {
        let mut core = Core::new(CoreConfig::default());
        create_null_sink(&mut core, &NullSinkConfig::new("null")).unwrap();
        assert!(create_null_sink(&mut core, &NullSinkConfig::new("null")).is_err());
    }
}
