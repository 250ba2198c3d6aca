// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core-wide settings shared by every sink.

use crate::sample::SampleSpec;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_safety_margin() -> u64 {
    8_000
}

fn default_alternate_rate() -> u32 {
    48_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Let sinks that support it follow their loudest stream.
    #[serde(default = "default_true")]
    pub flat_volumes: bool,
    /// Margin in microseconds by which deferred volume increases are
    /// delayed and decreases are advanced.
    #[serde(default = "default_safety_margin")]
    pub deferred_volume_safety_margin_usec: u64,
    /// Extra delay in microseconds added to every deferred volume change.
    #[serde(default)]
    pub deferred_volume_extra_delay_usec: u64,
    /// Rate a sink may switch to when a stream asks for it. 0 disables
    /// switching.
    #[serde(default = "default_alternate_rate")]
    pub alternate_sample_rate: u32,
    /// Fold both channels of stereo sinks into their average after mixing.
    #[serde(default)]
    pub mono_downmix: bool,
    #[serde(default)]
    pub default_sample_spec: SampleSpec,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            flat_volumes: true,
            deferred_volume_safety_margin_usec: default_safety_margin(),
            deferred_volume_extra_delay_usec: 0,
            alternate_sample_rate: default_alternate_rate(),
            mono_downmix: false,
            default_sample_spec: SampleSpec::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = CoreConfig::from_toml("").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert!(config.flat_volumes);
        assert_eq!(config.deferred_volume_safety_margin_usec, 8_000);
    }

    #[test]
    fn test_partial_toml() {
        let config = CoreConfig::from_toml(
            r#"
            flat_volumes = false
            deferred_volume_extra_delay_usec = 2500

            [default_sample_spec]
            format = "f32le"
            rate = 48000
            channels = 6
            "#,
        )
        .unwrap();
        assert!(!config.flat_volumes);
        assert_eq!(config.deferred_volume_extra_delay_usec, 2500);
        assert_eq!(config.default_sample_spec.format, SampleFormat::F32le);
        assert_eq!(config.default_sample_spec.channels, 6);
        assert_eq!(config.alternate_sample_rate, 48_000);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = CoreConfig::default();
        config.mono_downmix = true;
        let text = config.to_toml().unwrap();
        assert_eq!(CoreConfig::from_toml(&text).unwrap(), config);
    }
}
