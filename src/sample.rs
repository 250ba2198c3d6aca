// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sample formats, sample specs and channel maps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of channels in a sample spec or channel map.
pub const CHANNELS_MAX: usize = 32;

/// Highest sample rate accepted anywhere in the engine.
pub const RATE_MAX: u32 = 48000 * 4;

/// Lowest sample rate a sink may switch to.
pub const RATE_MIN_SWITCH: u32 = 8000;

/// Sample encoding of one PCM sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16le,
    S16be,
    S32le,
    S32be,
    F32le,
    F32be,
}

impl SampleFormat {
    /// Size of a single sample in bytes.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16le | SampleFormat::S16be => 2,
            SampleFormat::S32le | SampleFormat::S32be => 4,
            SampleFormat::F32le | SampleFormat::F32be => 4,
        }
    }

    /// Byte value that fills a silent buffer.
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16le => "s16le",
            SampleFormat::S16be => "s16be",
            SampleFormat::S32le => "s32le",
            SampleFormat::S32be => "s32be",
            SampleFormat::F32le => "float32le",
            SampleFormat::F32be => "float32be",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Format, rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.rate <= RATE_MAX
            && self.channels > 0
            && self.channels as usize <= CHANNELS_MAX
    }

    /// Size of one frame (one sample per channel) in bytes.
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Duration of `nbytes` of audio, rounded down to whole frames.
    pub fn bytes_to_usec(&self, nbytes: usize) -> u64 {
        let frames = (nbytes / self.frame_size()) as u64;
        frames * 1_000_000 / self.rate as u64
    }

    /// Number of bytes played in `usec`, rounded down to whole frames.
    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let frames = usec * self.rate as u64 / 1_000_000;
        frames as usize * self.frame_size()
    }

    pub fn frame_align(&self, nbytes: usize) -> usize {
        let fs = self.frame_size();
        nbytes - nbytes % fs
    }

    pub fn is_frame_aligned(&self, nbytes: usize) -> bool {
        nbytes % self.frame_size() == 0
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self::new(SampleFormat::S16le, 44100, 2)
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}ch {}Hz", self.format, self.channels, self.rate)
    }
}

/// Speaker position of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearCenter,
    RearLeft,
    RearRight,
    Lfe,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontRight,
    TopFrontCenter,
    TopRearLeft,
    TopRearRight,
    TopRearCenter,
    Aux(u8),
}

impl ChannelPosition {
    pub fn is_left(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontLeft | RearLeft | FrontLeftOfCenter | SideLeft | TopFrontLeft | TopRearLeft
        )
    }

    pub fn is_right(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontRight | RearRight | FrontRightOfCenter | SideRight | TopFrontRight | TopRearRight
        )
    }

    pub fn is_center(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            FrontCenter | RearCenter | TopCenter | TopFrontCenter | TopRearCenter
        )
    }

    pub fn is_lfe(self) -> bool {
        self == ChannelPosition::Lfe
    }

    pub fn name(self) -> String {
        use ChannelPosition::*;
        let s = match self {
            Mono => "mono",
            FrontLeft => "front-left",
            FrontRight => "front-right",
            FrontCenter => "front-center",
            RearCenter => "rear-center",
            RearLeft => "rear-left",
            RearRight => "rear-right",
            Lfe => "lfe",
            FrontLeftOfCenter => "front-left-of-center",
            FrontRightOfCenter => "front-right-of-center",
            SideLeft => "side-left",
            SideRight => "side-right",
            TopCenter => "top-center",
            TopFrontLeft => "top-front-left",
            TopFrontRight => "top-front-right",
            TopFrontCenter => "top-front-center",
            TopRearLeft => "top-rear-left",
            TopRearRight => "top-rear-right",
            TopRearCenter => "top-rear-center",
            Aux(n) => return format!("aux{}", n),
        };
        s.to_string()
    }
}

/// Ordered speaker positions, one per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelMap {
    positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    pub fn new(positions: Vec<ChannelPosition>) -> Self {
        Self { positions }
    }

    pub fn mono() -> Self {
        Self::new(vec![ChannelPosition::Mono])
    }

    pub fn stereo() -> Self {
        Self::new(vec![ChannelPosition::FrontLeft, ChannelPosition::FrontRight])
    }

    /// Default map for a channel count. Counts without a well-known layout
    /// fall back to auxiliary channels.
    pub fn init_auto(channels: u8) -> Option<Self> {
        use ChannelPosition::*;

        let positions = match channels {
            0 => return None,
            n if n as usize > CHANNELS_MAX => return None,
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, FrontCenter],
            4 => vec![FrontLeft, FrontRight, RearLeft, RearRight],
            5 => vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter],
            6 => vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, Lfe],
            8 => vec![
                FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, Lfe, SideLeft, SideRight,
            ],
            n => (0..n).map(Aux).collect(),
        };

        Some(Self::new(positions))
    }

    pub fn channels(&self) -> u8 {
        self.positions.len() as u8
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    pub fn is_valid(&self) -> bool {
        !self.positions.is_empty() && self.positions.len() <= CHANNELS_MAX
    }

    pub fn is_compatible(&self, spec: &SampleSpec) -> bool {
        self.is_valid() && self.channels() == spec.channels
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.positions.iter().map(|p| p.name()).collect();
        f.write_str(&names.join(","))
    }
}
