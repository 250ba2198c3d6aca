// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sample mixing and in-place volume scaling.
//!
//! Integer formats are mixed in 16.16 fixed point: each stream's per-channel
//! linear factor is rounded to a multiple of 1/65536, the products are summed
//! in 64 bits and the sum is shifted back and saturated to the sample range.
//! Float formats are summed in `f64` and clamped to `[-1.0, 1.0]`.

use crate::memblock::MemChunk;
use crate::sample::{SampleFormat, SampleSpec, CHANNELS_MAX};
use crate::volume::ChannelVolume;

/// Most inputs mixed in a single render pass.
pub const MAX_MIX_CHANNELS: usize = 32;

/// Default render length when the caller passes zero.
pub const MIX_BUFFER_LENGTH: usize = 4096;

/// One input's contribution to a render pass.
#[derive(Debug, Clone)]
pub struct MixInfo {
    /// Index of the sink input the chunk was peeked from.
    pub input: u32,
    pub chunk: MemChunk,
    pub volume: ChannelVolume,
}

type Factors = [i64; CHANNELS_MAX];

fn linear_factors(volume: &ChannelVolume, soft: &ChannelVolume, channels: usize) -> [f64; CHANNELS_MAX] {
    let mut out = [0.0; CHANNELS_MAX];
    for (c, f) in out.iter_mut().enumerate().take(channels) {
        let v = if c < volume.channels() as usize {
            volume.get(c).to_linear()
        } else {
            0.0
        };
        let s = if c < soft.channels() as usize {
            soft.get(c).to_linear()
        } else {
            1.0
        };
        *f = v * s;
    }
    out
}

fn fixed_factors(linear: &[f64; CHANNELS_MAX]) -> Factors {
    let mut out = [0i64; CHANNELS_MAX];
    for (dst, src) in out.iter_mut().zip(linear.iter()) {
        *dst = (src * 65536.0).round().min(i32::MAX as f64) as i64;
    }
    out
}

fn read_int(format: SampleFormat, b: &[u8]) -> i64 {
    match format {
        SampleFormat::U8 => b[0] as i64 - 0x80,
        SampleFormat::S16le => i16::from_le_bytes([b[0], b[1]]) as i64,
        SampleFormat::S16be => i16::from_be_bytes([b[0], b[1]]) as i64,
        SampleFormat::S32le => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64,
        SampleFormat::S32be => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64,
        SampleFormat::F32le | SampleFormat::F32be => 0,
    }
}

fn write_int(format: SampleFormat, b: &mut [u8], v: i64) {
    match format {
        SampleFormat::U8 => b[0] = (v.clamp(-0x80, 0x7F) + 0x80) as u8,
        SampleFormat::S16le => {
            b.copy_from_slice(&(v.clamp(i16::MIN as i64, i16::MAX as i64) as i16).to_le_bytes())
        }
        SampleFormat::S16be => {
            b.copy_from_slice(&(v.clamp(i16::MIN as i64, i16::MAX as i64) as i16).to_be_bytes())
        }
        SampleFormat::S32le => {
            b.copy_from_slice(&(v.clamp(i32::MIN as i64, i32::MAX as i64) as i32).to_le_bytes())
        }
        SampleFormat::S32be => {
            b.copy_from_slice(&(v.clamp(i32::MIN as i64, i32::MAX as i64) as i32).to_be_bytes())
        }
        SampleFormat::F32le | SampleFormat::F32be => {}
    }
}

fn read_float(format: SampleFormat, b: &[u8]) -> f64 {
    let bytes = [b[0], b[1], b[2], b[3]];
    match format {
        SampleFormat::F32be => f32::from_be_bytes(bytes) as f64,
        _ => f32::from_le_bytes(bytes) as f64,
    }
}

fn write_float(format: SampleFormat, b: &mut [u8], v: f64) {
    let v = v.clamp(-1.0, 1.0) as f32;
    let bytes = match format {
        SampleFormat::F32be => v.to_be_bytes(),
        _ => v.to_le_bytes(),
    };
    b.copy_from_slice(&bytes);
}

fn is_float(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32le | SampleFormat::F32be)
}

/// Fills `buf` with the silence pattern of `spec`.
pub fn fill_silence(buf: &mut [u8], spec: &SampleSpec) {
    buf.fill(spec.format.silence_byte());
}

/// Mixes `streams` into `out`, applying each stream's volume and the sink's
/// soft volume. Returns the number of bytes written: the shortest stream
/// length, capped at `out.len()` and frame-aligned.
pub fn mix(
    streams: &[MixInfo],
    out: &mut [u8],
    spec: &SampleSpec,
    soft_volume: &ChannelVolume,
    muted: bool,
) -> usize {
    let length = streams
        .iter()
        .fold(out.len(), |len, s| len.min(s.chunk.length));
    let length = spec.frame_align(length);
    let out = &mut out[..length];

    if muted || streams.is_empty() {
        fill_silence(out, spec);
        return length;
    }

    let channels = spec.channels as usize;
    let ss = spec.format.sample_size();
    let linear: Vec<[f64; CHANNELS_MAX]> = streams
        .iter()
        .map(|s| linear_factors(&s.volume, soft_volume, channels))
        .collect();

    if is_float(spec.format) {
        for (n, sample) in out.chunks_exact_mut(ss).enumerate() {
            let ch = n % channels;
            let offset = n * ss;
            let sum: f64 = streams
                .iter()
                .zip(linear.iter())
                .map(|(s, f)| read_float(spec.format, &s.chunk.bytes()[offset..offset + ss]) * f[ch])
                .sum();
            write_float(spec.format, sample, sum);
        }
    } else {
        let factors: Vec<Factors> = linear.iter().map(fixed_factors).collect();
        for (n, sample) in out.chunks_exact_mut(ss).enumerate() {
            let ch = n % channels;
            let offset = n * ss;
            let mut sum: i64 = 0;
            for (s, f) in streams.iter().zip(factors.iter()) {
                let v = read_int(spec.format, &s.chunk.bytes()[offset..offset + ss]);
                sum = sum.saturating_add(v.saturating_mul(f[ch]));
            }
            write_int(spec.format, sample, sum >> 16);
        }
    }

    length
}

/// Scales `buf` in place by `volume`.
pub fn apply_volume(buf: &mut [u8], spec: &SampleSpec, volume: &ChannelVolume) {
    let channels = spec.channels as usize;
    let ss = spec.format.sample_size();
    let linear = linear_factors(volume, &ChannelVolume::norm(spec.channels), channels);

    if is_float(spec.format) {
        for (n, sample) in buf.chunks_exact_mut(ss).enumerate() {
            let v = read_float(spec.format, sample) * linear[n % channels];
            write_float(spec.format, sample, v);
        }
    } else {
        let factors = fixed_factors(&linear);
        for (n, sample) in buf.chunks_exact_mut(ss).enumerate() {
            let v = read_int(spec.format, sample).saturating_mul(factors[n % channels]);
            write_int(spec.format, sample, v >> 16);
        }
    }
}

/// Replaces both channels of every stereo frame with their average.
pub fn stereo_to_mono(buf: &mut [u8], spec: &SampleSpec) {
    if spec.channels != 2 {
        return;
    }
    let ss = spec.format.sample_size();

    for frame in buf.chunks_exact_mut(ss * 2) {
        let (l, r) = frame.split_at_mut(ss);
        if is_float(spec.format) {
            let m = (read_float(spec.format, l) + read_float(spec.format, r)) / 2.0;
            write_float(spec.format, l, m);
            write_float(spec.format, r, m);
        } else {
            let m = (read_int(spec.format, l) >> 1) + (read_int(spec.format, r) >> 1);
            write_int(spec.format, l, m);
            write_int(spec.format, r, m);
        }
    }
}

/// Applies `volume` to a chunk: unity leaves it untouched, muted swaps in
/// silence and anything else scales a private copy.
pub fn volume_memchunk(chunk: &mut MemChunk, spec: &SampleSpec, volume: &ChannelVolume) {
    if chunk.is_silence() || volume.is_norm() {
        return;
    }

    if volume.is_muted() {
        *chunk = MemChunk::silence(spec, chunk.length);
        return;
    }

    apply_volume(chunk.make_writable(), spec, volume);
}
