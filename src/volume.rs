// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Software volume scale and per-channel volume vectors.
//!
//! A [`Volume`] is a 16.16 fixed-point factor on a cubic scale: `NORM` is
//! unity gain, `MUTED` is silence, and the linear amplitude factor is the
//! cube of `volume / NORM`. Multiplying two volumes on this scale multiplies
//! their linear factors, which is what makes the reference/real/soft volume
//! layering composable.

use crate::sample::{ChannelMap, SampleSpec, CHANNELS_MAX};
use std::fmt;

/// A single volume value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Volume(pub u32);

impl Volume {
    pub const MUTED: Volume = Volume(0);
    pub const NORM: Volume = Volume(0x10000);
    pub const MAX: Volume = Volume(u32::MAX / 2);

    pub fn is_valid(self) -> bool {
        self <= Self::MAX
    }

    pub fn is_muted(self) -> bool {
        self <= Self::MUTED
    }

    pub fn is_norm(self) -> bool {
        self == Self::NORM
    }

    fn clamp(v: u64) -> Volume {
        Volume(v.min(Self::MAX.0 as u64) as u32)
    }

    /// Linear amplitude factor.
    pub fn to_linear(self) -> f64 {
        if self.is_muted() {
            return 0.0;
        }
        if self.is_norm() {
            return 1.0;
        }
        let f = self.0 as f64 / Self::NORM.0 as f64;
        f * f * f
    }

    pub fn from_linear(v: f64) -> Volume {
        if v <= 0.0 {
            return Self::MUTED;
        }
        let scaled = (v.cbrt() * Self::NORM.0 as f64).round();
        Self::clamp(scaled as u64)
    }

    pub fn to_db(self) -> f64 {
        if self.is_muted() {
            return f64::NEG_INFINITY;
        }
        20.0 * self.to_linear().log10()
    }

    pub fn from_db(db: f64) -> Volume {
        if db == f64::NEG_INFINITY {
            return Self::MUTED;
        }
        Self::from_linear(10f64.powf(db / 20.0))
    }

    /// Product of two volumes, with round-to-nearest.
    pub fn multiply(self, other: Volume) -> Volume {
        let n = Self::NORM.0 as u64;
        Self::clamp((self.0 as u64 * other.0 as u64 + n / 2) / n)
    }

    /// Quotient of two volumes. Dividing by a muted volume yields muted.
    pub fn divide(self, other: Volume) -> Volume {
        if other.is_muted() {
            return Self::MUTED;
        }
        let n = Self::NORM.0 as u64;
        let b = other.0 as u64;
        Self::clamp((self.0 as u64 * n + b / 2) / b)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let percent = (self.0 as u64 * 100 + Self::NORM.0 as u64 / 2) / Self::NORM.0 as u64;
        write!(f, "{}%", percent)
    }
}

/// Per-channel volume vector.
///
/// Only the first `channels` values are meaningful; equality ignores the
/// rest.
#[derive(Clone, Copy)]
pub struct ChannelVolume {
    channels: u8,
    values: [Volume; CHANNELS_MAX],
}

impl ChannelVolume {
    /// Every channel set to `v`.
    pub fn new(channels: u8, v: Volume) -> Self {
        debug_assert!(channels as usize <= CHANNELS_MAX);
        let mut values = [Volume::MUTED; CHANNELS_MAX];
        for value in values.iter_mut().take(channels as usize) {
            *value = v;
        }
        Self { channels, values }
    }

    pub fn norm(channels: u8) -> Self {
        Self::new(channels, Volume::NORM)
    }

    pub fn muted(channels: u8) -> Self {
        Self::new(channels, Volume::MUTED)
    }

    pub fn from_values(values: &[Volume]) -> Self {
        let mut cv = Self::new(values.len().min(CHANNELS_MAX) as u8, Volume::MUTED);
        for (dst, src) in cv.values.iter_mut().zip(values) {
            *dst = *src;
        }
        cv
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn values(&self) -> &[Volume] {
        &self.values[..self.channels as usize]
    }

    pub fn get(&self, channel: usize) -> Volume {
        self.values()[channel]
    }

    pub fn set(&mut self, channel: usize, v: Volume) {
        debug_assert!(channel < self.channels as usize);
        self.values[channel] = v;
    }

    pub fn is_valid(&self) -> bool {
        self.channels > 0
            && self.channels as usize <= CHANNELS_MAX
            && self.values().iter().all(|v| v.is_valid())
    }

    pub fn is_compatible(&self, spec: &SampleSpec) -> bool {
        self.is_valid() && self.channels == spec.channels
    }

    pub fn is_compatible_with_map(&self, map: &ChannelMap) -> bool {
        self.is_valid() && self.channels == map.channels()
    }

    /// True if every channel is at `v`.
    pub fn channels_equal_to(&self, v: Volume) -> bool {
        self.values().iter().all(|c| *c == v)
    }

    pub fn is_muted(&self) -> bool {
        self.channels_equal_to(Volume::MUTED)
    }

    pub fn is_norm(&self) -> bool {
        self.channels_equal_to(Volume::NORM)
    }

    pub fn avg(&self) -> Volume {
        if self.channels == 0 {
            return Volume::MUTED;
        }
        let sum: u64 = self.values().iter().map(|v| v.0 as u64).sum();
        Volume((sum / self.channels as u64) as u32)
    }

    pub fn max(&self) -> Volume {
        self.values().iter().copied().max().unwrap_or(Volume::MUTED)
    }

    pub fn min(&self) -> Volume {
        self.values().iter().copied().min().unwrap_or(Volume::MUTED)
    }

    /// Channel-wise maximum over the common channels.
    pub fn merge(&self, other: &ChannelVolume) -> ChannelVolume {
        let channels = self.channels.min(other.channels);
        let mut out = ChannelVolume::new(channels, Volume::MUTED);
        for i in 0..channels as usize {
            out.values[i] = self.values[i].max(other.values[i]);
        }
        out
    }

    /// Rescales so the loudest channel becomes `max`, keeping the balance.
    pub fn scale(&self, max: Volume) -> ChannelVolume {
        let current = self.max();
        if current.is_muted() {
            return ChannelVolume::new(self.channels, max);
        }
        let mut out = *self;
        for v in out.values.iter_mut().take(self.channels as usize) {
            *v = Volume::clamp(v.0 as u64 * max.0 as u64 / current.0 as u64);
        }
        out
    }

    pub fn multiply(&self, other: &ChannelVolume) -> ChannelVolume {
        let channels = self.channels.min(other.channels);
        let mut out = ChannelVolume::new(channels, Volume::MUTED);
        for i in 0..channels as usize {
            out.values[i] = self.values[i].multiply(other.values[i]);
        }
        out
    }

    pub fn multiply_scalar(&self, v: Volume) -> ChannelVolume {
        let mut out = *self;
        for c in out.values.iter_mut().take(self.channels as usize) {
            *c = c.multiply(v);
        }
        out
    }

    pub fn divide(&self, other: &ChannelVolume) -> ChannelVolume {
        let channels = self.channels.min(other.channels);
        let mut out = ChannelVolume::new(channels, Volume::MUTED);
        for i in 0..channels as usize {
            out.values[i] = self.values[i].divide(other.values[i]);
        }
        out
    }

    /// Converts a volume laid out for `from` into the layout of `to`.
    ///
    /// A target channel takes the average of source channels at the same
    /// position, else the average of source channels on the same side, else
    /// the overall average.
    pub fn remap(&self, from: &ChannelMap, to: &ChannelMap) -> ChannelVolume {
        debug_assert_eq!(from.channels(), self.channels);

        if from == to {
            return *self;
        }

        let mut out = ChannelVolume::new(to.channels(), Volume::MUTED);
        for (a, &target) in to.positions().iter().enumerate() {
            let mut sum: u64 = 0;
            let mut n: u64 = 0;

            for (b, &source) in from.positions().iter().enumerate() {
                if source == target {
                    sum += self.values[b].0 as u64;
                    n += 1;
                }
            }

            if n == 0 {
                for (b, &source) in from.positions().iter().enumerate() {
                    let same_side = (source.is_left() && target.is_left())
                        || (source.is_right() && target.is_right())
                        || (source.is_center() && target.is_center())
                        || (source.is_lfe() && target.is_lfe());
                    if same_side {
                        sum += self.values[b].0 as u64;
                        n += 1;
                    }
                }
            }

            out.values[a] = if n == 0 {
                self.avg()
            } else {
                Volume((sum / n) as u32)
            };
        }
        out
    }

    /// Remaps `self` with the least audible change.
    ///
    /// If `template` already maps onto `self`, the template is returned.
    /// Otherwise every channel of the result is set to the loudest channel
    /// of `self`.
    pub fn remap_minimal_impact(
        &self,
        template: &ChannelVolume,
        from: &ChannelMap,
        to: &ChannelMap,
    ) -> ChannelVolume {
        debug_assert_eq!(template.channels, to.channels());

        if from == to {
            return *self;
        }

        if template.remap(to, from) == *self {
            return *template;
        }

        ChannelVolume::new(to.channels(), self.max())
    }
}

impl PartialEq for ChannelVolume {
    fn eq(&self, other: &Self) -> bool {
        self.channels == other.channels && self.values() == other.values()
    }
}

impl Eq for ChannelVolume {}

impl fmt::Debug for ChannelVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values().iter().map(|v| v.0)).finish()
    }
}

impl fmt::Display for ChannelVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.values().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}: {}", i, v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ChannelPosition;

    #[test]
    fn test_linear_mapping_is_cubic() {
        assert_eq!(Volume::NORM.to_linear(), 1.0);
        assert_eq!(Volume::MUTED.to_linear(), 0.0);
        let half = Volume(Volume::NORM.0 / 2);
        assert!((half.to_linear() - 0.125).abs() < 1e-9);
        assert_eq!(Volume::from_linear(0.125), half);
        assert_eq!(Volume::from_linear(1.0), Volume::NORM);
        assert_eq!(Volume::from_linear(-1.0), Volume::MUTED);
    }

    #[test]
    fn test_db_conversion() {
        assert_eq!(Volume::NORM.to_db(), 0.0);
        assert_eq!(Volume::MUTED.to_db(), f64::NEG_INFINITY);
        assert_eq!(Volume::from_db(0.0), Volume::NORM);
        let v = Volume::from_db(-6.0);
        assert!((v.to_db() + 6.0).abs() < 0.01);
    }

    #[test]
    fn test_multiply_divide() {
        let half = Volume(0x8000);
        assert_eq!(Volume::NORM.multiply(half), half);
        assert_eq!(half.multiply(half), Volume(0x4000));
        assert_eq!(half.divide(Volume::NORM), half);
        assert_eq!(Volume(0x4000).divide(half), half);
        assert_eq!(half.divide(Volume::MUTED), Volume::MUTED);
        assert_eq!(Volume::MAX.multiply(Volume::MAX), Volume::MAX);
    }

    #[test]
    fn test_aggregates() {
        let cv = ChannelVolume::from_values(&[Volume(100), Volume(300)]);
        assert_eq!(cv.avg(), Volume(200));
        assert_eq!(cv.max(), Volume(300));
        assert_eq!(cv.min(), Volume(100));
    }

    #[test]
    fn test_equality_ignores_unused_channels() {
        let mut a = ChannelVolume::new(2, Volume::NORM);
        let b = ChannelVolume::new(2, Volume::NORM);
        a.values[5] = Volume(7);
        assert_eq!(a, b);
        assert_ne!(a, ChannelVolume::new(3, Volume::NORM));
    }

    #[test]
    fn test_merge_and_scale() {
        let a = ChannelVolume::from_values(&[Volume(100), Volume(500)]);
        let b = ChannelVolume::from_values(&[Volume(200), Volume(400), Volume(900)]);
        assert_eq!(
            a.merge(&b),
            ChannelVolume::from_values(&[Volume(200), Volume(500)])
        );

        let scaled = a.scale(Volume(1000));
        assert_eq!(
            scaled,
            ChannelVolume::from_values(&[Volume(200), Volume(1000)])
        );

        let silent = ChannelVolume::muted(2).scale(Volume(42));
        assert!(silent.channels_equal_to(Volume(42)));
    }

    #[test]
    fn test_remap_stereo_mono() {
        let stereo = ChannelMap::stereo();
        let mono = ChannelMap::mono();
        let v = ChannelVolume::from_values(&[Volume(100), Volume(300)]);

        assert_eq!(v.remap(&stereo, &stereo), v);
        assert_eq!(
            v.remap(&stereo, &mono),
            ChannelVolume::from_values(&[Volume(200)])
        );

        let m = ChannelVolume::from_values(&[Volume(50)]);
        assert_eq!(
            m.remap(&mono, &stereo),
            ChannelVolume::from_values(&[Volume(50), Volume(50)])
        );
    }

    #[test]
    fn test_remap_uses_sides() {
        use ChannelPosition::*;
        let quad = ChannelMap::new(vec![FrontLeft, FrontRight, RearLeft, RearRight]);
        let side = ChannelMap::new(vec![SideLeft, SideRight]);
        let v = ChannelVolume::from_values(&[Volume(100), Volume(200), Volume(300), Volume(400)]);
        assert_eq!(
            v.remap(&quad, &side),
            ChannelVolume::from_values(&[Volume(200), Volume(300)])
        );
    }

    #[test]
    fn test_remap_minimal_impact() {
        let stereo = ChannelMap::stereo();
        let mono = ChannelMap::mono();

        let v = ChannelVolume::from_values(&[Volume(200)]);
        let template = ChannelVolume::from_values(&[Volume(200), Volume(200)]);
        assert_eq!(v.remap_minimal_impact(&template, &mono, &stereo), template);

        let other = ChannelVolume::from_values(&[Volume(100), Volume(500)]);
        assert_eq!(
            v.remap_minimal_impact(&other, &mono, &stereo),
            ChannelVolume::new(2, Volume(200))
        );
    }
}
