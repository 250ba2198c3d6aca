// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Deferred hardware volume changes.
//!
//! A change requested now must reach the hardware when the audio that is
//! currently buffered has been played, so each entry carries an absolute
//! time. Increases are pushed a safety margin later and decreases a margin
//! earlier, so a change never makes already-queued audio louder than it was
//! rendered for.

use crate::volume::ChannelVolume;
use std::collections::VecDeque;
use tracing::debug;

/// A hardware volume to be written at `at` (µs, clock time).
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeChange {
    pub hw_volume: ChannelVolume,
    pub at: u64,
}

#[derive(Debug, Default)]
pub struct VolumeChangeQueue {
    changes: VecDeque<VolumeChange>,
    safety_margin: u64,
    extra_delay: u64,
}

impl VolumeChangeQueue {
    pub fn new(safety_margin: u64, extra_delay: u64) -> Self {
        Self {
            changes: VecDeque::new(),
            safety_margin,
            extra_delay,
        }
    }

    pub fn safety_margin(&self) -> u64 {
        self.safety_margin
    }

    pub fn extra_delay(&self) -> u64 {
        self.extra_delay
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeChange> {
        self.changes.iter()
    }

    /// Time of the earliest pending change.
    pub fn next_at(&self) -> Option<u64> {
        self.changes.front().map(|c| c.at)
    }

    /// Schedules `hw_volume`. Returns false if the change was dropped
    /// because nothing is pending and the hardware is already there.
    ///
    /// Every pending change scheduled after the new one is discarded.
    pub fn push(
        &mut self,
        hw_volume: ChannelVolume,
        current_hw: &ChannelVolume,
        latency: u64,
        now: u64,
    ) -> bool {
        if self.changes.is_empty() && hw_volume == *current_hw {
            debug!("Volume not changing");
            return false;
        }

        let margin = self.safety_margin;
        let new_avg = hw_volume.avg();
        let mut at = latency + now + self.extra_delay;
        let mut direction = "";
        let mut insert_after = None;

        for (pos, c) in self.changes.iter().enumerate().rev() {
            if new_avg > c.hw_volume.avg() {
                if at + margin > c.at {
                    at += margin;
                    direction = "up";
                    insert_after = Some(pos);
                    break;
                }
            } else if at.saturating_sub(margin) > c.at {
                at = at.saturating_sub(margin);
                direction = "down";
                insert_after = Some(pos);
                break;
            }
        }

        match insert_after {
            Some(pos) => self.changes.truncate(pos + 1),
            None => {
                if new_avg > current_hw.avg() {
                    at += margin;
                    direction = "up";
                } else {
                    at = at.saturating_sub(margin);
                    direction = "down";
                }
                self.changes.clear();
            }
        }

        debug!(
            "Volume going {} to {} at {}",
            direction,
            hw_volume.avg().0,
            at
        );
        self.changes.push_back(VolumeChange { hw_volume, at });
        true
    }

    /// Pops every change that is due at `now`.
    ///
    /// Returns the last popped volume, if any, and the time until the next
    /// pending change (0 when the queue is empty).
    pub fn apply(&mut self, now: u64) -> (Option<ChannelVolume>, u64) {
        let mut applied = None;

        while let Some(front) = self.changes.front() {
            if front.at > now {
                break;
            }
            if let Some(c) = self.changes.pop_front() {
                debug!("Volume change to {} at {} was written {} usec late", c.hw_volume.avg().0, c.at, now - c.at);
                applied = Some(c.hw_volume);
            }
        }

        let next = self.changes.front().map(|c| c.at - now).unwrap_or(0);
        (applied, next)
    }

    /// Moves pending changes earlier by `rewound_usec`, never before the
    /// point at which freshly rendered audio reaches the hardware.
    pub fn rewind(&mut self, rewound_usec: u64, current_hw: &ChannelVolume, latency: u64, now: u64) {
        let limit = latency + now + self.extra_delay;
        let mut prev_avg = current_hw.avg();

        for c in self.changes.iter_mut() {
            let avg = c.hw_volume.avg();
            let floor = if prev_avg > avg {
                limit.saturating_sub(self.safety_margin)
            } else {
                limit + self.safety_margin
            };

            if c.at > floor {
                c.at = c.at.saturating_sub(rewound_usec).max(floor);
            }
            prev_avg = avg;
        }
    }

    pub fn flush(&mut self) {
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;

    const MARGIN: u64 = 8_000;

    fn cv(v: u32) -> ChannelVolume {
        ChannelVolume::new(2, Volume(v))
    }

    #[test]
    fn test_unchanged_volume_is_dropped() {
        let mut q = VolumeChangeQueue::new(MARGIN, 0);
        assert!(!q.push(cv(0x8000), &cv(0x8000), 20_000, 1_000_000));
        assert!(q.is_empty());
    }

    #[test]
    fn test_increase_is_delayed_decrease_advanced() {
        let mut q = VolumeChangeQueue::new(MARGIN, 500);
        q.push(cv(0x20000), &cv(0x10000), 20_000, 1_000_000);
        assert_eq!(q.next_at(), Some(1_020_500 + MARGIN));

        let mut q = VolumeChangeQueue::new(MARGIN, 500);
        q.push(cv(0x8000), &cv(0x10000), 20_000, 1_000_000);
        assert_eq!(q.next_at(), Some(1_020_500 - MARGIN));
    }

    #[test]
    fn test_quieter_change_supersedes_pending_louder_one() {
        let current = cv(0x10000);
        let mut q = VolumeChangeQueue::new(MARGIN, 0);

        // Louder change A with a long latency.
        q.push(cv(0x18000), &current, 50_000, 1_000_000);
        let a_at = q.next_at().unwrap();

        // Quieter change B whose natural time is earlier than A's.
        q.push(cv(0x8000), &current, 10_000, 1_000_000);
        assert_eq!(q.len(), 1);
        let b_at = q.next_at().unwrap();
        assert!(b_at < a_at);

        let (applied, next) = q.apply(b_at);
        assert_eq!(applied, Some(cv(0x8000)));
        assert_eq!(next, 0);

        // Nothing left to apply at A's time.
        assert_eq!(q.apply(a_at).0, None);
    }

    #[test]
    fn test_later_change_is_appended() {
        let current = cv(0x10000);
        let mut q = VolumeChangeQueue::new(MARGIN, 0);
        q.push(cv(0x8000), &current, 10_000, 1_000_000);
        q.push(cv(0x4000), &current, 10_000, 1_100_000);
        assert_eq!(q.len(), 2);

        let first = q.next_at().unwrap();
        let (applied, next) = q.apply(first);
        assert_eq!(applied, Some(cv(0x8000)));
        assert_eq!(next, 100_000);
    }

    #[test]
    fn test_apply_pops_all_due_changes() {
        let current = cv(0x10000);
        let mut q = VolumeChangeQueue::new(MARGIN, 0);
        q.push(cv(0x8000), &current, 10_000, 1_000_000);
        q.push(cv(0x4000), &current, 10_000, 1_100_000);

        assert_eq!(q.apply(999_000), (None, 3_000));
        let (applied, next) = q.apply(2_000_000);
        assert_eq!(applied, Some(cv(0x4000)));
        assert_eq!(next, 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_rewind_clamps_to_latency() {
        let current = cv(0x10000);
        let mut q = VolumeChangeQueue::new(MARGIN, 0);
        q.push(cv(0x8000), &current, 100_000, 1_000_000);
        assert_eq!(q.next_at(), Some(1_092_000));

        q.rewind(50_000, &current, 100_000, 1_000_000);
        assert_eq!(q.next_at(), Some(1_092_000));

        q.rewind(50_000, &current, 20_000, 1_000_000);
        assert_eq!(q.next_at(), Some(1_042_000));

        q.rewind(500_000, &current, 20_000, 1_000_000);
        assert_eq!(q.next_at(), Some(1_012_000));
    }

    #[test]
    fn test_flush() {
        let mut q = VolumeChangeQueue::new(MARGIN, 0);
        q.push(cv(0x8000), &cv(0x10000), 10_000, 0);
        q.flush();
        assert!(q.is_empty());
        assert_eq!(q.apply(u64::MAX), (None, 0));
    }
}
