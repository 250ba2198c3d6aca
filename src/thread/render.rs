// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Render paths: pull from the inputs, mix, apply soft volume and feed the
//! monitor.

use super::SinkThread;
use crate::input::InputState;
use crate::memblock::{MemChunk, MAX_BLOCK_SIZE};
use crate::mix::{self, MixInfo, MAX_MIX_CHANNELS, MIX_BUFFER_LENGTH};
use crate::sink::SinkState;
use crate::volume::ChannelVolume;
use tracing::trace;

impl SinkThread {
    /// Peeks every running input. Shrinks `length` to the shortest chunk seen,
    /// silent chunks included, and returns the audible ones.
    fn fill_mix_info(&mut self, length: &mut usize) -> Vec<MixInfo> {
        let mut mixlength = *length;
        let mut info = Vec::with_capacity(self.inputs.len().min(MAX_MIX_CHANNELS));

        for (&index, input) in self.inputs.iter_mut() {
            if info.len() >= MAX_MIX_CHANNELS {
                break;
            }
            if input.state != InputState::Running {
                continue;
            }

            let Some(chunk) = input.stream.peek(*length) else {
                continue;
            };
            if chunk.length == 0 {
                continue;
            }

            if chunk.length < mixlength {
                mixlength = chunk.length;
            }

            if chunk.is_silence() {
                continue;
            }

            let volume = if input.muted {
                ChannelVolume::muted(input.soft_volume.channels())
            } else {
                input.soft_volume
            };

            info.push(MixInfo {
                input: index,
                chunk,
                volume,
            });
        }

        let aligned = self.sample_spec.frame_align(mixlength);
        if aligned > 0 {
            *length = aligned;
        }

        info
    }

    /// Advances every running input past the rendered data, feeding direct
    /// monitor outputs on the way, then posts the result to the monitor.
    fn inputs_drop(&mut self, info: &[MixInfo], result: &MemChunk) {
        let monitor_linked = self.monitor.is_linked();

        for (&index, input) in self.inputs.iter_mut() {
            if input.state != InputState::Running {
                continue;
            }

            input.stream.drop_bytes(result.length);

            if !monitor_linked || !self.monitor.has_direct_outputs(index) {
                continue;
            }

            let chunk = match info.iter().find(|m| m.input == index) {
                Some(m) => {
                    let mut c = m.chunk.clone();
                    c.truncate(result.length);
                    mix::volume_memchunk(&mut c, &self.sample_spec, &m.volume);
                    c
                }
                None => {
                    let mut c = self.silence.clone();
                    c.truncate(result.length);
                    c
                }
            };
            self.monitor.post_direct(index, &chunk);
        }

        if monitor_linked {
            self.monitor.post(result);
        }
    }

    fn silence_of(&self, length: usize) -> MemChunk {
        let mut chunk = self.silence.clone();
        if length > chunk.length {
            return MemChunk::silence(&self.sample_spec, length);
        }
        chunk.truncate(length);
        chunk
    }

    fn clamp_render_length(&self, length: usize) -> usize {
        let length = if length == 0 {
            self.sample_spec.frame_align(MIX_BUFFER_LENGTH)
        } else {
            length
        };
        length.min(self.sample_spec.frame_align(MAX_BLOCK_SIZE))
    }

    /// Renders up to `length` bytes (0 picks a default). The result may be
    /// shorter; with a single audible input it references that input's
    /// memory directly.
    pub fn render(&mut self, length: usize) -> MemChunk {
        debug_assert!(self.state.is_linked());
        debug_assert!(!self.rewind_requested && self.rewind_nbytes == 0);
        debug_assert!(self.sample_spec.is_frame_aligned(length));

        if self.state == SinkState::Suspended {
            let mut result = self.silence.clone();
            result.truncate(length);
            return result;
        }

        let mut length = self.clamp_render_length(length);
        let info = self.fill_mix_info(&mut length);

        let mut result = match info.as_slice() {
            [] => self.silence_of(length),
            [single] => {
                let mut chunk = single.chunk.clone();
                chunk.truncate(length);

                let volume = self.soft_volume.multiply(&single.volume);
                if self.soft_muted || volume.is_muted() {
                    self.silence_of(chunk.length)
                } else {
                    if !volume.is_norm() {
                        mix::apply_volume(chunk.make_writable(), &self.sample_spec, &volume);
                    }
                    chunk
                }
            }
            streams => {
                let mut buf = vec![0u8; length];
                let n = mix::mix(
                    streams,
                    &mut buf,
                    &self.sample_spec,
                    &self.soft_volume,
                    self.soft_muted,
                );
                buf.truncate(n);
                MemChunk::from_vec(buf)
            }
        };

        trace!(
            "Sink {} rendered {} bytes from {} inputs",
            self.name,
            result.length,
            info.len()
        );

        self.inputs_drop(&info, &result);

        if self.mono_downmix && self.sample_spec.channels == 2 {
            mix::stereo_to_mono(result.make_writable(), &self.sample_spec);
        }

        result
    }

    /// Renders into caller storage. Returns the number of bytes written,
    /// which may be less than `target.len()`.
    pub fn render_into(&mut self, target: &mut [u8]) -> usize {
        debug_assert!(self.state.is_linked());
        debug_assert!(!self.rewind_requested && self.rewind_nbytes == 0);

        if self.state == SinkState::Suspended {
            mix::fill_silence(target, &self.sample_spec);
            return target.len();
        }

        let mut length = target.len().min(self.sample_spec.frame_align(MAX_BLOCK_SIZE));
        if length == 0 {
            return 0;
        }
        let info = self.fill_mix_info(&mut length);
        let n = length.min(target.len());

        let written = match info.as_slice() {
            [] => {
                mix::fill_silence(&mut target[..n], &self.sample_spec);
                n
            }
            [single] => {
                let n = n.min(single.chunk.length);
                let volume = self.soft_volume.multiply(&single.volume);
                if self.soft_muted || volume.is_muted() {
                    mix::fill_silence(&mut target[..n], &self.sample_spec);
                } else {
                    target[..n].copy_from_slice(&single.chunk.bytes()[..n]);
                    if !volume.is_norm() {
                        mix::apply_volume(&mut target[..n], &self.sample_spec, &volume);
                    }
                }
                n
            }
            streams => mix::mix(
                streams,
                &mut target[..n],
                &self.sample_spec,
                &self.soft_volume,
                self.soft_muted,
            ),
        };

        let result = if self.monitor.is_linked() {
            MemChunk::from_vec(target[..written].to_vec())
        } else {
            // Only the length matters when nobody listens.
            self.silence_of(written)
        };
        self.inputs_drop(&info, &result);

        if self.mono_downmix && self.sample_spec.channels == 2 {
            mix::stereo_to_mono(&mut target[..written], &self.sample_spec);
        }

        written
    }

    /// Fills all of `target`.
    pub fn render_into_full(&mut self, target: &mut [u8]) {
        debug_assert!(self.state.is_linked());

        if self.state == SinkState::Suspended {
            mix::fill_silence(target, &self.sample_spec);
            return;
        }

        let mut done = 0;
        while done < target.len() {
            let n = self.render_into(&mut target[done..]);
            if n == 0 {
                mix::fill_silence(&mut target[done..], &self.sample_spec);
                break;
            }
            done += n;
        }
    }

    /// Renders exactly `length` bytes.
    pub fn render_full(&mut self, length: usize) -> MemChunk {
        let result = self.render(length);
        if result.length >= length {
            return result;
        }

        let have = result.length;
        let mut data = Vec::with_capacity(length);
        data.extend_from_slice(result.bytes());
        data.resize(length, 0);
        self.render_into_full(&mut data[have..]);
        MemChunk::from_vec(data)
    }
}
