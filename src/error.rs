// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type shared by all engine operations.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Name already taken: {0}")]
    NameTaken(String),
    #[error("Invalid sample spec")]
    InvalidSampleSpec,
    #[error("Invalid channel map")]
    InvalidChannelMap,
    #[error("Channel map has {map} channels but sample spec has {spec}")]
    ChannelMapMismatch { map: u8, spec: u8 },
    #[error("Invalid volume")]
    InvalidVolume,
    #[error("Volume is not compatible with the sample spec")]
    IncompatibleVolume,
    #[error("Rejected by construction hook")]
    HookRejected,
    #[error("Operation not implemented")]
    NotImplemented,
    #[error("No such entity")]
    NoEntity,
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Object is not linked")]
    NotLinked,
    #[error("No such sink: {0}")]
    NoSuchSink(u32),
    #[error("No such sink input: {0}")]
    NoSuchInput(u32),
    #[error("Volume sharing would create a cycle")]
    Cycle,
    #[error("Operation refused: {0}")]
    Refused(String),
    #[error("IO thread is gone")]
    ThreadGone,
    #[error("Failed to spawn IO thread: {0}")]
    ThreadSpawn(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;
