// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream encodings and format negotiation.

use crate::sample::{ChannelMap, SampleSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const FORMAT_SAMPLE_FORMAT: &str = "format.sample_format";
pub const FORMAT_RATE: &str = "format.rate";
pub const FORMAT_CHANNELS: &str = "format.channels";
pub const FORMAT_CHANNEL_MAP: &str = "format.channel_map";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Any,
    Pcm,
    Ac3Iec61937,
    Eac3Iec61937,
    MpegIec61937,
    DtsIec61937,
    Mpeg2AacIec61937,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Any => "any",
            Encoding::Pcm => "pcm",
            Encoding::Ac3Iec61937 => "ac3-iec61937",
            Encoding::Eac3Iec61937 => "eac3-iec61937",
            Encoding::MpegIec61937 => "mpeg-iec61937",
            Encoding::DtsIec61937 => "dts-iec61937",
            Encoding::Mpeg2AacIec61937 => "mpeg2-aac-iec61937",
        }
    }

    pub fn parse(s: &str) -> Option<Encoding> {
        [
            Encoding::Any,
            Encoding::Pcm,
            Encoding::Ac3Iec61937,
            Encoding::Eac3Iec61937,
            Encoding::MpegIec61937,
            Encoding::DtsIec61937,
            Encoding::Mpeg2AacIec61937,
        ]
        .into_iter()
        .find(|e| e.as_str() == s)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of one format property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropValue {
    Fixed(String),
    /// Any one of the listed values.
    List(Vec<String>),
    /// Any integer within the inclusive range.
    Range(i64, i64),
}

impl PropValue {
    fn is_fixed(&self) -> bool {
        matches!(self, PropValue::Fixed(_))
    }

    fn compatible(&self, other: &PropValue) -> bool {
        let (open, fixed) = match (self, other) {
            (PropValue::Fixed(a), PropValue::Fixed(b)) => return a == b,
            (a, PropValue::Fixed(b)) => (a, b),
            (PropValue::Fixed(a), b) => (b, a),
            // Two open values are never matched against each other.
            _ => return false,
        };

        match open {
            PropValue::List(values) => values.iter().any(|v| v == fixed),
            PropValue::Range(min, max) => fixed
                .parse::<i64>()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            PropValue::Fixed(_) => false,
        }
    }
}

/// An encoding plus the properties that constrain it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub encoding: Encoding,
    #[serde(default)]
    pub props: BTreeMap<String, PropValue>,
}

impl FormatInfo {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            props: BTreeMap::new(),
        }
    }

    pub fn pcm() -> Self {
        Self::new(Encoding::Pcm)
    }

    /// A fully specified PCM format.
    pub fn from_sample_spec(spec: &SampleSpec, map: Option<&ChannelMap>) -> Self {
        let mut f = Self::pcm();
        f.set(FORMAT_SAMPLE_FORMAT, PropValue::Fixed(spec.format.name().to_string()));
        f.set(FORMAT_RATE, PropValue::Fixed(spec.rate.to_string()));
        f.set(FORMAT_CHANNELS, PropValue::Fixed(spec.channels.to_string()));
        if let Some(map) = map {
            f.set(FORMAT_CHANNEL_MAP, PropValue::Fixed(map.to_string()));
        }
        f
    }

    pub fn set(&mut self, key: &str, value: PropValue) {
        self.props.insert(key.to_string(), value);
    }

    pub fn is_pcm(&self) -> bool {
        self.encoding == Encoding::Pcm
    }

    pub fn is_valid(&self) -> bool {
        self.props
            .values()
            .all(|v| !matches!(v, PropValue::Range(min, max) if min > max))
    }

    /// True if `self` can be played through `other`: same encoding, and every
    /// property of `self` is present in `other` with a matching value.
    pub fn is_compatible(&self, other: &FormatInfo) -> bool {
        if self.encoding != other.encoding {
            return false;
        }

        self.props.iter().all(|(key, value)| {
            other
                .props
                .get(key)
                .map(|o| (value.is_fixed() || o.is_fixed()) && value.compatible(o))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for FormatInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoding)?;
        for (k, v) in &self.props {
            match v {
                PropValue::Fixed(s) => write!(f, ", {}={}", k, s)?,
                PropValue::List(l) => write!(f, ", {}=[{}]", k, l.join(","))?,
                PropValue::Range(min, max) => write!(f, ", {}={}..{}", k, min, max)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    #[test]
    fn test_encoding_names() {
        assert_eq!(Encoding::parse("ac3-iec61937"), Some(Encoding::Ac3Iec61937));
        assert_eq!(Encoding::parse("bogus"), None);
        assert_eq!(Encoding::Pcm.to_string(), "pcm");
    }

    #[test]
    fn test_compatibility() {
        let spec = SampleSpec::new(SampleFormat::S16le, 48000, 2);
        let stream = FormatInfo::from_sample_spec(&spec, None);
        let mut sink = FormatInfo::pcm();
        sink.set(FORMAT_SAMPLE_FORMAT, PropValue::Fixed("s16le".into()));
        sink.set(FORMAT_RATE, PropValue::Range(8000, 96000));
        sink.set(
            FORMAT_CHANNELS,
            PropValue::List(vec!["1".into(), "2".into()]),
        );

        assert!(stream.is_compatible(&sink));
        assert!(!sink.is_compatible(&FormatInfo::pcm()));
        assert!(FormatInfo::pcm().is_compatible(&sink));
        assert!(!stream.is_compatible(&FormatInfo::new(Encoding::Ac3Iec61937)));

        let mut fast = stream.clone();
        fast.set(FORMAT_RATE, PropValue::Fixed("192000".into()));
        assert!(!fast.is_compatible(&sink));
    }
}
