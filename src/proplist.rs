// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! String key/value metadata attached to sinks, monitors and inputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEVICE_DESCRIPTION: &str = "device.description";
pub const DEVICE_CLASS: &str = "device.class";
pub const DEVICE_FORM_FACTOR: &str = "device.form_factor";
pub const DEVICE_BUS: &str = "device.bus";
pub const DEVICE_ICON_NAME: &str = "device.icon_name";
pub const DEVICE_INTENDED_ROLES: &str = "device.intended_roles";
pub const DEVICE_PRODUCT_NAME: &str = "device.product.name";
pub const DEVICE_PROFILE_NAME: &str = "device.profile.name";
pub const DEVICE_PROFILE_DESCRIPTION: &str = "device.profile.description";
pub const DEVICE_MASTER_DEVICE: &str = "device.master_device";
pub const MEDIA_NAME: &str = "media.name";
pub const MEDIA_ROLE: &str = "media.role";

/// How [`Proplist::update`] combines two lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Drop every existing entry, then copy the other list.
    Set,
    /// Add entries whose key is not present yet.
    Merge,
    /// Add every entry, overwriting existing keys.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proplist(BTreeMap<String, String>);

impl Proplist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn unset(&mut self, key: &str) -> bool {
        self.0.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn update(&mut self, mode: UpdateMode, other: &Proplist) {
        match mode {
            UpdateMode::Set => self.0 = other.0.clone(),
            UpdateMode::Merge => {
                for (k, v) in &other.0 {
                    self.0.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            UpdateMode::Replace => {
                for (k, v) in &other.0 {
                    self.0.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Proplist {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Derives a human readable description from form factor, class and product
/// name. Returns false if nothing suitable was found.
pub fn device_init_description(p: &mut Proplist) -> bool {
    if p.contains(DEVICE_DESCRIPTION) {
        return true;
    }

    let mut d = match p.get(DEVICE_FORM_FACTOR) {
        Some("internal") => Some("Built-in Audio".to_string()),
        _ => None,
    };
    if d.is_none() && p.get(DEVICE_CLASS) == Some("modem") {
        d = Some("Modem".to_string());
    }
    if d.is_none() {
        d = p.get(DEVICE_PRODUCT_NAME).map(str::to_string);
    }

    let Some(d) = d else {
        return false;
    };

    let description = match p.get(DEVICE_PROFILE_DESCRIPTION) {
        Some(k) => format!("{} {}", d, k),
        None => d,
    };
    p.set(DEVICE_DESCRIPTION, description);
    true
}

/// Picks an icon name from form factor, class, profile and bus.
pub fn device_init_icon(p: &mut Proplist, is_sink: bool) -> bool {
    if p.contains(DEVICE_ICON_NAME) {
        return true;
    }

    let mut t = p.get(DEVICE_FORM_FACTOR).and_then(|ff| match ff {
        "microphone" => Some("audio-input-microphone"),
        "webcam" => Some("camera-web"),
        "computer" => Some("computer"),
        "handset" => Some("phone"),
        "portable" => Some("multimedia-player"),
        "tv" => Some("video-display"),
        "headset" => Some("audio-headset"),
        "headphone" => Some("audio-headphones"),
        "speaker" => Some("audio-speakers"),
        "hands-free" => Some("audio-handsfree"),
        _ => None,
    });
    if t.is_none() && p.get(DEVICE_CLASS) == Some("modem") {
        t = Some("modem");
    }
    let t = t.unwrap_or(if is_sink {
        "audio-card"
    } else {
        "audio-input-microphone"
    });

    let suffix = match p.get(DEVICE_PROFILE_NAME) {
        Some(profile) if profile.contains("analog") => "-analog",
        Some(profile) if profile.contains("iec958") => "-iec958",
        Some(profile) if profile.contains("hdmi") => "-hdmi",
        _ => "",
    };

    let icon = match p.get(DEVICE_BUS) {
        Some(bus) => format!("{}{}-{}", t, suffix, bus),
        None => format!("{}{}", t, suffix),
    };
    p.set(DEVICE_ICON_NAME, icon);
    true
}

/// Marks telephony form factors with the "phone" role.
pub fn device_init_intended_roles(p: &mut Proplist) -> bool {
    if p.contains(DEVICE_INTENDED_ROLES) {
        return true;
    }

    match p.get(DEVICE_FORM_FACTOR) {
        Some("handset") | Some("hands-free") | Some("headset") => {
            p.set(DEVICE_INTENDED_ROLES, "phone");
            true
        }
        _ => false,
    }
}

/// Scores a device for default-device selection.
pub fn device_init_priority(p: &Proplist) -> u32 {
    let mut priority = 0;

    match p.get(DEVICE_CLASS) {
        Some("sound") => priority += 9000,
        Some("modem") | None => {}
        Some(_) => priority += 1000,
    }

    priority += match p.get(DEVICE_FORM_FACTOR) {
        Some("internal") => 900,
        Some("speaker") => 500,
        Some("headphone") => 400,
        _ => 0,
    };

    priority += match p.get(DEVICE_BUS) {
        Some("pci") => 50,
        Some("usb") => 40,
        Some("bluetooth") => 30,
        _ => 0,
    };

    priority += match p.get(DEVICE_PROFILE_NAME) {
        Some(s) if s.starts_with("analog-") => 9,
        Some(s) if s.starts_with("iec958-") => 8,
        _ => 0,
    };

    priority
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_modes() {
        let mut a: Proplist = [("a", "1"), ("b", "2")].into_iter().collect();
        let b: Proplist = [("b", "3"), ("c", "4")].into_iter().collect();

        let mut merged = a.clone();
        merged.update(UpdateMode::Merge, &b);
        assert_eq!(merged.get("b"), Some("2"));
        assert_eq!(merged.get("c"), Some("4"));

        let mut replaced = a.clone();
        replaced.update(UpdateMode::Replace, &b);
        assert_eq!(replaced.get("b"), Some("3"));
        assert_eq!(replaced.get("a"), Some("1"));

        a.update(UpdateMode::Set, &b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_description_from_product_and_profile() {
        let mut p: Proplist = [
            (DEVICE_PRODUCT_NAME, "USB Audio"),
            (DEVICE_PROFILE_DESCRIPTION, "Analog Stereo"),
        ]
        .into_iter()
        .collect();
        assert!(device_init_description(&mut p));
        assert_eq!(p.get(DEVICE_DESCRIPTION), Some("USB Audio Analog Stereo"));

        let mut empty = Proplist::new();
        assert!(!device_init_description(&mut empty));
    }

    #[test]
    fn test_icon_and_roles() {
        let mut p: Proplist = [
            (DEVICE_FORM_FACTOR, "headset"),
            (DEVICE_BUS, "bluetooth"),
        ]
        .into_iter()
        .collect();
        device_init_icon(&mut p, true);
        assert_eq!(p.get(DEVICE_ICON_NAME), Some("audio-headset-bluetooth"));
        assert!(device_init_intended_roles(&mut p));
        assert_eq!(p.get(DEVICE_INTENDED_ROLES), Some("phone"));
    }

    #[test]
    fn test_priority() {
        let p: Proplist = [
            (DEVICE_CLASS, "sound"),
            (DEVICE_FORM_FACTOR, "internal"),
            (DEVICE_BUS, "pci"),
            (DEVICE_PROFILE_NAME, "analog-stereo"),
        ]
        .into_iter()
        .collect();
        assert_eq!(device_init_priority(&p), 9959);
        assert_eq!(device_init_priority(&Proplist::new()), 0);
    }
}
