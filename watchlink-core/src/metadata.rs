//! Fixed-layout values stored in BlobDB: app metadata, activity preferences, unit preference.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blobdb::BlobItem;

/// Encoded size of an app metadata record.
pub const APP_METADATA_LEN: usize = 16 + 4 + 4 + 2 + 2 + 2 + APP_NAME_LEN;
/// Fixed width of the name field, NUL padded.
pub const APP_NAME_LEN: usize = 96;

/// AppSettings key for activity preferences.
pub const HEALTH_PARAMS_KEY: &[u8] = b"activityPreferences";
/// AppSettings key for the distance unit preference.
pub const UNITS_KEY: &[u8] = b"unitsDistance";

/// Watch hardware platform, negotiated on connect. Selects which app binary the metadata describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwarePlatform {
    Aplite,
    Basalt,
    Chalk,
    Diorite,
    Emery,
}

impl HardwarePlatform {
    pub fn name(self) -> &'static str {
        match self {
            HardwarePlatform::Aplite => "aplite",
            HardwarePlatform::Basalt => "basalt",
            HardwarePlatform::Chalk => "chalk",
            HardwarePlatform::Diorite => "diorite",
            HardwarePlatform::Emery => "emery",
        }
    }
}

impl FromStr for HardwarePlatform {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aplite" => Ok(HardwarePlatform::Aplite),
            "basalt" => Ok(HardwarePlatform::Basalt),
            "chalk" => Ok(HardwarePlatform::Chalk),
            "diorite" => Ok(HardwarePlatform::Diorite),
            "emery" => Ok(HardwarePlatform::Emery),
            _ => Err(MetadataError::UnknownPlatform(s.to_string())),
        }
    }
}

/// Process flags as the watch firmware reads them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppFlags {
    pub watchface: bool,
    pub hidden: bool,
    pub shown_on_communication: bool,
    /// Companion JavaScript present (this is what makes an app configurable).
    pub javascript: bool,
    pub worker: bool,
}

impl AppFlags {
    pub const WATCHFACE: u32 = 1 << 0;
    pub const HIDDEN: u32 = 1 << 1;
    pub const SHOWN_ON_COMMUNICATION: u32 = 1 << 2;
    pub const JAVASCRIPT: u32 = 1 << 3;
    pub const WORKER: u32 = 1 << 4;

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.watchface {
            bits |= Self::WATCHFACE;
        }
        if self.hidden {
            bits |= Self::HIDDEN;
        }
        if self.shown_on_communication {
            bits |= Self::SHOWN_ON_COMMUNICATION;
        }
        if self.javascript {
            bits |= Self::JAVASCRIPT;
        }
        if self.worker {
            bits |= Self::WORKER;
        }
        bits
    }
}

/// What the app package says about the binary built for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformBinary {
    pub sdk_major: u8,
    pub sdk_minor: u8,
    pub icon_resource_id: u32,
}

/// Installed app as known to the app-management side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub uuid: Uuid,
    pub short_name: String,
    #[serde(default)]
    pub flags: AppFlags,
    pub version_major: u8,
    pub version_minor: u8,
    pub binaries: HashMap<HardwarePlatform, PlatformBinary>,
}

/// The App database record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetadata {
    pub uuid: Uuid,
    pub flags: u32,
    pub icon: u32,
    pub app_version: (u8, u8),
    pub sdk_version: (u8, u8),
    pub app_face_bg_color: u8,
    pub app_face_template_id: u8,
    pub name: String,
}

impl AppMetadata {
    pub fn from_app_info(info: &AppInfo, platform: HardwarePlatform) -> Result<Self, MetadataError> {
        let binary = info
            .binaries
            .get(&platform)
            .ok_or(MetadataError::NoBinary {
                uuid: info.uuid,
                platform,
            })?;
        Ok(Self {
            uuid: info.uuid,
            flags: info.flags.bits(),
            icon: binary.icon_resource_id,
            app_version: (info.version_major, info.version_minor),
            sdk_version: (binary.sdk_major, binary.sdk_minor),
            app_face_bg_color: 0,
            app_face_template_id: 0,
            name: info.short_name.clone(),
        })
    }

    /// `uuid | flags LE | icon LE | app ver | sdk ver | bg color | template | name[96]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(APP_METADATA_LEN);
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.icon.to_le_bytes());
        out.push(self.app_version.0);
        out.push(self.app_version.1);
        out.push(self.sdk_version.0);
        out.push(self.sdk_version.1);
        out.push(self.app_face_bg_color);
        out.push(self.app_face_template_id);
        write_fixed_str(&mut out, &self.name, APP_NAME_LEN);
        out
    }
}

impl BlobItem for AppMetadata {
    fn key(&self) -> Vec<u8> {
        self.uuid.as_bytes().to_vec()
    }

    fn value(&self) -> Vec<u8> {
        self.encode()
    }
}

/// Write `s` into exactly `width` bytes, keeping at least one trailing NUL.
/// Cuts on a char boundary.
fn write_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let mut end = s.len().min(width.saturating_sub(1));
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    if end < s.len() {
        tracing::debug!(name = s, "app name cut to {} bytes", end);
    }
    out.extend_from_slice(&s.as_bytes()[..end]);
    out.resize(out.len() + (width - end), 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female = 0,
    Male = 1,
    #[default]
    Other = 2,
}

/// Activity preferences for the health app, in the units the watch stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthParams {
    pub enabled: bool,
    pub height_mm: u16,
    /// Decagrams (kg * 100).
    pub weight_dag: u16,
    #[serde(default)]
    pub activity_insights: bool,
    #[serde(default)]
    pub sleep_insights: bool,
    pub age_years: u8,
    #[serde(default)]
    pub gender: Gender,
}

impl HealthParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.extend_from_slice(&self.height_mm.to_le_bytes());
        out.extend_from_slice(&self.weight_dag.to_le_bytes());
        out.push(self.enabled as u8);
        out.push(self.activity_insights as u8);
        out.push(self.sleep_insights as u8);
        out.push(self.age_years);
        out.push(self.gender as u8);
        out
    }
}

impl BlobItem for HealthParams {
    fn key(&self) -> Vec<u8> {
        HEALTH_PARAMS_KEY.to_vec()
    }

    fn value(&self) -> Vec<u8> {
        self.encode()
    }
}

/// Distance unit preference value: 1 imperial, 0 metric.
pub fn encode_units(imperial: bool) -> Vec<u8> {
    vec![imperial as u8]
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("app {uuid} has no binary for {}", platform.name())]
    NoBinary {
        uuid: Uuid,
        platform: HardwarePlatform,
    },
    #[error("unknown hardware platform {0:?}")]
    UnknownPlatform(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app(name: &str) -> AppInfo {
        let mut binaries = HashMap::new();
        binaries.insert(
            HardwarePlatform::Basalt,
            PlatformBinary {
                sdk_major: 5,
                sdk_minor: 86,
                icon_resource_id: 0x0102_0304,
            },
        );
        AppInfo {
            uuid: Uuid::from_bytes([0x11; 16]),
            short_name: name.to_string(),
            flags: AppFlags {
                watchface: true,
                javascript: true,
                ..AppFlags::default()
            },
            version_major: 2,
            version_minor: 7,
            binaries,
        }
    }

    #[test]
    fn app_metadata_layout() {
        let meta =
            AppMetadata::from_app_info(&sample_app("Tic"), HardwarePlatform::Basalt).unwrap();
        let bytes = meta.encode();
        assert_eq!(bytes.len(), APP_METADATA_LEN);
        assert_eq!(bytes.len(), 126);
        assert_eq!(&bytes[..16], &[0x11; 16]);
        assert_eq!(&bytes[16..20], &[0x09, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[24..30], &[2, 7, 5, 86, 0, 0]);
        assert_eq!(&bytes[30..33], b"Tic");
        assert!(bytes[33..].iter().all(|&b| b == 0));
        assert_eq!(meta.key(), vec![0x11; 16]);
    }

    #[test]
    fn missing_platform_binary() {
        let err =
            AppMetadata::from_app_info(&sample_app("Tic"), HardwarePlatform::Aplite).unwrap_err();
        assert!(matches!(
            err,
            MetadataError::NoBinary {
                platform: HardwarePlatform::Aplite,
                ..
            }
        ));
    }

    #[test]
    fn long_name_keeps_terminator_and_char_boundary() {
        let name = format!("{}é", "a".repeat(94));
        let meta = AppMetadata::from_app_info(&sample_app(&name), HardwarePlatform::Basalt)
            .unwrap();
        let bytes = meta.encode();
        assert_eq!(bytes.len(), APP_METADATA_LEN);
        let field = &bytes[30..];
        assert_eq!(&field[..94], "a".repeat(94).as_bytes());
        assert_eq!(field[94], 0);
        assert_eq!(field[95], 0);
    }

    #[test]
    fn flag_bits() {
        let flags = AppFlags {
            hidden: true,
            worker: true,
            ..AppFlags::default()
        };
        assert_eq!(flags.bits(), AppFlags::HIDDEN | AppFlags::WORKER);
    }

    #[test]
    fn health_params_layout() {
        let params = HealthParams {
            enabled: true,
            height_mm: 1800,
            weight_dag: 7500,
            activity_insights: false,
            sleep_insights: true,
            age_years: 34,
            gender: Gender::Male,
        };
        assert_eq!(
            params.encode(),
            vec![0x08, 0x07, 0x4C, 0x1D, 1, 0, 1, 34, 1]
        );
        assert_eq!(params.key(), b"activityPreferences".to_vec());
    }

    #[test]
    fn units_and_platform_parse() {
        assert_eq!(encode_units(true), vec![1]);
        assert_eq!(encode_units(false), vec![0]);
        assert_eq!("Chalk".parse::<HardwarePlatform>(), Ok(HardwarePlatform::Chalk));
        assert!("pebble".parse::<HardwarePlatform>().is_err());
    }
}
