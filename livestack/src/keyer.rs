//! Role classification and composite key derivation.
//!
//! Keys are pure functions of an exposure's acquisition setup. Exposure time is rounded to
//! two decimals and sensor temperature is bucketed to the nearest 5 degrees, so frames
//! taken within the same bucket share one composite.

use std::fmt;

use strum_macros::{Display, EnumIter};
use thiserror::Error;

use crate::frame::FrameMetadata;

/// Placeholder filter name used when a LIGHT or FLAT declares none.
pub const NO_FILTER: &str = "NONE";

/// Width of a temperature bucket, in degrees.
pub const TEMPERATURE_BUCKET: f64 = 5.0;

/// Acquisition role of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Role {
    Light,
    Dark,
    Flat,
    Unknown,
}

impl Role {
    /// Resolves a declared image type by case-insensitive substring, checked in the order
    /// light, dark, flat.
    pub fn from_declared(declared: &str) -> Self {
        let declared = declared.to_lowercase();
        if declared.contains("light") {
            Role::Light
        } else if declared.contains("dark") {
            Role::Dark
        } else if declared.contains("flat") {
            Role::Flat
        } else {
            Role::Unknown
        }
    }

    /// Image type written into persisted composites of this role.
    pub fn declared_name(self) -> Option<&'static str> {
        match self {
            Role::Light => Some("Light Frame"),
            Role::Dark => Some("Dark Frame"),
            Role::Flat => Some("Flat Frame"),
            Role::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum KeyError {
    #[error("light frame from camera '{camera}' declares no target")]
    MissingTarget { camera: String },
}

/// Identifier of one composite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as a file name stem. Bytes outside `[A-Za-z0-9._-]` are percent-encoded, so
    /// distinct keys never share a file.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
                stem.push(byte as char);
            } else {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
        stem
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CompositeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalized acquisition setup of an exposure: the fields keys are built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Setup {
    pub role: Role,
    pub camera: String,
    /// Exposure seconds rounded to two decimals.
    pub exposure: f64,
    pub gain: i64,
    /// Temperature bucket in degrees.
    pub temperature: i64,
    /// LIGHT only.
    pub target: Option<String>,
    /// LIGHT and FLAT only, `NONE` when undeclared.
    pub filter: Option<String>,
}

impl Setup {
    /// Key of the composite this setup merges into. `None` for UNKNOWN.
    pub fn composite_key(&self) -> Option<CompositeKey> {
        let key = match self.role {
            Role::Light => format!(
                "{}_{}_{}_{}_{}_{}_{}",
                self.camera,
                self.role,
                self.target.as_deref().unwrap_or_default(),
                self.filter_name(),
                format_exposure(self.exposure),
                self.gain,
                self.temperature
            ),
            Role::Dark => self.dark_key_text(),
            Role::Flat => self.flat_key_text(),
            Role::Unknown => return None,
        };
        Some(CompositeKey(key))
    }

    /// Key of the DARK composite that calibrates this setup.
    pub fn dark_key(&self) -> Option<CompositeKey> {
        match self.role {
            Role::Light | Role::Flat => Some(CompositeKey(self.dark_key_text())),
            Role::Dark | Role::Unknown => None,
        }
    }

    /// Key of the FLAT composite that calibrates this setup.
    pub fn flat_key(&self) -> Option<CompositeKey> {
        match self.role {
            Role::Light => Some(CompositeKey(self.flat_key_text())),
            Role::Dark | Role::Flat | Role::Unknown => None,
        }
    }

    /// Metadata written alongside a composite with this setup. Classifying the result
    /// yields the same keys.
    pub fn to_metadata(&self, sample_count: u32) -> FrameMetadata {
        FrameMetadata {
            camera: self.camera.clone(),
            exposure: self.exposure,
            gain: self.gain,
            temperature: self.temperature as f64,
            image_type: self.role.declared_name().unwrap_or_default().to_string(),
            target: self.target.clone(),
            filter: self.filter.clone(),
            bayer_pattern: None,
            sample_count: Some(sample_count),
        }
    }

    fn filter_name(&self) -> &str {
        self.filter.as_deref().unwrap_or(NO_FILTER)
    }

    fn dark_key_text(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.camera,
            Role::Dark,
            format_exposure(self.exposure),
            self.gain,
            self.temperature
        )
    }

    fn flat_key_text(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.camera,
            Role::Flat,
            self.filter_name(),
            self.gain,
            self.temperature
        )
    }
}

/// Result of classifying one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub setup: Setup,
    pub key: Option<CompositeKey>,
    pub dark_key: Option<CompositeKey>,
    pub flat_key: Option<CompositeKey>,
}

impl Classification {
    pub fn role(&self) -> Role {
        self.setup.role
    }
}

/// Derives role and keys from exposure metadata.
pub fn classify(metadata: &FrameMetadata) -> Result<Classification, KeyError> {
    let role = Role::from_declared(&metadata.image_type);

    let target = match role {
        Role::Light => match non_empty(metadata.target.as_deref()) {
            Some(target) => Some(target.to_string()),
            None => {
                return Err(KeyError::MissingTarget {
                    camera: metadata.camera.clone(),
                })
            }
        },
        Role::Dark | Role::Flat | Role::Unknown => None,
    };
    let filter = match role {
        Role::Light | Role::Flat => Some(
            non_empty(metadata.filter.as_deref())
                .unwrap_or(NO_FILTER)
                .to_string(),
        ),
        Role::Dark | Role::Unknown => None,
    };

    let setup = Setup {
        role,
        camera: metadata.camera.trim().to_string(),
        exposure: round_exposure(metadata.exposure),
        gain: metadata.gain,
        temperature: temperature_bucket(metadata.temperature),
        target,
        filter,
    };

    Ok(Classification {
        key: setup.composite_key(),
        dark_key: setup.dark_key(),
        flat_key: setup.flat_key(),
        setup,
    })
}

/// Rounds to two decimals, ties to even.
pub fn round_exposure(exposure: f64) -> f64 {
    (exposure * 100.0).round_ties_even() / 100.0
}

/// Nearest multiple of [`TEMPERATURE_BUCKET`], ties to even.
pub fn temperature_bucket(temperature: f64) -> i64 {
    ((temperature / TEMPERATURE_BUCKET).round_ties_even() * TEMPERATURE_BUCKET) as i64
}

/// Shortest decimal form with at least one fractional digit: `30.0`, `0.5`, `120.25`.
pub fn format_exposure(exposure: f64) -> String {
    if exposure.fract() == 0.0 {
        format!("{exposure:.1}")
    } else {
        format!("{exposure}")
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(image_type: &str) -> FrameMetadata {
        FrameMetadata {
            camera: "CamA".to_string(),
            exposure: 30.0,
            gain: 100,
            temperature: -10.0,
            image_type: image_type.to_string(),
            target: None,
            filter: None,
            bayer_pattern: None,
            sample_count: None,
        }
    }

    fn key(value: &Option<CompositeKey>) -> &str {
        value.as_ref().map(CompositeKey::as_str).unwrap_or("<none>")
    }

    #[test]
    fn role_resolution_is_case_insensitive_substring() {
        assert_eq!(Role::from_declared("Light Frame"), Role::Light);
        assert_eq!(Role::from_declared("DARK"), Role::Dark);
        assert_eq!(Role::from_declared("flat field"), Role::Flat);
        assert_eq!(Role::from_declared("Bias Frame"), Role::Unknown);
        assert_eq!(Role::from_declared(""), Role::Unknown);
        // light is checked first
        assert_eq!(Role::from_declared("dark light"), Role::Light);
    }

    #[test]
    fn declared_names_resolve_back_to_their_role() {
        use strum::IntoEnumIterator;

        for role in Role::iter() {
            match role.declared_name() {
                Some(name) => assert_eq!(Role::from_declared(name), role),
                None => assert_eq!(role, Role::Unknown),
            }
        }
    }

    #[test]
    fn dark_key_layout() {
        let classification = classify(&metadata("Dark Frame")).unwrap();

        assert_eq!(classification.role(), Role::Dark);
        assert_eq!(key(&classification.key), "CamA_DARK_30.0_100_-10");
        assert_eq!(classification.dark_key, None);
        assert_eq!(classification.flat_key, None);
    }

    #[test]
    fn flat_key_layout_and_calibration() {
        let mut meta = metadata("Flat Frame");
        meta.filter = Some("Ha".to_string());
        let classification = classify(&meta).unwrap();

        assert_eq!(key(&classification.key), "CamA_FLAT_Ha_100_-10");
        assert_eq!(key(&classification.dark_key), "CamA_DARK_30.0_100_-10");
        assert_eq!(classification.flat_key, None);
    }

    #[test]
    fn light_key_layout_and_calibration() {
        let mut meta = metadata("Light Frame");
        meta.target = Some("M31".to_string());
        let classification = classify(&meta).unwrap();

        assert_eq!(key(&classification.key), "CamA_LIGHT_M31_NONE_30.0_100_-10");
        assert_eq!(key(&classification.dark_key), "CamA_DARK_30.0_100_-10");
        assert_eq!(key(&classification.flat_key), "CamA_FLAT_NONE_100_-10");
    }

    #[test]
    fn light_without_target_is_rejected() {
        let mut meta = metadata("Light Frame");
        meta.target = Some("  ".to_string());

        assert_eq!(
            classify(&meta),
            Err(KeyError::MissingTarget {
                camera: "CamA".to_string()
            })
        );
    }

    #[test]
    fn unknown_role_has_no_keys() {
        let classification = classify(&metadata("Bias")).unwrap();

        assert_eq!(classification.role(), Role::Unknown);
        assert_eq!(classification.key, None);
        assert_eq!(classification.dark_key, None);
        assert_eq!(classification.flat_key, None);
    }

    #[test]
    fn temperature_buckets_round_half_even() {
        assert_eq!(temperature_bucket(-10.0), -10);
        assert_eq!(temperature_bucket(-7.4), -5);
        assert_eq!(temperature_bucket(-7.6), -10);
        assert_eq!(temperature_bucket(12.5), 10);
        assert_eq!(temperature_bucket(-12.5), -10);
        assert_eq!(temperature_bucket(17.5), 20);
        assert_eq!(temperature_bucket(0.3), 0);
    }

    #[test]
    fn exposure_rounding_and_formatting() {
        assert_eq!(format_exposure(round_exposure(30.0)), "30.0");
        assert_eq!(format_exposure(round_exposure(0.5)), "0.5");
        assert_eq!(format_exposure(round_exposure(120.254)), "120.25");
        assert_eq!(format_exposure(round_exposure(29.999)), "30.0");
        assert_eq!(format_exposure(round_exposure(0.125)), "0.12");
    }

    #[test]
    fn keys_are_deterministic_and_field_sensitive() {
        let base = metadata("Dark Frame");
        let same = classify(&base).unwrap();
        assert_eq!(same.key, classify(&base).unwrap().key);

        let mut within_bucket = base.clone();
        within_bucket.temperature = -11.9;
        assert_eq!(classify(&within_bucket).unwrap().key, same.key);

        let variants = [
            FrameMetadata {
                camera: "CamB".to_string(),
                ..base.clone()
            },
            FrameMetadata {
                exposure: 60.0,
                ..base.clone()
            },
            FrameMetadata {
                gain: 200,
                ..base.clone()
            },
            FrameMetadata {
                temperature: -20.0,
                ..base.clone()
            },
        ];
        for variant in variants {
            assert_ne!(classify(&variant).unwrap().key, same.key, "{variant:?}");
        }
    }

    #[test]
    fn composite_metadata_reclassifies_to_same_keys() {
        let mut meta = metadata("Light Frame");
        meta.target = Some("M31".to_string());
        meta.filter = Some("L".to_string());
        meta.exposure = 120.254;
        meta.temperature = -9.2;
        let classification = classify(&meta).unwrap();

        let persisted = classification.setup.to_metadata(7);
        let reclassified = classify(&persisted).unwrap();

        assert_eq!(persisted.sample_count, Some(7));
        assert_eq!(persisted.image_type, "Light Frame");
        assert_eq!(reclassified, classification);
    }

    #[test]
    fn file_stems_of_distinct_keys_differ() {
        let stem = |target: &str| {
            let mut meta = metadata("Light Frame");
            meta.target = Some(target.to_string());
            classify(&meta).unwrap().key.unwrap().file_stem()
        };

        assert_eq!(stem("A-B"), "CamA_LIGHT_A-B_NONE_30.0_100_-10");
        assert_eq!(stem("A/B"), "CamA_LIGHT_A%2FB_NONE_30.0_100_-10");
        assert_eq!(stem("A%2FB"), "CamA_LIGHT_A%252FB_NONE_30.0_100_-10");
        assert_eq!(stem("NGC 7000\\x"), "CamA_LIGHT_NGC%207000%5Cx_NONE_30.0_100_-10");
        assert_eq!(stem("Ω"), "CamA_LIGHT_%CE%A9_NONE_30.0_100_-10");
    }
}
