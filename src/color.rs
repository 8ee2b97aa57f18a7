//! Background colour parsing
//!
//! Colours enter the pipeline at the request boundary as `#RRGGBB` strings,
//! `r,g,b` triples or one of a few named presets.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 8-bit RGB triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Presets offered to users picking a background
const NAMED_COLORS: &[(&str, RgbColor)] = &[
    ("white", RgbColor::new(255, 255, 255)),
    ("blue", RgbColor::new(70, 130, 180)),
    ("red", RgbColor::new(220, 20, 60)),
    ("grey", RgbColor::new(128, 128, 128)),
    ("gray", RgbColor::new(128, 128, 128)),
    ("light_blue", RgbColor::new(230, 243, 255)),
    ("light_gray", RgbColor::new(245, 245, 245)),
    ("light_grey", RgbColor::new(211, 211, 211)),
    ("cream", RgbColor::new(249, 246, 240)),
];

impl RgbColor {
    pub const WHITE: Self = Self::new(255, 255, 255);

    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    #[must_use]
    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// Parse a `#RRGGBB` string. The leading `#` is required.
    ///
    /// # Errors
    /// - Missing `#`, wrong length or non-hex digits
    pub fn from_hex(input: &str) -> Result<Self> {
        let digits = input
            .strip_prefix('#')
            .ok_or_else(|| CoreError::invalid_color(format!("'{input}' must start with '#'")))?;

        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::invalid_color(format!(
                "'{input}' is not a 6-digit hex colour"
            )));
        }

        let channel = |range: std::ops::Range<usize>| {
            digits
                .get(range)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| CoreError::invalid_color(format!("'{input}' has invalid digits")))
        };

        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }

    /// Look up one of the named presets (case-insensitive)
    #[must_use]
    pub fn named(name: &str) -> Option<Self> {
        let key = name.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        NAMED_COLORS
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, color)| *color)
    }

    #[must_use]
    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl fmt::Display for RgbColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 3]> for RgbColor {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl From<(u8, u8, u8)> for RgbColor {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Self::new(r, g, b)
    }
}

/// Accepts `#RRGGBB`, `r,g,b` or a preset name
impl FromStr for RgbColor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.starts_with('#') {
            return Self::from_hex(trimmed);
        }

        if trimmed.contains(',') {
            let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
            if let [r, g, b] = parts.as_slice() {
                let parse = |v: &str| {
                    v.parse::<u8>().map_err(|_| {
                        CoreError::invalid_color(format!("'{trimmed}' channel '{v}' is not 0-255"))
                    })
                };
                return Ok(Self::new(parse(r)?, parse(g)?, parse(b)?));
            }
            return Err(CoreError::invalid_color(format!(
                "'{trimmed}' must have exactly three channels"
            )));
        }

        if let Some(color) = Self::named(trimmed) {
            return Ok(color);
        }

        // Bare hex digits are rejected like any other unknown word
        Self::from_hex(trimmed)
    }
}
