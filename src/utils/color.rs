//! Backdrop color parsing
//!
//! Backdrop colors arrive as hex strings from the upload form. They are
//! validated here, before any file is written or any subprocess started.

use crate::error::{BgReplaceError, Result};
use serde::{Deserialize, Serialize};

/// Solid, fully opaque backdrop color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackdropColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl BackdropColor {
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    #[must_use]
    pub const fn white() -> Self {
        Self::new(255, 255, 255)
    }

    /// Color as an opaque RGBA pixel
    #[must_use]
    pub fn to_rgba(self) -> image::Rgba<u8> {
        image::Rgba([self.r, self.g, self.b, 255])
    }
}

impl Default for BackdropColor {
    fn default() -> Self {
        Self::white()
    }
}

impl std::fmt::Display for BackdropColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&ColorParser::to_hex(self, true))
    }
}

impl std::str::FromStr for BackdropColor {
    type Err = BgReplaceError;

    fn from_str(s: &str) -> Result<Self> {
        ColorParser::parse_hex(s)
    }
}

/// Utility for parsing and converting colors
pub struct ColorParser;

impl ColorParser {
    /// Parse a hex color string to `BackdropColor`
    ///
    /// Supports both #RRGGBB and #RGB formats, with or without the `#`.
    /// Surrounding whitespace is ignored.
    ///
    /// # Examples
    /// ```rust
    /// use imgly_bgreplace::utils::ColorParser;
    ///
    /// let teal = ColorParser::parse_hex("#00b894")?;
    /// assert_eq!((teal.r, teal.g, teal.b), (0x00, 0xb8, 0x94));
    /// let red = ColorParser::parse_hex("f00")?;
    /// assert_eq!(red.r, 255);
    /// # Ok::<(), imgly_bgreplace::BgReplaceError>(())
    /// ```
    pub fn parse_hex(hex: &str) -> Result<BackdropColor> {
        let original = hex;
        let hex = hex.trim();
        let hex = hex.strip_prefix('#').unwrap_or(hex);

        if !Self::is_valid_hex(hex) {
            return Err(BgReplaceError::InvalidColor(format!(
                "'{}' (expected #RRGGBB or #RGB)",
                original
            )));
        }

        let component = |range: std::ops::Range<usize>| -> Result<u8> {
            hex.get(range)
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| BgReplaceError::InvalidColor(format!("'{}'", original)))
        };

        if hex.len() == 6 {
            Ok(BackdropColor::new(component(0..2)?, component(2..4)?, component(4..6)?))
        } else {
            // #RGB expands each nibble: f -> ff
            Ok(BackdropColor::new(
                component(0..1)? * 17,
                component(1..2)? * 17,
                component(2..3)? * 17,
            ))
        }
    }

    /// Convert `BackdropColor` to hex string
    #[must_use]
    pub fn to_hex(color: &BackdropColor, include_hash: bool) -> String {
        if include_hash {
            format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
        } else {
            format!("{:02x}{:02x}{:02x}", color.r, color.g, color.b)
        }
    }

    /// Validate hex color format without parsing
    #[must_use]
    pub fn is_valid_hex(hex: &str) -> bool {
        let hex = hex.trim_start_matches('#');

        if hex.len() != 3 && hex.len() != 6 {
            return false;
        }

        hex.chars().all(|c| c.is_ascii_hexdigit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_6_digit() {
        let white = ColorParser::parse_hex("#ffffff").unwrap();
        assert_eq!(white, BackdropColor::white());

        let teal = ColorParser::parse_hex("#00b894").unwrap();
        assert_eq!(teal, BackdropColor::new(0x00, 0xb8, 0x94));

        let upper = ColorParser::parse_hex("#00B894").unwrap();
        assert_eq!(upper, teal);
    }

    #[test]
    fn test_parse_hex_3_digit() {
        let red = ColorParser::parse_hex("#f00").unwrap();
        assert_eq!(red, BackdropColor::new(255, 0, 0));

        let grey = ColorParser::parse_hex("#888").unwrap();
        assert_eq!(grey, BackdropColor::new(0x88, 0x88, 0x88));
    }

    #[test]
    fn test_parse_hex_without_hash_and_with_whitespace() {
        let blue = ColorParser::parse_hex("0000ff").unwrap();
        assert_eq!(blue, BackdropColor::new(0, 0, 255));

        let padded = ColorParser::parse_hex("  #0000ff \n").unwrap();
        assert_eq!(padded, blue);
    }

    #[test]
    fn test_parse_hex_invalid() {
        assert!(ColorParser::parse_hex("#gggggg").is_err());
        assert!(ColorParser::parse_hex("#ff").is_err());
        assert!(ColorParser::parse_hex("#fffffff").is_err());
        assert!(ColorParser::parse_hex("").is_err());
        assert!(ColorParser::parse_hex("red").is_err());
        // multi-byte characters must not panic on slicing
        assert!(ColorParser::parse_hex("#é0000").is_err());
        assert!(ColorParser::parse_hex("ééé").is_err());

        let err = ColorParser::parse_hex("purple").unwrap_err();
        assert!(matches!(err, BgReplaceError::InvalidColor(_)));
    }

    #[test]
    fn test_to_hex_and_display() {
        let color = BackdropColor::new(255, 128, 0);
        assert_eq!(ColorParser::to_hex(&color, true), "#ff8000");
        assert_eq!(ColorParser::to_hex(&color, false), "ff8000");
        assert_eq!(color.to_string(), "#ff8000");
        assert_eq!("#ff8000".parse::<BackdropColor>().unwrap(), color);
    }

    #[test]
    fn test_to_rgba_is_opaque() {
        let px = BackdropColor::new(1, 2, 3).to_rgba();
        assert_eq!(px.0, [1, 2, 3, 255]);
    }
}
