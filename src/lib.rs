pub mod actors;
pub mod alert;
pub mod board;
pub mod checkpoint;
pub mod config;
pub mod locator;
pub mod notify;
pub mod proto;
pub mod rules;
pub mod server;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity of a test result.
///
/// The ordering is the paging severity: `Clear` is the most harmless,
/// `Purple` (stale, no report received in time) sorts worse than `Red`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Clear,
    Blue,
    Green,
    Yellow,
    Red,
    Purple,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Clear => "clear",
            Color::Blue => "blue",
            Color::Green => "green",
            Color::Yellow => "yellow",
            Color::Red => "red",
            Color::Purple => "purple",
        }
    }

    /// All colors, in severity order.
    pub const ALL: [Color; 6] = [
        Color::Clear,
        Color::Blue,
        Color::Green,
        Color::Yellow,
        Color::Red,
        Color::Purple,
    ];
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownColor(pub String);

impl fmt::Display for UnknownColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown color '{}'", self.0)
    }
}

impl std::error::Error for UnknownColor {}

impl FromStr for Color {
    type Err = UnknownColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear" => Ok(Color::Clear),
            "blue" => Ok(Color::Blue),
            "green" => Ok(Color::Green),
            "yellow" => Ok(Color::Yellow),
            "red" => Ok(Color::Red),
            "purple" => Ok(Color::Purple),
            other => Err(UnknownColor(other.to_string())),
        }
    }
}

/// The set of colors that are considered alert-worthy.
///
/// Default matches the classic deployment: yellow, red and purple page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertColors(u8);

impl AlertColors {
    pub fn new(colors: &[Color]) -> Self {
        let mut bits = 0u8;
        for c in colors {
            bits |= 1 << (*c as u8);
        }
        AlertColors(bits)
    }

    pub fn contains(&self, color: Color) -> bool {
        self.0 & (1 << (color as u8)) != 0
    }
}

impl Default for AlertColors {
    fn default() -> Self {
        AlertColors::new(&[Color::Yellow, Color::Red, Color::Purple])
    }
}
