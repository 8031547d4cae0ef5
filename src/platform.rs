use serde::{Deserialize, Serialize};
use std::fmt;

/// Device/client class a user can be logged in on, one session each.
///
/// Serialized as its numeric platform ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Platform {
    Ios,
    Android,
    Windows,
    MacOs,
    Web,
    MiniWeb,
    Linux,
    AndroidPad,
    IPad,
    Admin,
}

/// Coarse grouping of platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformClass {
    Mobile,
    Pc,
    Web,
    MiniWeb,
    Pad,
    Admin,
}

impl Platform {
    /// Every platform a client can connect from.
    pub const CLIENTS: [Platform; 9] = [
        Platform::Ios,
        Platform::Android,
        Platform::Windows,
        Platform::MacOs,
        Platform::Web,
        Platform::MiniWeb,
        Platform::Linux,
        Platform::AndroidPad,
        Platform::IPad,
    ];

    pub fn id(self) -> i32 {
        match self {
            Platform::Ios => 1,
            Platform::Android => 2,
            Platform::Windows => 3,
            Platform::MacOs => 4,
            Platform::Web => 5,
            Platform::MiniWeb => 6,
            Platform::Linux => 7,
            Platform::AndroidPad => 8,
            Platform::IPad => 9,
            Platform::Admin => 10,
        }
    }

    pub fn from_id(id: i32) -> Option<Platform> {
        Some(match id {
            1 => Platform::Ios,
            2 => Platform::Android,
            3 => Platform::Windows,
            4 => Platform::MacOs,
            5 => Platform::Web,
            6 => Platform::MiniWeb,
            7 => Platform::Linux,
            8 => Platform::AndroidPad,
            9 => Platform::IPad,
            10 => Platform::Admin,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Ios => "IOS",
            Platform::Android => "Android",
            Platform::Windows => "Windows",
            Platform::MacOs => "OSX",
            Platform::Web => "Web",
            Platform::MiniWeb => "MiniWeb",
            Platform::Linux => "Linux",
            Platform::AndroidPad => "APad",
            Platform::IPad => "IPad",
            Platform::Admin => "Admin",
        }
    }

    pub fn class(self) -> PlatformClass {
        match self {
            Platform::Ios | Platform::Android => PlatformClass::Mobile,
            Platform::Windows | Platform::MacOs | Platform::Linux => PlatformClass::Pc,
            Platform::Web => PlatformClass::Web,
            Platform::MiniWeb => PlatformClass::MiniWeb,
            Platform::AndroidPad | Platform::IPad => PlatformClass::Pad,
            Platform::Admin => PlatformClass::Admin,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<i32> for Platform {
    type Error = String;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        Platform::from_id(id).ok_or_else(|| format!("unknown platform id {id}"))
    }
}

impl From<Platform> for i32 {
    fn from(p: Platform) -> i32 {
        p.id()
    }
}
