//! Structured device descriptor bound to a refresh session.

use isbot::Bots;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static BOTS: Lazy<Bots> = Lazy::new(Bots::default);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFamily {
    Chrome,
    Edge,
    Firefox,
    Opera,
    Safari,
    Bot,
    Other,
}

impl ClientFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientFamily::Chrome => "chrome",
            ClientFamily::Edge => "edge",
            ClientFamily::Firefox => "firefox",
            ClientFamily::Opera => "opera",
            ClientFamily::Safari => "safari",
            ClientFamily::Bot => "bot",
            ClientFamily::Other => "other",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "chrome" => Some(ClientFamily::Chrome),
            "edge" => Some(ClientFamily::Edge),
            "firefox" => Some(ClientFamily::Firefox),
            "opera" => Some(ClientFamily::Opera),
            "safari" => Some(ClientFamily::Safari),
            "bot" => Some(ClientFamily::Bot),
            "other" => Some(ClientFamily::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Windows,
    MacOs,
    Ios,
    Android,
    ChromeOs,
    Linux,
    Other,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::MacOs => "macos",
            OsFamily::Ios => "ios",
            OsFamily::Android => "android",
            OsFamily::ChromeOs => "chromeos",
            OsFamily::Linux => "linux",
            OsFamily::Other => "other",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "windows" => Some(OsFamily::Windows),
            "macos" => Some(OsFamily::MacOs),
            "ios" => Some(OsFamily::Ios),
            "android" => Some(OsFamily::Android),
            "chromeos" => Some(OsFamily::ChromeOs),
            "linux" => Some(OsFamily::Linux),
            "other" => Some(OsFamily::Other),
            _ => None,
        }
    }
}

/// Coarse client fingerprint. Derived once from the user-agent when a
/// session is created, then compared field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub client_family: ClientFamily,
    pub os_family: OsFamily,
}

impl DeviceDescriptor {
    pub fn new(client_family: ClientFamily, os_family: OsFamily) -> Self {
        Self {
            client_family,
            os_family,
        }
    }

    pub fn from_user_agent(user_agent: &str) -> Self {
        Self {
            client_family: client_family(user_agent),
            os_family: os_family(user_agent),
        }
    }

    pub fn matches(&self, presented: &DeviceDescriptor) -> bool {
        self == presented
    }
}

/// A session without a stored descriptor accepts any device.
pub fn device_matches(stored: Option<&DeviceDescriptor>, presented: &DeviceDescriptor) -> bool {
    stored.map_or(true, |device| device.matches(presented))
}

fn client_family(ua: &str) -> ClientFamily {
    if BOTS.is_bot(ua) {
        return ClientFamily::Bot;
    }

    // Edge and Opera embed "Chrome/", Chrome embeds "Safari/".
    if ua.contains("Edg/") || ua.contains("Edge/") || ua.contains("EdgiOS") {
        ClientFamily::Edge
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        ClientFamily::Opera
    } else if ua.contains("Firefox/") || ua.contains("FxiOS") {
        ClientFamily::Firefox
    } else if ua.contains("Chrome/") || ua.contains("CriOS") || ua.contains("Chromium") {
        ClientFamily::Chrome
    } else if ua.contains("Safari/") {
        ClientFamily::Safari
    } else {
        ClientFamily::Other
    }
}

fn os_family(ua: &str) -> OsFamily {
    // iOS agents say "like Mac OS X", Android agents say "Linux".
    if ua.contains("Windows") {
        OsFamily::Windows
    } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        OsFamily::Ios
    } else if ua.contains("Android") {
        OsFamily::Android
    } else if ua.contains("CrOS") {
        OsFamily::ChromeOs
    } else if ua.contains("Macintosh") || ua.contains("Mac OS X") {
        OsFamily::MacOs
    } else if ua.contains("Linux") {
        OsFamily::Linux
    } else {
        OsFamily::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
    const CHROME_MAC_NEWER: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.6478.57 Safari/537.36";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
    const EDGE_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.67";
    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";
    const CHROME_ANDROID: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36";

    #[test]
    fn test_descriptor_families() {
        assert_eq!(
            DeviceDescriptor::from_user_agent(CHROME_MAC),
            DeviceDescriptor::new(ClientFamily::Chrome, OsFamily::MacOs)
        );
        assert_eq!(
            DeviceDescriptor::from_user_agent(SAFARI_IPHONE),
            DeviceDescriptor::new(ClientFamily::Safari, OsFamily::Ios)
        );
        assert_eq!(
            DeviceDescriptor::from_user_agent(EDGE_WINDOWS),
            DeviceDescriptor::new(ClientFamily::Edge, OsFamily::Windows)
        );
        assert_eq!(
            DeviceDescriptor::from_user_agent(FIREFOX_LINUX),
            DeviceDescriptor::new(ClientFamily::Firefox, OsFamily::Linux)
        );
        assert_eq!(
            DeviceDescriptor::from_user_agent(CHROME_ANDROID),
            DeviceDescriptor::new(ClientFamily::Chrome, OsFamily::Android)
        );
    }

    #[test]
    fn test_browser_upgrade_still_matches() {
        let stored = DeviceDescriptor::from_user_agent(CHROME_MAC);
        let presented = DeviceDescriptor::from_user_agent(CHROME_MAC_NEWER);
        assert!(stored.matches(&presented));
    }

    #[test]
    fn test_different_browser_does_not_match() {
        let stored = DeviceDescriptor::from_user_agent(CHROME_MAC);
        let presented = DeviceDescriptor::from_user_agent(SAFARI_IPHONE);
        assert!(!stored.matches(&presented));
    }

    #[test]
    fn test_missing_stored_device_always_matches() {
        let presented = DeviceDescriptor::from_user_agent(FIREFOX_LINUX);
        assert!(device_matches(None, &presented));
    }

    #[test]
    fn test_crawler_is_bot() {
        let device = DeviceDescriptor::from_user_agent(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        );
        assert_eq!(device.client_family, ClientFamily::Bot);
    }

    #[test]
    fn test_codes_round_trip() {
        assert_eq!(ClientFamily::from_code("edge"), Some(ClientFamily::Edge));
        assert_eq!(OsFamily::from_code("chromeos"), Some(OsFamily::ChromeOs));
        assert_eq!(OsFamily::from_code("beos"), None);
    }
}
