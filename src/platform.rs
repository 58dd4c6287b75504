//! Platform/interface selector (C1).
//!
//! Detects the host OS family and picks a concrete CAN interface
//! configuration: a real driver where one exists, or the virtual bus
//! everywhere else, so the rest of the pipeline runs unchanged across
//! laptops, CI, and production Linux hosts.

use crate::error::{GatewayError, Result};

/// Host platform family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    Linux,
    MacOs,
    Windows,
    Unknown,
}

impl PlatformFamily {
    /// Detect the current platform from `std::env::consts::OS`.
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Unknown,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Unknown => "unknown",
        }
    }
}

/// The capability set a platform family exposes.
#[derive(Debug, Clone)]
pub struct PlatformCapabilities {
    pub platform: PlatformFamily,
    pub recommended_interface: &'static str,
    pub available_interfaces: Vec<&'static str>,
}

/// Use-case driven interface recommendation, carried over from the original
/// platform detection module's `get_interface_recommendations` table.
pub fn recommended_for_use_case(use_case: &str) -> &'static str {
    match use_case {
        "development" | "testing" | "ci_cd" | "demonstration" => "virtual",
        "production_linux" => "socketcan",
        "production_other" => "thirdparty_usb",
        _ => "virtual",
    }
}

/// Get the capability report for a platform family (or the detected one).
pub fn capabilities(platform: Option<PlatformFamily>) -> PlatformCapabilities {
    let platform = platform.unwrap_or_else(PlatformFamily::detect);

    let (recommended_interface, available_interfaces) = match platform {
        PlatformFamily::Linux => ("socketcan", vec!["socketcan", "virtual", "pcan", "kvaser", "ixxat"]),
        PlatformFamily::MacOs => ("virtual", vec!["virtual", "pcan", "kvaser"]),
        PlatformFamily::Windows => ("virtual", vec!["virtual", "pcan", "kvaser", "ixxat", "usb2can"]),
        PlatformFamily::Unknown => ("virtual", vec!["virtual"]),
    };

    #[cfg(feature = "tracing-support")]
    tracing::info!(platform = platform.as_str(), recommended_interface, "platform detection complete");

    PlatformCapabilities {
        platform,
        recommended_interface,
        available_interfaces,
    }
}

/// A concrete, selected bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedInterface {
    pub interface: String,
    pub channel: String,
    pub bitrate: u32,
    pub fallback_used: bool,
}

/// Select the interface to use, given an optional caller preference.
///
/// If `preferred` names an interface the platform doesn't expose, falls back
/// to the platform's virtual-bus default when `allow_fallback` is set;
/// otherwise fails with `InterfaceUnavailable`.
pub fn select(
    preferred: Option<&str>,
    channel: Option<&str>,
    bitrate: u32,
    allow_fallback: bool,
) -> Result<SelectedInterface> {
    let caps = capabilities(None);
    let target = preferred.unwrap_or(caps.recommended_interface);

    if caps.available_interfaces.contains(&target) {
        let channel = channel
            .map(str::to_string)
            .unwrap_or_else(|| default_channel(target).to_string());
        return Ok(SelectedInterface {
            interface: target.to_string(),
            channel,
            bitrate,
            fallback_used: false,
        });
    }

    if !allow_fallback {
        return Err(GatewayError::InterfaceUnavailable(format!(
            "interface '{target}' not available on {}; available: {:?}",
            caps.platform.as_str(),
            caps.available_interfaces
        )));
    }

    #[cfg(feature = "tracing-support")]
    tracing::warn!(
        requested = target,
        platform = caps.platform.as_str(),
        "requested interface unavailable, falling back to virtual"
    );

    Ok(SelectedInterface {
        interface: "virtual".to_string(),
        channel: channel.map(str::to_string).unwrap_or_else(|| "vcan0".to_string()),
        bitrate,
        fallback_used: true,
    })
}

fn default_channel(interface: &str) -> &'static str {
    match interface {
        "socketcan" => "can0",
        _ => "vcan0",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_capabilities() {
        let caps = capabilities(Some(PlatformFamily::Linux));
        assert_eq!(caps.recommended_interface, "socketcan");
        assert!(caps.available_interfaces.contains(&"socketcan"));
    }

    #[test]
    fn test_macos_falls_back_to_virtual() {
        let caps = capabilities(Some(PlatformFamily::MacOs));
        assert_eq!(caps.recommended_interface, "virtual");
        assert!(!caps.available_interfaces.contains(&"socketcan"));
    }

    #[test]
    fn test_select_honors_preference_when_available() {
        // Virtual is available on every platform family.
        let selected = select(Some("virtual"), Some("vcan1"), 250_000, true).unwrap();
        assert_eq!(selected.interface, "virtual");
        assert_eq!(selected.channel, "vcan1");
        assert!(!selected.fallback_used);
    }

    #[test]
    fn test_select_rejects_without_fallback() {
        let err = select(Some("nonexistent-iface"), None, 500_000, false).unwrap_err();
        assert!(matches!(err, GatewayError::InterfaceUnavailable(_)));
    }

    #[test]
    fn test_select_falls_back_when_allowed() {
        let selected = select(Some("nonexistent-iface"), None, 500_000, true).unwrap();
        assert!(selected.fallback_used);
        assert_eq!(selected.interface, "virtual");
    }

    #[test]
    fn test_recommended_for_use_case() {
        assert_eq!(recommended_for_use_case("production_linux"), "socketcan");
        assert_eq!(recommended_for_use_case("ci_cd"), "virtual");
    }
}
