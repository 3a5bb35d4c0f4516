//! Class-of-Device decoding for BR/EDR devices.
//!
//! The 24-bit CoD packs service-class bits (13..23), a major device class
//! (8..12) and a major-dependent minor class (2..7).

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceClass {
    pub raw: u32,
    pub major: String,
    pub minor: Option<String>,
    pub services: Vec<String>,
}

const SERVICE_BITS: [(u32, &str); 9] = [
    (13, "Limited Discoverable Mode"),
    (16, "Positioning"),
    (17, "Networking"),
    (18, "Rendering"),
    (19, "Capturing"),
    (20, "Object Transfer"),
    (21, "Audio"),
    (22, "Telephony"),
    (23, "Information"),
];

fn major_name(major: u32) -> &'static str {
    match major {
        0x00 => "Miscellaneous",
        0x01 => "Computer",
        0x02 => "Phone",
        0x03 => "LAN/Network Access Point",
        0x04 => "Audio/Video",
        0x05 => "Peripheral",
        0x06 => "Imaging",
        0x07 => "Wearable",
        0x08 => "Toy",
        0x09 => "Health",
        0x1f => "Uncategorized",
        _ => "Reserved",
    }
}

fn minor_name(major: u32, minor: u32) -> Option<&'static str> {
    match major {
        0x01 => match minor {
            0x01 => Some("Desktop workstation"),
            0x02 => Some("Server-class computer"),
            0x03 => Some("Laptop"),
            0x04 => Some("Handheld PC/PDA"),
            0x05 => Some("Palm-size PC/PDA"),
            0x06 => Some("Wearable computer"),
            0x07 => Some("Tablet"),
            _ => None,
        },
        0x02 => match minor {
            0x01 => Some("Cellular"),
            0x02 => Some("Cordless"),
            0x03 => Some("Smartphone"),
            0x04 => Some("Wired modem or voice gateway"),
            0x05 => Some("Common ISDN access"),
            _ => None,
        },
        0x04 => match minor {
            0x01 => Some("Wearable headset device"),
            0x02 => Some("Hands-free device"),
            0x04 => Some("Microphone"),
            0x05 => Some("Loudspeaker"),
            0x06 => Some("Headphones"),
            0x07 => Some("Portable audio"),
            0x08 => Some("Car audio"),
            0x09 => Some("Set-top box"),
            0x0a => Some("HiFi audio device"),
            0x0b => Some("VCR"),
            0x0c => Some("Video camera"),
            0x0f => Some("Video display and loudspeaker"),
            _ => None,
        },
        0x05 => match minor >> 4 {
            0x01 => Some("Keyboard"),
            0x02 => Some("Pointing device"),
            0x03 => Some("Combo keyboard/pointing device"),
            _ => match minor & 0x0f {
                0x01 => Some("Joystick"),
                0x02 => Some("Gamepad"),
                0x03 => Some("Remote control"),
                0x04 => Some("Sensing device"),
                _ => None,
            },
        },
        0x07 => match minor {
            0x01 => Some("Wristwatch"),
            0x02 => Some("Pager"),
            0x03 => Some("Jacket"),
            0x04 => Some("Helmet"),
            0x05 => Some("Glasses"),
            _ => None,
        },
        0x09 => match minor {
            0x01 => Some("Blood pressure monitor"),
            0x02 => Some("Thermometer"),
            0x03 => Some("Weighing scale"),
            0x04 => Some("Glucose meter"),
            0x05 => Some("Pulse oximeter"),
            0x06 => Some("Heart/pulse rate monitor"),
            _ => None,
        },
        _ => None,
    }
}

/// Decode a raw Class-of-Device value.
pub fn decode_device_class(raw: u32) -> DeviceClass {
    let major = (raw >> 8) & 0x1f;
    let minor = (raw >> 2) & 0x3f;
    let services = SERVICE_BITS
        .iter()
        .filter(|(bit, _)| raw & (1 << bit) != 0)
        .map(|(_, name)| name.to_string())
        .collect();
    DeviceClass {
        raw,
        major: major_name(major).to_string(),
        minor: minor_name(major, minor).map(str::to_string),
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_smartphone_class() {
        let decoded = decode_device_class(0x5a020c);
        assert_eq!(decoded.major, "Phone");
        assert_eq!(decoded.minor.as_deref(), Some("Smartphone"));
        for service in ["Networking", "Capturing", "Object Transfer", "Telephony"] {
            assert!(decoded.services.iter().any(|s| s == service));
        }
    }

    #[test]
    fn decodes_audio_sink_class() {
        // 0x240404: Audio + Rendering services, Audio/Video major,
        // wearable headset minor.
        let decoded = decode_device_class(0x240404);
        assert_eq!(decoded.major, "Audio/Video");
        assert_eq!(decoded.minor.as_deref(), Some("Wearable headset device"));
        assert!(decoded.services.iter().any(|s| s == "Audio"));
        assert!(decoded.services.iter().any(|s| s == "Rendering"));
    }

    #[test]
    fn unknown_major_is_reserved() {
        let decoded = decode_device_class(0x000a00);
        assert_eq!(decoded.major, "Reserved");
        assert!(decoded.minor.is_none());
    }
}
