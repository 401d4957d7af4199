//! Protocol constants for the Meshtastic serial stream API.

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// First byte of every stream frame header.
pub const START1: u8 = 0x94;

/// Second byte of every stream frame header.
pub const START2: u8 = 0xC3;

/// Header size: two magic bytes plus a big-endian u16 payload length.
pub const HEADER_LEN: usize = 4;

/// Largest payload the device will send or accept in one frame.
pub const MAX_PAYLOAD_LEN: usize = 512;

/// Number of `START2` bytes written before the first request to wake the
/// device's stream parser out of console mode.
pub const WAKE_PREAMBLE_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Destination number used for broadcast packets.
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Scale factor for integer latitude/longitude fields (degrees * 1e7).
pub const POSITION_SCALE: f64 = 1e-7;

// ---------------------------------------------------------------------------
// Hardware models
// ---------------------------------------------------------------------------

/// Name of a `HardwareModel` enum value, as the device firmware reports it.
///
/// Only the commonly deployed boards are listed; anything else is reported
/// through [`hardware_model_label`] as `HW_<n>`.
pub fn hardware_model_name(value: i32) -> Option<&'static str> {
    let name = match value {
        0 => "UNSET",
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        15 => "TLORA_V2_1_1P8",
        16 => "TLORA_T3_S3",
        17 => "NANO_G1_EXPLORER",
        18 => "NANO_G2_ULTRA",
        25 => "STATION_G1",
        26 => "RAK11310",
        37 => "PORTDUINO",
        39 => "DIY_V1",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        47 => "RPI_PICO",
        48 => "HELTEC_WIRELESS_TRACKER",
        49 => "HELTEC_WIRELESS_PAPER",
        50 => "T_DECK",
        51 => "T_WATCH_S3",
        255 => "PRIVATE_HW",
        _ => return None,
    };
    Some(name)
}

/// Display tag for a hardware model value, never empty.
pub fn hardware_model_label(value: i32) -> String {
    match hardware_model_name(value) {
        Some(name) => name.to_string(),
        None => format!("HW_{value}"),
    }
}
