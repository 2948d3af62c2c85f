//! BLE Service and Characteristic UUIDs.
//!
//! Contains the endpoint identifiers exposed by the Smart Bottle firmware.

use uuid::Uuid;

/// Smart Bottle sensor service UUID.
pub const BOTTLE_SERVICE_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_1234_1234_1234_5678_9abc);

/// Telemetry characteristic UUID (Notify). Carries newline-delimited JSON frames.
pub const TELEMETRY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xabcd_1234_5678_1234_5678_1234_5678_9abc);

/// Authentication characteristic UUID (Write). Receives the shared secret.
pub const AUTH_KEY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xfedc_ba98_7654_3210_fedc_ba98_7654_3210);

/// Clock sync characteristic UUID (Write). Receives epoch seconds as ASCII.
pub const TIME_SYNC_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00);

/// Client Characteristic Configuration Descriptor (standard BLE).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Check if a characteristic UUID belongs to the bottle service.
pub fn is_bottle_endpoint(uuid: &Uuid) -> bool {
    *uuid == TELEMETRY_CHARACTERISTIC_UUID
        || *uuid == AUTH_KEY_CHARACTERISTIC_UUID
        || *uuid == TIME_SYNC_CHARACTERISTIC_UUID
}

/// Human-readable name of a bottle endpoint, used in logs.
pub fn endpoint_name(uuid: &Uuid) -> &'static str {
    if *uuid == TELEMETRY_CHARACTERISTIC_UUID {
        "telemetry"
    } else if *uuid == AUTH_KEY_CHARACTERISTIC_UUID {
        "auth"
    } else if *uuid == TIME_SYNC_CHARACTERISTIC_UUID {
        "clock sync"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            BOTTLE_SERVICE_UUID.to_string(),
            "12345678-1234-1234-1234-123456789abc"
        );
        assert_eq!(
            TELEMETRY_CHARACTERISTIC_UUID.to_string(),
            "abcd1234-5678-1234-5678-123456789abc"
        );
        assert_eq!(
            AUTH_KEY_CHARACTERISTIC_UUID.to_string(),
            "fedcba98-7654-3210-fedc-ba9876543210"
        );
        assert_eq!(
            TIME_SYNC_CHARACTERISTIC_UUID.to_string(),
            "11223344-5566-7788-99aa-bbccddeeff00"
        );
        assert!(CCCD_UUID.to_string().contains("2902"));
    }

    #[test]
    fn test_is_bottle_endpoint() {
        assert!(is_bottle_endpoint(&TELEMETRY_CHARACTERISTIC_UUID));
        assert!(is_bottle_endpoint(&AUTH_KEY_CHARACTERISTIC_UUID));
        assert!(!is_bottle_endpoint(&BOTTLE_SERVICE_UUID));
        assert!(!is_bottle_endpoint(&CCCD_UUID));
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(endpoint_name(&AUTH_KEY_CHARACTERISTIC_UUID), "auth");
        assert_eq!(endpoint_name(&CCCD_UUID), "unknown");
    }
}
