pub const DEVICE_ID_PREFIX: &str = "DeviceX_";
pub const TOPIC_CONFIG_SUFFIX: &str = "/config";
pub const TOPIC_STATUS_SUFFIX: &str = "/status";

pub const TOPIC_PWM1: &str = "kitchen/light";
pub const TOPIC_PWM2: &str = "living/light";
pub const TOPIC_SW1: &str = "kitchen/switch";
pub const TOPIC_SW2: &str = "living/switch";
pub const TOPIC_DISCOVERY: &str = "discovery";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Placeholder accepted in remotely supplied topic values; replaced by the chip id.
pub const CHIP_ID_PLACEHOLDER: &str = "%08X";

pub fn device_id(chip_id: u32) -> String {
    format!("{DEVICE_ID_PREFIX}{chip_id:08X}")
}

pub fn config_topic(device_id: &str) -> String {
    format!("{device_id}{TOPIC_CONFIG_SUFFIX}")
}

pub fn status_topic(device_id: &str) -> String {
    format!("{device_id}{TOPIC_STATUS_SUFFIX}")
}

pub fn substitute_chip_id(value: &str, chip_id: u32) -> String {
    value.replace(CHIP_ID_PLACEHOLDER, &format!("{chip_id:08X}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_zero_padded_upper_hex() {
        assert_eq!(device_id(0xAB12), "DeviceX_0000AB12");
        assert_eq!(config_topic(&device_id(0xAB12)), "DeviceX_0000AB12/config");
        assert_eq!(status_topic(&device_id(1)), "DeviceX_00000001/status");
    }

    #[test]
    fn only_the_chip_id_placeholder_is_substituted() {
        assert_eq!(
            substitute_chip_id("node/%08X/light", 0xDEADBEEF),
            "node/DEADBEEF/light"
        );
        assert_eq!(substitute_chip_id("%s%n%x", 7), "%s%n%x");
    }
}
