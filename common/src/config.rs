use serde::{Deserialize, Serialize};

use crate::topics::{
    config_topic, device_id, status_topic, TOPIC_DISCOVERY, TOPIC_PWM1, TOPIC_PWM2, TOPIC_SW1,
    TOPIC_SW2,
};

/// Change this value to force every device back to compiled-in defaults.
pub const CFG_HOLDER: u32 = 0x00FF557;

pub const DEVICE_ID_LEN: usize = 32;
pub const SSID_LEN: usize = 64;
pub const STA_PASS_LEN: usize = 64;
pub const HOST_LEN: usize = 64;
pub const MQTT_USER_LEN: usize = 32;
pub const MQTT_PASS_LEN: usize = 32;
pub const TOPIC_LEN: usize = 64;

pub const DEFAULT_STA_SSID: &str = "";
pub const DEFAULT_STA_PASS: &str = "";
pub const DEFAULT_STA_TYPE: AuthMode = AuthMode::Wpa2Psk;
pub const DEFAULT_MQTT_HOST: &str = "192.168.1.3";
pub const DEFAULT_MQTT_PORT: u32 = 1883;
pub const DEFAULT_MQTT_USER: &str = "test";
pub const DEFAULT_MQTT_PASS: &str = "testpass";
pub const DEFAULT_MQTT_KEEPALIVE: u32 = 120;
pub const DEFAULT_SECURITY: u8 = 0;

/// Station authentication mode, numbered like the ESP SDK `AUTH_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Other(u32),
}

impl AuthMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Wep,
            2 => Self::WpaPsk,
            3 => Self::Wpa2Psk,
            4 => Self::WpaWpa2Psk,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Open => 0,
            Self::Wep => 1,
            Self::WpaPsk => 2,
            Self::Wpa2Psk => 3,
            Self::WpaWpa2Psk => 4,
            Self::Other(raw) => raw,
        }
    }
}

/// The persisted device configuration.
///
/// Field order mirrors the on-flash layout in [`crate::record`]. Text fields never hold more
/// than their capacity minus one byte; use [`bounded`] when assigning from outside input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysConfig {
    pub cfg_holder: u32,
    pub device_id: String,
    pub sta_ssid: String,
    pub sta_pwd: String,
    pub sta_type: AuthMode,
    pub mqtt_host: String,
    pub mqtt_port: u32,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_keepalive: u32,
    pub security: u8,
    pub mqtt_topic_config: String,
    pub mqtt_topic_status: String,
    pub mqtt_topic_pwm1: String,
    pub mqtt_topic_pwm2: String,
    pub mqtt_topic_sw1: String,
    pub mqtt_topic_sw2: String,
    pub mqtt_topic_discovery: String,
    pub discovery_flag: bool,
}

impl SysConfig {
    /// Equivalent of an all-zero record: every string empty, every number zero.
    pub fn zeroed() -> Self {
        Self {
            cfg_holder: 0,
            device_id: String::new(),
            sta_ssid: String::new(),
            sta_pwd: String::new(),
            sta_type: AuthMode::Open,
            mqtt_host: String::new(),
            mqtt_port: 0,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_keepalive: 0,
            security: 0,
            mqtt_topic_config: String::new(),
            mqtt_topic_status: String::new(),
            mqtt_topic_pwm1: String::new(),
            mqtt_topic_pwm2: String::new(),
            mqtt_topic_sw1: String::new(),
            mqtt_topic_sw2: String::new(),
            mqtt_topic_discovery: String::new(),
            discovery_flag: false,
        }
    }

    /// Full first-boot defaults, with identity and channel topics derived from `chip_id`.
    pub fn factory(chip_id: u32) -> Self {
        let mut config = Self::remote_profile();

        config.device_id = bounded(&device_id(chip_id), DEVICE_ID_LEN);
        config.mqtt_topic_config = bounded(&config_topic(&config.device_id), TOPIC_LEN);
        config.mqtt_topic_status = bounded(&status_topic(&config.device_id), TOPIC_LEN);
        config.mqtt_topic_discovery = TOPIC_DISCOVERY.to_string();
        config.discovery_flag = true;

        config
    }

    /// Defaults for network, broker and the four application topics only.
    ///
    /// Identity, config/status/discovery topics and the discovery flag are left zeroed.
    pub fn remote_profile() -> Self {
        Self {
            cfg_holder: CFG_HOLDER,
            sta_ssid: DEFAULT_STA_SSID.to_string(),
            sta_pwd: DEFAULT_STA_PASS.to_string(),
            sta_type: DEFAULT_STA_TYPE,
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: DEFAULT_MQTT_USER.to_string(),
            mqtt_pass: DEFAULT_MQTT_PASS.to_string(),
            mqtt_keepalive: DEFAULT_MQTT_KEEPALIVE,
            security: DEFAULT_SECURITY,
            mqtt_topic_pwm1: TOPIC_PWM1.to_string(),
            mqtt_topic_pwm2: TOPIC_PWM2.to_string(),
            mqtt_topic_sw1: TOPIC_SW1.to_string(),
            mqtt_topic_sw2: TOPIC_SW2.to_string(),
            ..Self::zeroed()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cfg_holder == CFG_HOLDER
    }

    pub fn uses_tls(&self) -> bool {
        self.security != 0
    }
}

/// Clamps `value` to what fits in a NUL-terminated field of `capacity` bytes.
///
/// An embedded NUL ends the text, as it would on flash.
pub fn bounded(value: &str, capacity: usize) -> String {
    let value = value.find('\0').map_or(value, |end| &value[..end]);
    let max = capacity.saturating_sub(1);
    if value.len() <= max {
        return value.to_string();
    }

    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
