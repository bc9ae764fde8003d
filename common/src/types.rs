use serde::Serialize;

use crate::config::{AuthMode, SysConfig};

/// Published once to the discovery topic while the discovery flag is still set.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryAnnouncement {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "configTopic")]
    pub config_topic: String,
    #[serde(rename = "statusTopic")]
    pub status_topic: String,
    pub topics: ChannelTopics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelTopics {
    pub pwm1: String,
    pub pwm2: String,
    pub sw1: String,
    pub sw2: String,
}

impl From<&SysConfig> for DiscoveryAnnouncement {
    fn from(config: &SysConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            config_topic: config.mqtt_topic_config.clone(),
            status_topic: config.mqtt_topic_status.clone(),
            topics: ChannelTopics {
                pwm1: config.mqtt_topic_pwm1.clone(),
                pwm2: config.mqtt_topic_pwm2.clone(),
                sw1: config.mqtt_topic_sw1.clone(),
                sw2: config.mqtt_topic_sw2.clone(),
            },
        }
    }
}

/// Loggable view of the configuration with secrets reduced to "is set" flags.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "staSsid")]
    pub sta_ssid: String,
    #[serde(rename = "staPassSet")]
    pub sta_pass_set: bool,
    #[serde(rename = "staType")]
    pub sta_type: AuthMode,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u32,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    pub mqtt_pass_set: bool,
    #[serde(rename = "mqttKeepalive")]
    pub mqtt_keepalive: u32,
    pub security: bool,
    #[serde(rename = "discoveryPending")]
    pub discovery_pending: bool,
}

impl From<&SysConfig> for ConfigView {
    fn from(config: &SysConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            sta_ssid: config.sta_ssid.clone(),
            sta_pass_set: !config.sta_pwd.is_empty(),
            sta_type: config.sta_type,
            mqtt_host: config.mqtt_host.clone(),
            mqtt_port: config.mqtt_port,
            mqtt_user: config.mqtt_user.clone(),
            mqtt_pass_set: !config.mqtt_pass.is_empty(),
            mqtt_keepalive: config.mqtt_keepalive,
            security: config.uses_tls(),
            discovery_pending: config.discovery_flag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_uses_camel_case_keys() {
        let config = SysConfig::factory(0x42);
        let json = serde_json::to_value(DiscoveryAnnouncement::from(&config)).unwrap();

        assert_eq!(json["deviceId"], "DeviceX_00000042");
        assert_eq!(json["configTopic"], "DeviceX_00000042/config");
        assert_eq!(json["topics"]["sw1"], "kitchen/switch");
    }

    #[test]
    fn view_hides_secrets() {
        let config = SysConfig::factory(0x42);
        let json = serde_json::to_string(&ConfigView::from(&config)).unwrap();

        assert!(!json.contains("testpass"));
        assert!(json.contains("\"mqttPassSet\":true"));
        assert!(json.contains("\"staPassSet\":false"));
        assert!(json.contains("\"staType\":\"WPA2_PSK\""));
    }
}
