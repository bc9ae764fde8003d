//! Fixed byte layout of the persisted records.
//!
//! `SysConfig` is stored as a flat little-endian aggregate of `RECORD_SIZE` bytes. Text fields
//! are NUL-padded arrays. The order and width of every field below is the on-flash format:
//! changing either makes previously written slots unreadable.

use crate::config::{
    bounded, AuthMode, SysConfig, DEVICE_ID_LEN, HOST_LEN, MQTT_PASS_LEN, MQTT_USER_LEN,
    SSID_LEN, STA_PASS_LEN, TOPIC_LEN,
};

pub const RECORD_SIZE: usize = 760;

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn u32(&mut self, value: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&value.to_le_bytes());
        self.pos += 4;
    }

    // Single byte followed by padding up to the next word.
    fn u8_padded(&mut self, value: u8) {
        self.buf[self.pos] = value;
        self.pos += 4;
    }

    fn text(&mut self, value: &str, capacity: usize) {
        let value = bounded(value, capacity);
        self.buf[self.pos..self.pos + value.len()].copy_from_slice(value.as_bytes());
        self.pos += capacity;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        u32::from_le_bytes(word)
    }

    fn u8_padded(&mut self) -> u8 {
        let value = self.buf[self.pos];
        self.pos += 4;
        value
    }

    fn text(&mut self, capacity: usize) -> String {
        let field = &self.buf[self.pos..self.pos + capacity];
        self.pos += capacity;
        let end = field.iter().position(|&b| b == 0).unwrap_or(capacity);
        bounded(&String::from_utf8_lossy(&field[..end]), capacity)
    }
}

impl SysConfig {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let mut w = Writer {
            buf: &mut buf,
            pos: 0,
        };

        w.u32(self.cfg_holder);
        w.text(&self.device_id, DEVICE_ID_LEN);
        w.text(&self.sta_ssid, SSID_LEN);
        w.text(&self.sta_pwd, STA_PASS_LEN);
        w.u32(self.sta_type.raw());
        w.text(&self.mqtt_host, HOST_LEN);
        w.u32(self.mqtt_port);
        w.text(&self.mqtt_user, MQTT_USER_LEN);
        w.text(&self.mqtt_pass, MQTT_PASS_LEN);
        w.u32(self.mqtt_keepalive);
        w.u8_padded(self.security);
        w.text(&self.mqtt_topic_config, TOPIC_LEN);
        w.text(&self.mqtt_topic_status, TOPIC_LEN);
        w.text(&self.mqtt_topic_pwm1, TOPIC_LEN);
        w.text(&self.mqtt_topic_pwm2, TOPIC_LEN);
        w.text(&self.mqtt_topic_sw1, TOPIC_LEN);
        w.text(&self.mqtt_topic_sw2, TOPIC_LEN);
        w.text(&self.mqtt_topic_discovery, TOPIC_LEN);
        w.u8_padded(u8::from(self.discovery_flag));
        debug_assert_eq!(w.pos, RECORD_SIZE);

        buf
    }

    /// Decodes a raw slot. Never fails: whether the result is usable is decided by
    /// [`SysConfig::is_initialized`].
    pub fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        let mut r = Reader { buf, pos: 0 };

        Self {
            cfg_holder: r.u32(),
            device_id: r.text(DEVICE_ID_LEN),
            sta_ssid: r.text(SSID_LEN),
            sta_pwd: r.text(STA_PASS_LEN),
            sta_type: AuthMode::from_raw(r.u32()),
            mqtt_host: r.text(HOST_LEN),
            mqtt_port: r.u32(),
            mqtt_user: r.text(MQTT_USER_LEN),
            mqtt_pass: r.text(MQTT_PASS_LEN),
            mqtt_keepalive: r.u32(),
            security: r.u8_padded(),
            mqtt_topic_config: r.text(TOPIC_LEN),
            mqtt_topic_status: r.text(TOPIC_LEN),
            mqtt_topic_pwm1: r.text(TOPIC_LEN),
            mqtt_topic_pwm2: r.text(TOPIC_LEN),
            mqtt_topic_sw1: r.text(TOPIC_LEN),
            mqtt_topic_sw2: r.text(TOPIC_LEN),
            mqtt_topic_discovery: r.text(TOPIC_LEN),
            discovery_flag: r.u8_padded() != 0,
        }
    }
}

/// Contents of the pointer region. `0` selects slot A, anything else slot B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveFlag {
    pub flag: u32,
}

impl SaveFlag {
    pub const SIZE: usize = 4;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.flag.to_le_bytes()
    }

    pub fn from_bytes(buf: [u8; Self::SIZE]) -> Self {
        Self {
            flag: u32::from_le_bytes(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::CFG_HOLDER;

    #[test]
    fn layout_offsets_are_stable() {
        let mut config = SysConfig::factory(0x0000_0001);
        config.mqtt_port = 0x0102_0304;
        config.security = 1;
        let bytes = config.to_bytes();

        assert_eq!(&bytes[0..4], &CFG_HOLDER.to_le_bytes());
        assert_eq!(&bytes[4..20], b"DeviceX_00000001");
        assert_eq!(bytes[20], 0);
        assert_eq!(&bytes[164..168], &3u32.to_le_bytes());
        assert_eq!(&bytes[168..179], b"192.168.1.3");
        assert_eq!(&bytes[232..236], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&bytes[300..304], &120u32.to_le_bytes());
        assert_eq!(bytes[304], 1);
        assert_eq!(&bytes[308..331], b"DeviceX_00000001/config");
        assert_eq!(&bytes[436..449], b"kitchen/light");
        assert_eq!(&bytes[692..701], b"discovery");
        assert_eq!(bytes[756], 1);
    }

    #[test]
    fn erased_slot_decodes_as_uninitialized() {
        let config = SysConfig::from_bytes(&[0xFF; RECORD_SIZE]);
        assert!(!config.is_initialized());
    }

    #[test]
    fn decode_restores_encoded_record() {
        let mut config = SysConfig::factory(0xCAFE);
        config.sta_ssid = "home-net".to_string();
        config.sta_pwd = "hunter22".to_string();
        config.sta_type = AuthMode::Other(77);
        config.discovery_flag = false;

        assert_eq!(SysConfig::from_bytes(&config.to_bytes()), config);
    }

    #[test]
    fn overlong_text_is_truncated_to_field() {
        let mut config = SysConfig::factory(1);
        config.mqtt_user = "u".repeat(40);

        let decoded = SysConfig::from_bytes(&config.to_bytes());
        assert_eq!(decoded.mqtt_user, "u".repeat(31));
        // The NUL terminator keeps the next field intact.
        assert_eq!(decoded.mqtt_pass, "testpass");
    }

    #[test]
    fn erased_pointer_selects_slot_b() {
        let flag = SaveFlag::from_bytes([0xFF; 4]);
        assert_ne!(flag.flag, 0);
        assert_eq!(SaveFlag { flag: 1 }.to_bytes(), [1, 0, 0, 0]);
    }
}
