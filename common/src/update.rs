//! Remote configuration updates.
//!
//! The payload is a loose `key: 'value', ...` text. It is not parsed as JSON: it is split on a
//! fixed delimiter set and consumed as alternating key/value tokens. A token in key position
//! that is not a known field is skipped on its own, so the token after it is tried as the next
//! key.

use log::{error, info, warn};

use crate::{
    config::{
        bounded, SysConfig, HOST_LEN, MQTT_PASS_LEN, MQTT_USER_LEN, SSID_LEN, STA_PASS_LEN,
        TOPIC_LEN,
    },
    flash::FlashDriver,
    store::{ConfigStore, StoreError},
    topics::substitute_chip_id,
};

pub const DELIMITERS: &[char] = &['\'', '{', '"', ':', ',', ' ', '}', '\n'];

/// Lazy token stream over an update payload. Empty tokens are never produced.
#[derive(Debug, Clone)]
pub struct UpdateTokens<'a> {
    rest: &'a str,
}

impl<'a> UpdateTokens<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { rest: text }
    }
}

impl<'a> Iterator for UpdateTokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let start = self.rest.trim_start_matches(DELIMITERS);
        if start.is_empty() {
            self.rest = start;
            return None;
        }

        let end = start.find(DELIMITERS).unwrap_or(start.len());
        let (token, rest) = start.split_at(end);
        self.rest = rest;
        Some(token)
    }
}

type Setter = fn(&mut SysConfig, &str, u32);

pub struct UpdateField {
    pub key: &'static str,
    apply: Setter,
}

pub static UPDATE_FIELDS: &[UpdateField] = &[
    UpdateField {
        key: "mqtt_topic_pwm1",
        apply: set_topic_pwm1,
    },
    UpdateField {
        key: "mqtt_topic_pwm2",
        apply: set_topic_pwm2,
    },
    UpdateField {
        key: "mqtt_topic_sw1",
        apply: set_topic_sw1,
    },
    UpdateField {
        key: "mqtt_topic_sw2",
        apply: set_topic_sw2,
    },
    UpdateField {
        key: "mqtt_host",
        apply: set_mqtt_host,
    },
    UpdateField {
        key: "mqtt_port",
        apply: set_mqtt_port,
    },
    UpdateField {
        key: "mqtt_user",
        apply: set_mqtt_user,
    },
    UpdateField {
        key: "mqtt_pass",
        apply: set_mqtt_pass,
    },
    UpdateField {
        key: "sta_ssid",
        apply: set_sta_ssid,
    },
    UpdateField {
        key: "sta_pass",
        apply: set_sta_pass,
    },
];

pub fn lookup_field(key: &str) -> Option<&'static UpdateField> {
    UPDATE_FIELDS.iter().find(|field| field.key == key)
}

fn topic(value: &str, chip_id: u32) -> String {
    bounded(&substitute_chip_id(value, chip_id), TOPIC_LEN)
}

fn set_topic_pwm1(config: &mut SysConfig, value: &str, chip_id: u32) {
    config.mqtt_topic_pwm1 = topic(value, chip_id);
}

fn set_topic_pwm2(config: &mut SysConfig, value: &str, chip_id: u32) {
    config.mqtt_topic_pwm2 = topic(value, chip_id);
}

fn set_topic_sw1(config: &mut SysConfig, value: &str, chip_id: u32) {
    config.mqtt_topic_sw1 = topic(value, chip_id);
}

fn set_topic_sw2(config: &mut SysConfig, value: &str, chip_id: u32) {
    config.mqtt_topic_sw2 = topic(value, chip_id);
}

fn set_mqtt_host(config: &mut SysConfig, value: &str, _: u32) {
    config.mqtt_host = bounded(value, HOST_LEN);
}

fn set_mqtt_port(config: &mut SysConfig, value: &str, _: u32) {
    config.mqtt_port = parse_port(value);
}

fn set_mqtt_user(config: &mut SysConfig, value: &str, _: u32) {
    config.mqtt_user = bounded(value, MQTT_USER_LEN);
}

fn set_mqtt_pass(config: &mut SysConfig, value: &str, _: u32) {
    config.mqtt_pass = bounded(value, MQTT_PASS_LEN);
}

fn set_sta_ssid(config: &mut SysConfig, value: &str, _: u32) {
    config.sta_ssid = bounded(value, SSID_LEN);
}

fn set_sta_pass(config: &mut SysConfig, value: &str, _: u32) {
    config.sta_pwd = bounded(value, STA_PASS_LEN);
}

/// Leading decimal digits of `value`, `0` when there are none. Saturates instead of wrapping.
pub fn parse_port(value: &str) -> u32 {
    let value = value.trim_start();
    let value = value.strip_prefix('+').unwrap_or(value);

    value
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |acc, digit| {
            acc.saturating_mul(10).saturating_add(u32::from(digit - b'0'))
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub applied: Vec<&'static str>,
    pub ignored: Vec<String>,
    /// A known key that ended the payload without a value.
    pub dangling_key: Option<&'static str>,
}

/// Restart primitive invoked once at the end of [`apply_update`].
pub trait Restart {
    fn restart(&mut self);
}

impl<T: FnMut()> Restart for T {
    fn restart(&mut self) {
        self()
    }
}

/// Applies the recognized fields of `text` to `config` without committing anything.
pub fn apply_fields(config: &mut SysConfig, chip_id: u32, text: &str) -> UpdateReport {
    let mut report = UpdateReport::default();
    let mut tokens = UpdateTokens::new(text);

    while let Some(token) = tokens.next() {
        let Some(field) = lookup_field(token) else {
            report.ignored.push(token.to_string());
            continue;
        };

        match tokens.next() {
            Some(value) => {
                (field.apply)(config, value, chip_id);
                report.applied.push(field.key);
            }
            None => report.dangling_key = Some(field.key),
        }
    }

    report
}

/// Applies a remote update, consumes the discovery flag, commits and restarts.
///
/// The restart happens whether or not the commit succeeded. On hardware the restart does not
/// return; elsewhere the commit result is handed back to the caller.
pub fn apply_update<F, R>(
    store: &mut ConfigStore<F>,
    config: &mut SysConfig,
    text: &str,
    restart: &mut R,
) -> Result<UpdateReport, StoreError>
where
    F: FlashDriver,
    R: Restart + ?Sized,
{
    let report = apply_fields(config, store.chip_id(), text);
    config.discovery_flag = false;

    info!("remote update applied fields {:?}", report.applied);
    if !report.ignored.is_empty() {
        warn!("remote update ignored tokens {:?}", report.ignored);
    }
    if let Some(key) = report.dangling_key {
        warn!("remote update ended before a value for `{key}`");
    }

    let saved = store.save(config);
    if let Err(err) = &saved {
        error!("committing remote update failed: {err}");
    }

    restart.restart();
    saved.map(|()| report)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::flash::{FlashLayout, MemFlash};

    const CHIP_ID: u32 = 0x0012ABCD;

    #[test]
    fn tokenizer_splits_on_every_delimiter() {
        let tokens: Vec<_> =
            UpdateTokens::new("{\"mqtt_host\": 'a.b',\n mqtt_port:1883}").collect();
        assert_eq!(tokens, vec!["mqtt_host", "a.b", "mqtt_port", "1883"]);

        assert_eq!(UpdateTokens::new("").next(), None);
        assert_eq!(UpdateTokens::new(" ,:'\"{}\n").next(), None);
    }

    #[test]
    fn tokenizer_is_restartable() {
        let mut tokens = UpdateTokens::new("a b c");
        tokens.next();
        let snapshot = tokens.clone();

        assert_eq!(tokens.collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(snapshot.collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn dispatch_updates_only_named_fields() {
        let before = SysConfig::factory(CHIP_ID);
        let mut config = before.clone();

        let report = apply_fields(
            &mut config,
            CHIP_ID,
            "mqtt_host:'broker.example.com', mqtt_port:'1883'",
        );

        assert_eq!(report.applied, vec!["mqtt_host", "mqtt_port"]);
        let expected = SysConfig {
            mqtt_host: "broker.example.com".to_string(),
            mqtt_port: 1883,
            ..before
        };
        assert_eq!(config, expected);
    }

    #[test]
    fn unknown_key_does_not_block_following_pairs() {
        let mut config = SysConfig::factory(CHIP_ID);

        let report = apply_fields(&mut config, CHIP_ID, "bogus_key:'x', mqtt_user:'alice'");

        assert_eq!(config.mqtt_user, "alice");
        assert_eq!(report.ignored, vec!["bogus_key", "x"]);
        assert_eq!(report.applied, vec!["mqtt_user"]);
    }

    #[test]
    fn value_of_unknown_key_is_examined_as_a_key() {
        let mut config = SysConfig::factory(CHIP_ID);

        apply_fields(&mut config, CHIP_ID, "bogus:mqtt_host:evil");

        assert_eq!(config.mqtt_host, "evil");
    }

    #[test]
    fn keys_are_case_sensitive() {
        let mut config = SysConfig::factory(CHIP_ID);

        let report = apply_fields(&mut config, CHIP_ID, "MQTT_HOST:other");

        assert_eq!(config.mqtt_host, "192.168.1.3");
        assert!(report.applied.is_empty());
    }

    #[test]
    fn trailing_key_without_value_is_left_alone() {
        let mut config = SysConfig::factory(CHIP_ID);

        let report = apply_fields(&mut config, CHIP_ID, "sta_ssid:garage, sta_pass");

        assert_eq!(config.sta_ssid, "garage");
        assert_eq!(config.sta_pwd, "");
        assert_eq!(report.dangling_key, Some("sta_pass"));
    }

    #[test]
    fn port_parses_like_atoi() {
        assert_eq!(parse_port("1883"), 1883);
        assert_eq!(parse_port("8883abc"), 8883);
        assert_eq!(parse_port("+42"), 42);
        assert_eq!(parse_port("abc"), 0);
        assert_eq!(parse_port("-5"), 0);
        assert_eq!(parse_port("99999999999"), u32::MAX);
    }

    #[test]
    fn values_are_copied_verbatim() {
        let mut config = SysConfig::factory(CHIP_ID);

        apply_fields(&mut config, CHIP_ID, "mqtt_pass:%s%n%x mqtt_user:100%");

        assert_eq!(config.mqtt_pass, "%s%n%x");
        assert_eq!(config.mqtt_user, "100%");
    }

    #[test]
    fn topics_take_the_chip_id_substitution() {
        let mut config = SysConfig::factory(CHIP_ID);

        apply_fields(
            &mut config,
            CHIP_ID,
            "mqtt_topic_pwm1:node/%08X/light mqtt_topic_sw2:hall/%d",
        );

        assert_eq!(config.mqtt_topic_pwm1, "node/0012ABCD/light");
        assert_eq!(config.mqtt_topic_sw2, "hall/%d");
    }

    #[test]
    fn every_table_field_is_reachable() {
        let mut config = SysConfig::zeroed();
        let payload = UPDATE_FIELDS
            .iter()
            .map(|field| format!("{}:'7'", field.key))
            .collect::<Vec<_>>()
            .join(", ");

        let report = apply_fields(&mut config, CHIP_ID, &payload);

        assert_eq!(report.applied.len(), UPDATE_FIELDS.len());
        assert_eq!(config.mqtt_port, 7);
        assert_eq!(config.sta_pwd, "7");
        assert_eq!(config.mqtt_topic_sw1, "7");
    }

    #[test]
    fn apply_update_commits_and_restarts_once() {
        let layout = FlashLayout::default();
        let mut store = ConfigStore::new(MemFlash::for_layout(layout), layout, CHIP_ID);
        let mut config = store.load().unwrap();
        assert!(config.discovery_flag);

        let mut restarts = 0;
        let mut restart = || restarts += 1;
        apply_update(&mut store, &mut config, "mqtt_port:'8883'", &mut restart).unwrap();

        assert_eq!(restarts, 1);
        assert!(!config.discovery_flag);
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn dispatch_through_apply_update_is_one_commit() {
        let layout = FlashLayout::default();
        let mut flash = MemFlash::for_layout(layout);
        let before = ConfigStore::new(&mut flash, layout, CHIP_ID).load().unwrap();
        let mut config = before.clone();
        flash.clear_ops();

        let mut store = ConfigStore::new(&mut flash, layout, CHIP_ID);

        let mut restarts = 0;
        let mut restart = || restarts += 1;
        apply_update(
            &mut store,
            &mut config,
            "mqtt_host:'broker.example.com', mqtt_port:'1883'",
            &mut restart,
        )
        .unwrap();

        let expected = SysConfig {
            mqtt_host: "broker.example.com".to_string(),
            mqtt_port: 1883,
            discovery_flag: false,
            ..before
        };
        assert_eq!(config, expected);
        assert_eq!(restarts, 1);
        // One data erase+program, one pointer erase+program.
        assert_eq!(store.flash().ops().len(), 4);
        assert_eq!(store.load().unwrap(), expected);
    }

    #[test]
    fn committed_record_matches_memory_after_nul_in_value() {
        let layout = FlashLayout::default();
        let mut store = ConfigStore::new(MemFlash::for_layout(layout), layout, CHIP_ID);
        let mut config = store.load().unwrap();

        let mut restart = || {};
        apply_update(&mut store, &mut config, "mqtt_user:a\u{0}b", &mut restart).unwrap();

        assert_eq!(config.mqtt_user, "a");
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn restart_happens_even_when_commit_fails() {
        let layout = FlashLayout::default();
        let mut flash = MemFlash::for_layout(layout);
        let mut store = ConfigStore::new(&mut flash, layout, CHIP_ID);
        let mut config = store.load().unwrap();
        drop(store);
        flash.fail_after(0);

        let mut store = ConfigStore::new(&mut flash, layout, CHIP_ID);
        let mut restarts = 0;
        let mut restart = || restarts += 1;
        let result = apply_update(&mut store, &mut config, "mqtt_user:x", &mut restart);

        assert!(result.is_err());
        assert_eq!(restarts, 1);
    }
}
