use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{modem::Modem, prelude::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use esp_idf_sys as sys;
use log::{info, warn};

use lightnode_common::{
    apply_update, AuthMode, ConfigStore, DiscoveryAnnouncement, FlashDriver, FlashError,
    FlashLayout, SysConfig, SECTOR_SIZE, STATUS_OFFLINE, STATUS_ONLINE,
};

const MAX_UPDATE_PAYLOAD_BYTES: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2000;
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The default SPI flash chip, addressed through the raw `esp_flash_*` API.
struct EspFlash;

fn check(rc: sys::esp_err_t) -> Result<(), FlashError> {
    if rc == sys::ESP_OK {
        Ok(())
    } else {
        Err(FlashError::Driver(rc))
    }
}

fn flash_len(len: usize) -> Result<u32, FlashError> {
    u32::try_from(len).map_err(|_| FlashError::OutOfRange { offset: 0, len })
}

impl FlashDriver for EspFlash {
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let offset = FlashLayout::offset(sector)?;
        let rc = unsafe {
            sys::esp_flash_erase_region(core::ptr::null_mut(), offset, SECTOR_SIZE)
        };
        check(rc)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let len = flash_len(data.len())?;
        let rc = unsafe {
            sys::esp_flash_write(core::ptr::null_mut(), data.as_ptr().cast(), offset, len)
        };
        check(rc)
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let len = flash_len(buf.len())?;
        let rc = unsafe {
            sys::esp_flash_read(core::ptr::null_mut(), buf.as_mut_ptr().cast(), offset, len)
        };
        check(rc)
    }
}

/// Lower 24 bits of the factory MAC, the value older SDKs reported as the chip id.
fn chip_id() -> anyhow::Result<u32> {
    let mut mac = [0u8; 6];
    let rc = unsafe { sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != sys::ESP_OK {
        bail!("failed to read factory MAC (esp error {rc})");
    }
    Ok(u32::from(mac[3]) << 16 | u32::from(mac[4]) << 8 | u32::from(mac[5]))
}

fn auth_method(mode: AuthMode) -> AuthMethod {
    match mode {
        AuthMode::Open => AuthMethod::None,
        AuthMode::Wep => AuthMethod::WEP,
        AuthMode::WpaPsk => AuthMethod::WPA,
        AuthMode::Wpa2Psk => AuthMethod::WPA2Personal,
        AuthMode::WpaWpa2Psk => AuthMethod::WPAWPA2Personal,
        AuthMode::Other(raw) => {
            warn!("unknown station auth mode {raw}, trying WPA2");
            AuthMethod::WPA2Personal
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let chip_id = chip_id()?;
    let layout = FlashLayout::default();
    let mut store = ConfigStore::new(EspFlash, layout, chip_id);
    let mut config = store
        .load()
        .context("failed to load configuration from flash")?;
    info!(
        "configuration loaded: device `{}`, mqtt `{}:{}`",
        config.device_id, config.mqtt_host, config.mqtt_port
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;
    let _wifi = connect_wifi(modem, sys_loop, nvs_partition, &config)
        .context("wifi startup failed")?;

    let (client, conn) = create_mqtt_client(&config)?;
    let client = Arc::new(Mutex::new(client));
    let (updates_tx, updates_rx) = mpsc::channel::<Vec<u8>>();
    spawn_mqtt_receiver(conn, client.clone(), config.clone(), updates_tx);

    for payload in updates_rx {
        let Ok(text) = core::str::from_utf8(&payload) else {
            warn!("dropping config payload that is not UTF-8");
            continue;
        };

        config = store
            .load_remote_profile()
            .context("failed to reload configuration before update")?;

        let mut restart = || {
            unsafe { sys::esp_restart() };
        };
        apply_update(&mut store, &mut config, text, &mut restart)
            .context("failed to commit configuration update")?;
    }

    bail!("mqtt receiver stopped")
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &SysConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if config.sta_ssid.is_empty() {
        bail!("no station SSID stored");
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .sta_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .sta_pwd
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: auth_method(config.sta_type),
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.sta_ssid);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                break;
            }
            Err(err) if attempt < WIFI_CONNECT_ATTEMPTS => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
            Err(err) => {
                return Err(err).context(format!(
                    "wifi connect failed after {WIFI_CONNECT_ATTEMPTS} attempts"
                ))
            }
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    config: &SysConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    if config.uses_tls() {
        warn!("configuration requests TLS, which this build does not configure");
    }
    let url = format!("mqtt://{}:{}", config.mqtt_host, config.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(config.device_id.as_str()),
        username: if config.mqtt_user.is_empty() {
            None
        } else {
            Some(config.mqtt_user.as_str())
        },
        password: if config.mqtt_pass.is_empty() {
            None
        } else {
            Some(config.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(u64::from(config.mqtt_keepalive))),
        lwt: if config.mqtt_topic_status.is_empty() {
            None
        } else {
            Some(LwtConfiguration {
                topic: config.mqtt_topic_status.as_str(),
                payload: STATUS_OFFLINE.as_bytes(),
                qos: QoS::AtLeastOnce,
                retain: true,
            })
        },
        ..Default::default()
    };

    info!("connecting to {url} as {}", config.device_id);
    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn on_connected(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    config: &SysConfig,
    announced: &mut bool,
) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;

    if !config.mqtt_topic_config.is_empty() {
        mqtt.subscribe(&config.mqtt_topic_config, QoS::AtMostOnce)?;
    }
    if !config.mqtt_topic_status.is_empty() {
        mqtt.publish(
            &config.mqtt_topic_status,
            QoS::AtLeastOnce,
            true,
            STATUS_ONLINE.as_bytes(),
        )?;
    }

    if config.discovery_flag && !*announced && !config.mqtt_topic_discovery.is_empty() {
        let payload = serde_json::to_vec(&DiscoveryAnnouncement::from(config))?;
        mqtt.publish(
            &config.mqtt_topic_discovery,
            QoS::AtLeastOnce,
            false,
            &payload,
        )?;
        *announced = true;
        info!(
            "announced {} on {}",
            config.device_id, config.mqtt_topic_discovery
        );
    }

    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    config: SysConfig,
    updates: mpsc::Sender<Vec<u8>>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut announced = false;
            loop {
                match conn.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("mqtt connected");
                            if let Err(err) = on_connected(&mqtt, &config, &mut announced) {
                                warn!("mqtt session setup failed: {err:#}");
                            }
                        }
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details: Details::Complete,
                            ..
                        } if topic == config.mqtt_topic_config => {
                            if data.len() > MAX_UPDATE_PAYLOAD_BYTES {
                                warn!("dropping oversized config payload ({} bytes)", data.len());
                                continue;
                            }
                            if updates.send(data.to_vec()).is_err() {
                                return;
                            }
                        }
                        EventPayload::Disconnected => warn!("mqtt disconnected"),
                        _ => {}
                    },
                    Err(err) => {
                        warn!("mqtt receive loop error: {err:?}");
                        thread::sleep(MQTT_RETRY_DELAY);
                    }
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}
