use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use thiserror::Error;
use tracing::{info, warn};

use lightnode_common::{
    apply_update, config::DEFAULT_MQTT_PORT, topics, ConfigStore, ConfigView,
    DiscoveryAnnouncement, FlashDriver, FlashError, FlashLayout, MemFlash, SysConfig,
    CFG_LOCATION, SECTOR_SIZE, STATUS_OFFLINE, STATUS_ONLINE,
};

const MAX_UPDATE_PAYLOAD_BYTES: usize = 1024;
const DEFAULT_CHIP_ID: u32 = 0x00C0_FFEE;
const FLASH_IMAGE_FILE: &str = "flash.bin";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
enum SettingsError {
    #[error("{var} must be a number, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
    #[error("LIGHTNODE_CFG_SECTOR {0:#x} puts the configuration sectors past the 32-bit address space")]
    UnaddressableSector(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostSettings {
    data_dir: PathBuf,
    chip_id: u32,
    layout: FlashLayout,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
}

impl HostSettings {
    fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let data_dir = lookup("LIGHTNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./.lightnode"));

        let chip_id = match lookup("LIGHTNODE_CHIP_ID") {
            Some(value) => {
                let digits = value.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(digits, 16).map_err(|_| SettingsError::InvalidNumber {
                    var: "LIGHTNODE_CHIP_ID",
                    value: value.clone(),
                })?
            }
            None => DEFAULT_CHIP_ID,
        };

        let base_sector = match lookup("LIGHTNODE_CFG_SECTOR") {
            Some(value) => parse_sector(&value).ok_or(SettingsError::InvalidNumber {
                var: "LIGHTNODE_CFG_SECTOR",
                value,
            })?,
            None => CFG_LOCATION,
        };
        let layout = FlashLayout::new(base_sector);
        if !layout.is_addressable() {
            return Err(SettingsError::UnaddressableSector(base_sector));
        }

        Ok(Self {
            data_dir,
            chip_id,
            layout,
            mqtt_host: lookup("MQTT_HOST"),
            mqtt_port: lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()),
        })
    }

    fn image_path(&self) -> PathBuf {
        self.data_dir.join(FLASH_IMAGE_FILE)
    }
}

fn parse_sector(value: &str) -> Option<u32> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Flash emulated in memory and written through to an image file, so configuration survives
/// host restarts the way it survives power cycles on the device.
///
/// Each erase/program rewrites only the bytes it touched, in place. A process killed mid-write
/// tears that one range, like a power cut on real flash, and never shortens the image.
struct ImageFlash {
    file: File,
    inner: MemFlash,
}

impl ImageFlash {
    fn open(path: &Path, layout: FlashLayout) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open flash image {}", path.display()))?;

        let mut image = Vec::new();
        file.read_to_end(&mut image)
            .with_context(|| format!("failed to read flash image {}", path.display()))?;

        let required = FlashLayout::offset(layout.end_sector())
            .context("configuration sectors are not addressable")? as usize;
        if image.len() < required {
            let existing = image.len();
            image.resize(required, 0xFF);
            write_range(&mut file, existing as u64, &image[existing..])
                .with_context(|| format!("failed to extend flash image {}", path.display()))?;
        }

        Ok(Self {
            file,
            inner: MemFlash::from_image(image),
        })
    }

    // FlashDriver is synchronous, so image I/O blocks the boot task for the length of a commit.
    fn persist(&mut self, offset: u32, len: usize) -> Result<(), FlashError> {
        let start = offset as usize;
        let bytes = &self.inner.image()[start..start + len];
        write_range(&mut self.file, u64::from(offset), bytes)
            .map_err(|err| FlashError::Io(err.to_string()))
    }
}

fn write_range(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()
}

impl FlashDriver for ImageFlash {
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        self.inner.erase_sector(sector)?;
        self.persist(FlashLayout::offset(sector)?, SECTOR_SIZE as usize)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.inner.write(offset, data)?;
        self.persist(offset, data.len())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.inner.read(offset, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootOutcome {
    Restart,
    Shutdown,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env()?;
    info!(
        "node chip id {:08X}, flash image {}",
        settings.chip_id,
        settings.image_path().display()
    );

    loop {
        match boot(&settings).await? {
            BootOutcome::Restart => info!("restarting to apply new configuration"),
            BootOutcome::Shutdown => return Ok(()),
        }
    }
}

async fn boot(settings: &HostSettings) -> anyhow::Result<BootOutcome> {
    let flash = ImageFlash::open(&settings.image_path(), settings.layout)?;
    let mut store = ConfigStore::new(flash, settings.layout, settings.chip_id);
    let mut config = store
        .load()
        .context("failed to load configuration from flash")?;
    info!(
        "configuration loaded: {}",
        serde_json::to_string(&ConfigView::from(&config))?
    );

    let (mqtt, mut eventloop) = connect(settings, &config);
    let mut announced = false;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    on_connected(&mqtt, &config, &mut announced).await?;
                }
                Ok(Event::Incoming(Incoming::Publish(message)))
                    if message.topic == config.mqtt_topic_config =>
                {
                    if let Some(outcome) = handle_update(&mut store, &mut config, &message.payload)? {
                        return Ok(outcome);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                return Ok(BootOutcome::Shutdown);
            }
        }
    }
}

fn broker_port(settings: &HostSettings, config: &SysConfig) -> u16 {
    if let Some(port) = settings.mqtt_port {
        return port;
    }

    u16::try_from(config.mqtt_port).unwrap_or_else(|_| {
        warn!(
            "stored mqtt port {} is out of range, using {DEFAULT_MQTT_PORT}",
            config.mqtt_port
        );
        DEFAULT_MQTT_PORT as u16
    })
}

fn connect(settings: &HostSettings, config: &SysConfig) -> (AsyncClient, EventLoop) {
    let host = settings
        .mqtt_host
        .clone()
        .unwrap_or_else(|| config.mqtt_host.clone());
    let port = broker_port(settings, config);
    let client_id = if config.device_id.is_empty() {
        topics::device_id(settings.chip_id)
    } else {
        config.device_id.clone()
    };

    info!("connecting to mqtt://{host}:{port} as {client_id}");
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(u64::from(config.mqtt_keepalive)));

    if !config.mqtt_user.is_empty() {
        options.set_credentials(config.mqtt_user.clone(), config.mqtt_pass.clone());
    }
    if !config.mqtt_topic_status.is_empty() {
        options.set_last_will(LastWill::new(
            config.mqtt_topic_status.clone(),
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
    }
    if config.uses_tls() {
        warn!("configuration requests TLS; the host build connects without it");
    }

    AsyncClient::new(options, 32)
}

async fn on_connected(
    mqtt: &AsyncClient,
    config: &SysConfig,
    announced: &mut bool,
) -> anyhow::Result<()> {
    if config.mqtt_topic_config.is_empty() {
        warn!("no config topic stored; remote updates are disabled for this boot");
    } else {
        mqtt.subscribe(config.mqtt_topic_config.clone(), QoS::AtMostOnce)
            .await
            .context("failed to subscribe to config topic")?;
    }

    if !config.mqtt_topic_status.is_empty() {
        mqtt.publish(
            config.mqtt_topic_status.clone(),
            QoS::AtLeastOnce,
            true,
            STATUS_ONLINE,
        )
        .await
        .context("failed to publish online status")?;
    }

    if config.discovery_flag && !*announced && !config.mqtt_topic_discovery.is_empty() {
        let payload = serde_json::to_vec(&DiscoveryAnnouncement::from(config))?;
        mqtt.publish(
            config.mqtt_topic_discovery.clone(),
            QoS::AtLeastOnce,
            false,
            payload,
        )
        .await
        .context("failed to publish discovery announcement")?;
        *announced = true;
        info!(
            "announced {} on {}",
            config.device_id, config.mqtt_topic_discovery
        );
    }

    Ok(())
}

fn handle_update<F: FlashDriver>(
    store: &mut ConfigStore<F>,
    config: &mut SysConfig,
    payload: &[u8],
) -> anyhow::Result<Option<BootOutcome>> {
    if payload.len() > MAX_UPDATE_PAYLOAD_BYTES {
        warn!(
            "dropping oversized config payload ({} bytes)",
            payload.len()
        );
        return Ok(None);
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!("dropping config payload that is not UTF-8");
        return Ok(None);
    };

    *config = store
        .load_remote_profile()
        .context("failed to reload configuration before update")?;

    let mut restart_requested = false;
    let report = apply_update(store, config, text, &mut || restart_requested = true)
        .context("failed to commit configuration update")?;
    info!(
        "configuration update committed, {} field(s) changed",
        report.applied.len()
    );

    Ok(restart_requested.then_some(BootOutcome::Restart))
}
