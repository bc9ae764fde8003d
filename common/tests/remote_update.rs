use lightnode_common::{
    apply_update, ConfigStore, FlashLayout, MemFlash, SaveStage, StoreError, SysConfig,
};
use pretty_assertions::assert_eq;

const CHIP_ID: u32 = 0x00E5F00D;

fn boot(flash: MemFlash, layout: FlashLayout) -> (ConfigStore<MemFlash>, SysConfig) {
    let mut store = ConfigStore::new(flash, layout, CHIP_ID);
    let config = store.load().expect("boot load");
    (store, config)
}

#[test]
fn update_survives_restart() {
    let layout = FlashLayout::new(0x10);
    let (mut store, mut config) = boot(MemFlash::for_layout(layout), layout);
    assert!(config.discovery_flag);
    assert_eq!(config.device_id, "DeviceX_00E5F00D");

    let mut restarted = false;
    let report = apply_update(
        &mut store,
        &mut config,
        "{\"mqtt_host\":\"broker.example.com\",\"mqtt_port\":\"8883\",\"sta_ssid\":\"attic\"}",
        &mut || restarted = true,
    )
    .unwrap();
    assert!(restarted);
    assert_eq!(report.applied, vec!["mqtt_host", "mqtt_port", "sta_ssid"]);

    let (_, rebooted) = boot(store.into_inner(), layout);
    assert_eq!(rebooted, config);
    assert_eq!(rebooted.mqtt_host, "broker.example.com");
    assert_eq!(rebooted.mqtt_port, 8883);
    assert_eq!(rebooted.sta_ssid, "attic");
    assert!(!rebooted.discovery_flag);
    assert_eq!(rebooted.device_id, "DeviceX_00E5F00D");
}

#[test]
fn power_loss_during_update_keeps_previous_configuration() {
    let layout = FlashLayout::default();
    let (store, before) = boot(MemFlash::for_layout(layout), layout);
    let mut flash = store.into_inner();

    // Lose power on the data slot program, one op into the commit.
    flash.fail_after(1);
    let mut store = ConfigStore::new(flash, layout, CHIP_ID);
    let mut config = before.clone();
    let err = apply_update(&mut store, &mut config, "mqtt_user:'mallory'", &mut || {})
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Save {
            stage: SaveStage::DataSlotWriting,
            ..
        }
    ));

    let mut flash = store.into_inner();
    flash.restore_power();
    let (_, rebooted) = boot(flash, layout);
    assert_eq!(rebooted, before);
}

#[test]
fn remote_profile_bootstrap_on_blank_flash() {
    let layout = FlashLayout::default();
    let mut store = ConfigStore::new(MemFlash::for_layout(layout), layout, CHIP_ID);

    let mut config = store.load_remote_profile().unwrap();
    apply_update(&mut store, &mut config, "mqtt_user:'carol'", &mut || {}).unwrap();

    let (_, rebooted) = boot(store.into_inner(), layout);
    assert_eq!(rebooted.mqtt_user, "carol");
    assert!(rebooted.device_id.is_empty());
    assert!(rebooted.mqtt_topic_config.is_empty());
}
