//! End-to-end scenarios driven through the in-memory bus transport.

use std::sync::Arc;
use std::time::Duration;

use bleep::classify::{ClassifyContext, DeviceTypeClassifier, EvidenceType};
use bleep::config::CoreConfig;
use bleep::context::Context;
use bleep::discovery::ScanOptions;
use bleep::gatt::{EnumOptions, EnumVariant, WriteStatus};
use bleep::modes::{connect_and_enumerate, ScanMode};
use lib_bus::mock::{
    MockBus, MockCharacteristic, MockPeripheral, MockService, ReadBehavior, WriteBehavior,
};
use lib_bus::transport::ADAPTER_IFACE;
use lib_bus::{BusError, BusTransport, IpcValue};
use lib_observations::DeviceType;

async fn context_over(bus: Arc<MockBus>) -> (Arc<Context>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = CoreConfig::rooted_at(dir.path());
    let ctx = Context::start_in_memory(config, bus).await.unwrap();
    (ctx, dir)
}

const BATTERY_SVC: &str = "0000180f-0000-1000-8000-00805f9b34fb";
const BATTERY_CHR: &str = "00002a19-0000-1000-8000-00805f9b34fb";
const CUSTOM_SVC: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";
const CUSTOM_CHR: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// S1: three sightings of one device during a passive scan fold into one
/// device row with correct RSSI extrema and at least one adv report.
#[tokio::test]
async fn s1_passive_discovery_deduplication() {
    let bus = Arc::new(MockBus::new());
    bus.add_peripheral(MockPeripheral::new("aa:bb:cc:dd:ee:01").with_name("beacon"));
    bus.stage_advertisement("AA:BB:CC:DD:EE:01", -40);
    bus.stage_advertisement("AA:BB:CC:DD:EE:01", -42);
    bus.stage_advertisement("AA:BB:CC:DD:EE:01", -41);
    let (ctx, _dir) = context_over(bus).await;

    let report = bleep::discovery::passive_scan(
        &ctx,
        &ScanOptions {
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(report.devices.len(), 1);
    let seen = &report.devices[0];
    assert_eq!(seen.rssi_last, Some(-41));
    assert_eq!(seen.rssi_min, Some(-42));
    assert_eq!(seen.rssi_max, Some(-40));

    let row = ctx
        .store
        .get_device("aa:bb:cc:dd:ee:01")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.rssi_last, Some(-41));
    assert_eq!(row.rssi_min, Some(-42));
    assert_eq!(row.rssi_max, Some(-40));
    assert!(row.first_seen <= row.last_seen);

    let advs = ctx.store.get_adv_reports("aa:bb:cc:dd:ee:01", 50).await.unwrap();
    assert!(!advs.is_empty());
}

/// S2: pokey cycles discovery on/off at a one-second cadence and applies
/// the address filter before the first start.
#[tokio::test(start_paused = true)]
async fn s2_pokey_flush_cycle() {
    let bus = Arc::new(MockBus::new());
    bus.add_peripheral(MockPeripheral::new("aa:bb:cc:dd:ee:02"));
    let (ctx, _dir) = context_over(bus.clone()).await;

    let report = bleep::discovery::pokey_scan(
        &ctx,
        &ScanOptions {
            timeout: Duration::from_secs(10),
            target: Some("AA:BB:CC:DD:EE:02".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(report.cycles >= 5, "expected >=5 cycles, got {}", report.cycles);
    let starts = bus.calls_matching(ADAPTER_IFACE, "StartDiscovery");
    let stops = bus.calls_matching(ADAPTER_IFACE, "StopDiscovery");
    assert!(starts >= 5);
    assert_eq!(starts, stops);

    let filter = bus.discovery_filter().expect("filter must be set before first start");
    assert_eq!(
        filter.get("Address").and_then(IpcValue::as_str),
        Some("AA:BB:CC:DD:EE:02")
    );
}

/// S3: a characteristic behind authorisation walls ends up in the
/// permission map, produces no history rows, and the rest of the device
/// still enumerates; LE evidence still classifies the device.
#[tokio::test(start_paused = true)]
async fn s3_enumeration_with_permission_wall() {
    let mac = "aa:bb:cc:dd:ee:03";
    let bus = Arc::new(MockBus::new());
    bus.add_peripheral(
        MockPeripheral::new(mac)
            .with_address_type("random")
            .with_service(
                MockService::new(CUSTOM_SVC).with_characteristic(
                    MockCharacteristic::new(CUSTOM_CHR, 0x0040, &["write"])
                        .with_read(ReadBehavior::Error("org.bluez.Error.NotAuthorized".into()))
                        .with_write(WriteBehavior::Error("org.bluez.Error.NotPermitted".into())),
                ),
            )
            .with_service(
                MockService::new(BATTERY_SVC).with_characteristic(
                    MockCharacteristic::new(BATTERY_CHR, 0x002a, &["read"])
                        .with_read(ReadBehavior::Value(vec![0x63])),
                ),
            ),
    );
    bus.stage_advertisement(mac, -50);
    let (ctx, _dir) = context_over(bus).await;

    let (_device, report, classification) =
        connect_and_enumerate(&ctx, mac, EnumVariant::Pokey, &EnumOptions::default())
            .await
            .unwrap();

    let wall = report
        .permissions
        .get(CUSTOM_CHR)
        .expect("permission map entry for the walled characteristic");
    assert_eq!(wall.get("read").map(String::as_str), Some("NotAuthorized"));
    assert_eq!(wall.get("write").map(String::as_str), Some("NotPermitted"));

    // Both services enumerated despite the wall.
    assert_eq!(report.mapping.services.len(), 2);

    // The failed read produced no history row.
    let walled_history = ctx
        .store
        .get_characteristic_timeline(mac, None, Some(CUSTOM_CHR), 10)
        .await
        .unwrap();
    assert!(walled_history.is_empty());

    // LE evidence unaffected by the authorisation wall.
    assert_eq!(classification.device_type, DeviceType::Le);
    assert!(classification.cited.contains(&EvidenceType::LeAddressTypeRandom));
}

/// S4: brute with verify produces alternating write/read history in order
/// and verified payload echoes.
#[tokio::test(start_paused = true)]
async fn s4_brute_with_verify() {
    let mac = "aa:bb:cc:dd:ee:04";
    let bus = Arc::new(MockBus::new());
    bus.add_peripheral(
        MockPeripheral::new(mac).with_service(
            MockService::new(CUSTOM_SVC).with_characteristic(
                MockCharacteristic::new(CUSTOM_CHR, 0x0040, &["read", "write"])
                    .with_write(WriteBehavior::Echo),
            ),
        ),
    );
    bus.stage_advertisement(mac, -45);
    let (ctx, _dir) = context_over(bus).await;

    let opts = EnumOptions {
        verify: true,
        write_target: Some(CUSTOM_CHR.to_string()),
        payloads: vec![vec![0x00], vec![0x01], vec![0x02]],
        ..Default::default()
    };
    let (_device, report, _classification) =
        connect_and_enumerate(&ctx, mac, EnumVariant::Brute, &opts)
            .await
            .unwrap();

    let outcomes = &report.brute_writes[CUSTOM_CHR];
    assert_eq!(outcomes.len(), 3);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.payload, vec![i as u8]);
        assert_eq!(outcome.status, WriteStatus::Ok);
        assert_eq!(outcome.verify.as_deref(), Some(&[i as u8][..]));
    }

    let timeline = ctx
        .store
        .get_characteristic_timeline(mac, None, Some(CUSTOM_CHR), 20)
        .await
        .unwrap();
    let sources: Vec<&str> = timeline.iter().map(|row| row.source.as_str()).collect();
    assert_eq!(sources, vec!["write", "read", "write", "read", "write", "read"]);
    assert_eq!(timeline[0].value.as_deref(), Some(&[0x00u8][..]));
    assert_eq!(timeline[5].value.as_deref(), Some(&[0x02u8][..]));
}

/// S5: conclusive Classic plus conclusive LE evidence classifies dual,
/// citing both.
#[tokio::test]
async fn s5_dual_mode_classification() {
    let bus = Arc::new(MockBus::new());
    let (ctx, _dir) = context_over(bus).await;
    let mac = "cc:dd:ee:00:11:22";
    ctx.store
        .upsert_device(mac, Default::default())
        .await
        .unwrap();

    let classify_context = ClassifyContext {
        device_class: Some(0x5a020c),
        address_type: Some("random".to_string()),
        uuids: vec![
            "0000110b-0000-1000-8000-00805f9b34fb".to_string(),
            "00001800-0000-1000-8000-00805f9b34fb".to_string(),
        ],
        has_advertising_data: true,
        connected: true,
        gatt_service_count: Some(3),
        sdp_record_count: None,
    };
    let result = DeviceTypeClassifier::new()
        .classify_with_mode(&ctx, mac, &classify_context, ScanMode::Pokey, false)
        .await;

    assert_eq!(result.device_type, DeviceType::Dual);
    assert!(result.cited.contains(&EvidenceType::ClassicDeviceClass));
    assert!(result.cited.contains(&EvidenceType::LeAddressTypeRandom));
    assert!(result.reasoning.contains("classic_device_class"));
    assert!(result.reasoning.contains("le_address_type_random"));

    // The cached hint on the device row strengthened to dual.
    let row = ctx.store.get_device(mac).await.unwrap().unwrap();
    assert_eq!(row.device_type, "dual");
}

/// S6: a stalled PBAP transfer is aborted by the watchdog; the session is
/// disposed, no phonebook file or metadata row remains.
#[tokio::test]
async fn s6_pbap_watchdog() {
    let mac = "aa:bb:cc:dd:ee:06";
    let bus = Arc::new(MockBus::new());
    bus.set_phonebook(mac, "PB", b"BEGIN:VCARD\nEND:VCARD\n");
    bus.stall_transfers(true);
    let (ctx, dir) = context_over(bus.clone()).await;

    let out_dir = dir.path().join("pbap-out");
    let opts = bleep::classic::PbapOptions {
        repos: vec!["PB".to_string()],
        watchdog: Duration::from_millis(150),
        dest_dir: Some(out_dir.clone()),
        ..Default::default()
    };
    let err = bleep::classic::pull_phonebook(&ctx, mac, &opts).await.unwrap_err();
    match err {
        BusError::OperationTimeout { op, .. } => assert_eq!(op, "pbap"),
        other => panic!("expected pbap watchdog timeout, got {other:?}"),
    }

    let leftovers = std::fs::read_dir(&out_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
    assert!(ctx.store.get_pbap_metadata(mac).await.unwrap().is_empty());
    let sessions = bus
        .get_managed_objects(lib_bus::transport::OBEX_SERVICE)
        .await
        .unwrap()
        .keys()
        .filter(|path| path.contains("session"))
        .count();
    assert_eq!(sessions, 0);
}

/// Scan-tier classification: a random-address advertiser classifies LE
/// straight from the passive sweep.
#[tokio::test]
async fn scan_mode_classifies_from_advertisement_evidence() {
    let bus = Arc::new(MockBus::new());
    bus.add_peripheral(
        MockPeripheral::new("aa:bb:cc:dd:ee:07")
            .with_address_type("random")
            .with_uuids(&["0000180f-0000-1000-8000-00805f9b34fb"]),
    );
    bus.stage_advertisement("aa:bb:cc:dd:ee:07", -60);
    let (ctx, _dir) = context_over(bus).await;

    let summaries = bleep::modes::scan_with_mode(
        &ctx,
        ScanMode::Passive,
        &ScanOptions {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].classification.device_type, DeviceType::Le);
    assert!(summaries[0]
        .classification
        .cited
        .contains(&EvidenceType::LeAddressTypeRandom));
}

/// CTF flow: flag-shaped read values are extracted, scored and submitted
/// to the flag characteristic.
#[tokio::test(start_paused = true)]
async fn ctf_flow_submits_high_confidence_flags() {
    let mac = "cc:50:e3:b6:bc:a6";
    let ctf_svc = "000000ff-0000-1000-8000-00805f9b34fb";
    let score_chr = "0000ff01-0000-1000-8000-00805f9b34fb";
    let submit_chr = "0000ff02-0000-1000-8000-00805f9b34fb";
    let flag_chr = "0000ff03-0000-1000-8000-00805f9b34fb";

    let bus = Arc::new(MockBus::new());
    bus.add_peripheral(
        MockPeripheral::new(mac).with_service(
            MockService::new(ctf_svc)
                .with_characteristic(
                    MockCharacteristic::new(score_chr, 0x002a, &["read"])
                        .with_read(ReadBehavior::Value(b"0/20".to_vec())),
                )
                .with_characteristic(
                    MockCharacteristic::new(submit_chr, 0x002c, &["write"])
                        .with_write(WriteBehavior::Accept),
                )
                .with_characteristic(
                    MockCharacteristic::new(flag_chr, 0x002e, &["read"]).with_read(
                        ReadBehavior::Value(b"d205303e099ceff44835d51af11d1c72".to_vec()),
                    ),
                ),
        ),
    );
    bus.stage_advertisement(mac, -55);

    let dir = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::rooted_at(dir.path());
    config.ctf_mac = Some(mac.to_string());
    let ctx = Context::start_in_memory(config, bus).await.unwrap();

    let report = bleep::modes::run_ctf(&ctx).await.unwrap();
    assert_eq!(report.score_before.as_deref(), Some("0/20"));
    let submitted: Vec<_> = report.candidates.iter().filter(|c| c.submitted).collect();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].char_uuid, flag_chr);
    assert_eq!(submitted[0].flag, "d205303e099ceff44835d51af11d1c72");

    // The submission shows up as a write in the flag-submit history.
    let timeline = ctx
        .store
        .get_characteristic_timeline(mac, None, Some(submit_chr), 10)
        .await
        .unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].source, "write");
}
