// Example driving a scan session and one heart rate monitor over the simulated radio
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use ble_session_core::definitions::{AdvertisementData, Characteristic, CharacteristicProperties, CharacteristicRef, Service};
use ble_session_core::identifier::uuid_from_short;
use ble_session_core::{BluetoothSession, ConnectionPhase, DeviceAction, DeviceIdentifier, ScanPhase, SessionSettings, SimulatedRadio};
use futures::StreamExt;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let heart_rate_service = uuid_from_short(0x180D);
    let measurement = CharacteristicRef::new(heart_rate_service, uuid_from_short(0x2A37));
    let control_point = CharacteristicRef::new(heart_rate_service, uuid_from_short(0x2A39));
    let monitor = DeviceIdentifier::from_address("C0:FF:EE:00:00:01");

    let radio = Arc::new(SimulatedRadio::new());
    radio.set_services(monitor, vec![Service::new(
        heart_rate_service,
        vec![
            Characteristic::new(measurement.characteristic, CharacteristicProperties::NOTIFY | CharacteristicProperties::READ),
            Characteristic::new(control_point.characteristic, CharacteristicProperties::WRITE),
        ],
    )]);
    radio.set_value(monitor, measurement.into(), vec![0x00, 72]);

    let (session, service_handle) = BluetoothSession::start(radio.clone(), SessionSettings::default());

    session.initialize().await?;
    let mut phase = session.scan_phase();
    phase.wait_for(|p| *p == ScanPhase::Idle).await?;
    session.start_scanning([heart_rate_service].into_iter().collect()).await?;

    let mut devices = Box::pin(session.devices());
    radio.discover(monitor, AdvertisementData::with_name("Demo HRM"));
    while let Some(list) = devices.next().await {
        info!("Devices in range: {:?}", list.iter().map(|d| &d.advertisement.name).collect::<Vec<_>>());
        if !list.is_empty() {
            break;
        }
    }
    session.stop_scanning().await?;

    let device = session.device(monitor);
    device.connect().await?;
    let mut state = device.state().await?;
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.phase == ConnectionPhase::Idle))
        .await
        .map_err(|_| anyhow!("device did not become ready"))??;
    info!("Connected, services: {:?}", device.snapshot().await?.services.map(|s| s.len()));

    let read = device.enqueue_action(DeviceAction::ReadCharacteristic(measurement)).await?;
    let reset = device
        .enqueue_action(DeviceAction::WriteCharacteristic { characteristic: control_point, value: vec![0x01] })
        .await?;
    let notify = device.enqueue_action(DeviceAction::EnableNotification(measurement)).await?;
    info!("Read: {}, reset: {}, notifications: {}", read.await, reset.await, notify.await);

    radio.notify(monitor, measurement.into(), vec![0x00, 75]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("Cached values: {:?}", device.snapshot().await?.values);

    device.disconnect().await?;
    service_handle.shutdown().await?;
    Ok(())
}
