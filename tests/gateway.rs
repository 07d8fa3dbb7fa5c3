use std::time::Duration;

use devex::adapters::{DeviceBus, SimulatedDeviceBus, SimulatedTransport};
use devex::core::{DeviceError, DeviceRegistry, DeviceSession};
use devex::export::{ExportEngine, ExportEvent, ExportItem};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn plug_export_unplug_lifecycle() {
    let registry = DeviceRegistry::new();
    let (bus, controller) = SimulatedDeviceBus::new();
    let (tx, mut rx) = mpsc::channel(8);
    bus.start(tx);

    controller.plug("udid-123");
    let event = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed");
    registry.handle_event(event);

    let session = registry.get("udid-123").unwrap();
    let names = session.list_dir("/DCIM/100APPLE").unwrap();
    assert_eq!(names.len(), 1);
    let data = session
        .read_file_to_vec("/DCIM/100APPLE/IMG_udid-123.JPG")
        .unwrap();
    assert!(!data.is_empty());

    controller.unplug("udid-123");
    let event = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed");
    registry.handle_event(event);

    assert!(!session.is_live());
    assert!(matches!(session.stat("/x"), Err(DeviceError::DeviceGone)));
    assert!(matches!(
        registry.get("udid-123"),
        Err(DeviceError::NotInitialized)
    ));
}

#[tokio::test]
async fn device_yank_mid_job_fails_items_without_crashing() {
    let mut transport = SimulatedTransport::new();
    transport.add_file("/one.bin", vec![1u8; 64 * 1024]);
    transport.add_file("/two.bin", vec![2u8; 1024]);
    let probe = transport.probe();
    // Stall the copy after the first chunk so the yank lands mid-item.
    probe.gate_reads("/one.bin", 8 * 1024);
    let session = DeviceSession::new("yanked-device", Box::new(transport));
    let dest = tempfile::tempdir().unwrap();

    let engine = ExportEngine::new();
    let (_job_id, mut rx) = engine
        .start_export(
            session,
            vec![ExportItem::new("/one.bin"), ExportItem::new("/two.bin")],
            dest.path(),
        )
        .unwrap();

    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ExportEvent::Progress { .. })) => break,
            Ok(Some(_)) => continue,
            other => panic!("unexpected while waiting for progress: {other:?}"),
        }
    }

    // Physical removal while the worker is mid-read.
    probe.yank();
    probe.release_reads("/one.bin");

    let mut events = Vec::new();
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for export events"),
        }
    }

    // Both items fail with typed errors; the job still reaches a terminal
    // summary instead of crashing.
    match events.last() {
        Some(ExportEvent::Finished(summary)) => {
            assert_eq!(summary.successful, 0);
            assert_eq!(summary.failed, 2);
        }
        other => panic!("expected Finished, got {other:?}"),
    }
    for event in &events {
        if let ExportEvent::ItemDone(result) = event {
            assert!(!result.success);
            assert!(!result.error.is_empty());
        }
    }

    // No partial output survives the failure.
    assert!(fs_is_empty(dest.path()));
}

#[tokio::test]
async fn invalidation_waits_for_inflight_call_then_fails_new_ones() {
    let mut transport = SimulatedTransport::new();
    transport.add_file("/f.bin", vec![9u8; 4096]);
    let probe = transport.probe();
    probe.gate_reads("/f.bin", 0);
    let session = DeviceSession::new("teardown-device", Box::new(transport));

    let reader = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || {
            let handle = session
                .open_file("/f.bin", devex::core::OpenMode::ReadOnly)
                .unwrap();
            let mut buf = [0u8; 1024];
            session.read(handle, &mut buf)
        })
    };

    // Let the reader block inside the gated transport call.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let invalidator = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.invalidate())
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!invalidator.is_finished(), "teardown must wait for in-flight call");

    probe.release_reads("/f.bin");
    assert!(reader.await.unwrap().is_ok());
    timeout(Duration::from_secs(2), invalidator)
        .await
        .expect("invalidate should complete")
        .unwrap();

    assert!(matches!(session.stat("/f.bin"), Err(DeviceError::DeviceGone)));
}

fn fs_is_empty(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
}
