//! Fly and step scans of an area detector connected in mock mode.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daq_devices::areadetector::{AdBaseDataType, AreaDetector, UNBOUNDED_FRAMES};
use daq_devices::detector::{DetectorController, TriggerInfo};
use daq_devices::device::{ConnectOptions, Connectable};
use daq_devices::documents::StreamAsset;
use daq_devices::providers::{AutoIncrementFilenameProvider, StaticPathProvider};
use daq_devices::signal::{InMemoryTransport, MockSignalBackend};
use daq_devices::testing::{callback_on_mock_put, set_mock_put_proceeds, set_mock_value};

async fn mocked_detector() -> AreaDetector {
    let paths = StaticPathProvider::new(
        Arc::new(AutoIncrementFilenameProvider::new("saxs")),
        "/data/cm12345",
    );
    let det = AreaDetector::builder(
        Arc::new(InMemoryTransport::new("ca")),
        "BL01:SAXS:",
        Arc::new(paths),
    )
    .readout_time(0.001)
    .build("saxs")
    .unwrap();
    det.connect(ConnectOptions::mock()).await.unwrap();

    let drv = det.driver();
    set_mock_value(drv.array_size_x.as_ref(), 64).unwrap();
    set_mock_value(drv.array_size_y.as_ref(), 32).unwrap();
    set_mock_value(drv.data_type.as_ref(), AdBaseDataType::UInt32).unwrap();
    let hdf = det.hdf();
    set_mock_value(hdf.file_path_exists.as_ref(), true).unwrap();
    set_mock_value(hdf.num_frames_chunks.as_ref(), 1).unwrap();
    set_mock_value(
        hdf.full_file_name.as_ref(),
        "/data/cm12345/saxs_00000.h5".to_string(),
    )
    .unwrap();
    det
}

/// Frames land in the file every few milliseconds once acquisition starts.
fn produce_frames(captured: Arc<MockSignalBackend<i32>>, frames: i32) {
    tokio::spawn(async move {
        for frame in 1..=frames {
            tokio::time::sleep(Duration::from_millis(5)).await;
            captured.set_value(frame);
        }
    });
}

fn datum_ranges(docs: &[StreamAsset]) -> Vec<(u64, u64)> {
    docs.iter()
        .filter_map(|doc| match doc {
            StreamAsset::StreamDatum(datum) => {
                Some((datum.index_range.start, datum.index_range.stop))
            }
            StreamAsset::StreamResource(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn flyscan_writes_every_frame_and_documents_it() {
    let det = mocked_detector().await;
    let captured = det.hdf().num_captured.mock().unwrap();
    let _frames = callback_on_mock_put(det.driver().acquire.as_ref(), move |start, _| {
        if *start {
            produce_frames(captured.clone(), 4);
        }
    })
    .unwrap();

    let detector = det.detector();
    detector.stage().await.unwrap();
    detector
        .prepare(TriggerInfo::new(4).with_livetime(0.01))
        .await
        .unwrap();
    assert_eq!(det.driver().num_images.get_value().await.unwrap(), 4);
    assert!((det.driver().acquire_period.get_value().await.unwrap() - 0.011).abs() < 1e-12);
    assert_eq!(det.hdf().file_name.get_value().await.unwrap(), "saxs_00000");
    assert!(detector.describe().contains_key("saxs"));

    detector.kickoff().await.unwrap();
    let status = detector.complete().unwrap();
    tokio::time::timeout(Duration::from_secs(5), status.wait())
        .await
        .unwrap()
        .unwrap();
    let last = status.latest().unwrap();
    assert_eq!(last.current, 4.0);
    assert_eq!(last.target, 4.0);
    assert_eq!(last.fraction(), 1.0);
    // Writer is closed once the acquisition completes.
    assert!(!det.hdf().capture.get_value().await.unwrap());

    let docs = detector.collect_asset_docs(None).await.unwrap();
    assert!(matches!(&docs[0], StreamAsset::StreamResource(r) if r.data_key == "saxs"));
    assert_eq!(datum_ranges(&docs), vec![(0, 4)]);
    assert!(detector.collect_asset_docs(None).await.unwrap().is_empty());
    detector.unstage().await.unwrap();
}

#[tokio::test]
async fn unbounded_acquisition_runs_until_disarmed() {
    let det = mocked_detector().await;
    let captured = det.hdf().num_captured.mock().unwrap();
    let detector = det.detector();
    detector.stage().await.unwrap();
    detector
        .prepare(TriggerInfo::new(0).with_livetime(0.01))
        .await
        .unwrap();
    assert_eq!(
        det.driver().num_images.get_value().await.unwrap(),
        UNBOUNDED_FRAMES
    );

    // Acquire completes only when the driver stops.
    set_mock_put_proceeds(det.driver().acquire.as_ref(), false).unwrap();
    detector.kickoff().await.unwrap();
    let status = detector.complete().unwrap();
    produce_frames(captured, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!status.is_done());
    assert_eq!(status.latest().unwrap().current, 3.0);

    detector.controller().disarm().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), status.wait())
        .await
        .unwrap()
        .unwrap();
    let docs = detector.collect_asset_docs(None).await.unwrap();
    assert_eq!(datum_ranges(&docs), vec![(0, 3)]);
}

#[tokio::test]
async fn step_scan_takes_one_frame_per_trigger() {
    let det = mocked_detector().await;
    let captured = det.hdf().num_captured.mock().unwrap();
    let frames = Arc::new(AtomicI32::new(0));
    let _frames = callback_on_mock_put(det.driver().acquire.as_ref(), move |start, _| {
        if *start {
            captured.set_value(frames.fetch_add(1, Ordering::SeqCst) + 1);
        }
    })
    .unwrap();

    let detector = det.detector();
    detector.stage().await.unwrap();
    let mut ranges = Vec::new();
    for point in 1..=3u64 {
        detector.trigger().await.unwrap();
        assert_eq!(detector.get_index().await.unwrap(), point);
        let docs = detector.collect_asset_docs(None).await.unwrap();
        ranges.extend(datum_ranges(&docs));
    }
    assert_eq!(ranges, vec![(0, 1), (1, 2), (2, 3)]);
    // Default step exposure is applied once, on the first trigger.
    assert_eq!(det.driver().num_images.get_value().await.unwrap(), 1);
    assert_eq!(det.driver().acquire_time.get_value().await.unwrap(), 0.1);
    detector.unstage().await.unwrap();
}
