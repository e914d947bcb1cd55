// Integration tests for the capture adapter against the simulated camera

use scan_rig::camera::sim::{SimulatedCamera, SIM_FAILURE};
use scan_rig::camera::{CameraError, CaptureAdapter};
use scan_rig::config::CameraConfig;
use scan_rig::run::Run;
use tempfile::tempdir;

fn small_camera() -> CameraConfig {
    CameraConfig {
        width: 16,
        height: 8,
        ..CameraConfig::default()
    }
}

#[tokio::test]
async fn test_capture_writes_numbered_png() {
    let dir = tempdir().unwrap();
    let mut run = Run::create(dir.path(), "run", "picture").await.unwrap();
    let mut camera = CaptureAdapter::init(Box::new(SimulatedCamera::new()), &small_camera()).unwrap();

    let first = camera.capture(&mut run).unwrap();
    let second = camera.capture(&mut run).unwrap();

    assert_eq!(first, dir.path().join("run1").join("picture1.png"));
    assert_eq!(second, dir.path().join("run1").join("picture2.png"));
    assert_eq!(run.pictures_taken(), 2);

    let img = image::open(&first).unwrap().to_rgb8();
    assert_eq!(img.dimensions(), (16, 8));
}

#[tokio::test]
async fn test_frame_is_flipped_and_converted() {
    let dir = tempdir().unwrap();
    let mut run = Run::create(dir.path(), "run", "picture").await.unwrap();
    let config = CameraConfig { flip_vertical: false, ..small_camera() };
    let mut camera = CaptureAdapter::init(Box::new(SimulatedCamera::new()), &config).unwrap();
    let straight = camera.capture(&mut run).unwrap();
    camera.close();

    let config = CameraConfig { flip_vertical: true, ..small_camera() };
    let mut camera = CaptureAdapter::init(Box::new(SimulatedCamera::new()), &config).unwrap();
    let flipped = camera.capture(&mut run).unwrap();

    let straight = image::open(&straight).unwrap().to_rgb8();
    let flipped = image::open(&flipped).unwrap().to_rgb8();
    // Both are the first frame of a fresh camera, so they differ only by the flip
    for y in 0..8 {
        for x in 0..16 {
            assert_eq!(straight.get_pixel(x, y), flipped.get_pixel(x, 7 - y));
        }
    }
    // Simulated BGR frame 1: blue = x + 7, red = x + y
    assert_eq!(straight.get_pixel(3, 2)[0], 5);
    assert_eq!(straight.get_pixel(3, 2)[2], 10);
}

#[tokio::test]
async fn test_failed_freeze_keeps_numbering() {
    let dir = tempdir().unwrap();
    let mut run = Run::create(dir.path(), "run", "picture").await.unwrap();
    let mut camera = CaptureAdapter::init(Box::new(SimulatedCamera::new().failing_freeze(1)), &small_camera()).unwrap();

    let err = camera.capture(&mut run).unwrap_err();
    assert!(matches!(err, CameraError::Capture { step: "freeze", code: SIM_FAILURE }));
    assert_eq!(run.pictures_taken(), 0);

    let path = camera.capture(&mut run).unwrap();
    assert!(path.ends_with("picture1.png"));
}

#[tokio::test]
async fn test_existing_picture_is_not_overwritten() {
    let dir = tempdir().unwrap();
    let mut run = Run::create(dir.path(), "run", "picture").await.unwrap();
    std::fs::write(run.next_picture_path(), b"keep").unwrap();
    let mut camera = CaptureAdapter::init(Box::new(SimulatedCamera::new()), &small_camera()).unwrap();

    let err = camera.capture(&mut run).unwrap_err();

    assert!(matches!(err, CameraError::Io { .. }));
    assert_eq!(std::fs::read(run.next_picture_path()).unwrap(), b"keep");
    assert_eq!(run.pictures_taken(), 0);
}

#[test]
fn test_init_failure_releases_device() {
    let camera = SimulatedCamera::new().failing_at("image memory");
    let handle = camera.handle();

    let err = CaptureAdapter::init(Box::new(camera), &small_camera()).err().unwrap();

    assert!(matches!(err, CameraError::DeviceInit { step: "image memory", .. }));
    assert_eq!(handle.inits(), 1);
    assert_eq!(handle.allocs(), 1);
    assert_eq!(handle.frees(), 1);
    assert_eq!(handle.exits(), 1);
}

#[test]
fn test_failed_device_init_has_nothing_to_release() {
    let camera = SimulatedCamera::new().failing_at("init");
    let handle = camera.handle();

    assert!(CaptureAdapter::init(Box::new(camera), &small_camera()).is_err());
    assert_eq!(handle.inits(), 0);
    assert_eq!(handle.exits(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_blocks_capture() {
    let dir = tempdir().unwrap();
    let mut run = Run::create(dir.path(), "run", "picture").await.unwrap();
    let camera = SimulatedCamera::new();
    let handle = camera.handle();
    let mut adapter = CaptureAdapter::init(Box::new(camera), &small_camera()).unwrap();

    adapter.close();
    adapter.close();
    assert!(!adapter.is_open());
    assert!(matches!(adapter.capture(&mut run), Err(CameraError::Closed)));
    drop(adapter);

    assert_eq!(handle.exits(), 1);
    assert_eq!(handle.frees(), 1);
}
