// Tests for loading and validating waypoint sequence files

use std::io::Write;

use scan_rig::sequence::{Sequence, SequenceError, Target};
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        name = "upper ring"
        home = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        turntable = {{ channel = 0 }}
        angle_speed = 30.0

        [[waypoint]]
        label = "approach"
        pose = [87.0, 0.0, 166.5, 180.0, 0.0, 0.0]
        captures = 0

        [[waypoint]]
        joints = [0.0, -16.3, 7.8, 0.0, 40.5, 0.0]
        settle = 5.0
        captures = 20
        "#
    )
    .unwrap();

    let seq = Sequence::load(file.path()).unwrap();

    assert_eq!(seq.name, "upper ring");
    assert_eq!(seq.home, Some([0.0; 6]));
    assert_eq!(seq.turntable.map(|t| t.channel), Some(0));
    assert_eq!(seq.angle_speed, Some(30.0));
    assert_eq!(seq.waypoints.len(), 2);
    assert_eq!(seq.waypoints[0].label.as_deref(), Some("approach"));
    assert_eq!(seq.waypoints[0].target, Target::Pose([87.0, 0.0, 166.5, 180.0, 0.0, 0.0]));
    assert_eq!(seq.waypoints[1].settle, 5.0);
    assert_eq!(seq.total_captures(), 20);
    assert_eq!(seq.pause_seconds(), 120.0);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = Sequence::load("does/not/exist.toml").unwrap_err();
    assert!(matches!(err, SequenceError::Io(_)));
}

#[test]
fn test_rejects_bad_sequences() {
    let cases = [
        ("", "no waypoints"),
        ("repeat = 0\n[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]", "repeat"),
        ("[[waypoint]]\nsettle = 1.0", "missing"),
        (
            "[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]\npose = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]",
            "not both",
        ),
        ("[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]\nsettle = -1.0", "settle"),
        ("[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]\nspeed = 0.0", "speed"),
        ("[[waypoint]]\njoints = [nan, 0.0, 0.0, 0.0, 0.0, 0.0]", "finite"),
        ("tcp_speed = -5.0\n[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]", "tcp_speed"),
    ];
    for (toml, expected) in cases {
        let err = Sequence::from_toml_str(toml).unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "'{}' should mention '{}', got '{}'",
            toml,
            expected,
            err
        );
    }
}

#[test]
fn test_waypoint_errors_carry_index() {
    let err = Sequence::from_toml_str(
        "[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]\n[[waypoint]]\ncaptures = 1",
    )
    .unwrap_err();
    assert!(matches!(err, SequenceError::Waypoint { index: 2, .. }));
}

#[test]
fn test_unknown_keys_and_short_vectors_fail_to_parse() {
    let typo = Sequence::from_toml_str("[[waypoint]]\njoint = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]");
    assert!(matches!(typo, Err(SequenceError::Toml(_))));
    let short = Sequence::from_toml_str("[[waypoint]]\njoints = [0.0, 0.0]");
    assert!(matches!(short, Err(SequenceError::Toml(_))));
}

#[test]
fn test_shipped_sequences_are_valid() {
    for entry in std::fs::read_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/sequences")).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            let seq = Sequence::load(&path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
            assert!(seq.total_captures() > 0, "{} captures nothing", path.display());
        }
    }
}
