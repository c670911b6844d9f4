use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tiler::{
    CancellationToken, CollectingSink, EventKind, EventSink, JobState, LasFile, MemoryInput, NullSink,
    RawPoint, SourceProvider, Tiler, TilerError, TilerEvent, TilerOptions, Tileset,
};

const UTM_32N: u32 = 32632;

/// `n` points on a jittered lattice starting at (`east`, `north`) in UTM 32N.
fn patch(name: &str, n: usize, east: f64, north: f64) -> Arc<dyn SourceProvider> {
    let points = (0..n)
        .map(|i| {
            let x = (i % 97) as f64 * 1.7;
            let y = ((i / 97) % 89) as f64 * 1.9;
            let z = 250.0 + (i % 13) as f64 * 0.4;
            RawPoint::new(east + x, north + y, z)
                .with_color(if i % 2 == 0 { 65535 } else { 0 }, 32768, 0)
                .with_intensity(1024)
                .with_classification((i % 5) as u8)
        })
        .collect();
    Arc::new(MemoryInput::new(name, points, Some(UTM_32N)))
}

fn tiler() -> Tiler {
    let options = TilerOptions::default()
        .with_grid_size(4.0)
        .with_max_depth(6)
        .with_min_points_per_tile(250)
        .with_num_workers(3);
    Tiler::new(options).unwrap()
}

/// Every file below `root`, keyed by its relative path.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn read_tileset(dir: &Path) -> Tileset {
    serde_json::from_slice(&fs::read(dir.join("tileset.json")).unwrap()).unwrap()
}

#[test]
fn empty_input_produces_a_root_only_tileset() {
    let dir = tempfile::tempdir().unwrap();
    let report = tiler()
        .process_files(
            vec![patch("empty", 0, 500_000.0, 4_982_950.0)],
            dir.path(),
            UTM_32N,
            &CancellationToken::new(),
            &NullSink,
        )
        .unwrap();

    let stats = report.into_result().unwrap();
    assert_eq!(stats[0].points, 0);
    assert_eq!(stats[0].export.payloads, 0);

    let tileset = read_tileset(dir.path());
    assert!(tileset.root.content.is_none());
    assert!(tileset.root.children.is_empty());
    assert_eq!(snapshot(dir.path()).len(), 1);
}

#[test]
fn every_point_is_written_exactly_once_with_rescaled_color() {
    let dir = tempfile::tempdir().unwrap();
    let report = tiler()
        .process_files(
            vec![patch("a", 20_000, 500_000.0, 4_982_950.0)],
            dir.path(),
            UTM_32N,
            &CancellationToken::new(),
            &NullSink,
        )
        .unwrap();
    let stats = report.into_result().unwrap();
    assert!(stats[0].nodes > 1);

    let mut total = 0;
    for (path, bytes) in snapshot(dir.path()) {
        if path.extension().is_some_and(|e| e == "pnts") {
            let tile = pnts::parse_pnts_bytes(&bytes).unwrap();
            assert!(tile.colors.iter().all(|c| c[0] == 255 || c[0] == 0));
            assert!(tile.colors.iter().all(|c| c[1] == 128 && c[2] == 0));
            assert!(tile.intensities.iter().all(|&i| i == 4));
            total += tile.len();
        }
    }
    assert_eq!(total, 20_000);
    assert_eq!(stats[0].export.points, 20_000);
}

#[test]
fn join_shares_one_baseline_and_independent_runs_do_not() {
    let west = || patch("west", 3_000, 500_000.0, 4_982_950.0);
    let east = || patch("east", 3_000, 502_000.0, 4_982_950.0);
    let cancel = CancellationToken::new();

    let joined_dir = tempfile::tempdir().unwrap();
    let joined = tiler()
        .process_files(vec![west(), east()], joined_dir.path(), UTM_32N, &cancel, &NullSink)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].points, 6_000);
    assert!(joined_dir.path().join("tileset.json").is_file());

    let split_dir = tempfile::tempdir().unwrap();
    let split = tiler()
        .process_each(vec![west(), east()], split_dir.path(), UTM_32N, &cancel, &NullSink)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(split.len(), 2);
    assert!(split_dir.path().join("west/tileset.json").is_file());
    assert!(split_dir.path().join("east/tileset.json").is_file());

    let (w, e, j) = (split[0].baseline.0, split[1].baseline.0, joined[0].baseline.0);
    assert!(w.distance(e) > 1_500.0);
    // The merged baseline sits between the two patches.
    assert!((j.distance(w) - j.distance(e)).abs() < 1.0);
    assert!(j.distance(w) > 500.0);
}

#[test]
fn identical_runs_are_byte_identical() {
    let run = || {
        let dir = tempfile::tempdir().unwrap();
        tiler()
            .process_files(
                vec![patch("a", 8_000, 500_000.0, 4_982_950.0), patch("b", 4_000, 500_050.0, 4_983_000.0)],
                dir.path(),
                UTM_32N,
                &CancellationToken::new(),
                &NullSink,
            )
            .unwrap()
            .into_result()
            .unwrap();
        snapshot(dir.path())
    };

    let first = run();
    let second = run();
    assert!(first.len() > 2);
    assert_eq!(first, second);
}

#[test]
fn events_follow_the_job_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CollectingSink::new();
    tiler()
        .process_each(
            vec![patch("one", 1_000, 500_000.0, 4_982_950.0), patch("two", 1_000, 501_000.0, 4_982_950.0)],
            dir.path(),
            UTM_32N,
            &CancellationToken::new(),
            &sink,
        )
        .unwrap()
        .into_result()
        .unwrap();

    use EventKind::*;
    let expected = [
        ReadLasHeaderStarted,
        ReadLasHeaderCompleted,
        PointLoadingStarted,
        PointLoadingCompleted,
        BuildStarted,
        BuildCompleted,
        ExportStarted,
        ExportCompleted,
    ];
    assert_eq!(sink.kinds_for("one"), expected);
    assert_eq!(sink.kinds_for("two"), expected);
    assert!(sink.events().iter().all(|e| !e.kind.is_error()));
}

#[test]
fn cancelled_before_start_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = tiler()
        .process_files(
            vec![patch("a", 5_000, 500_000.0, 4_982_950.0)],
            dir.path(),
            UTM_32N,
            &cancel,
            &NullSink,
        )
        .unwrap();

    assert_eq!(report.jobs[0].state, JobState::Error);
    assert!(matches!(report.into_result(), Err(TilerError::Cancelled)));
    assert!(!dir.path().join("tileset.json").exists());
}

#[test]
fn cancelling_mid_build_never_claims_success() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let sink = CollectingSink::new();
    let cancelling_sink = |event: &TilerEvent| {
        if event.kind == EventKind::BuildStarted {
            trigger.cancel();
        }
        sink.on_event(event);
    };

    let report = tiler()
        .process_files(
            vec![patch("a", 20_000, 500_000.0, 4_982_950.0)],
            dir.path(),
            UTM_32N,
            &cancel,
            &cancelling_sink,
        )
        .unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.failed_in, Some(JobState::Building));
    assert!(matches!(job.outcome, Err(TilerError::Cancelled)));
    assert_eq!(sink.kinds_for("a").last(), Some(&EventKind::BuildError));
    assert!(!dir.path().join("tileset.json").exists());
}

#[test]
fn las_file_is_tiled_end_to_end() {
    let input_dir = tempfile::tempdir().unwrap();
    let path = input_dir.path().join("survey.las");

    // GeoKeyDirectory declaring EPSG:32632 as the projected CRS.
    let geokeys: Vec<u8> = [1u16, 1, 0, 1, 3072, 0, 1, UTM_32N as u16]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    let mut builder = las::Builder::from((1, 2));
    builder.point_format = las::point::Format::new(2).unwrap();
    builder.vlrs.push(las::Vlr {
        user_id: "LASF_Projection".to_owned(),
        record_id: 34735,
        description: String::new(),
        data: geokeys,
    });
    let mut writer = las::Writer::from_path(&path, builder.into_header().unwrap()).unwrap();
    for i in 0..600u16 {
        writer
            .write_point(las::Point {
                x: 500_000.0 + f64::from(i % 30),
                y: 4_982_950.0 + f64::from(i / 30),
                z: 250.0,
                intensity: 2560,
                color: Some(las::Color::new(65535, 0, 32768)),
                ..Default::default()
            })
            .unwrap();
    }
    writer.close().unwrap();

    let out = tempfile::tempdir().unwrap();
    let inputs: Vec<Arc<dyn SourceProvider>> = vec![Arc::new(LasFile(path))];
    let stats = tiler()
        .process_files(inputs, out.path(), UTM_32N, &CancellationToken::new(), &NullSink)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(stats[0].points, 600);

    let mut total = 0;
    for (path, bytes) in snapshot(out.path()) {
        if path.extension().is_some_and(|e| e == "pnts") {
            let tile = pnts::parse_pnts_bytes(&bytes).unwrap();
            assert!(tile.colors.iter().all(|c| *c == [255, 0, 128]));
            assert!(tile.intensities.iter().all(|&i| i == 10));
            total += tile.len();
        }
    }
    assert_eq!(total, 600);
}

#[test]
fn geoid_heights_lift_the_baseline() {
    let baseline = |geoid: bool| {
        let dir = tempfile::tempdir().unwrap();
        let options = TilerOptions::default().with_num_workers(2).with_geoid_elevation(geoid);
        Tiler::new(options)
            .unwrap()
            .process_files(
                vec![patch("a", 100, 500_000.0, 4_982_950.0)],
                dir.path(),
                UTM_32N,
                &CancellationToken::new(),
                &NullSink,
            )
            .unwrap()
            .into_result()
            .unwrap()[0]
            .baseline
            .0
    };

    let ellipsoidal = baseline(false);
    let orthometric = baseline(true);
    // Northern Italy sits roughly 45-50 m above the ellipsoid.
    let lift = orthometric.length() - ellipsoidal.length();
    assert!((30.0..70.0).contains(&lift), "lift {lift}");
}
