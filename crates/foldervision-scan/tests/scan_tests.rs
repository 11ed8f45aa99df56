use foldervision_scan::{
    ErrorKind, LaneState, MemoryGuard, ProgressSnapshot, ProgressTracker, ScanContext, ScanEngine,
    ScanSettings, ThreadManager, VolumeTable, RUNNING_PERCENT_CAP,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn manager(settings: ScanSettings) -> ThreadManager {
    ThreadManager::new(settings)
        .unwrap()
        .with_volumes(VolumeTable::default())
}

fn touch(dir: &Path, count: usize) {
    for i in 0..count {
        fs::write(dir.join(format!("f{i}.txt")), "x").unwrap();
    }
}

/// root -> A (3 files) -> C (2 files); root -> B (empty)
fn three_level_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::create_dir_all(root.join("A/C")).unwrap();
    fs::create_dir(root.join("B")).unwrap();
    touch(&root.join("A"), 3);
    touch(&root.join("A/C"), 2);
    temp
}

fn chain(root: &Path, levels: usize) -> PathBuf {
    let mut path = root.to_path_buf();
    for i in 0..levels {
        path.push(format!("l{i}"));
    }
    fs::create_dir_all(&path).unwrap();
    path
}

#[tokio::test]
async fn test_three_level_scan_end_to_end() {
    let temp = three_level_tree();
    let tracker = Arc::new(ProgressTracker::new());

    let result = manager(ScanSettings::default())
        .scan_all(&[temp.path().to_path_buf()], tracker.clone())
        .await
        .unwrap();

    assert_eq!(result.total_folders(), 4);
    assert_eq!(result.total_files(), 5);
    assert!(!result.has_errors());

    let root = &result.roots[0];
    let names: Vec<_> = root.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["A", "B"]);
    assert_eq!(root.subfolder_count(), root.children.len());
    assert!(root.modified.is_some());

    let c = result.find_folder(&temp.path().join("A/C")).unwrap();
    assert_eq!(c.file_count, 2);
    assert_eq!(result.all_folders().count(), 4);

    assert_eq!(tracker.lane(0).unwrap().state, LaneState::Completed);
    assert_eq!(tracker.overall_percent(), 100.0);
    assert_eq!(tracker.estimated_remaining(), Some(std::time::Duration::ZERO));
}

#[tokio::test]
async fn test_roots_merged_in_input_order() {
    let temp = TempDir::new().unwrap();
    let paths: Vec<_> = ["zeta", "alpha", "mid"]
        .iter()
        .map(|name| {
            let p = temp.path().join(name);
            fs::create_dir(&p).unwrap();
            touch(&p, 1);
            p
        })
        .collect();

    let result = manager(ScanSettings::default())
        .scan_all(&paths, Arc::new(ProgressTracker::new()))
        .await
        .unwrap();

    let names: Vec<_> = result.roots.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["zeta", "alpha", "mid"]);
    assert_eq!(result.scanned_paths.iter().cloned().collect::<Vec<_>>(), paths);
    assert_eq!(result.total_folders(), 3);
    assert_eq!(result.total_files(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_after_first_lane_keeps_its_tree() {
    let temp = three_level_tree();
    let first = temp.path().join("A");

    let mut paths = vec![first];
    for name in ["big1", "big2"] {
        let root = temp.path().join(name);
        for i in 0..300 {
            fs::create_dir_all(root.join(format!("d{i}/x"))).unwrap();
        }
        paths.push(root);
    }

    let settings = ScanSettings::builder()
        .max_lanes(1usize)
        .max_threads(1usize)
        .build()
        .unwrap();
    let manager = manager(settings);
    let tracker = Arc::new(ProgressTracker::new());

    let mut rx = tracker.subscribe();
    let cancel = manager.cancel_token();
    let watcher = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) if snapshot.completed_lanes >= 1 => {
                    cancel.cancel();
                    break;
                }
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    });

    let result = manager.scan_all(&paths, tracker.clone()).await.unwrap();
    watcher.await.unwrap();

    let lane0 = &result.roots[0];
    assert_eq!(lane0.name.as_str(), "A");
    assert!(!lane0.truncated);
    assert_eq!(lane0.total_file_count(), 5);

    let states: Vec<_> = tracker.snapshot().lanes.iter().map(|l| l.state).collect();
    assert_eq!(states[0], LaneState::Completed);
    assert_eq!(states[2], LaneState::Cancelled);
    assert!(result.total_folders() < 2 + 2 * 601);
}

#[tokio::test]
async fn test_progress_capped_until_completed() {
    let temp = TempDir::new().unwrap();
    let mut paths = Vec::new();
    for name in ["a", "b", "c"] {
        let root = temp.path().join(name);
        fs::create_dir_all(root.join("x/y")).unwrap();
        fs::create_dir_all(root.join("z")).unwrap();
        paths.push(root);
    }

    let tracker = Arc::new(ProgressTracker::new());
    let mut rx = tracker.subscribe();
    manager(ScanSettings::default())
        .scan_all(&paths, tracker.clone())
        .await
        .unwrap();

    let mut snapshots: Vec<ProgressSnapshot> = Vec::new();
    while let Ok(snapshot) = rx.try_recv() {
        snapshots.push(snapshot);
    }
    assert!(!snapshots.is_empty());

    for snapshot in &snapshots {
        for lane in &snapshot.lanes {
            match lane.state {
                LaneState::Completed => assert_eq!(lane.percent, 100.0),
                _ => assert!(lane.percent <= RUNNING_PERCENT_CAP),
            }
        }
    }

    let last = snapshots.last().unwrap();
    assert_eq!(last.completed_lanes, 3);
    assert_eq!(last.overall_percent, 100.0);
}

#[tokio::test]
async fn test_depth_limit_marks_truncated_without_children() {
    let temp = TempDir::new().unwrap();
    chain(temp.path(), 4);

    let settings = ScanSettings::builder().max_depth(3u32).build().unwrap();
    let result = manager(settings)
        .scan_all(&[temp.path().to_path_buf()], Arc::new(ProgressTracker::new()))
        .await
        .unwrap();

    let root = &result.roots[0];
    assert_eq!(root.max_depth(), 3);
    let deepest = result
        .find_folder(&temp.path().join("l0/l1/l2"))
        .unwrap();
    assert!(deepest.truncated);
    assert!(deepest.children.is_empty());
    assert_eq!(result.all_folders().filter(|n| n.truncated).count(), 1);
}

#[tokio::test]
async fn test_very_deep_tree_stops_at_default_depth() {
    let temp = TempDir::new().unwrap();
    chain(temp.path(), 120);

    let result = manager(ScanSettings::default())
        .scan_all(&[temp.path().to_path_buf()], Arc::new(ProgressTracker::new()))
        .await
        .unwrap();

    assert_eq!(result.roots[0].max_depth(), 50);
    assert_eq!(result.total_folders(), 51);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_sub_cap_bounds_wide_directory() {
    let temp = TempDir::new().unwrap();
    for i in 0..150 {
        fs::create_dir(temp.path().join(format!("w{i}"))).unwrap();
    }

    let settings = ScanSettings::builder()
        .max_threads(16usize)
        .batch_concurrency(3usize)
        .build()
        .unwrap();
    let memory = Arc::new(MemoryGuard::new(&settings));
    let ctx = ScanContext::with_parts(
        settings,
        Arc::new(ProgressTracker::new()),
        memory,
        VolumeTable::default(),
    )
    .unwrap();
    ctx.tracker.initialize(1);

    let engine = ScanEngine::new(0, ctx, CancellationToken::new());
    let root = engine.walk(temp.path()).await.unwrap().unwrap();

    assert_eq!(root.subfolder_count(), 150);
    assert_eq!(engine.batches_run(), 3);
    assert!(engine.peak_in_flight() <= 3);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_directory_recorded_and_truncated() {
    use std::os::unix::fs::PermissionsExt;

    let temp = three_level_tree();
    let locked = temp.path().join("B");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    // Running as root bypasses permission bits.
    let readable = fs::read_dir(&locked).is_ok();

    let result = manager(ScanSettings::default())
        .scan_all(&[temp.path().to_path_buf()], Arc::new(ProgressTracker::new()))
        .await
        .unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    if readable {
        return;
    }
    let b = result.find_folder(&locked).unwrap();
    assert!(b.truncated);
    let records = result.error_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ErrorKind::Access);
    assert_eq!(result.total_files(), 5);
}
