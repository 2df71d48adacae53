use std::{sync::Arc, time::Duration};

use slicestore::{
    diskalloc,
    disksync,
    events::Events,
    volume::{AssignmentConfig, VolumeError, ID_FILE, ID_LENGTH},
    writer::{Overrides, Volume, VolumeConfig, Volumes, WriterError},
};

#[path = "common/mod.rs"]
mod common;
use common::{
    test_slice, volume_spec, FailingCloseOpener, GatedOpener, HeldWriteOpener, RecordingAllocator,
};

#[tokio::test(flavor = "multi_thread")]
async fn volume_id_is_generated_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let spec = volume_spec(root.path(), "hdd", "1");

    let volume = Volume::open(spec.clone(), VolumeConfig::default(), &Events::new())
        .await
        .expect("open");
    let id = volume.id().clone();
    assert_eq!(id.as_str().len(), ID_LENGTH);
    let on_disk = std::fs::read_to_string(spec.path.join(ID_FILE)).expect("read id");
    assert_eq!(on_disk.trim(), id.as_str());
    volume.close().await.expect("close");

    let reopened = Volume::open(spec, VolumeConfig::default(), &Events::new())
        .await
        .expect("reopen");
    assert_eq!(reopened.id(), &id);
    reopened.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_writer_volume_is_locked_out() {
    let root = tempfile::tempdir().expect("tempdir");
    let spec = volume_spec(root.path(), "hdd", "1");

    let first = Volume::open(spec.clone(), VolumeConfig::default(), &Events::new())
        .await
        .expect("open");
    let err = Volume::open(spec.clone(), VolumeConfig::default(), &Events::new())
        .await
        .err()
        .expect("second open must fail");
    assert!(matches!(err, VolumeError::AlreadyLocked { .. }), "{err}");

    first.close().await.expect("close");
    assert!(!spec.path.join("writer.lock").exists());
    let again = Volume::open(spec, VolumeConfig::default(), &Events::new())
        .await
        .expect("open after release");
    again.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_volume_dir_fails() {
    let root = tempfile::tempdir().expect("tempdir");
    let spec = slicestore::VolumeSpec::new("my-node", root.path().join("missing"), "hdd", "1");
    let err = Volume::open(spec, VolumeConfig::default(), &Events::new())
        .await
        .err()
        .expect("missing dir");
    assert!(matches!(err, VolumeError::Path { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_writer_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
    )
    .await
    .expect("open");
    let slice = test_slice(volume.id(), "slice-1");

    let writer = volume
        .open_writer("my-node", slice.clone())
        .await
        .expect("first writer");
    let err = volume
        .open_writer("my-node", slice.clone())
        .await
        .err()
        .expect("duplicate");
    assert!(matches!(err, WriterError::AlreadyExists));

    // Another source node may write into the same slice.
    let other = volume
        .open_writer("other-node", slice.clone())
        .await
        .expect("other node");
    assert_eq!(volume.writers().len(), 2);

    writer.close().await.expect("close writer");
    other.close().await.expect("close other");
    assert!(volume.writers().is_empty());

    // The key is free again once the writer closed.
    let reopened = volume
        .open_writer("my-node", slice)
        .await
        .expect("reopen writer");
    volume.close().await.expect("close volume");
    assert!(matches!(
        reopened.close().await,
        Err(WriterError::AlreadyClosed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_volume_rejects_writers() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
    )
    .await
    .expect("open");
    volume.close().await.expect("close");
    let err = volume
        .open_writer("my-node", test_slice(volume.id(), "slice-1"))
        .await
        .err()
        .expect("closed volume");
    assert!(matches!(err, WriterError::VolumeClosed(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn writer_opened_during_volume_close_is_closed() {
    let root = tempfile::tempdir().expect("tempdir");
    let opener = Arc::new(GatedOpener::new());
    let volume = Arc::new(
        Volume::open_with(
            volume_spec(root.path(), "hdd", "1"),
            VolumeConfig::default(),
            &Events::new(),
            Overrides {
                file_opener: Some(opener.clone()),
                allocator: None,
            },
        )
        .await
        .expect("open"),
    );
    let slice = test_slice(volume.id(), "slice-1");
    let file_path = slice.file_path(volume.path());

    let opening = tokio::spawn({
        let volume = Arc::clone(&volume);
        async move { volume.open_writer("my-node", slice).await }
    });
    let gate = Arc::clone(&opener);
    tokio::task::spawn_blocking(move || gate.entered.wait())
        .await
        .expect("entered");

    volume.close().await.expect("close volume");
    let gate = Arc::clone(&opener);
    tokio::task::spawn_blocking(move || gate.release.wait())
        .await
        .expect("released");

    // The writer's close fails, but the open still reports the closed volume.
    let err = opening
        .await
        .expect("join")
        .err()
        .expect("volume closed during open");
    assert!(matches!(err, WriterError::VolumeClosed(_)), "{err}");
    assert!(volume.writers().is_empty());
    assert!(file_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_open_listener_frees_the_key() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
    )
    .await
    .expect("open");
    let refuse = Arc::new(std::sync::atomic::AtomicBool::new(true));
    {
        let refuse = Arc::clone(&refuse);
        volume.events().on_open(move |_| {
            if refuse.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("listener refused".into());
            }
            Ok(())
        });
    }
    let slice = test_slice(volume.id(), "slice-1");

    let err = volume
        .open_writer("my-node", slice.clone())
        .await
        .err()
        .expect("listener must abort the open");
    assert!(matches!(err, WriterError::Events(_)), "{err}");
    assert!(err.to_string().contains("listener refused"), "{err}");
    assert_eq!(volume.writers().len(), 0);

    refuse.store(false, std::sync::atomic::Ordering::SeqCst);
    let writer = volume
        .open_writer("my-node", slice)
        .await
        .expect("key is free again");
    assert_eq!(volume.writers().len(), 1);
    writer.close().await.expect("close writer");
    volume.close().await.expect("close volume");
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_sync_persists_buffered_rows() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
    )
    .await
    .expect("open");
    let mut slice = test_slice(volume.id(), "slice-1");
    // Only an explicit sync moves the bytes to disk.
    slice.sync = disksync::Config::default()
        .with_wait(false)
        .with_count_trigger(0)
        .with_interval_trigger(Duration::from_secs(3600));
    let file_path = slice.file_path(volume.path());

    let writer = volume.open_writer("my-node", slice).await.expect("writer");
    writer.write(b"abc\n").await.expect("write");
    writer.sync().await.expect("sync");
    assert_eq!(std::fs::read_to_string(&file_path).expect("read"), "abc\n");

    writer.close().await.expect("close writer");
    assert!(matches!(writer.sync().await, Err(WriterError::Closed)));
    volume.close().await.expect("close volume");
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_without_wait_return_before_sync() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
    )
    .await
    .expect("open");
    let mut slice = test_slice(volume.id(), "slice-1");
    slice.sync = disksync::Config::default()
        .with_wait(false)
        .with_count_trigger(0)
        .with_interval_trigger(Duration::from_secs(3600));
    let file_path = slice.file_path(volume.path());

    let writer = volume.open_writer("my-node", slice).await.expect("writer");
    for row in ["foo,1\n", "bar,2\n"] {
        let written = tokio::time::timeout(Duration::from_secs(1), writer.write(row.as_bytes()))
            .await
            .expect("write must not wait for a sync")
            .expect("write");
        assert_eq!(written, row.len());
    }

    // Close flushes what no trigger synced.
    writer.close().await.expect("close writer");
    assert_eq!(
        std::fs::read_to_string(&file_path).expect("read"),
        "foo,1\nbar,2\n"
    );
    volume.close().await.expect("close volume");
}

#[tokio::test(flavor = "current_thread")]
async fn chain_writes_do_not_block_the_runtime() {
    let root = tempfile::tempdir().expect("tempdir");
    let opener = Arc::new(HeldWriteOpener::default());
    let volume = Volume::open_with(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default().with_file_buffer_size(0),
        &Events::new(),
        Overrides {
            file_opener: Some(opener.clone()),
            allocator: None,
        },
    )
    .await
    .expect("open");
    let mut slice = test_slice(volume.id(), "slice-1");
    slice.sync = disksync::Config::disabled();
    let file_path = slice.file_path(volume.path());
    let writer = volume.open_writer("my-node", slice).await.expect("writer");

    // Only runs if the write yields the single runtime thread.
    let released = Arc::clone(&opener.released);
    tokio::spawn(async move { released.store(true, std::sync::atomic::Ordering::SeqCst) });
    writer.write(b"foo,bar\n").await.expect("write");

    writer.close().await.expect("close writer");
    assert_eq!(std::fs::read_to_string(&file_path).expect("read"), "foo,bar\n");
    volume.close().await.expect("close volume");
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_close_aggregates_writer_errors() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open_with(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
        Overrides {
            file_opener: Some(Arc::new(FailingCloseOpener)),
            allocator: None,
        },
    )
    .await
    .expect("open");

    let mut keys = Vec::new();
    for slice_id in ["slice-1", "slice-2"] {
        let mut slice = test_slice(volume.id(), slice_id);
        slice.sync = disksync::Config::disabled();
        keys.push(slice.key.clone());
        let writer = volume.open_writer("my-node", slice).await.expect("writer");
        writer.write(b"foo,bar\n").await.expect("write");
    }

    let err = volume.close().await.err().expect("close must fail");
    let message = err.to_string();
    for key in keys {
        assert!(
            message.contains(&format!(
                "cannot close writer for slice \"{key}\": chain close error: cannot close file: some close error"
            )),
            "{message}"
        );
    }
    assert!(!volume.path().join("writer.lock").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn new_slice_file_is_allocated() {
    let root = tempfile::tempdir().expect("tempdir");
    let allocator = Arc::new(RecordingAllocator::default());
    let volume = Volume::open_with(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
        Overrides {
            file_opener: None,
            allocator: Some(allocator.clone()),
        },
    )
    .await
    .expect("open");

    let mut slice = test_slice(volume.id(), "slice-1");
    slice.allocated_disk_space = diskalloc::Config::default()
        .with_relative(150)
        .for_next_slice(Some(10_000));
    assert_eq!(slice.allocated_disk_space, 15_000);

    let writer = volume
        .open_writer("my-node", slice.clone())
        .await
        .expect("writer");
    writer.close().await.expect("close");
    assert_eq!(allocator.requested(), 15_000);

    // Existing files are not allocated again.
    let writer = volume.open_writer("my-node", slice).await.expect("reopen");
    writer.close().await.expect("close");
    assert_eq!(allocator.requested(), 15_000);

    let usage = volume.disk_usage().expect("usage");
    assert_eq!((usage.used, usage.total), (1, 2));
    volume.close().await.expect("close volume");
}

#[tokio::test(flavor = "multi_thread")]
async fn allocation_can_be_disabled() {
    let root = tempfile::tempdir().expect("tempdir");
    let allocator = Arc::new(RecordingAllocator::default());
    let volume = Volume::open_with(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default().with_allocation(diskalloc::Config::disabled()),
        &Events::new(),
        Overrides {
            file_opener: None,
            allocator: Some(allocator.clone()),
        },
    )
    .await
    .expect("open");
    let mut slice = test_slice(volume.id(), "slice-1");
    slice.allocated_disk_space = 10_000;
    let writer = volume.open_writer("my-node", slice).await.expect("writer");
    writer.close().await.expect("close");
    assert_eq!(allocator.requested(), 0);
    volume.close().await.expect("close volume");
}

#[tokio::test(flavor = "multi_thread")]
async fn drained_volumes_are_not_assigned() {
    let root = tempfile::tempdir().expect("tempdir");
    for (volume_type, label) in [("hdd", "1"), ("hdd", "2"), ("ssd", "1")] {
        volume_spec(root.path(), volume_type, label);
    }
    std::fs::write(root.path().join("hdd/2/drain"), "").expect("drain");

    let volumes = Volumes::detect("my-node", root.path(), VolumeConfig::default())
        .await
        .expect("detect");
    assert_eq!(volumes.all().len(), 3);
    let drained = volumes.drained();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].label(), "2");

    let assigned = volumes.assign_for(&AssignmentConfig::new(3, ["hdd"]), "my-file");
    assert_eq!(assigned.len(), 2);
    assert_eq!(assigned[0].volume_type(), "hdd");
    assert_eq!(assigned[0].label(), "1");
    assert_eq!(assigned[1].volume_type(), "ssd");

    let assigned = volumes.assign_for(&AssignmentConfig::new(1, ["ssd"]), "my-file");
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].volume_type(), "ssd");

    volumes.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_marker_is_followed() {
    let root = tempfile::tempdir().expect("tempdir");
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &Events::new(),
    )
    .await
    .expect("open");
    assert!(!volume.is_drained());

    std::fs::write(volume.path().join("drain"), "").expect("drain");
    let mut drained = false;
    for _ in 0..100 {
        if volume.is_drained() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained, "drain marker not noticed");
    volume.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_events_reach_writers() {
    let root = tempfile::tempdir().expect("tempdir");
    let events = Events::new();
    let opened = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let opened = Arc::clone(&opened);
        events.on_open(move |_| {
            opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let closed = Arc::clone(&closed);
        events.on_close(move |_, err| {
            assert!(err.is_none());
            closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
    }
    let volume = Volume::open(
        volume_spec(root.path(), "hdd", "1"),
        VolumeConfig::default(),
        &events,
    )
    .await
    .expect("open");
    let writer = volume
        .open_writer("my-node", test_slice(volume.id(), "slice-1"))
        .await
        .expect("writer");
    assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);
    writer.close().await.expect("close writer");
    assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    volume.close().await.expect("close volume");
}
