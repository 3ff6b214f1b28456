//! End-to-end tests driving a whole store through the public API.

use std::io::Read;

use similar_asserts::assert_eq;
use tempfile::TempDir;

use layerstore::check::{CheckOptions, RepairOptions};
use layerstore::config::{IdRange, StoreOptions};
use layerstore::errors::StoreError;
use layerstore::idset::IdMap;
use layerstore::layers::LayerOptions;
use layerstore::store::{ContainerCreateOptions, Store, StoreRegistry};
use layerstore::userns::AutoUserNsOptions;
use layerstore::ImageOptions;

const MTIME: u64 = 1_700_000_000;

fn euid() -> u64 {
    rustix::process::geteuid().as_raw() as u64
}

fn egid() -> u64 {
    rustix::process::getegid().as_raw() as u64
}

/// A tar stream built entry by entry, with stable metadata.
struct DiffBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl DiffBuilder {
    fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header.set_uid(euid());
        header.set_gid(egid());
        header.set_mtime(MTIME);
        header
    }

    fn dir(mut self, path: &str) -> Self {
        let mut header = Self::header(tar::EntryType::Directory, 0o755, 0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    fn file(mut self, path: &str, data: &[u8]) -> Self {
        let mut header = Self::header(tar::EntryType::Regular, 0o644, data.len() as u64);
        self.builder.append_data(&mut header, path, data).unwrap();
        self
    }

    fn whiteout(mut self, dir: &str, name: &str) -> Self {
        let mut header = Self::header(tar::EntryType::Regular, 0o644, 0);
        let path = format!("{dir}/.wh.{name}");
        self.builder
            .append_data(&mut header, path.as_str(), std::io::empty())
            .unwrap();
        self
    }

    fn bytes(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

fn base_diff() -> Vec<u8> {
    DiffBuilder::new()
        .dir("etc")
        .file("etc/os-release", b"NAME=test\n")
        .file("etc/shadow", b"root:!:0:::::\n")
        .bytes()
}

fn child_diff() -> Vec<u8> {
    DiffBuilder::new()
        .dir("etc")
        .file("etc/motd", b"hello\n")
        .whiteout("etc", "shadow")
        .bytes()
}

fn open_store(tmp: &TempDir) -> Store {
    let options = StoreOptions::new(tmp.path().join("run"), tmp.path().join("graph"));
    Store::open(options).unwrap()
}

#[test]
fn test_layer_image_container_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (base, base_size) = store
        .put_layer(
            None,
            None,
            &["base".to_string()],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    assert_eq!(base_size, base_diff().len() as i64);

    let (child, _) = store
        .put_layer(
            None,
            Some("base"),
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut child_diff().as_slice()),
        )
        .unwrap();
    assert_eq!(child.parent.as_deref(), Some(base.id.as_str()));

    // Whiteouts applied through the driver.
    let mount = store.mount(&child.id, None).unwrap();
    assert!(mount.join("etc/motd").is_file());
    assert!(mount.join("etc/os-release").is_file());
    assert!(!mount.join("etc/shadow").exists());
    assert!(!store.unmount(&child.id, false).unwrap());

    let image = store
        .create_image(
            None,
            &["localhost/test:latest".to_string()],
            Some(&child.id),
            &ImageOptions::default(),
        )
        .unwrap();
    assert_eq!(store.lookup("localhost/test:latest").unwrap(), image.id);

    let manifest = br#"{"schemaVersion":2}"#;
    store
        .set_image_big_data(&image.id, "manifest", manifest, None)
        .unwrap();
    assert_eq!(
        store.image_big_data_size(&image.id, "manifest").unwrap(),
        manifest.len() as i64
    );
    assert!(store.image_big_data_digest(&image.id, "manifest").is_err());
    assert!(store.image_directory(&image.id).unwrap().is_dir());
    assert!(store.image_run_directory(&image.id).unwrap().is_dir());

    let container = store
        .create_container(
            None,
            &["worker".to_string()],
            Some(&image.id),
            None,
            &ContainerCreateOptions {
                metadata: "{}".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(container.image, image.id);
    let container_layer = store.layer(&container.layer).unwrap();
    assert_eq!(container_layer.parent.as_deref(), Some(child.id.as_str()));
    assert_eq!(store.metadata("worker").unwrap(), "{}");

    // The container's layer is writable and private to it.
    let mount = store.mount("worker", None).unwrap();
    std::fs::write(mount.join("scratch"), b"state").unwrap();
    assert_eq!(store.mounted("worker").unwrap(), 1);
    assert!(!store.unmount("worker", false).unwrap());

    // Userdata files live alongside the record and under the run root.
    store
        .set_container_directory_file(&container.id, "hosts", b"127.0.0.1 localhost\n")
        .unwrap();
    assert_eq!(
        store.container_directory_file("worker", "hosts").unwrap(),
        b"127.0.0.1 localhost\n"
    );
    store
        .set_container_run_directory_file(&container.id, "pidfile", b"1234\n")
        .unwrap();
    assert_eq!(
        store
            .container_run_directory_file(&container.id, "pidfile")
            .unwrap(),
        b"1234\n"
    );
    assert!(store
        .container_run_directory(&container.id)
        .unwrap()
        .join("pidfile")
        .is_file());

    // The image is pinned while the container exists.
    assert!(matches!(
        store.delete_image(&image.id, true),
        Err(StoreError::ImageUsedByContainer(_))
    ));

    store.delete_container(&container.id).unwrap();
    let removed = store.delete_image(&image.id, true).unwrap();
    assert_eq!(removed.len(), 2, "both image layers reclaimed: {removed:?}");
    assert!(store.layers().unwrap().is_empty());
    assert!(store.images().unwrap().is_empty());
    assert!(store.containers().unwrap().is_empty());
}

#[test]
fn test_diff_replays_verbatim() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let diff = base_diff();

    let (layer, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut diff.as_slice()),
        )
        .unwrap();

    let mut replayed = Vec::new();
    store
        .diff(&layer.id)
        .unwrap()
        .read_to_end(&mut replayed)
        .unwrap();
    assert_eq!(replayed, diff);
    assert_eq!(store.diff_size(&layer.id).unwrap(), diff.len() as i64);

    let recorded = layer.uncompressed_digest.unwrap();
    let found = store.layers_by_uncompressed_digest(&recorded).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, layer.id);
}

#[test]
fn test_delete_layer_refuses_while_referenced() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (base, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    let (child, _) = store
        .put_layer(
            None,
            Some(&base.id),
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut child_diff().as_slice()),
        )
        .unwrap();
    assert!(matches!(
        store.delete_layer(&base.id),
        Err(StoreError::LayerHasChildren(_))
    ));

    store
        .create_image(None, &[], Some(&child.id), &ImageOptions::default())
        .unwrap();
    assert!(matches!(
        store.delete_layer(&child.id),
        Err(StoreError::LayerUsedByImage(_))
    ));
}

#[test]
fn test_delete_image_keeps_shared_ancestors() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (base, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    let (child_a, _) = store
        .put_layer(
            None,
            Some(&base.id),
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut child_diff().as_slice()),
        )
        .unwrap();
    let (child_b, _) = store
        .put_layer(
            None,
            Some(&base.id),
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut child_diff().as_slice()),
        )
        .unwrap();

    let image_a = store
        .create_image(None, &[], Some(&child_a.id), &ImageOptions::default())
        .unwrap();
    store
        .create_image(None, &[], Some(&child_b.id), &ImageOptions::default())
        .unwrap();

    let removed = store.delete_image(&image_a.id, true).unwrap();
    assert_eq!(removed, vec![child_a.id.clone()]);
    assert!(store.layer(&base.id).is_ok());
    assert!(store.layer(&child_b.id).is_ok());
    assert!(store.layer(&child_a.id).is_err());
}

#[test]
fn test_mount_counting() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let (layer, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();

    let first = store.mount(&layer.id, None).unwrap();
    let second = store.mount(&layer.id, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(store.mounted(&layer.id).unwrap(), 2);

    assert!(store.unmount(&layer.id, false).unwrap());
    assert_eq!(store.mounted(&layer.id).unwrap(), 1);
    assert!(!store.unmount(&layer.id, false).unwrap());
    assert_eq!(store.mounted(&layer.id).unwrap(), 0);
    assert!(matches!(
        store.unmount(&layer.id, false),
        Err(StoreError::LayerNotMounted(_))
    ));
}

#[test]
fn test_container_inherits_store_default_maps() {
    let tmp = TempDir::new().unwrap();
    let mut options = StoreOptions::new(tmp.path().join("run"), tmp.path().join("graph"));
    options.uid_map = vec![IdMap {
        container_id: 0,
        host_id: 100_000,
        size: 65_536,
    }];
    options.gid_map = vec![IdMap {
        container_id: 0,
        host_id: 100_000,
        size: 65_536,
    }];
    let store = Store::open(options).unwrap();

    let (base, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    assert_eq!(base.uid_map, store_default_map());

    let image = store
        .create_image(None, &[], Some(&base.id), &ImageOptions::default())
        .unwrap();
    let container = store
        .create_container(None, &[], Some(&image.id), None, &Default::default())
        .unwrap();
    assert_eq!(container.uid_map, store_default_map());
    assert_eq!(container.gid_map, store_default_map());

    // The defaults flow down to the container's layer record too.
    let layer = store.layer(&container.layer).unwrap();
    assert_eq!(layer.uid_map, store_default_map());
    assert_eq!(layer.gid_map, store_default_map());

    // Explicit maps still override the defaults.
    let explicit = store
        .create_container(
            None,
            &[],
            None,
            None,
            &ContainerCreateOptions {
                uid_maps: vec![IdMap {
                    container_id: 0,
                    host_id: 200_000,
                    size: 1024,
                }],
                gid_maps: vec![IdMap {
                    container_id: 0,
                    host_id: 200_000,
                    size: 1024,
                }],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(explicit.uid_map[0].host_id, 200_000);
}

fn store_default_map() -> Vec<IdMap> {
    vec![IdMap {
        container_id: 0,
        host_id: 100_000,
        size: 65_536,
    }]
}

#[test]
fn test_auto_userns_allocation_and_exhaustion() {
    let tmp = TempDir::new().unwrap();
    let mut options = StoreOptions::new(tmp.path().join("run"), tmp.path().join("graph"));
    options.auto_userns_uids = vec![IdRange {
        start: 100_000,
        length: 3000,
    }];
    options.auto_userns_gids = vec![IdRange {
        start: 200_000,
        length: 3000,
    }];
    let store = Store::open(options).unwrap();

    let auto = |size: u32| ContainerCreateOptions {
        auto_userns: Some(AutoUserNsOptions {
            size,
            ..Default::default()
        }),
        ..Default::default()
    };

    let first = store
        .create_container(None, &[], None, None, &auto(1024))
        .unwrap();
    assert_eq!(first.uid_map, vec![IdMap {
        container_id: 0,
        host_id: 100_000,
        size: 1024,
    }]);
    assert_eq!(first.gid_map[0].host_id, 200_000);

    // The second allocation skips what the first one holds.
    let second = store
        .create_container(None, &[], None, None, &auto(1024))
        .unwrap();
    assert_eq!(second.uid_map[0].host_id, 101_024);

    // 3000 - 2048 leaves less than another 1024.
    assert!(matches!(
        store.create_container(None, &[], None, None, &auto(1024)),
        Err(StoreError::NoAvailableIds)
    ));

    store.delete_container(&first.id).unwrap();
    let third = store
        .create_container(None, &[], None, None, &auto(1024))
        .unwrap();
    assert_eq!(third.uid_map[0].host_id, 100_000);
}

#[test]
fn test_mapped_top_layer_created_per_mapping() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (top, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    let image = store
        .create_image(None, &[], Some(&top.id), &ImageOptions::default())
        .unwrap();

    let maps = vec![IdMap {
        container_id: 0,
        host_id: 100_000,
        size: 2048,
    }];
    let container = store
        .create_container(
            None,
            &[],
            Some(&image.id),
            None,
            &ContainerCreateOptions {
                uid_maps: maps.clone(),
                gid_maps: maps.clone(),
                ..Default::default()
            },
        )
        .unwrap();

    let image = store.image(&image.id).unwrap();
    assert_eq!(image.mapped_top_layers.len(), 1);
    let mapped = store.layer(&image.mapped_top_layers[0]).unwrap();
    assert_eq!(mapped.uid_map, maps);
    assert_eq!(mapped.uncompressed_digest, top.uncompressed_digest);

    let container_layer = store.layer(&container.layer).unwrap();
    assert_eq!(container_layer.parent.as_deref(), Some(mapped.id.as_str()));

    // A second container with the same mappings reuses the mapped copy.
    store
        .create_container(
            None,
            &[],
            Some(&image.id),
            None,
            &ContainerCreateOptions {
                uid_maps: maps.clone(),
                gid_maps: maps,
                ..Default::default()
            },
        )
        .unwrap();
    let image = store.image(&image.id).unwrap();
    assert_eq!(image.mapped_top_layers.len(), 1);

    // Deleting the image takes the mapped copy with it.
    for container in store.containers().unwrap() {
        store.delete_container(&container.id).unwrap();
    }
    store.delete_image(&image.id, true).unwrap();
    assert!(store.layers().unwrap().is_empty());
}

#[test]
fn test_check_clean_store() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (layer, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    let image = store
        .create_image(None, &[], Some(&layer.id), &ImageOptions::default())
        .unwrap();
    store
        .set_image_big_data(&image.id, "manifest", b"{\"layers\":[]}", None)
        .unwrap();
    store
        .create_container(None, &[], Some(&image.id), None, &Default::default())
        .unwrap();

    let report = store.check(&CheckOptions::everything()).unwrap();
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn test_check_flags_and_repairs_corrupt_layer() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (layer, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    let image = store
        .create_image(None, &[], Some(&layer.id), &ImageOptions::default())
        .unwrap();

    // Truncate the retained diff behind the store's back.
    let blob = tmp
        .path()
        .join("graph/dir-layers")
        .join(format!("{}.diff.tar", layer.id));
    std::fs::write(&blob, b"").unwrap();

    let report = store.check(&CheckOptions::most()).unwrap();
    assert!(report.layers.contains_key(&layer.id));
    assert!(report.images.contains_key(&image.id));

    let errors = store.repair(&report, &RepairOptions::default());
    assert!(errors.is_empty(), "{errors:?}");
    assert!(store.layers().unwrap().is_empty());
    assert!(store.images().unwrap().is_empty());
    assert!(store.check(&CheckOptions::most()).unwrap().is_clean());
}

#[test]
fn test_check_audits_additional_image_stores() {
    let tmp = TempDir::new().unwrap();

    // Populate a store that will later be attached read-only.
    let extra_graph = tmp.path().join("extra");
    let extra = Store::open(StoreOptions::new(
        tmp.path().join("extra-run"),
        &extra_graph,
    ))
    .unwrap();
    let (layer, _) = extra
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    let image = extra
        .create_image(None, &[], Some(&layer.id), &ImageOptions::default())
        .unwrap();
    drop(extra);

    // Corrupt the retained diff, then attach the store read-only elsewhere.
    let blob = extra_graph
        .join("dir-layers")
        .join(format!("{}.diff.tar", layer.id));
    std::fs::write(&blob, b"").unwrap();

    let mut options = StoreOptions::new(tmp.path().join("run"), tmp.path().join("graph"));
    options.graph_driver_options =
        vec![format!("dir.imagestore={}", extra_graph.display())];
    let store = Store::open(options).unwrap();

    let report = store.check(&CheckOptions::most()).unwrap();
    assert!(report.layers.contains_key(&layer.id), "{report:?}");
    assert!(report.images.contains_key(&image.id), "{report:?}");

    // Repair only reports on read-only records; it never touches them.
    let errors = store.repair(&report, &RepairOptions::default());
    assert!(errors.is_empty(), "{errors:?}");
    assert!(store.image(&image.id).is_ok());
    assert!(blob.exists());
}

#[test]
fn test_check_flags_modified_layer_content() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (layer, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();

    // Tamper with the layer's content through the driver's directory.
    let dir = tmp.path().join("graph/dir").join(&layer.id);
    std::fs::write(dir.join("etc/os-release"), b"NAME=tampered\n").unwrap();

    let report = store.check(&CheckOptions::everything()).unwrap();
    let errors = report.layers.get(&layer.id).expect("layer flagged");
    assert!(errors
        .iter()
        .any(|e| matches!(e, StoreError::LayerContentModified(_))));
}

#[test]
fn test_check_flags_unaccounted_driver_layer() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let stray = tmp.path().join("graph/dir/deadbeef");
    std::fs::create_dir_all(&stray).unwrap();

    let report = store.check(&CheckOptions::most()).unwrap();
    let errors = report.layers.get("deadbeef").expect("stray flagged");
    assert!(errors
        .iter()
        .any(|e| matches!(e, StoreError::LayerUnaccounted(_))));

    let errors = store.repair(&report, &RepairOptions::default());
    assert!(errors.is_empty(), "{errors:?}");
    assert!(!stray.exists());
}

#[test]
fn test_repair_spares_containers_unless_told() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let container = store
        .create_container(None, &[], None, None, &Default::default())
        .unwrap();
    store
        .set_container_big_data(&container.id, "config", b"{\"cmd\":[\"sh\"]}")
        .unwrap();
    // Grow the blob on disk; the recorded size no longer matches.
    let blob = tmp
        .path()
        .join("graph/dir-containers")
        .join(&container.id)
        .join("config");
    std::fs::write(&blob, b"{\"cmd\":[\"sh\"],\"tampered\":true}").unwrap();

    let report = store.check(&CheckOptions::most()).unwrap();
    assert!(report.containers.contains_key(&container.id));

    let errors = store.repair(&report, &RepairOptions::default());
    assert_eq!(errors.len(), 1);
    assert!(store.container(&container.id).is_ok());

    let errors = store.repair(
        &report,
        &RepairOptions {
            remove_containers: true,
            ..Default::default()
        },
    );
    assert!(errors.is_empty(), "{errors:?}");
    assert!(store.containers().unwrap().is_empty());
}

#[test]
fn test_shutdown_reports_busy_mounts() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let (layer, _) = store
        .put_layer(
            None,
            None,
            &[],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();
    store.mount(&layer.id, None).unwrap();

    let busy = store.shutdown(false).unwrap();
    assert_eq!(busy, vec![layer.id.clone()]);
    let clean = store.shutdown(true).unwrap();
    assert!(clean.is_empty());
    assert_eq!(store.mounted(&layer.id).unwrap(), 0);
}

#[test]
fn test_registry_deduplicates_handles() {
    let tmp = TempDir::new().unwrap();
    let registry = StoreRegistry::new();
    let options = StoreOptions::new(tmp.path().join("run"), tmp.path().join("graph"));

    let first = registry.get(options.clone()).unwrap();
    let second = registry.get(options.clone()).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    let mismatched = StoreOptions::new(tmp.path().join("other-run"), tmp.path().join("graph"));
    assert!(matches!(
        registry.get(mismatched),
        Err(StoreError::IncompleteOptions(_))
    ));

    registry.free(&second);
    registry.free(&first);
}

#[test]
fn test_two_handles_share_state_through_locks() {
    let tmp = TempDir::new().unwrap();
    let options = StoreOptions::new(tmp.path().join("run"), tmp.path().join("graph"));
    let writer = Store::open(options.clone()).unwrap();
    let reader = Store::open(options).unwrap();

    assert!(reader.layers().unwrap().is_empty());
    let (layer, _) = writer
        .put_layer(
            None,
            None,
            &["shared".to_string()],
            false,
            &LayerOptions::default(),
            Some(&mut base_diff().as_slice()),
        )
        .unwrap();

    // The second handle notices the write via the lock's token.
    assert_eq!(reader.lookup("shared").unwrap(), layer.id);
    writer.delete_layer(&layer.id).unwrap();
    assert!(reader.lookup("shared").is_err());
}
