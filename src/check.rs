//! Consistency checking and repair.
//!
//! `check` walks layers, then images, then containers, re-verifying layer
//! content against the recorded digests and sizes, optionally mounting each
//! layer and comparing the actual tree against the one its diff chain
//! promises. Damage propagates upward: a bad layer marks the images and
//! containers built on it. `repair` removes what `check` flagged, children
//! before parents, metadata-known layers before driver-only ones.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::digest::{Digest, DigestWriter, TeeReader};
use crate::drivers::MountOptions;
use crate::errors::{Result, StoreError};
use crate::images::ImageStore;
use crate::layers::{Layer, LayerStore, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::store::Store;

/// What `check` should look at.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Re-verify layer diffs against their recorded digests and sizes.
    pub layer_digests: bool,
    /// Mount each layer and compare its tree against the diff chain.
    pub layer_contents: bool,
    /// Verify layer big-data items are readable.
    pub layer_data: bool,
    /// Verify image big-data items exist with recorded sizes and digests.
    pub image_data: bool,
    /// Verify container big-data items exist with recorded sizes.
    pub container_data: bool,
    /// Flag layers no image or container references once they are older
    /// than this; `None` disables the check.
    pub layer_unreferenced_max_age: Option<Duration>,
}

/// One day; layers younger than this may still be mid-pull.
const DEFAULT_UNREFERENCED_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

impl CheckOptions {
    /// Every check, including the expensive mount-and-compare pass.
    pub fn everything() -> Self {
        Self {
            layer_digests: true,
            layer_contents: true,
            layer_data: true,
            image_data: true,
            container_data: true,
            layer_unreferenced_max_age: Some(DEFAULT_UNREFERENCED_MAX_AGE),
        }
    }

    /// Every check except mount-and-compare.
    pub fn most() -> Self {
        Self {
            layer_contents: false,
            ..Self::everything()
        }
    }
}

/// What `repair` is allowed to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    /// Allow removing damaged containers (and with them their layers).
    pub remove_containers: bool,
    /// Proceed even when damaged containers are left in place.
    pub force: bool,
}

/// Findings of one `check` run, keyed by record ID.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub layers: BTreeMap<String, Vec<StoreError>>,
    pub images: BTreeMap<String, Vec<StoreError>>,
    pub containers: BTreeMap<String, Vec<StoreError>>,
    /// Chain depth per known layer, for child-first removal.
    layer_depth: HashMap<String, usize>,
    /// Driver layers with no metadata record, in driver order.
    unaccounted: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.layers.is_empty() && self.images.is_empty() && self.containers.is_empty()
    }

    fn flag_layer(&mut self, id: &str, err: StoreError) {
        self.layers.entry(id.to_string()).or_default().push(err);
    }

    fn flag_image(&mut self, id: &str, err: StoreError) {
        self.images.entry(id.to_string()).or_default().push(err);
    }

    fn flag_container(&mut self, id: &str, err: StoreError) {
        self.containers.entry(id.to_string()).or_default().push(err);
    }
}

/// The parts of a tar header the content comparison cares about.
#[derive(Debug, Clone)]
struct DiffHeader {
    path: PathBuf,
    entry_type: tar::EntryType,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
    link_target: Option<PathBuf>,
}

impl Store {
    /// Run consistency checks and report, without changing anything.
    pub fn check(&self, options: &CheckOptions) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        // Audit every store, deduplicated by ID; the writable store's copy
        // wins when an ID appears in a read-only store too.
        let mut layers: Vec<(Layer, &LayerStore)> = Vec::new();
        let mut seen_layers = std::collections::HashSet::new();
        for store in self.all_layer_stores() {
            for layer in store.all()? {
                if seen_layers.insert(layer.id.clone()) {
                    layers.push((layer, store));
                }
            }
        }
        let mut images: Vec<(crate::images::Image, &ImageStore)> = Vec::new();
        let mut seen_images = std::collections::HashSet::new();
        for store in self.all_image_stores() {
            for image in store.all()? {
                if seen_images.insert(image.id.clone()) {
                    images.push((image, store));
                }
            }
        }
        let containers = self.container_store_ref().all()?;

        // Chain depth, children-first removal needs it.
        let parents: HashMap<&str, Option<&str>> = layers
            .iter()
            .map(|(l, _)| (l.id.as_str(), l.parent.as_deref()))
            .collect();
        for (layer, _) in &layers {
            let mut depth = 0usize;
            let mut cursor = Some(layer.id.as_str());
            while let Some(id) = cursor {
                depth += 1;
                cursor = parents.get(id).copied().flatten();
                if depth > layers.len() {
                    break; // cyclic parentage; depth is meaningless anyway
                }
            }
            report.layer_depth.insert(layer.id.clone(), depth);
        }

        let mut headers_by_layer: HashMap<String, Vec<DiffHeader>> = HashMap::new();
        for (layer, owner) in &layers {
            self.check_layer(layer, owner, options, &mut report, &mut headers_by_layer);
        }

        if options.layer_contents {
            // Mount bookkeeping needs write access; read-only copies are
            // covered by the digest pass alone.
            for (layer, owner) in &layers {
                if owner.is_read_write() {
                    self.check_layer_contents(layer, &parents, &headers_by_layer, &mut report);
                }
            }
        }

        if let Some(max_age) = options.layer_unreferenced_max_age {
            let writable: Vec<&Layer> = layers
                .iter()
                .filter(|(_, owner)| owner.is_read_write())
                .map(|(l, _)| l)
                .collect();
            let all_images: Vec<&crate::images::Image> =
                images.iter().map(|(i, _)| i).collect();
            self.check_unreferenced_layers(
                &writable,
                &all_images,
                &containers,
                max_age,
                &mut report,
            );
        }

        // Driver cross-check: content with no record at all.
        match self.driver().list_layers() {
            Ok(driver_layers) => {
                for id in driver_layers {
                    if self.layer(&id).is_err() {
                        report.flag_layer(&id, StoreError::LayerUnaccounted(id.clone()));
                        report.unaccounted.push(id);
                    }
                }
            }
            Err(StoreError::NotSupported(_)) => {}
            Err(e) => return Err(e),
        }

        for (image, owner) in &images {
            self.check_image(image, owner, options, &mut report);
        }
        for container in &containers {
            self.check_container(container, options, &mut report);
        }
        Ok(report)
    }

    fn check_layer(
        &self,
        layer: &Layer,
        owner: &LayerStore,
        options: &CheckOptions,
        report: &mut CheckReport,
        headers_by_layer: &mut HashMap<String, Vec<DiffHeader>>,
    ) {
        if options.layer_data {
            for key in &layer.big_data_names {
                if let Err(e) = owner.big_data(&layer.id, key) {
                    debug!("layer {} big data {key}: {e}", layer.id);
                    report.flag_layer(
                        &layer.id,
                        StoreError::LayerDataMissing(format!("{}: {key}", layer.id)),
                    );
                }
            }
        }

        let wants_headers = options.layer_contents;
        let wants_digest = options.layer_digests && layer.uncompressed_digest.is_some();
        if !wants_headers && !wants_digest {
            return;
        }
        let diff = match owner.diff(&layer.id) {
            Ok(diff) => diff,
            Err(StoreError::NotSupported(_)) => {
                // No recorded diff stream. That's normal for writable
                // container layers; it only counts as damage when a digest
                // claims there should be one.
                if wants_digest {
                    report.flag_layer(
                        &layer.id,
                        StoreError::LayerDataMissing(format!("{}: diff", layer.id)),
                    );
                }
                return;
            }
            Err(e) => {
                report.flag_layer(&layer.id, e);
                return;
            }
        };
        match read_diff_headers(diff) {
            Ok((headers, digest, size)) => {
                if wants_digest {
                    if layer.uncompressed_digest.as_ref() != Some(&digest) {
                        report.flag_layer(
                            &layer.id,
                            StoreError::LayerIncorrectContentDigest(format!(
                                "{}: {digest}",
                                layer.id
                            )),
                        );
                    }
                    if layer.uncompressed_size.is_some_and(|s| s != size as i64) {
                        report.flag_layer(
                            &layer.id,
                            StoreError::LayerIncorrectContentSize(format!(
                                "{}: {size} bytes",
                                layer.id
                            )),
                        );
                    }
                }
                headers_by_layer.insert(layer.id.clone(), headers);
            }
            Err(e) => {
                report.flag_layer(
                    &layer.id,
                    StoreError::LayerDataMissing(format!("{}: diff: {e}", layer.id)),
                );
            }
        }
    }

    /// Mount one layer and compare it against its replayed diff chain.
    fn check_layer_contents(
        &self,
        layer: &Layer,
        parents: &HashMap<&str, Option<&str>>,
        headers_by_layer: &HashMap<String, Vec<DiffHeader>>,
        report: &mut CheckReport,
    ) {
        // Ancestors, top-down.
        let mut chain = Vec::new();
        let mut cursor = Some(layer.id.as_str());
        while let Some(id) = cursor {
            chain.push(id.to_string());
            cursor = parents.get(id).copied().flatten();
            if chain.len() > parents.len() {
                break;
            }
        }
        chain.reverse();
        // Without every ancestor's headers expectations are unknowable
        // (writable layers have no recorded diff); skip rather than guess.
        if chain.iter().any(|id| !headers_by_layer.contains_key(id)) {
            return;
        }

        let mut expected = ExpectedNode::directory();
        for id in &chain {
            apply_headers(&mut expected, &headers_by_layer[id]);
        }

        let mount = match self
            .primary_layer_store()
            .mount(&layer.id, &MountOptions::default())
        {
            Ok(mount) => mount,
            Err(e) => {
                report.flag_layer(&layer.id, e);
                return;
            }
        };
        let mut diffs = Vec::new();
        if let Err(e) = compare_tree(&expected, &mount, Path::new(""), &mut diffs) {
            report.flag_layer(&layer.id, e);
        }
        if let Err(e) = self.primary_layer_store().unmount(&layer.id, false) {
            warn!("unmounting layer {} after checking: {e}", layer.id);
        }
        if !diffs.is_empty() {
            report.flag_layer(
                &layer.id,
                StoreError::LayerContentModified(format!(
                    "{}: {}",
                    layer.id,
                    diffs.join("; ")
                )),
            );
        }
    }

    fn check_unreferenced_layers(
        &self,
        layers: &[&Layer],
        images: &[&crate::images::Image],
        containers: &[crate::containers::Container],
        max_age: Duration,
        report: &mut CheckReport,
    ) {
        let parents: HashMap<&str, Option<&str>> = layers
            .iter()
            .map(|l| (l.id.as_str(), l.parent.as_deref()))
            .collect();
        let mut referenced = std::collections::HashSet::new();
        let mut roots: Vec<String> = Vec::new();
        for image in images {
            roots.extend(image.top_layer.iter().cloned());
            roots.extend(image.mapped_top_layers.iter().cloned());
        }
        roots.extend(containers.iter().map(|c| c.layer.clone()));
        for root in roots {
            let mut cursor = Some(root);
            while let Some(id) = cursor {
                if !referenced.insert(id.clone()) {
                    break;
                }
                cursor = parents
                    .get(id.as_str())
                    .copied()
                    .flatten()
                    .map(str::to_string);
            }
        }
        let now = SystemTime::now();
        for layer in layers {
            if referenced.contains(&layer.id) {
                continue;
            }
            let age = now
                .duration_since(layer.created)
                .unwrap_or(Duration::ZERO);
            if age >= max_age {
                report.flag_layer(&layer.id, StoreError::LayerUnreferenced(layer.id.clone()));
            }
        }
    }

    fn check_image(
        &self,
        image: &crate::images::Image,
        owner: &ImageStore,
        options: &CheckOptions,
        report: &mut CheckReport,
    ) {
        let mut top_layers: Vec<&String> = image.top_layer.iter().collect();
        top_layers.extend(image.mapped_top_layers.iter());
        for top in top_layers {
            let missing = self.layer(top).is_err();
            let damaged = report.layers.get(top).is_some_and(|errs| {
                errs.iter().any(|e| {
                    !matches!(e, StoreError::LayerUnreferenced(_))
                })
            });
            if missing || damaged {
                report.flag_image(
                    &image.id,
                    StoreError::ImageLayerMissing(format!("{}: layer {top}", image.id)),
                );
            }
        }

        if options.image_data {
            for key in &image.big_data_names {
                let data = match owner.big_data(&image.id, key) {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("image {} big data {key}: {e}", image.id);
                        report.flag_image(
                            &image.id,
                            StoreError::ImageDataMissing(format!("{}: {key}", image.id)),
                        );
                        continue;
                    }
                };
                if let Some(size) = image.big_data_sizes.get(key) {
                    if *size != data.len() as i64 {
                        report.flag_image(
                            &image.id,
                            StoreError::ImageDataIncorrectSize(format!(
                                "{}: {key}",
                                image.id
                            )),
                        );
                    }
                }
                if let Some(recorded) = image.big_data_digests.get(key) {
                    if recorded.algorithm() == "sha256"
                        && *recorded != Digest::sha256(&data)
                    {
                        report.flag_image(
                            &image.id,
                            StoreError::ImageDataIncorrectDigest(format!(
                                "{}: {key}",
                                image.id
                            )),
                        );
                    }
                }
            }
        }
    }

    fn check_container(
        &self,
        container: &crate::containers::Container,
        options: &CheckOptions,
        report: &mut CheckReport,
    ) {
        if !container.image.is_empty() {
            let missing = self.image(&container.image).is_err();
            let damaged = report.images.contains_key(&container.image);
            if missing || damaged {
                report.flag_container(
                    &container.id,
                    StoreError::ContainerImageMissing(format!(
                        "{}: image {}",
                        container.id, container.image
                    )),
                );
            }
        }
        if self.layer(&container.layer).is_err() {
            report.flag_container(
                &container.id,
                StoreError::LayerMissing(format!(
                    "{}: layer {}",
                    container.id, container.layer
                )),
            );
        }

        if options.container_data {
            for key in &container.big_data_names {
                let data = match self.container_store_ref().big_data(&container.id, key) {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("container {} big data {key}: {e}", container.id);
                        report.flag_container(
                            &container.id,
                            StoreError::ContainerDataMissing(format!(
                                "{}: {key}",
                                container.id
                            )),
                        );
                        continue;
                    }
                };
                if let Some(size) = container.big_data_sizes.get(key) {
                    if *size != data.len() as i64 {
                        report.flag_container(
                            &container.id,
                            StoreError::ContainerDataIncorrectSize(format!(
                                "{}: {key}",
                                container.id
                            )),
                        );
                    }
                }
            }
        }
    }

    /// Remove everything `report` flagged. Errors are collected, not fatal.
    pub fn repair(&self, report: &CheckReport, options: &RepairOptions) -> Vec<StoreError> {
        let mut errors = Vec::new();
        if !report.containers.is_empty() && !options.remove_containers && !options.force {
            errors.push(StoreError::NotSupported(
                "not removing damaged containers without being told to".into(),
            ));
            return errors;
        }

        if options.remove_containers {
            for id in report.containers.keys() {
                debug!("repair: removing damaged container {id}");
                if let Err(e) = self.delete_container(id) {
                    errors.push(e);
                }
            }
        }
        for id in report.images.keys() {
            if !self.primary_image_store().exists(id) {
                continue; // read-only copy; report-only
            }
            debug!("repair: removing damaged image {id}");
            match self.delete_image(id, true) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(e),
            }
        }

        // Known-damaged layers first, children before parents; then
        // driver-only layers in the order the driver listed them.
        let mut known: Vec<&String> = report
            .layers
            .keys()
            .filter(|id| !report.unaccounted.contains(*id))
            .collect();
        known.sort_by_key(|id| std::cmp::Reverse(report.layer_depth.get(*id).copied()));
        for id in known {
            if !self.primary_layer_store().exists(id) {
                continue; // an image delete already reclaimed it
            }
            debug!("repair: removing damaged layer {id}");
            if let Err(e) = self.primary_layer_store().delete(id, true) {
                errors.push(e);
            }
        }
        for id in &report.unaccounted {
            debug!("repair: removing unaccounted driver layer {id}");
            if let Err(e) = self.driver().remove(id) {
                errors.push(e);
            }
        }
        errors
    }
}

/// Read a diff stream once: collect its headers while digesting and
/// counting every byte, trailer included.
fn read_diff_headers(
    reader: Box<dyn Read + Send>,
) -> Result<(Vec<DiffHeader>, Digest, u64)> {
    let mut tee = TeeReader::new(reader, DigestWriter::new());
    let mut headers = Vec::new();
    {
        let mut archive = tar::Archive::new(&mut tee);
        for entry in archive.entries()? {
            let entry = entry?;
            let header = entry.header();
            headers.push(DiffHeader {
                path: entry.path()?.into_owned(),
                entry_type: header.entry_type(),
                size: header.size()?,
                mode: header.mode()? & 0o7777,
                uid: header.uid()? as u32,
                gid: header.gid()? as u32,
                mtime: header.mtime()?,
                link_target: header.link_name()?.map(|p| p.into_owned()),
            });
        }
    }
    let side = tee.finish()?;
    let size = side.count();
    Ok((headers, side.digest(), size))
}

/// What one path in the assembled tree should stat back as.
#[derive(Debug, Clone)]
struct ExpectedNode {
    entry_type: tar::EntryType,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
    link_target: Option<PathBuf>,
    children: BTreeMap<String, ExpectedNode>,
}

impl ExpectedNode {
    fn directory() -> Self {
        Self {
            entry_type: tar::EntryType::Directory,
            size: 0,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            link_target: None,
            children: BTreeMap::new(),
        }
    }

    fn from_header(header: &DiffHeader) -> Self {
        Self {
            entry_type: header.entry_type,
            size: header.size,
            mode: header.mode,
            uid: header.uid,
            gid: header.gid,
            mtime: header.mtime,
            link_target: header.link_target.clone(),
            children: BTreeMap::new(),
        }
    }

    fn lookup(&self, path: &Path) -> Option<&ExpectedNode> {
        let mut node = self;
        for component in path_components(path) {
            node = node.children.get(&component)?;
        }
        Some(node)
    }

    fn insert(&mut self, path: &Path, node: ExpectedNode) {
        let components = path_components(path);
        let Some((leaf, dirs)) = components.split_last() else {
            return;
        };
        let mut cursor = self;
        for dir in dirs {
            cursor = cursor
                .children
                .entry(dir.clone())
                .or_insert_with(ExpectedNode::directory);
        }
        // Replacing a directory with a directory keeps what it holds.
        if let Some(existing) = cursor.children.get_mut(leaf) {
            if existing.entry_type == tar::EntryType::Directory
                && node.entry_type == tar::EntryType::Directory
            {
                existing.size = node.size;
                existing.mode = node.mode;
                existing.uid = node.uid;
                existing.gid = node.gid;
                existing.mtime = node.mtime;
                return;
            }
        }
        cursor.children.insert(leaf.clone(), node);
    }

    fn remove(&mut self, path: &Path) {
        let components = path_components(path);
        let Some((leaf, dirs)) = components.split_last() else {
            return;
        };
        let mut cursor = self;
        for dir in dirs {
            match cursor.children.get_mut(dir) {
                Some(next) => cursor = next,
                None => return,
            }
        }
        cursor.children.remove(leaf);
    }

    fn clear_children(&mut self, path: &Path) {
        let mut cursor = self;
        for component in path_components(path) {
            match cursor.children.get_mut(&component) {
                Some(next) => cursor = next,
                None => return,
            }
        }
        cursor.children.clear();
    }
}

fn path_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Replay one layer's headers onto the expected tree.
///
/// Order matters: opaque whiteouts first, then plain whiteouts, then
/// regular entries, hard links last so their targets already exist.
fn apply_headers(tree: &mut ExpectedNode, headers: &[DiffHeader]) {
    let class = |h: &DiffHeader| -> u8 {
        let name = h
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == OPAQUE_WHITEOUT {
            0
        } else if name.starts_with(WHITEOUT_PREFIX) {
            1
        } else if h.entry_type == tar::EntryType::Link {
            3
        } else {
            2
        }
    };
    let mut ordered: Vec<&DiffHeader> = headers.iter().collect();
    ordered.sort_by_key(|h| class(h));

    for header in ordered {
        let name = header
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == OPAQUE_WHITEOUT {
            let dir = header.path.parent().unwrap_or(Path::new(""));
            tree.clear_children(dir);
        } else if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
            let path = match header.path.parent() {
                Some(parent) => parent.join(victim),
                None => PathBuf::from(victim),
            };
            tree.remove(&path);
        } else if header.entry_type == tar::EntryType::Link {
            // A hard link stats like its target.
            if let Some(target) = &header.link_target {
                if let Some(node) = tree.lookup(target).cloned() {
                    let mut node = node;
                    node.children.clear();
                    tree.insert(&header.path, node);
                }
            }
        } else {
            tree.insert(&header.path, ExpectedNode::from_header(header));
        }
    }
}

/// Compare an expected tree against the mounted filesystem under `root`.
///
/// Directory mtimes are not compared (applying a later layer legitimately
/// touches parents), and symlinks only compare their targets.
fn compare_tree(
    expected: &ExpectedNode,
    actual_dir: &Path,
    rel: &Path,
    diffs: &mut Vec<String>,
) -> Result<()> {
    let mut actual_names = BTreeMap::new();
    for entry in std::fs::read_dir(actual_dir)? {
        let entry = entry?;
        actual_names.insert(entry.file_name().to_string_lossy().into_owned(), entry.path());
    }

    for (name, node) in &expected.children {
        let rel_path = rel.join(name);
        let Some(path) = actual_names.remove(name) else {
            diffs.push(format!("{} missing", rel_path.display()));
            continue;
        };
        let metadata = std::fs::symlink_metadata(&path)?;
        compare_node(node, &metadata, &path, &rel_path, diffs)?;
        if node.entry_type == tar::EntryType::Directory && metadata.is_dir() {
            compare_tree(node, &path, &rel_path, diffs)?;
        }
    }
    for (name, _) in actual_names {
        diffs.push(format!("{} added", rel.join(name).display()));
    }
    Ok(())
}

fn compare_node(
    node: &ExpectedNode,
    metadata: &std::fs::Metadata,
    path: &Path,
    rel: &Path,
    diffs: &mut Vec<String>,
) -> Result<()> {
    let file_type = metadata.file_type();
    let type_matches = match node.entry_type {
        tar::EntryType::Directory => file_type.is_dir(),
        tar::EntryType::Symlink => file_type.is_symlink(),
        tar::EntryType::Regular | tar::EntryType::Link => file_type.is_file(),
        _ => true, // device nodes and the like are out of scope here
    };
    if !type_matches {
        diffs.push(format!("{} changed type", rel.display()));
        return Ok(());
    }

    match node.entry_type {
        tar::EntryType::Symlink => {
            let target = std::fs::read_link(path)?;
            if node.link_target.as_deref() != Some(target.as_path()) {
                diffs.push(format!("{} changed target", rel.display()));
            }
        }
        tar::EntryType::Regular | tar::EntryType::Link => {
            if metadata.len() != node.size {
                diffs.push(format!("{} changed size", rel.display()));
            }
            if metadata.mode() & 0o7777 != node.mode {
                diffs.push(format!("{} changed mode", rel.display()));
            }
            if metadata.uid() != node.uid || metadata.gid() != node.gid {
                diffs.push(format!("{} changed ownership", rel.display()));
            }
            if metadata.mtime() != node.mtime as i64 {
                diffs.push(format!("{} changed mtime", rel.display()));
            }
        }
        tar::EntryType::Directory => {
            if metadata.mode() & 0o7777 != node.mode {
                diffs.push(format!("{} changed mode", rel.display()));
            }
            if metadata.uid() != node.uid || metadata.gid() != node.gid {
                diffs.push(format!("{} changed ownership", rel.display()));
            }
        }
        _ => {}
    }
    Ok(())
}
