//! The store: one graph root, one run root, one driver, three record
//! stores, and the locks that keep multiple processes honest.
//!
//! # Lock ordering
//!
//! When an operation needs more than one lock it always acquires them in
//! this order: graph lock, primary layer store, additional (read-only)
//! layer stores in their fixed order, primary image store, additional image
//! stores, container store. The user-namespace lock is independent and is
//! held across allocation plus the layer/container creation it covers.
//!
//! The graph lock (`storage.lock`) is taken shared around every operation
//! that consults the driver, and exclusively by `shutdown`; its last-writer
//! token tells other processes the driver's world changed underneath them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::config::StoreOptions;
use crate::containers::{Container, ContainerOptions, ContainerStore};
use crate::digest::Digest;
use crate::drivers::{new_driver, Driver, MountOptions};
use crate::errors::{Result, StoreError};
use crate::idset::{has_overlapping_ranges, IdMap, IdSet};
use crate::images::{Image, ImageOptions, ImageStore};
use crate::layers::{Layer, LayerOptions, LayerStore};
use crate::lockfile::{LastWrite, LockFile};
use crate::metadata::NameOperation;
use crate::userns::{allocate_mappings, auto_userns_size, subordinate_pool, AutoUserNsOptions};

/// Everything `create_container` accepts beyond ID, names and image.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateOptions {
    pub metadata: String,
    /// Explicit mappings for the container's layer; empty means the store
    /// defaults (or an automatic allocation when `auto_userns` is set).
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// Request an automatically allocated user namespace.
    pub auto_userns: Option<AutoUserNsOptions>,
    /// Mount options replayed on every `mount` of this container.
    pub mount_opts: Vec<String>,
    pub volatile: bool,
    pub flags: std::collections::HashMap<String, serde_json::Value>,
}

/// A handle on one storage tree.
pub struct Store {
    options: StoreOptions,
    graph_lock: LockFile,
    userns_lock: LockFile,
    driver: Arc<dyn Driver>,
    graph_last_write: Mutex<LastWrite>,
    layer_store: LayerStore,
    ro_layer_stores: Vec<LayerStore>,
    image_store: ImageStore,
    ro_image_stores: Vec<ImageStore>,
    container_store: ContainerStore,
}

impl Store {
    /// Open (creating on first use) the storage tree described by `options`.
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        std::fs::create_dir_all(&options.graph_root)?;
        std::fs::create_dir_all(&options.run_root)?;

        let graph_lock = LockFile::open(options.graph_root.join("storage.lock"))?;
        let userns_lock = LockFile::open(options.graph_root.join("userns.lock"))?;

        let driver_name = options.driver_name().to_string();
        let driver: Arc<dyn Driver> = Arc::from(new_driver(
            &driver_name,
            &options.graph_root,
            &options.graph_driver_options,
        )?);

        let layer_store = LayerStore::open(
            &options.graph_root.join(format!("{driver_name}-layers")),
            &options.run_root.join(format!("{driver_name}-layers")),
            Arc::clone(&driver),
        )?;

        let mut ro_layer_stores = Vec::new();
        let mut ro_image_stores = Vec::new();
        for extra in driver.additional_image_stores() {
            let layers = extra.join(format!("{driver_name}-layers"));
            if layers.is_dir() {
                ro_layer_stores.push(LayerStore::open_read_only(
                    &layers,
                    &options.run_root.join(format!("{driver_name}-layers")),
                    Arc::clone(&driver),
                )?);
            }
            let images = extra.join(format!("{driver_name}-images"));
            if images.is_dir() {
                ro_image_stores.push(ImageStore::open_read_only(&images)?);
            }
        }

        let image_store = match &options.image_store {
            Some(dir) => {
                // The graph root's image store becomes an additional
                // read-only one.
                let graph_images = options.graph_root.join(format!("{driver_name}-images"));
                if graph_images.is_dir() {
                    ro_image_stores.insert(0, ImageStore::open_read_only(&graph_images)?);
                }
                ImageStore::open(&dir.join(format!("{driver_name}-images")))?
            }
            None => {
                ImageStore::open(&options.graph_root.join(format!("{driver_name}-images")))?
            }
        };

        let container_dir = if options.transient_store {
            options.run_root.join(format!("{driver_name}-containers"))
        } else {
            options.graph_root.join(format!("{driver_name}-containers"))
        };
        let container_store = ContainerStore::open(
            &container_dir,
            &options.run_root.join(format!("{driver_name}-containers")),
        )?;

        let graph_last_write = {
            let _guard = graph_lock.rlock();
            graph_lock.get_last_write()?
        };

        Ok(Self {
            options,
            graph_lock,
            userns_lock,
            driver,
            graph_last_write: Mutex::new(graph_last_write),
            layer_store,
            ro_layer_stores,
            image_store,
            ro_image_stores,
            container_store,
        })
    }

    pub fn run_root(&self) -> &Path {
        &self.options.run_root
    }

    pub fn graph_root(&self) -> &Path {
        &self.options.graph_root
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub(crate) fn primary_layer_store(&self) -> &LayerStore {
        &self.layer_store
    }

    pub(crate) fn container_store_ref(&self) -> &ContainerStore {
        &self.container_store
    }

    pub(crate) fn primary_image_store(&self) -> &ImageStore {
        &self.image_store
    }

    pub(crate) fn all_layer_stores(&self) -> Vec<&LayerStore> {
        let mut stores = vec![&self.layer_store];
        stores.extend(self.ro_layer_stores.iter());
        stores
    }

    pub(crate) fn all_image_stores(&self) -> Vec<&ImageStore> {
        let mut stores = vec![&self.image_store];
        stores.extend(self.ro_image_stores.iter());
        stores
    }

    /// Notice writes other processes recorded on the graph lock; the driver
    /// gets a chance to drop whatever it cached.
    fn check_graph(&self) -> Result<()> {
        let _guard = self.graph_lock.rlock();
        let mut last = self.graph_last_write.lock().unwrap_or_else(|e| e.into_inner());
        let (current, modified) = self.graph_lock.modified_since(&last)?;
        if modified {
            debug!("graph state changed under us; resetting driver caches");
            self.driver.cleanup()?;
            *last = current;
        }
        Ok(())
    }

    // Layers.

    /// Create a layer, optionally populated by a tar diff stream.
    ///
    /// The parent may live in the writable store or any additional store;
    /// a parent that is some container's private layer is refused.
    pub fn put_layer(
        &self,
        id: Option<String>,
        parent: Option<&str>,
        names: &[String],
        writable: bool,
        options: &LayerOptions,
        diff: Option<&mut dyn std::io::Read>,
    ) -> Result<(Layer, i64)> {
        self.check_graph()?;
        has_overlapping_ranges(&options.uid_maps, &options.gid_maps)?;

        let parent_id = match parent {
            Some(term) => {
                let parent_layer = self.layer(term)?;
                if let Some(container) = self.container_store.by_layer(&parent_layer.id)? {
                    return Err(StoreError::ParentIsContainer(format!(
                        "layer {} is in use by container {}",
                        parent_layer.id, container.id
                    )));
                }
                Some(parent_layer.id)
            }
            None => None,
        };

        let mut options = options.clone();
        if options.uid_maps.is_empty() {
            options.uid_maps = self.options.uid_map.clone();
        }
        if options.gid_maps.is_empty() {
            options.gid_maps = self.options.gid_map.clone();
        }
        self.layer_store
            .create(id, parent_id.as_deref(), names, writable, &options, diff)
    }

    /// `put_layer` without content.
    pub fn create_layer(
        &self,
        id: Option<String>,
        parent: Option<&str>,
        names: &[String],
        writable: bool,
        options: &LayerOptions,
    ) -> Result<Layer> {
        let (layer, _) = self.put_layer(id, parent, names, writable, options, None)?;
        Ok(layer)
    }

    /// Resolve a layer across the writable and additional stores.
    pub fn layer(&self, id: &str) -> Result<Layer> {
        for store in self.all_layer_stores() {
            match store.get(id) {
                Ok(layer) => return Ok(layer),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::LayerUnknown(id.to_string()))
    }

    pub fn layers(&self) -> Result<Vec<Layer>> {
        let mut out = Vec::new();
        for store in self.all_layer_stores() {
            out.extend(store.all()?);
        }
        Ok(out)
    }

    pub fn layers_by_compressed_digest(&self, digest: &Digest) -> Result<Vec<Layer>> {
        let mut out = Vec::new();
        for store in self.all_layer_stores() {
            out.extend(store.by_compressed_digest(digest)?);
        }
        Ok(out)
    }

    pub fn layers_by_uncompressed_digest(&self, digest: &Digest) -> Result<Vec<Layer>> {
        let mut out = Vec::new();
        for store in self.all_layer_stores() {
            out.extend(store.by_uncompressed_digest(digest)?);
        }
        Ok(out)
    }

    /// Delete a layer nothing depends on any more.
    pub fn delete_layer(&self, id: &str) -> Result<()> {
        let layer = self.layer_store.get(id)?;
        let id = layer.id;

        if !self.layer_store.children(&id)?.is_empty() {
            return Err(StoreError::LayerHasChildren(id));
        }
        for image_store in self.all_image_stores() {
            for image in image_store.by_top_layer(&id)? {
                if image.top_layer.as_deref() == Some(id.as_str()) {
                    return Err(StoreError::LayerUsedByImage(format!(
                        "layer {id} is the top layer of image {}",
                        image.id
                    )));
                }
                // A mapped top layer is a cached artifact; detach it.
                if image_store.is_read_write() {
                    image_store.remove_mapped_top_layer(&image.id, &id)?;
                }
            }
        }
        if let Some(container) = self.container_store.by_layer(&id)? {
            return Err(StoreError::LayerUsedByContainer(format!(
                "layer {id} is the layer of container {}",
                container.id
            )));
        }
        self.layer_store.delete(&id, false)
    }

    pub fn diff(&self, id: &str) -> Result<Box<dyn std::io::Read + Send>> {
        for store in self.all_layer_stores() {
            match store.diff(id) {
                Ok(r) => return Ok(r),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::LayerUnknown(id.to_string()))
    }

    pub fn diff_size(&self, id: &str) -> Result<i64> {
        for store in self.all_layer_stores() {
            match store.diff_size(id) {
                Ok(size) => return Ok(size),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::LayerUnknown(id.to_string()))
    }

    pub fn apply_diff(&self, id: &str, diff: &mut dyn std::io::Read) -> Result<i64> {
        self.check_graph()?;
        self.layer_store.apply_diff(id, diff)
    }

    // Images.

    /// Create an image on top of a layer.
    ///
    /// If `id` names an image that only exists in an additional read-only
    /// store, that image is first copied into the writable store (record,
    /// big data and digests), and `names` are then added to the copy.
    pub fn create_image(
        &self,
        id: Option<String>,
        names: &[String],
        top_layer: Option<&str>,
        options: &ImageOptions,
    ) -> Result<Image> {
        if let Some(id) = id.as_deref() {
            if !self.image_store.exists(id) {
                for ro_store in &self.ro_image_stores {
                    match ro_store.get(id) {
                        Ok(template) => {
                            let pulled = self.pull_up_image(ro_store, &template)?;
                            self.image_store.update_names(
                                &pulled.id,
                                names,
                                NameOperation::Add,
                            )?;
                            return self.image_store.get(&pulled.id);
                        }
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let top_layer = match top_layer {
            Some(term) => Some(self.layer(term)?.id),
            None => None,
        };
        self.image_store
            .create(id, names, top_layer.as_deref(), options)
    }

    /// Copy a read-only store's image record and big data into the writable
    /// store.
    fn pull_up_image(&self, ro_store: &ImageStore, template: &Image) -> Result<Image> {
        debug!(
            "copying image {} out of a read-only store",
            template.id
        );
        let options = ImageOptions {
            created: Some(template.created),
            digest: template.digest.clone(),
            digests: template.digests.clone(),
            metadata: template.metadata.clone(),
            flags: template.flags.clone(),
        };
        let image = self.image_store.create(
            Some(template.id.clone()),
            &[],
            template.top_layer.as_deref(),
            &options,
        )?;
        for key in &template.big_data_names {
            let data = ro_store.big_data(&template.id, key)?;
            let digest = ro_store.big_data_digest(&template.id, key).ok();
            self.image_store.set_big_data(&image.id, key, &data, digest)?;
        }
        Ok(image)
    }

    /// Resolve an image across the writable and additional stores.
    pub fn image(&self, id: &str) -> Result<Image> {
        for store in self.all_image_stores() {
            match store.get(id) {
                Ok(image) => return Ok(image),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ImageUnknown(id.to_string()))
    }

    pub fn images(&self) -> Result<Vec<Image>> {
        let mut out = Vec::new();
        for store in self.all_image_stores() {
            out.extend(store.all()?);
        }
        Ok(out)
    }

    pub fn images_by_digest(&self, digest: &Digest) -> Result<Vec<Image>> {
        let mut out = Vec::new();
        for store in self.all_image_stores() {
            out.extend(store.by_digest(digest)?);
        }
        Ok(out)
    }

    pub fn images_by_top_layer(&self, layer: &str) -> Result<Vec<Image>> {
        let mut out = Vec::new();
        for store in self.all_image_stores() {
            out.extend(store.by_top_layer(layer)?);
        }
        Ok(out)
    }

    /// Delete an image, reclaiming whatever ancestor layers become unused.
    ///
    /// With `commit` false nothing is changed; the returned list is the
    /// layers a committed delete would remove.
    pub fn delete_image(&self, id: &str, commit: bool) -> Result<Vec<String>> {
        let image = self.image_store.get(id)?;

        for container in self.container_store.all()? {
            if container.image == image.id {
                return Err(StoreError::ImageUsedByContainer(format!(
                    "image {} is in use by container {}",
                    image.id, container.id
                )));
            }
        }

        // Top layers (canonical and mapped) claimed by other images.
        let mut other_top_layers: Vec<String> = Vec::new();
        for store in self.all_image_stores() {
            for other in store.all()? {
                if other.id == image.id {
                    continue;
                }
                other_top_layers.extend(other.top_layer.iter().cloned());
                other_top_layers.extend(other.mapped_top_layers.iter().cloned());
            }
        }

        let container_layers: Vec<String> = self
            .container_store
            .all()?
            .into_iter()
            .map(|c| c.layer)
            .collect();

        let mut layers_to_remove: Vec<String> = Vec::new();
        if let Some(top) = &image.top_layer {
            let mut candidates = vec![top.clone()];
            candidates.extend(image.mapped_top_layers.iter().cloned());
            for candidate in candidates {
                let mut current = Some(candidate);
                while let Some(layer_id) = current {
                    if layers_to_remove.contains(&layer_id)
                        || other_top_layers.contains(&layer_id)
                        || container_layers.contains(&layer_id)
                    {
                        break;
                    }
                    // A child outside the removal set keeps the whole
                    // remaining chain alive.
                    let children = match self.layer_store.children(&layer_id) {
                        Ok(children) => children,
                        Err(e) if e.is_not_found() => break,
                        Err(e) => return Err(e),
                    };
                    if children.iter().any(|c| !layers_to_remove.contains(c)) {
                        break;
                    }
                    let parent = self.layer_store.get(&layer_id)?.parent;
                    layers_to_remove.push(layer_id);
                    current = parent;
                }
            }
        }

        if commit {
            self.image_store.delete(&image.id)?;
            for layer_id in &layers_to_remove {
                if let Err(e) = self.layer_store.delete(layer_id, false) {
                    warn!("removing layer {layer_id} of deleted image {}: {e}", image.id);
                }
            }
        }
        Ok(layers_to_remove)
    }

    /// Find or create a top layer of `image` matching the requested ID
    /// mappings.
    ///
    /// When the driver can shift IDs at mount time the canonical top layer
    /// is good enough; otherwise a mapped copy is created once and reused.
    pub fn image_top_layer_for_mapping(
        &self,
        image: &Image,
        uid_maps: &[IdMap],
        gid_maps: &[IdMap],
    ) -> Result<Layer> {
        let Some(top) = &image.top_layer else {
            return Err(StoreError::ImageLayerMissing(image.id.clone()));
        };

        let mut candidates = vec![top.clone()];
        candidates.extend(image.mapped_top_layers.iter().cloned());
        for candidate in candidates {
            let layer = self.layer(&candidate)?;
            if layer.uid_map == uid_maps && layer.gid_map == gid_maps {
                return Ok(layer);
            }
        }
        let canonical = self.layer(top)?;
        if (uid_maps.is_empty() && gid_maps.is_empty())
            || self.driver.supports_shifting(uid_maps, gid_maps)
        {
            return Ok(canonical);
        }

        debug!(
            "creating a mapped top layer of {top} for image {}",
            image.id
        );
        let template_blob = self
            .all_layer_stores()
            .iter()
            .find_map(|s| s.diff_blob_path(&canonical.id));
        let mapped = self.layer_store.create_mapped_copy(
            &canonical,
            template_blob.as_deref(),
            uid_maps,
            gid_maps,
        )?;
        self.image_store.add_mapped_top_layer(&image.id, &mapped.id)?;
        Ok(mapped)
    }

    // Containers.

    /// Create a container from an image (or, with `image` unset, directly
    /// on top of the layer named by `layer`).
    pub fn create_container(
        &self,
        id: Option<String>,
        names: &[String],
        image: Option<&str>,
        layer: Option<&str>,
        options: &ContainerCreateOptions,
    ) -> Result<Container> {
        self.check_graph()?;

        // The user-namespace lock serializes allocation against every other
        // process; take it only when mappings are actually in play.
        let needs_userns_lock =
            options.auto_userns.is_some() || !options.uid_maps.is_empty() || !options.gid_maps.is_empty();
        let _userns_guard = needs_userns_lock.then(|| self.userns_lock.lock());

        // Explicit maps win, then auto-allocation, then the store defaults.
        let (uid_maps, gid_maps) = match &options.auto_userns {
            Some(auto) => self.allocate_auto_userns(auto)?,
            None => {
                let uid_maps = if options.uid_maps.is_empty() {
                    self.options.uid_map.clone()
                } else {
                    options.uid_maps.clone()
                };
                let gid_maps = if options.gid_maps.is_empty() {
                    self.options.gid_map.clone()
                } else {
                    options.gid_maps.clone()
                };
                (uid_maps, gid_maps)
            }
        };
        has_overlapping_ranges(&uid_maps, &gid_maps)?;

        let (image_id, parent_layer) = match image {
            Some(term) => {
                let image = self.image(term)?;
                let top = self.image_top_layer_for_mapping(&image, &uid_maps, &gid_maps)?;
                (image.id, Some(top.id))
            }
            None => (
                String::new(),
                match layer {
                    Some(term) => Some(self.layer(term)?.id),
                    None => None,
                },
            ),
        };

        let volatile = options.volatile && !self.options.disable_volatile;
        let layer_options = LayerOptions {
            uid_maps: uid_maps.clone(),
            gid_maps: gid_maps.clone(),
            volatile,
            ..Default::default()
        };
        let (container_layer, _) = self.layer_store.create(
            None,
            parent_layer.as_deref(),
            &[],
            true,
            &layer_options,
            None,
        )?;

        let container_options = ContainerOptions {
            metadata: options.metadata.clone(),
            uid_map: uid_maps,
            gid_map: gid_maps,
            mount_opts: options.mount_opts.clone(),
            volatile,
            flags: options.flags.clone(),
        };
        match self.container_store.create(
            id,
            names,
            &image_id,
            &container_layer.id,
            &container_options,
        ) {
            Ok(container) => Ok(container),
            Err(e) => {
                // Don't leak the layer we just made for it.
                if let Err(cleanup) = self.layer_store.delete(&container_layer.id, true) {
                    warn!(
                        "deleting layer {} after failed container create: {cleanup}",
                        container_layer.id
                    );
                }
                Err(e)
            }
        }
    }

    fn allocate_auto_userns(
        &self,
        requested: &AutoUserNsOptions,
    ) -> Result<(Vec<IdMap>, Vec<IdMap>)> {
        let size = auto_userns_size(
            requested.size,
            self.options.auto_ns_min_size,
            self.options.auto_ns_max_size,
        )?;
        let mut used_uids = IdSet::new();
        let mut used_gids = IdSet::new();
        for container in self.container_store.all()? {
            used_uids = used_uids.union(&IdSet::host_ids(&container.uid_map));
            used_gids = used_gids.union(&IdSet::host_ids(&container.gid_map));
        }
        let uid_maps = allocate_mappings(
            size,
            &subordinate_pool(&self.options.auto_userns_uids),
            &used_uids,
            &requested.additional_uid_mappings,
        )?;
        let gid_maps = allocate_mappings(
            size,
            &subordinate_pool(&self.options.auto_userns_gids),
            &used_gids,
            &requested.additional_gid_mappings,
        )?;
        Ok((uid_maps, gid_maps))
    }

    pub fn container(&self, id: &str) -> Result<Container> {
        self.container_store.get(id)
    }

    pub fn containers(&self) -> Result<Vec<Container>> {
        self.container_store.all()
    }

    pub fn container_by_layer(&self, layer: &str) -> Result<Option<Container>> {
        self.container_store.by_layer(layer)
    }

    /// Delete a container: its layer first, then the record and its
    /// userdata directories.
    pub fn delete_container(&self, id: &str) -> Result<()> {
        let container = self.container_store.get(id)?;
        match self.layer_store.delete(&container.layer, true) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.container_store.delete(&container.id)
    }

    /// Delete whatever `id` names: a container, an image (committing layer
    /// reclamation), or a layer.
    pub fn delete(&self, id: &str) -> Result<()> {
        if self.container_store.exists(id) {
            return self.delete_container(id);
        }
        if self.image_store.exists(id) {
            return self.delete_image(id, true).map(|_| ());
        }
        if self.layer_store.exists(id) {
            return self.delete_layer(id);
        }
        Err(StoreError::NotAnId(id.to_string()))
    }

    /// Remove every container, image and layer.
    pub fn wipe(&self) -> Result<()> {
        self.container_store.wipe()?;
        self.image_store.wipe()?;
        self.layer_store.wipe()
    }

    // Names and metadata.

    /// Resolve any ID, name, or unambiguous ID prefix to the record's ID.
    pub fn lookup(&self, term: &str) -> Result<String> {
        if let Ok(container) = self.container(term) {
            return Ok(container.id);
        }
        if let Ok(image) = self.image(term) {
            return Ok(image.id);
        }
        if let Ok(layer) = self.layer(term) {
            return Ok(layer.id);
        }
        Err(StoreError::NotAnId(term.to_string()))
    }

    pub fn exists(&self, term: &str) -> bool {
        self.lookup(term).is_ok()
    }

    /// Names of whatever record `term` resolves to.
    pub fn names(&self, term: &str) -> Result<Vec<String>> {
        if let Ok(container) = self.container(term) {
            return Ok(container.names);
        }
        if let Ok(image) = self.image(term) {
            return Ok(image.names);
        }
        if let Ok(layer) = self.layer(term) {
            return Ok(layer.names);
        }
        Err(StoreError::NotAnId(term.to_string()))
    }

    /// Update names on whatever writable record `term` resolves to.
    pub fn update_names(
        &self,
        term: &str,
        names: &[String],
        op: NameOperation,
    ) -> Result<()> {
        if self.container_store.exists(term) {
            return self.container_store.update_names(term, names, op);
        }
        if self.image_store.exists(term) {
            return self.image_store.update_names(term, names, op);
        }
        if self.layer_store.exists(term) {
            return self.layer_store.update_names(term, names, op);
        }
        Err(StoreError::NotAnId(term.to_string()))
    }

    pub fn set_names(&self, term: &str, names: &[String]) -> Result<()> {
        self.update_names(term, names, NameOperation::Set)
    }

    pub fn add_names(&self, term: &str, names: &[String]) -> Result<()> {
        self.update_names(term, names, NameOperation::Add)
    }

    pub fn remove_names(&self, term: &str, names: &[String]) -> Result<()> {
        self.update_names(term, names, NameOperation::Remove)
    }

    /// Metadata of an image or container (layers carry none).
    pub fn metadata(&self, term: &str) -> Result<String> {
        if let Ok(container) = self.container(term) {
            return Ok(container.metadata);
        }
        if let Ok(image) = self.image(term) {
            return Ok(image.metadata);
        }
        if self.layer(term).is_ok() {
            return Ok(String::new());
        }
        Err(StoreError::NotAnId(term.to_string()))
    }

    pub fn set_metadata(&self, term: &str, metadata: &str) -> Result<()> {
        if self.container_store.exists(term) {
            return self.container_store.set_metadata(term, metadata);
        }
        if self.image_store.exists(term) {
            return self.image_store.set_metadata(term, metadata);
        }
        Err(StoreError::NotAnId(term.to_string()))
    }

    // Big data plumbing.

    pub fn layer_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        for store in self.all_layer_stores() {
            match store.big_data(id, key) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::LayerUnknown(id.to_string()))
    }

    pub fn set_layer_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        self.layer_store.set_big_data(id, key, data)
    }

    pub fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        for store in self.all_image_stores() {
            match store.big_data(id, key) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ImageUnknown(id.to_string()))
    }

    pub fn image_big_data_size(&self, id: &str, key: &str) -> Result<i64> {
        for store in self.all_image_stores() {
            match store.big_data_size(id, key) {
                Ok(size) => return Ok(size),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ImageUnknown(id.to_string()))
    }

    pub fn image_big_data_digest(&self, id: &str, key: &str) -> Result<Digest> {
        for store in self.all_image_stores() {
            match store.big_data_digest(id, key) {
                Ok(digest) => return Ok(digest),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ImageUnknown(id.to_string()))
    }

    pub fn set_image_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
        digest: Option<Digest>,
    ) -> Result<()> {
        self.image_store.set_big_data(id, key, data, digest)
    }

    pub fn image_directory(&self, id: &str) -> Result<PathBuf> {
        for store in self.all_image_stores() {
            match store.directory(id) {
                Ok(dir) => return Ok(dir),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ImageUnknown(id.to_string()))
    }

    pub fn image_run_directory(&self, id: &str) -> Result<PathBuf> {
        let image = self.image(id)?;
        let dir = self
            .options
            .run_root
            .join(format!("{}-images", self.driver_name()))
            .join(&image.id)
            .join("userdata");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn container_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.container_store.big_data(id, key)
    }

    pub fn set_container_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        self.container_store.set_big_data(id, key, data)
    }

    pub fn container_directory(&self, id: &str) -> Result<PathBuf> {
        self.container_store.directory(id)
    }

    pub fn container_run_directory(&self, id: &str) -> Result<PathBuf> {
        self.container_store.run_directory(id)
    }

    /// Write `data` to a named file under the container's userdata directory.
    pub fn set_container_directory_file(&self, id: &str, file: &str, data: &[u8]) -> Result<()> {
        let path = self.container_store.directory(id)?.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Read a named file from the container's userdata directory.
    pub fn container_directory_file(&self, id: &str, file: &str) -> Result<Vec<u8>> {
        let path = self.container_store.directory(id)?.join(file);
        Ok(std::fs::read(path)?)
    }

    /// Write `data` to a named file under the container's run-root userdata
    /// directory.
    pub fn set_container_run_directory_file(
        &self,
        id: &str,
        file: &str,
        data: &[u8],
    ) -> Result<()> {
        let path = self.container_store.run_directory(id)?.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Read a named file from the container's run-root userdata directory.
    pub fn container_run_directory_file(&self, id: &str, file: &str) -> Result<Vec<u8>> {
        let path = self.container_store.run_directory(id)?.join(file);
        Ok(std::fs::read(path)?)
    }

    // Mounting.

    /// Mount a layer or a container's layer and return the mount point.
    pub fn mount(&self, term: &str, mount_label: Option<&str>) -> Result<PathBuf> {
        let _graph = self.graph_lock.rlock();
        let (layer_id, options) = self.resolve_mount(term, mount_label)?;
        self.layer_store.mount(&layer_id, &options)
    }

    fn resolve_mount(
        &self,
        term: &str,
        mount_label: Option<&str>,
    ) -> Result<(String, MountOptions)> {
        if let Ok(container) = self.container_store.get(term) {
            let options = MountOptions {
                mount_label: mount_label.map(str::to_string),
                uid_maps: container.uid_map.clone(),
                gid_maps: container.gid_map.clone(),
                options: container.mount_opts.clone(),
                volatile: container.volatile && !self.options.disable_volatile,
                read_only: false,
            };
            return Ok((container.layer, options));
        }
        let layer = self.layer_store.get(term)?;
        Ok((
            layer.id,
            MountOptions {
                mount_label: mount_label.map(str::to_string),
                ..Default::default()
            },
        ))
    }

    /// Unmount a layer or a container's layer.
    ///
    /// Returns whether it is still mounted (by other references) afterwards.
    pub fn unmount(&self, term: &str, force: bool) -> Result<bool> {
        let _graph = self.graph_lock.rlock();
        let layer_id = match self.container_store.get(term) {
            Ok(container) => container.layer,
            Err(e) if e.is_not_found() => term.to_string(),
            Err(e) => return Err(e),
        };
        self.layer_store.unmount(&layer_id, force)
    }

    /// Current mount count of a layer or a container's layer.
    pub fn mounted(&self, term: &str) -> Result<u32> {
        let layer_id = match self.container_store.get(term) {
            Ok(container) => container.layer,
            Err(e) if e.is_not_found() => term.to_string(),
            Err(e) => return Err(e),
        };
        Ok(self.layer_store.mounted(&layer_id)?.0)
    }

    /// Mount an image's top layer read-only.
    pub fn mount_image(&self, term: &str, mount_label: Option<&str>) -> Result<PathBuf> {
        let _graph = self.graph_lock.rlock();
        let image = self.image(term)?;
        let Some(top) = &image.top_layer else {
            return Err(StoreError::ImageLayerMissing(image.id.clone()));
        };
        let options = MountOptions {
            mount_label: mount_label.map(str::to_string),
            read_only: true,
            ..Default::default()
        };
        self.layer_store.mount(top, &options)
    }

    pub fn unmount_image(&self, term: &str, force: bool) -> Result<bool> {
        let _graph = self.graph_lock.rlock();
        let image = self.image(term)?;
        let Some(top) = &image.top_layer else {
            return Err(StoreError::ImageLayerMissing(image.id.clone()));
        };
        self.layer_store.unmount(top, force)
    }

    /// Unmount every mounted layer and reset the driver.
    ///
    /// Without `force`, any layer that is still mounted aborts the shutdown
    /// and is returned in the error list. A write is recorded on the graph
    /// lock either way, so other processes re-check the driver.
    pub fn shutdown(&self, force: bool) -> Result<Vec<String>> {
        let _graph = self.graph_lock.lock();

        let mut still_mounted = Vec::new();
        for id in self.layer_store.mounted_layers()? {
            if force {
                while matches!(self.layer_store.unmount(&id, false), Ok(true)) {}
            }
            let (count, _) = self.layer_store.mounted(&id)?;
            if count > 0 {
                still_mounted.push(id);
            }
        }

        let result = if still_mounted.is_empty() {
            self.driver.cleanup()?;
            Ok(Vec::new())
        } else {
            warn!("shutdown leaving {} layer(s) mounted", still_mounted.len());
            Ok(still_mounted)
        };
        let token = self.graph_lock.record_write()?;
        *self.graph_last_write.lock().unwrap_or_else(|e| e.into_inner()) = token;
        result
    }
}

/// An explicit registry deduplicating [`Store`] handles per storage tree.
///
/// Owned by the embedding application; two `get` calls with equivalent
/// options share one handle.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Mutex<Vec<Arc<Store>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (opening on first use) the store for `options`.
    ///
    /// Re-requesting the same graph root with a different driver or run
    /// root is refused rather than silently returning the mismatched
    /// handle.
    pub fn get(&self, options: StoreOptions) -> Result<Arc<Store>> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        for store in stores.iter() {
            if store.graph_root() == options.graph_root {
                if store.run_root() == options.run_root
                    && store.driver_name() == options.driver_name()
                {
                    return Ok(Arc::clone(store));
                }
                return Err(StoreError::IncompleteOptions(format!(
                    "storage at {} is already in use with different options",
                    options.graph_root.display()
                )));
            }
        }
        let store = Arc::new(Store::open(options)?);
        stores.push(Arc::clone(&store));
        Ok(store)
    }

    /// Drop a handle from the registry.
    pub fn free(&self, store: &Arc<Store>) {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.retain(|s| !Arc::ptr_eq(s, store));
    }
}
