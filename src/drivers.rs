//! Differencing backends.
//!
//! The engine talks to the filesystem layering mechanism through the
//! [`Driver`] trait. Real deployments plug in an overlay- or
//! snapshot-capable backend; the built-in [`DirDriver`] keeps a plain
//! directory per layer and copies the parent's tree on create, which works
//! on any filesystem and is what the tests run against.

use std::path::{Path, PathBuf};

use crate::errors::{Result, StoreError};
use crate::idset::IdMap;

/// Options for creating a layer in the backend.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub mount_label: Option<String>,
    pub writable: bool,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
}

/// Options for mounting a layer.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub mount_label: Option<String>,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// Driver-specific mount options, as `key=value` strings.
    pub options: Vec<String>,
    pub volatile: bool,
    pub read_only: bool,
}

/// A filesystem differencing backend.
pub trait Driver: Send + Sync {
    /// The backend's name, used to namespace store directories.
    fn name(&self) -> &str;

    /// Create a layer, populated from `parent` when given.
    fn create(&self, id: &str, parent: Option<&str>, options: &CreateOptions) -> Result<()>;

    /// Remove a layer and its content.
    fn remove(&self, id: &str) -> Result<()>;

    /// Make a layer's filesystem available and return its location.
    fn get(&self, id: &str, options: &MountOptions) -> Result<PathBuf>;

    /// Undo a `get`.
    fn put(&self, id: &str) -> Result<()>;

    /// Whether a layer exists in the backend.
    fn exists(&self, id: &str) -> bool;

    /// Additional read-only image stores the backend is configured with.
    fn additional_image_stores(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Whether the backend can present a layer under different ID mappings
    /// without duplicating it.
    fn supports_shifting(&self, _uid_maps: &[IdMap], _gid_maps: &[IdMap]) -> bool {
        false
    }

    /// Enumerate every layer the backend is holding.
    fn list_layers(&self) -> Result<Vec<String>> {
        Err(StoreError::NotSupported("listing layers".into()))
    }

    /// Release whatever the backend is caching.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Instantiate a backend by name.
///
/// `options` are `key=value` strings understood by the backend; common
/// prefix form is `<driver>.<key>=<value>`.
pub fn new_driver(
    name: &str,
    home: &Path,
    options: &[String],
) -> Result<Box<dyn Driver>> {
    match name {
        "dir" | "vfs" => Ok(Box::new(DirDriver::new(home, options)?)),
        other => Err(StoreError::NotSupported(format!(
            "driver \"{other}\" is not built in"
        ))),
    }
}

/// Directory-per-layer backend.
///
/// `create` with a parent copies the parent's whole tree, preserving modes,
/// symlinks and mtimes so recorded diffs stay verifiable. `get` simply
/// returns the layer directory.
#[derive(Debug)]
pub struct DirDriver {
    home: PathBuf,
    additional_stores: Vec<PathBuf>,
}

impl DirDriver {
    pub fn new(home: &Path, options: &[String]) -> Result<Self> {
        let mut additional_stores = Vec::new();
        for opt in options {
            match opt.split_once('=') {
                Some((key, value))
                    if key == "dir.imagestore" || key == "vfs.imagestore" =>
                {
                    additional_stores.extend(value.split(',').map(PathBuf::from));
                }
                Some(("dir.ignore_chown_errors", _)) => {}
                _ => {
                    return Err(StoreError::IncompleteOptions(format!(
                        "dir driver does not understand option {opt:?}"
                    )))
                }
            }
        }
        let driver = Self {
            home: home.join("dir"),
            additional_stores,
        };
        std::fs::create_dir_all(&driver.home)?;
        Ok(driver)
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }
}

impl Driver for DirDriver {
    fn name(&self) -> &str {
        "dir"
    }

    fn create(&self, id: &str, parent: Option<&str>, _options: &CreateOptions) -> Result<()> {
        let dir = self.layer_dir(id);
        if dir.exists() {
            return Err(StoreError::DuplicateId(id.to_string()));
        }
        match parent {
            Some(parent) => {
                let parent_dir = self.layer_dir(parent);
                if !parent_dir.is_dir() {
                    return Err(StoreError::LayerUnknown(parent.to_string()));
                }
                copy_tree(&parent_dir, &dir)?;
            }
            None => std::fs::create_dir_all(&dir)?,
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.layer_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str, _options: &MountOptions) -> Result<PathBuf> {
        let dir = self.layer_dir(id);
        if !dir.is_dir() {
            return Err(StoreError::LayerUnknown(id.to_string()));
        }
        Ok(dir)
    }

    fn put(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.layer_dir(id).is_dir()
    }

    fn additional_image_stores(&self) -> Vec<PathBuf> {
        self.additional_stores.clone()
    }

    fn list_layers(&self) -> Result<Vec<String>> {
        let mut layers = Vec::new();
        for entry in std::fs::read_dir(&self.home)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                layers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(layers)
    }
}

/// Recursively copy a tree, preserving permissions, symlinks and mtimes.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(src)?;
    std::fs::create_dir(dst)?;
    std::fs::set_permissions(dst, metadata.permissions())?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
            copy_mtime(&from, &to)?;
        }
    }
    copy_mtime(src, dst)?;
    Ok(())
}

fn copy_mtime(src: &Path, dst: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(src)?;
    let mtime = metadata.modified()?;
    set_mtime(dst, mtime)
}

/// Set a path's mtime (atime is set to the same value).
pub fn set_mtime(path: &Path, mtime: std::time::SystemTime) -> Result<()> {
    let since_epoch = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let stamp = rustix::fs::Timespec {
        tv_sec: since_epoch.as_secs() as i64,
        tv_nsec: since_epoch.subsec_nanos() as i64,
    };
    rustix::fs::utimensat(
        rustix::fs::CWD,
        path,
        &rustix::fs::Timestamps {
            last_access: stamp,
            last_modification: stamp,
        },
        rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
    )
    .map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(dir: &Path) -> DirDriver {
        DirDriver::new(dir, &[]).unwrap()
    }

    #[test]
    fn test_create_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let d = driver(tmp.path());

        d.create("base", None, &CreateOptions::default()).unwrap();
        assert!(d.exists("base"));
        let mount = d.get("base", &MountOptions::default()).unwrap();
        std::fs::write(mount.join("hello.txt"), b"hi").unwrap();
        d.put("base").unwrap();

        d.remove("base").unwrap();
        assert!(!d.exists("base"));
        assert!(d.get("base", &MountOptions::default()).is_err());
    }

    #[test]
    fn test_create_from_parent_copies_content() {
        let tmp = tempfile::tempdir().unwrap();
        let d = driver(tmp.path());

        d.create("base", None, &CreateOptions::default()).unwrap();
        let base = d.get("base", &MountOptions::default()).unwrap();
        std::fs::create_dir(base.join("etc")).unwrap();
        std::fs::write(base.join("etc/issue"), b"v1").unwrap();
        std::os::unix::fs::symlink("issue", base.join("etc/link")).unwrap();

        d.create("child", Some("base"), &CreateOptions::default())
            .unwrap();
        let child = d.get("child", &MountOptions::default()).unwrap();
        assert_eq!(std::fs::read(child.join("etc/issue")).unwrap(), b"v1");
        assert_eq!(
            std::fs::read_link(child.join("etc/link")).unwrap(),
            PathBuf::from("issue")
        );

        // Writes in the child leave the parent alone.
        std::fs::write(child.join("etc/issue"), b"v2").unwrap();
        assert_eq!(std::fs::read(base.join("etc/issue")).unwrap(), b"v1");
    }

    #[test]
    fn test_list_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let d = driver(tmp.path());
        d.create("one", None, &CreateOptions::default()).unwrap();
        d.create("two", None, &CreateOptions::default()).unwrap();
        let mut layers = d.list_layers().unwrap();
        layers.sort();
        assert_eq!(layers, vec!["one", "two"]);
    }

    #[test]
    fn test_unknown_driver_name() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            new_driver("btrfs", tmp.path(), &[]),
            Err(StoreError::NotSupported(_))
        ));
    }
}
