//! Platform probes: hidden/system attributes, volume roots and network volumes.

use std::ffi::OsStr;
use std::fs::DirEntry;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use sysinfo::Disks;

use foldervision_core::{ScanError, ScanSettings};

#[cfg(windows)]
const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
#[cfg(windows)]
const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;

/// File system types reported for network-attached volumes.
const NETWORK_FILE_SYSTEMS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smb", "smbfs", "smb2", "smb3", "sshfs", "fuse.sshfs", "9p", "afs",
    "davfs", "ncpfs",
];

/// Directory and file skip predicates derived from [`ScanSettings`].
#[derive(Debug, Clone)]
pub struct SkipRules {
    skip_hidden: bool,
    skip_system: bool,
    excludes: GlobSet,
}

impl SkipRules {
    /// Build the rules, compiling any exclusion patterns.
    pub fn from_settings(settings: &ScanSettings) -> Result<Self, ScanError> {
        Ok(Self {
            skip_hidden: settings.skip_hidden,
            skip_system: settings.skip_system,
            excludes: settings.exclude_set()?,
        })
    }

    /// Whether a directory should not be descended into.
    ///
    /// Volume roots are explicit scan targets and never match.
    pub fn skip_dir(&self, path: &Path, attributes: Option<u32>) -> bool {
        if is_volume_root(path) {
            return false;
        }
        ScanSettings::is_excluded(&self.excludes, path)
            || (self.skip_hidden && is_hidden(path, attributes))
            || (self.skip_system && is_system(attributes))
    }

    /// Whether a file should be left out of the count.
    pub fn skip_file(&self, path: &Path, attributes: Option<u32>) -> bool {
        self.skip_hidden && is_hidden(path, attributes)
    }

    /// Whether any rule needs per-entry attributes.
    pub fn needs_attributes(&self) -> bool {
        cfg!(windows) && (self.skip_hidden || self.skip_system)
    }
}

/// A path with no parent: `/`, `C:\`, or a bare network share.
pub fn is_volume_root(path: &Path) -> bool {
    path.parent().is_none()
}

/// Raw attribute bits for an entry, where the platform has them.
#[cfg(windows)]
pub fn entry_attributes(entry: &DirEntry) -> Option<u32> {
    use std::os::windows::fs::MetadataExt;
    entry.metadata().ok().map(|m| m.file_attributes())
}

#[cfg(not(windows))]
pub fn entry_attributes(_entry: &DirEntry) -> Option<u32> {
    None
}

#[cfg(windows)]
fn is_hidden(_path: &Path, attributes: Option<u32>) -> bool {
    attributes.is_some_and(|a| a & FILE_ATTRIBUTE_HIDDEN != 0)
}

#[cfg(not(windows))]
fn is_hidden(path: &Path, _attributes: Option<u32>) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}

#[cfg(windows)]
fn is_system(attributes: Option<u32>) -> bool {
    attributes.is_some_and(|a| a & FILE_ATTRIBUTE_SYSTEM != 0)
}

#[cfg(not(windows))]
fn is_system(_attributes: Option<u32>) -> bool {
    false
}

/// Mount table used to tell network volumes from local ones.
#[derive(Debug, Clone, Default)]
pub struct VolumeTable {
    // Longest mount point first so nested mounts win.
    mounts: Vec<(PathBuf, bool)>,
}

impl VolumeTable {
    /// Read the current mount table.
    pub fn detect() -> Self {
        let disks = Disks::new_with_refreshed_list();
        Self::from_mounts(
            disks
                .iter()
                .map(|d| (d.mount_point().to_path_buf(), is_network_fs(d.file_system()))),
        )
    }

    /// Build a table from `(mount point, is network)` pairs.
    pub fn from_mounts(mounts: impl IntoIterator<Item = (PathBuf, bool)>) -> Self {
        let mut mounts: Vec<_> = mounts.into_iter().collect();
        mounts.sort_by_key(|(m, _)| std::cmp::Reverse(m.components().count()));
        Self { mounts }
    }

    /// Whether the volume holding `path` is network-attached.
    pub fn is_network(&self, path: &Path) -> bool {
        self.mounts
            .iter()
            .find(|(mount, _)| path.starts_with(mount))
            .is_some_and(|(_, network)| *network)
    }
}

/// Whether a file system type name denotes a network file system.
pub fn is_network_fs(fs_type: &OsStr) -> bool {
    let name = fs_type.to_string_lossy().to_ascii_lowercase();
    NETWORK_FILE_SYSTEMS.contains(&name.as_str())
}

/// `\\server\share` or `//server/share`.
pub fn is_unc_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with(r"\\") || s.starts_with("//")
}

/// Whether `path` lives on a remote volume.
pub fn is_remote_path(path: &Path, volumes: &VolumeTable) -> bool {
    is_unc_path(path) || volumes.is_network(path)
}
