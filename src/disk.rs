// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Block device resolution and mounting.
//!
//! Freshly attached volumes of cloud machines rarely have a predictable
//! device name, but their size is known up front. So a volume is identified
//! by its human-readable size label as reported by lsblk, e.g., "100G".
//!
//! # Mount Procedure
//!
//! 1. Resolve size label to exactly one block device. Zero or multiple
//!    candidates are fatal.
//! 2. Create a filesystem if the device has none.
//! 3. Wait for the filesystem UUID to show up.
//! 4. Create the mount point.
//! 5. Register the device in the mount table by UUID, unless already there.
//! 6. Mount everything listed in the mount table.
//!
//! Creating a filesystem destroys whatever was on the raw device. Callers
//! get a chance to veto it before it happens.

use crate::{
    syscall::{syscall_non_interactive, syscall_output, SyscallError},
    wait::{poll, Sleep, POLL_INTERVAL, POLL_TIMEOUT},
};

use std::{
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Filesystem created on devices that have none.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Default location of persisted mount table.
pub const DEFAULT_FSTAB: &str = "/etc/fstab";

/// Block device as reported by the system listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name, e.g., "sdb".
    pub name: String,

    /// Human-readable size label, e.g., "100G".
    pub size_label: String,
}

impl BlockDevice {
    /// Construct new block device entry.
    pub fn new(name: impl Into<String>, size_label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_label: size_label.into(),
        }
    }

    /// Device node path, always `/dev/<name>`.
    pub fn sys_path(&self) -> PathBuf {
        Path::new("/dev").join(&self.name)
    }
}

/// Access to block devices of the host.
///
/// Layer of indirection so the mount procedure can run against a fake.
pub trait BlockDevices {
    /// List all block devices with their size labels.
    fn list(&self) -> Result<Vec<BlockDevice>>;

    /// Filesystem type of device, if any.
    fn fs_type(&self, device: &Path) -> Result<Option<String>>;

    /// Filesystem UUID of device, if assigned yet.
    fn fs_uuid(&self, device: &Path) -> Result<Option<String>>;

    /// Create filesystem of given type on device.
    fn make_fs(&self, device: &Path, fs_type: &str) -> Result<()>;

    /// Mount everything listed in the mount table.
    fn mount_all(&self) -> Result<()>;
}

/// Block device access through util-linux tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBlockDevices;

impl HostBlockDevices {
    /// Construct new host block device access.
    pub fn new() -> Self {
        Self
    }

    fn blkid_tag(&self, device: &Path, tag: &str) -> Result<Option<String>> {
        let output = syscall_output(
            "blkid",
            [
                OsStr::new("-s"),
                OsStr::new(tag),
                OsStr::new("-o"),
                OsStr::new("value"),
                device.as_os_str(),
            ],
        )?;

        // INVARIANT: blkid exits with status 2 when tag is not present.
        match output.status.code() {
            Some(0) => Ok(Some(output.stdout.trim().to_owned()).filter(|value| !value.is_empty())),
            Some(2) => Ok(None),
            code => Err(DiskError::Syscall(SyscallError::Failed {
                program: "blkid".into(),
                code,
                stderr: output.stderr,
            })),
        }
    }
}

impl BlockDevices for HostBlockDevices {
    fn list(&self) -> Result<Vec<BlockDevice>> {
        let listing = syscall_non_interactive(
            "lsblk",
            ["--raw", "--noheadings", "--output", "NAME,SIZE"],
        )?;
        Ok(parse_lsblk(&listing))
    }

    fn fs_type(&self, device: &Path) -> Result<Option<String>> {
        self.blkid_tag(device, "TYPE")
    }

    fn fs_uuid(&self, device: &Path) -> Result<Option<String>> {
        self.blkid_tag(device, "UUID")
    }

    fn make_fs(&self, device: &Path, fs_type: &str) -> Result<()> {
        syscall_non_interactive(
            "mkfs",
            [OsStr::new("-t"), OsStr::new(fs_type), device.as_os_str()],
        )?;
        Ok(())
    }

    fn mount_all(&self) -> Result<()> {
        syscall_non_interactive("mount", ["-a"])?;
        Ok(())
    }
}

/// Parse raw lsblk listing of `NAME SIZE` pairs.
///
/// Lines that do not carry both columns are skipped.
pub fn parse_lsblk(listing: &str) -> Vec<BlockDevice> {
    listing
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            match (columns.next(), columns.next()) {
                (Some(name), Some(size)) => Some(BlockDevice::new(name, size)),
                _ => None,
            }
        })
        .collect()
}

/// Entry of persisted mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Filesystem UUID.
    pub uuid: String,

    /// Directory to mount filesystem at.
    pub mount_point: PathBuf,

    /// Filesystem type.
    pub fs_type: String,

    /// Comma-separated mount options.
    pub options: String,
}

impl FstabEntry {
    /// Construct entry with `defaults,nofail` options.
    pub fn new(
        uuid: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        fs_type: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            mount_point: mount_point.into(),
            fs_type: fs_type.into(),
            options: "defaults,nofail".into(),
        }
    }
}

impl Display for FstabEntry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "UUID={}\t{}\t{}\t{}\t0\t2",
            self.uuid,
            self.mount_point.display(),
            self.fs_type,
            self.options
        )
    }
}

/// Persisted mount table.
///
/// Entries are only ever appended, never updated or removed.
#[derive(Debug, Clone)]
pub struct Fstab {
    path: PathBuf,
}

impl Fstab {
    /// Construct mount table handle for file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to mount table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if any entry references UUID.
    ///
    /// A missing mount table references nothing.
    ///
    /// # Errors
    ///
    /// - Return [`DiskError::ReadFstab`] if mount table cannot be read.
    pub fn references(&self, uuid: &str) -> Result<bool> {
        match read_to_string(&self.path) {
            Ok(content) => Ok(content.contains(uuid)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(DiskError::ReadFstab {
                source: err,
                path: self.path.clone(),
            }),
        }
    }

    /// Append entry to mount table.
    ///
    /// # Errors
    ///
    /// - Return [`DiskError::ReadFstab`] if mount table cannot be read.
    /// - Return [`DiskError::WriteFstab`] if entry cannot be appended.
    pub fn append(&self, entry: &FstabEntry) -> Result<()> {
        let needs_newline = match read_to_string(&self.path) {
            Ok(content) => !content.is_empty() && !content.ends_with('\n'),
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                return Err(DiskError::ReadFstab {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        let write_error = |err| DiskError::WriteFstab {
            source: err,
            path: self.path.clone(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_error)?;
        let prefix = if needs_newline { "\n" } else { "" };
        writeln!(file, "{prefix}{entry}").map_err(write_error)?;

        Ok(())
    }
}

/// Resolve a volume by size and mount it persistently.
#[derive(Debug)]
pub struct DiskMounter<D, S>
where
    D: BlockDevices,
    S: Sleep,
{
    devices: D,
    sleeper: S,
    fstab: Fstab,
}

impl<D, S> DiskMounter<D, S>
where
    D: BlockDevices,
    S: Sleep,
{
    /// Construct new disk mounter.
    pub fn new(devices: D, sleeper: S, fstab: Fstab) -> Self {
        Self {
            devices,
            sleeper,
            fstab,
        }
    }

    /// Resolve size label to exactly one block device.
    ///
    /// Size labels are compared as plain strings.
    ///
    /// # Errors
    ///
    /// - Return [`DiskError::NoDevice`] if no device has that size.
    /// - Return [`DiskError::AmbiguousDevice`] if several devices have it.
    pub fn resolve(&self, size_label: &str) -> Result<BlockDevice> {
        let mut matches = self
            .devices
            .list()?
            .into_iter()
            .filter(|device| device.size_label == size_label)
            .collect::<Vec<_>>();

        match matches.len() {
            0 => Err(DiskError::NoDevice {
                size_label: size_label.into(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(DiskError::AmbiguousDevice {
                size_label: size_label.into(),
                devices: matches.into_iter().map(|device| device.name).collect(),
            }),
        }
    }

    /// Mount block device with given size label at mount point.
    ///
    /// The `approve_format` callback is consulted before a filesystem is
    /// created on a device that has none.
    ///
    /// # Errors
    ///
    /// - Return [`DiskError::NoDevice`] or [`DiskError::AmbiguousDevice`] if
    ///   size label does not resolve to exactly one device.
    /// - Return [`DiskError::FormatDeclined`] if formatting is not approved.
    /// - Return [`DiskError::UuidTimeout`] if filesystem UUID never shows up.
    /// - Return [`DiskError::CreateMountPoint`] if mount point cannot be made.
    /// - Return [`DiskError::Syscall`] if any external tool fails.
    #[instrument(skip(self, approve_format), level = "debug")]
    pub fn mount_by_size(
        &self,
        size_label: &str,
        mount_point: &Path,
        approve_format: impl FnOnce(&BlockDevice) -> Result<bool>,
    ) -> Result<FstabEntry> {
        let device = self.resolve(size_label)?;
        let path = device.sys_path();
        info!("block device {:?} matches size {size_label}", path.display());

        let fs_type = match self.devices.fs_type(&path)? {
            Some(fs_type) => fs_type,
            None => {
                if !approve_format(&device)? {
                    return Err(DiskError::FormatDeclined { device: path });
                }
                warn!("create {DEFAULT_FS_TYPE} filesystem on {:?}", path.display());
                self.devices.make_fs(&path, DEFAULT_FS_TYPE)?;
                DEFAULT_FS_TYPE.to_owned()
            }
        };

        let uuid = poll(&self.sleeper, POLL_INTERVAL, POLL_TIMEOUT, || {
            self.devices.fs_uuid(&path)
        })?
        .ok_or_else(|| DiskError::UuidTimeout {
            device: path.clone(),
        })?;

        mkdirp::mkdirp(mount_point).map_err(|err| DiskError::CreateMountPoint {
            source: err,
            path: mount_point.to_path_buf(),
        })?;

        let entry = FstabEntry::new(uuid, mount_point, fs_type);
        if self.fstab.references(&entry.uuid)? {
            info!("mount table already references UUID {}", entry.uuid);
        } else {
            info!("register {entry} in {:?}", self.fstab.path().display());
            self.fstab.append(&entry)?;
        }

        self.devices.mount_all()?;

        Ok(entry)
    }
}

/// Block device handling error types.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// No block device has requested size.
    #[error("no block device matches size {size_label:?}")]
    NoDevice { size_label: String },

    /// More than one block device has requested size.
    #[error("more than one block device matches size {size_label:?}: {devices:?}")]
    AmbiguousDevice {
        size_label: String,
        devices: Vec<String>,
    },

    /// Caller refused to create filesystem on raw device.
    #[error("refused to create filesystem on {:?}", device.display())]
    FormatDeclined { device: PathBuf },

    /// Filesystem UUID did not show up in time.
    #[error("no filesystem UUID for {:?} after {:?}", device.display(), POLL_TIMEOUT)]
    UuidTimeout { device: PathBuf },

    /// Mount point directory cannot be created.
    #[error("failed to create mount point at {:?}", path.display())]
    CreateMountPoint {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Mount table cannot be read from.
    #[error("failed to read mount table at {:?}", path.display())]
    ReadFstab {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Mount table cannot be appended to.
    #[error("failed to write mount table at {:?}", path.display())]
    WriteFstab {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Confirmation prompt failed.
    #[error(transparent)]
    Prompt(#[from] inquire::InquireError),

    /// External tool failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

/// Friendly result alias :3
pub type Result<T, E = DiskError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::RecordedSleep;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Default)]
    struct FakeDevices {
        devices: Vec<BlockDevice>,
        fs_type: Option<String>,
        uuid_after: usize,
        uuid_probes: Cell<usize>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeDevices {
        fn new(devices: Vec<BlockDevice>) -> Self {
            Self {
                devices,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl BlockDevices for &FakeDevices {
        fn list(&self) -> Result<Vec<BlockDevice>> {
            Ok(self.devices.clone())
        }

        fn fs_type(&self, _device: &Path) -> Result<Option<String>> {
            Ok(self.fs_type.clone())
        }

        fn fs_uuid(&self, _device: &Path) -> Result<Option<String>> {
            let probes = self.uuid_probes.get() + 1;
            self.uuid_probes.set(probes);
            Ok((probes > self.uuid_after).then(|| "0b1c2d3e".to_owned()))
        }

        fn make_fs(&self, device: &Path, fs_type: &str) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("mkfs {fs_type} {}", device.display()));
            Ok(())
        }

        fn mount_all(&self) -> Result<()> {
            self.calls.borrow_mut().push("mount -a".into());
            Ok(())
        }
    }

    fn approve(_: &BlockDevice) -> Result<bool> {
        Ok(true)
    }

    #[test]
    fn parse_lsblk_listing() {
        let listing = indoc! {r#"
            loop0 63.9M
            sda 20G
            sda1 19.9G
            sdb 100G

        "#};
        let expect = vec![
            BlockDevice::new("loop0", "63.9M"),
            BlockDevice::new("sda", "20G"),
            BlockDevice::new("sda1", "19.9G"),
            BlockDevice::new("sdb", "100G"),
        ];
        assert_eq!(parse_lsblk(listing), expect);
    }

    #[test]
    fn fstab_entry_layout() {
        let entry = FstabEntry::new("0b1c2d3e", "/srv/data", "ext4");
        assert_eq!(
            entry.to_string(),
            "UUID=0b1c2d3e\t/srv/data\text4\tdefaults,nofail\t0\t2"
        );
    }

    #[test]
    fn resolve_single_device_by_exact_label() -> anyhow::Result<()> {
        let fake = FakeDevices::new(vec![
            BlockDevice::new("sda", "20G"),
            BlockDevice::new("sdb", "100G"),
            BlockDevice::new("sdc", "100.0G"),
        ]);
        let mounter = DiskMounter::new(&fake, RecordedSleep::new(), Fstab::new("fstab"));

        let device = mounter.resolve("100G")?;
        assert_eq!(device.sys_path(), PathBuf::from("/dev/sdb"));

        Ok(())
    }

    #[sealed_test]
    fn zero_or_many_devices_abort_before_mutation() {
        let none = FakeDevices::new(vec![BlockDevice::new("sda", "20G")]);
        let mounter = DiskMounter::new(&none, RecordedSleep::new(), Fstab::new("fstab"));
        let result = mounter.mount_by_size("100G", Path::new("data"), approve);
        assert!(matches!(result, Err(DiskError::NoDevice { .. })));
        assert!(none.calls().is_empty());

        let many = FakeDevices::new(vec![
            BlockDevice::new("sdb", "100G"),
            BlockDevice::new("sdc", "100G"),
        ]);
        let mounter = DiskMounter::new(&many, RecordedSleep::new(), Fstab::new("fstab"));
        let result = mounter.mount_by_size("100G", Path::new("data"), approve);
        assert!(matches!(result, Err(DiskError::AmbiguousDevice { .. })));
        assert!(many.calls().is_empty());

        assert!(!Path::new("fstab").exists());
        assert!(!Path::new("data").exists());
    }

    #[sealed_test]
    fn mount_formats_raw_device_and_registers_it() -> anyhow::Result<()> {
        std::fs::write("fstab", "# static file system information")?;
        let mut fake = FakeDevices::new(vec![BlockDevice::new("sdb", "100G")]);
        fake.uuid_after = 3;
        let sleeper = RecordedSleep::new();
        let mounter = DiskMounter::new(&fake, &sleeper, Fstab::new("fstab"));

        let entry = mounter.mount_by_size("100G", Path::new("srv/data"), approve)?;
        assert_eq!(entry, FstabEntry::new("0b1c2d3e", "srv/data", "ext4"));
        assert_eq!(fake.calls(), vec!["mkfs ext4 /dev/sdb", "mount -a"]);
        assert_eq!(sleeper.pauses().len(), 3);
        assert!(Path::new("srv/data").is_dir());

        let expect = "# static file system information\n\
                      UUID=0b1c2d3e\tsrv/data\text4\tdefaults,nofail\t0\t2\n";
        assert_eq!(std::fs::read_to_string("fstab")?, expect);

        // Second run leaves mount table alone.
        let mut fake = FakeDevices::new(vec![BlockDevice::new("sdb", "100G")]);
        fake.fs_type = Some("ext4".into());
        let mounter = DiskMounter::new(&fake, RecordedSleep::new(), Fstab::new("fstab"));
        mounter.mount_by_size("100G", Path::new("srv/data"), approve)?;
        assert_eq!(fake.calls(), vec!["mount -a"]);
        assert_eq!(std::fs::read_to_string("fstab")?, expect);

        Ok(())
    }

    #[sealed_test]
    fn declined_format_leaves_device_alone() {
        let fake = FakeDevices::new(vec![BlockDevice::new("sdb", "100G")]);
        let mounter = DiskMounter::new(&fake, RecordedSleep::new(), Fstab::new("fstab"));

        let result = mounter.mount_by_size("100G", Path::new("data"), |_| Ok(false));
        assert!(matches!(result, Err(DiskError::FormatDeclined { .. })));
        assert!(fake.calls().is_empty());
    }

    #[sealed_test]
    fn missing_uuid_times_out() {
        let mut fake = FakeDevices::new(vec![BlockDevice::new("sdb", "100G")]);
        fake.fs_type = Some("xfs".into());
        fake.uuid_after = usize::MAX;
        let sleeper = RecordedSleep::new();
        let mounter = DiskMounter::new(&fake, &sleeper, Fstab::new("fstab"));

        let result = mounter.mount_by_size("100G", Path::new("data"), approve);
        assert!(matches!(result, Err(DiskError::UuidTimeout { .. })));
        assert_eq!(sleeper.pauses().len(), 60);
        assert!(!Path::new("fstab").exists());
    }
}
