#![allow(dead_code)]

use byteorder::{LE, WriteBytesExt};
use corne_flash::config::{DeviceTable, Settings};
use corne_flash::deploy::MountOps;
use corne_flash::locator::{BlockDevice, DeviceProbe};
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const NRF52840_FAMILY: u32 = 0xada5_2840;
pub const RP2040_FAMILY: u32 = 0xe48b_ff56;

/// Stand-in for the host: serves a fixed device list and records every mutating call. Copies
/// really happen, into whatever directory plays the mount point.
#[derive(Default)]
pub struct MockHost {
    pub devices: Vec<BlockDevice>,
    pub fail_mount: bool,
    pub fail_copy: bool,
    pub fail_unmount: bool,
    /// Raise `interrupt` once the copy has gone through, as a Ctrl-C during the settle wait would.
    pub interrupt_after_copy: bool,
    pub interrupt: AtomicBool,

    pub mount_attempts: Cell<usize>,
    pub mounts: Cell<usize>,
    pub copies: Cell<usize>,
    pub unmounts: Cell<usize>,
    pub copied_from: RefCell<Vec<PathBuf>>,
    pub mounted: Cell<bool>,
    pub outstanding: Cell<usize>,
    pub max_outstanding: Cell<usize>,
}

impl MockHost {
    pub fn with_devices(devices: Vec<BlockDevice>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    /// A host with one nice!nano bootloader attached at /dev/sda.
    pub fn with_nice_nano() -> Self {
        Self::with_devices(vec![bootloader("/dev/sda", "239a", "00b3")])
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.get()
    }
}

impl DeviceProbe for MockHost {
    fn block_devices(&self) -> std::io::Result<Vec<BlockDevice>> {
        Ok(self.devices.clone())
    }
}

impl MountOps for MockHost {
    fn mount(&self, _device: &Path, mount_point: &Path) -> std::io::Result<()> {
        self.mount_attempts.set(self.mount_attempts.get() + 1);
        assert!(mount_point.is_dir(), "mount point must exist before mounting");
        assert!(!self.mounted.get(), "mounted twice without unmounting");
        if self.fail_mount {
            return Err(std::io::Error::other("mount: wrong fs type"));
        }

        self.mounts.set(self.mounts.get() + 1);
        self.mounted.set(true);
        self.outstanding.set(self.outstanding.get() + 1);
        self.max_outstanding
            .set(self.max_outstanding.get().max(self.outstanding.get()));
        Ok(())
    }

    fn copy(&self, source: &Path, destination: &Path) -> std::io::Result<u64> {
        assert!(self.mounted.get(), "copy while not mounted");
        self.copies.set(self.copies.get() + 1);
        self.copied_from.borrow_mut().push(source.to_owned());
        if self.fail_copy {
            return Err(std::io::Error::other("No space left on device"));
        }
        let copied = std::fs::copy(source, destination)?;
        if self.interrupt_after_copy {
            self.interrupt.store(true, Ordering::SeqCst);
        }
        Ok(copied)
    }

    fn unmount(&self, _mount_point: &Path) -> std::io::Result<()> {
        assert!(self.mounted.get(), "unmount while not mounted");
        self.unmounts.set(self.unmounts.get() + 1);
        if self.fail_unmount {
            return Err(std::io::Error::other("umount: target is busy"));
        }

        self.mounted.set(false);
        self.outstanding.set(self.outstanding.get() - 1);
        Ok(())
    }
}

/// A removable block device reporting the given USB IDs the way udev does.
pub fn bootloader(path: &str, vid: &str, pid: &str) -> BlockDevice {
    BlockDevice::from_udev(
        path,
        true,
        &format!(
            "DEVNAME={path}\nID_BUS=usb\nID_USB_VENDOR_ID={vid}\nID_USB_MODEL_ID={pid}\nID_MODEL=nRF_UF2\n"
        ),
    )
}

/// Default settings, with paths relative to the current (scratch) directory and no settle wait.
pub fn settings() -> Settings {
    let mut settings = Settings::new(DeviceTable::builtin().unwrap());
    settings.results_dir = PathBuf::from("results");
    settings.mount_point = PathBuf::from("mnt/corne");
    settings.settle = Duration::ZERO;
    settings.use_sudo = false;
    settings
}

/// A small but well-formed UF2 image.
pub fn uf2_image(blocks: u32, family: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for block_no in 0..blocks {
        out.write_u32::<LE>(0x0a32_4655).unwrap();
        out.write_u32::<LE>(0x9e5d_5157).unwrap();
        out.write_u32::<LE>(0x0000_2000).unwrap();
        out.write_u32::<LE>(0x26000 + block_no * 256).unwrap();
        out.write_u32::<LE>(256).unwrap();
        out.write_u32::<LE>(block_no).unwrap();
        out.write_u32::<LE>(blocks).unwrap();
        out.write_u32::<LE>(family).unwrap();
        out.write_all(&[0x5a; 476]).unwrap();
        out.write_u32::<LE>(0x0ab1_6f30).unwrap();
    }
    out
}

/// Write a UF2 image into `results/<name>`.
pub fn write_artifact(name: &str, family: u32) -> PathBuf {
    let path = Path::new("results").join(name);
    std::fs::create_dir_all("results").unwrap();
    std::fs::write(&path, uf2_image(4, family)).unwrap();
    path
}
