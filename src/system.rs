use crate::deploy::MountOps;
use crate::locator::{BlockDevice, DeviceProbe};
use log::{debug, trace};
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};

const SYS_BLOCK: &str = "/sys/block";
const DEV_DIR: &str = "/dev";

/// The machine we're running on: devices come from sysfs and udev, mounting and copying go
/// through the usual command-line tools (optionally via `sudo`, since mounting needs root).
#[derive(Debug, Clone)]
pub struct SystemHost {
    use_sudo: bool,
}

impl SystemHost {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn command(&self, program: &str) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }
}

/// Run `cmd` to completion, turning a non-zero exit into an error carrying its stderr.
fn run(mut cmd: Command) -> std::io::Result<()> {
    trace!("Running {cmd:?}");
    // sudo may need to ask for a password
    let output = cmd.stdin(Stdio::inherit()).output()?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(std::io::Error::other(format!(
        "{cmd:?} failed ({}): {}",
        output.status,
        stderr.trim()
    )))
}

fn udev_properties(device: &Path) -> std::io::Result<String> {
    let output = Command::new("udevadm")
        .args(["info", "--query=property", "--name"])
        .arg(device)
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "udevadm exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Walk `sys_block` for disks, in name order. USB mass storage shows up as SCSI disks, so only
/// `sd*` entries are considered. Entries without a node under `dev_dir`, or whose udev properties
/// can't be read, are skipped.
fn scan_block_devices(
    sys_block: &Path,
    dev_dir: &Path,
    query: impl Fn(&Path) -> std::io::Result<String>,
) -> std::io::Result<Vec<BlockDevice>> {
    let mut names: Vec<String> = fs::read_dir(sys_block)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("sd"))
        .collect();
    names.sort();

    let mut devices = Vec::with_capacity(names.len());
    for name in names {
        let path = dev_dir.join(&name);
        if !path.exists() {
            debug!("Device path does not exist: {}", path.display());
            continue;
        }

        let removable = fs::read_to_string(sys_block.join(&name).join("removable"))
            .map(|v| v.trim() == "1")
            .unwrap_or(false);

        match query(&path) {
            Ok(output) => devices.push(BlockDevice::from_udev(path, removable, &output)),
            Err(e) => debug!("Failed to get udev info for {}: {e}", path.display()),
        }
    }

    Ok(devices)
}

impl DeviceProbe for SystemHost {
    fn block_devices(&self) -> std::io::Result<Vec<BlockDevice>> {
        scan_block_devices(Path::new(SYS_BLOCK), Path::new(DEV_DIR), udev_properties)
    }
}

impl MountOps for SystemHost {
    fn mount(&self, device: &Path, mount_point: &Path) -> std::io::Result<()> {
        let mut cmd = self.command("mount");
        cmd.arg(device).arg(mount_point);
        run(cmd)
    }

    fn copy(&self, source: &Path, destination: &Path) -> std::io::Result<u64> {
        let len = fs::metadata(source)?.len();
        if self.use_sudo {
            // The volume is owned by root once mounted, so the copy needs the same privileges.
            let mut cmd = self.command("cp");
            cmd.arg(source).arg(destination);
            run(cmd)?;
            Ok(len)
        } else {
            let mut input = File::open(source)?;
            let mut output = File::create(destination)?;
            let copied = std::io::copy(&mut input, &mut output)?;
            output.sync_all()?;
            Ok(copied)
        }
    }

    fn unmount(&self, mount_point: &Path) -> std::io::Result<()> {
        let mut cmd = self.command("umount");
        cmd.arg(mount_point);
        run(cmd)
    }
}
