use crate::artifact::FirmwareArtifact;
use crate::config::Settings;
use crate::device_ids::DeviceSignature;
use crate::locator::{self, DeviceProbe, DiscoveredDevice};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often the settle wait checks for an interrupt.
const SETTLE_POLL: Duration = Duration::from_millis(100);

static NEVER_INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Host operations that change state: mounting the bootloader volume, writing to it and
/// unmounting it. Every call blocks until the operation finishes or fails.
pub trait MountOps {
    fn mount(&self, device: &Path, mount_point: &Path) -> std::io::Result<()>;

    /// Copy `source` to `destination`, returning the number of bytes written.
    fn copy(&self, source: &Path, destination: &Path) -> std::io::Result<u64>;

    fn unmount(&self, mount_point: &Path) -> std::io::Result<()>;
}

/// How a session ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Life cycle of one flashing session. There is no way back from `Unmounted`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Mounted,
    Copying,
    Settling,
    Unmounted(Outcome),
}

/// All errors that can end a flashing attempt. None of them are retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(
        "firmware file not found at {}; make sure you've built the firmware first",
        .path.display()
    )]
    ArtifactNotFound { path: PathBuf },

    #[error("no bootloader device found")]
    DeviceNotFound(#[source] locator::Error),

    #[error(
        "mount point {} is in use by another flash (remove {} if none is running)",
        .mount_point.display(), .lock.display()
    )]
    Busy { mount_point: PathBuf, lock: PathBuf },

    #[error("failed to create lock file {}", .lock.display())]
    LockFailed {
        lock: PathBuf,
        source: std::io::Error,
    },

    #[error("interrupted before the bootloader confirmed the image; flash again to be sure")]
    Interrupted,

    #[error("failed to mount {} at {}", .device.display(), .mount_point.display())]
    MountFailed {
        device: PathBuf,
        mount_point: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to copy firmware to {}", .destination.display())]
    CopyFailed {
        destination: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "failed to unmount {}; unmount it by hand before unplugging the board",
        .mount_point.display()
    )]
    UnmountFailed {
        mount_point: PathBuf,
        source: std::io::Error,
    },
}

/// A mounted bootloader volume. Dropping a session that hasn't been explicitly unmounted (for
/// example while unwinding) still unmounts it.
#[derive(Debug)]
pub struct MountSession<'h, H: MountOps> {
    host: &'h H,
    device: DiscoveredDevice,
    mount_point: PathBuf,
    state: SessionState,
}

impl<'h, H: MountOps> MountSession<'h, H> {
    /// Mount `device` at `mount_point`. On failure nothing is left to clean up.
    pub fn mount(host: &'h H, device: DiscoveredDevice, mount_point: &Path) -> Result<Self, Error> {
        info!("Mounting {device} at {}", mount_point.display());
        host.mount(&device.path, mount_point)
            .map_err(|source| Error::MountFailed {
                device: device.path.clone(),
                mount_point: mount_point.to_owned(),
                source,
            })?;

        let mut session = Self {
            host,
            device,
            mount_point: mount_point.to_owned(),
            state: SessionState::Idle,
        };
        session.transition(SessionState::Mounted);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Copy `source` onto the volume as `file_name`.
    pub fn copy(&mut self, source: &Path, file_name: &str) -> Result<u64, Error> {
        let destination = self.mount_point.join(file_name);
        self.transition(SessionState::Copying);
        info!(
            "Copying firmware from {} to {}",
            source.display(),
            destination.display()
        );

        self.host
            .copy(source, &destination)
            .map_err(|source| Error::CopyFailed {
                destination,
                source,
            })
    }

    /// Block for `duration` while the bootloader starts consuming the image. Unmounting while it
    /// is still reading races the reset it performs once it has the whole file.
    ///
    /// Returns false if `interrupt` was raised before the time was up.
    pub fn settle(&mut self, duration: Duration, interrupt: &AtomicBool) -> bool {
        self.transition(SessionState::Settling);
        if !duration.is_zero() {
            info!("Flashing firmware... please wait {} seconds", duration.as_secs_f32());
        }

        let deadline = Instant::now() + duration;
        loop {
            if interrupt.load(Ordering::SeqCst) {
                warn!("Interrupted while waiting for the bootloader; unmounting");
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep(SETTLE_POLL.min(deadline - now));
        }
    }

    /// Unmount the volume. Runs exactly once per session; a failure is reported, not retried.
    pub fn unmount(mut self, outcome: Outcome) -> Result<(), Error> {
        self.release(outcome)
    }

    fn release(&mut self, outcome: Outcome) -> Result<(), Error> {
        self.transition(SessionState::Unmounted(outcome));
        info!("Unmounting {}", self.mount_point.display());
        self.host
            .unmount(&self.mount_point)
            .map_err(|source| Error::UnmountFailed {
                mount_point: self.mount_point.clone(),
                source,
            })
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

impl<H: MountOps> Drop for MountSession<'_, H> {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Unmounted(_)) {
            return;
        }

        warn!(
            "Session for {} abandoned in state {:?}; unmounting",
            self.device, self.state
        );
        if let Err(e) = self.release(Outcome::Failure) {
            warn!("{e}");
        }
    }
}

/// Advisory lock that keeps two flashes from sharing a mount point. It is a file next to the
/// mount point (not inside it, where the mounted volume would hide it), removed on drop.
#[derive(Debug)]
struct MountLock {
    path: PathBuf,
}

impl MountLock {
    fn path_for(mount_point: &Path) -> PathBuf {
        let mut name = mount_point
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mount".into());
        name.push(".lock");
        mount_point.with_file_name(name)
    }

    fn acquire(mount_point: &Path) -> Result<Self, Error> {
        let path = Self::path_for(mount_point);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Busy {
                    mount_point: mount_point.to_owned(),
                    lock: path,
                });
            }
            Err(source) => return Err(Error::LockFailed { lock: path, source }),
        };
        // Best effort: the PID only helps a human decide whether the lock is stale.
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { path })
    }
}

impl Drop for MountLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock {}: {e}", self.path.display());
        }
    }
}

/// What a successful flash did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub device: DiscoveredDevice,
    pub destination: PathBuf,
    pub bytes: u64,
}

/// Transfers firmware images onto bootloader volumes, one attempt per call.
#[derive(Debug)]
pub struct Deployer<'a, H> {
    host: &'a H,
    settings: &'a Settings,
    interrupt: &'a AtomicBool,
}

impl<'a, H: DeviceProbe + MountOps> Deployer<'a, H> {
    pub fn new(host: &'a H, settings: &'a Settings) -> Self {
        Self {
            host,
            settings,
            interrupt: &NEVER_INTERRUPTED,
        }
    }

    /// Watch `flag` (typically set from a Ctrl-C handler). Once it is raised, a flash that hasn't
    /// mounted yet is abandoned and a settle wait in progress is cut short. The volume is still
    /// unmounted and the lock released.
    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = flag;
        self
    }

    /// Fail with [Error::ArtifactNotFound] unless the image is a regular file we can open.
    pub fn check_artifact(&self, artifact: &FirmwareArtifact) -> Result<(), Error> {
        let not_found = || Error::ArtifactNotFound {
            path: artifact.path.clone(),
        };

        if !artifact.path.is_file() {
            return Err(not_found());
        }
        File::open(&artifact.path).map_err(|e| {
            debug!("Could not open {}: {e}", artifact.path.display());
            not_found()
        })?;

        Ok(())
    }

    /// Flash `artifact` onto the single device matching `signature`.
    ///
    /// Preconditions are checked before anything is touched. Once the volume is mounted it is
    /// always unmounted again, even if the copy fails; the first failure is what gets returned.
    pub fn deploy(
        &self,
        artifact: &FirmwareArtifact,
        signature: &DeviceSignature,
    ) -> Result<Report, Error> {
        self.check_artifact(artifact)?;

        let device = locator::locate(self.host, signature).map_err(Error::DeviceNotFound)?;
        info!("Found bootloader device at {device}");

        let mount_point = &self.settings.mount_point;
        std::fs::create_dir_all(mount_point).map_err(|source| Error::MountFailed {
            device: device.path.clone(),
            mount_point: mount_point.clone(),
            source,
        })?;
        let _lock = MountLock::acquire(mount_point)?;
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }

        let mut session = MountSession::mount(self.host, device.clone(), mount_point)?;

        let copied = session
            .copy(&artifact.path, &self.settings.destination_name)
            .and_then(|bytes| {
                if session.settle(self.settings.settle, self.interrupt) {
                    Ok(bytes)
                } else {
                    Err(Error::Interrupted)
                }
            });
        let outcome = match copied {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        };
        let unmounted = session.unmount(outcome);

        match (copied, unmounted) {
            (Ok(bytes), Ok(())) => Ok(Report {
                device,
                destination: self.settings.destination(),
                bytes,
            }),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unmount_err)) => {
                warn!("{unmount_err}");
                Err(e)
            }
        }
    }
}
