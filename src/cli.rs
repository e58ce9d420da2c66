use crate::artifact::{FirmwareArtifact, Side, Variant};
use crate::config::{
    DEFAULT_DEVICE, DEFAULT_READY_TIME, DEFAULT_RESULTS_DIR, DeviceTable, Settings,
    default_mount_point,
};
use crate::deploy::{Deployer, MountOps};
use crate::device_ids::known_bootloader;
use crate::locator::{self, DeviceProbe};
use crate::uf2_file;
use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "corne-flash", version)]
#[command(about = "Flash ZMK firmware onto a Corne keyboard half in UF2 bootloader mode")]
pub struct Cli {
    /// Keyboard half to flash (left or right)
    #[arg(long, default_value = "left")]
    pub side: Side,

    /// Firmware variant (default or gem)
    #[arg(long, default_value = "default")]
    pub variant: Variant,

    /// Device profile to flash
    #[arg(long, default_value = DEFAULT_DEVICE)]
    pub device: String,

    /// Device table to use instead of the built-in one
    #[arg(long, value_name = "FILE", env = "CORNE_FLASH_DEVICES")]
    pub devices: Option<PathBuf>,

    /// Directory containing built firmware images
    #[arg(long, value_name = "DIR", env = "CORNE_FLASH_RESULTS", default_value = DEFAULT_RESULTS_DIR)]
    pub results_dir: PathBuf,

    /// Where to mount the bootloader volume [default: ~/mnt/corne]
    #[arg(long, value_name = "DIR")]
    pub mount_point: Option<PathBuf>,

    /// Seconds to wait after copying before unmounting
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_READY_TIME)]
    pub ready_time: u64,

    /// Run mount, cp and umount without sudo
    #[arg(long)]
    pub no_sudo: bool,

    /// Flash even if the image doesn't target the controller's chip family
    #[arg(long)]
    pub force: bool,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,

    /// List attached block devices and which profiles they match, then exit
    #[arg(long, conflicts_with = "show_config")]
    pub list: bool,

    /// Print the device table, then exit
    #[arg(long)]
    pub show_config: bool,
}

impl Cli {
    /// Resolve everything the run needs from the arguments. Done once, before any device work.
    pub fn settings(&self) -> Result<Settings> {
        let devices = match &self.devices {
            Some(path) => DeviceTable::load(path)?,
            None => DeviceTable::builtin().context("built-in device table is invalid")?,
        };

        let mut settings = Settings::new(devices);
        settings.results_dir = self.results_dir.clone();
        settings.mount_point = self
            .mount_point
            .clone()
            .unwrap_or_else(default_mount_point);
        settings.settle = Duration::from_secs(self.ready_time);
        settings.use_sudo = !self.no_sudo;
        Ok(settings)
    }
}

/// Exit status for an argument error. Help and version requests are successes; everything else
/// (unknown flags, bad values) is a failure.
pub fn exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() { 1 } else { 0 }
}

/// Asks the operator a yes/no question.
pub trait Confirm {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Prompts on the terminal. Anything but an explicit yes, including EOF, counts as no.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&mut self, question: &str) -> bool {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                warn!("Cannot prompt for confirmation: {e}");
                return false;
            }
        };

        match editor.readline(&format!("{question} (y/n): ")) {
            Ok(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Execute the parsed command against `host`. Human-facing results go to `out`; progress goes to
/// the log. Raising `interrupt` cuts a flash short without leaving the volume mounted.
pub fn run<H: DeviceProbe + MountOps>(
    cli: &Cli,
    settings: &Settings,
    host: &H,
    interrupt: &AtomicBool,
    prompt: &mut impl Confirm,
    out: &mut impl Write,
) -> Result<()> {
    if cli.show_config {
        write!(out, "{}", settings.devices)?;
        return Ok(());
    }
    if cli.list {
        return list(settings, host, out);
    }

    let profile = settings.devices.get(&cli.device)?;
    let signature = profile.signature(&cli.device);
    let artifact = FirmwareArtifact::resolve(&settings.results_dir, profile, cli.side, cli.variant)?;

    info!(
        "Flashing {} side with {} firmware: {}",
        artifact.side,
        artifact.variant,
        artifact.path.display()
    );

    let deployer = Deployer::new(host, settings).with_interrupt(interrupt);
    deployer.check_artifact(&artifact)?;

    let image = uf2_file::parse(&mut File::open(&artifact.path)?)
        .with_context(|| format!("cannot flash {}", artifact.path.display()))?;
    info!(
        "Image has {} blocks ({} bytes of firmware), CRC32 {:#010x}",
        image.block_count, image.payload_bytes, image.crc32
    );

    if let Some(family) = profile.family {
        if !image.targets(family) {
            warn!(
                "Image targets {}, but {} expects {family}; the bootloader will likely ignore it",
                image.describe_families(),
                cli.device
            );
            if !cli.force && !prompt.confirm("Continue anyway?") {
                bail!("aborted: image does not target {family}");
            }
        }
    }

    let report = deployer.deploy(&artifact, &signature)?;
    writeln!(
        out,
        "Flashing complete! Copied {} bytes to {} via {}",
        report.bytes,
        report.destination.display(),
        report.device
    )?;

    Ok(())
}

fn list(settings: &Settings, host: &impl DeviceProbe, out: &mut impl Write) -> Result<()> {
    let candidates = locator::scan(host, &settings.devices.signatures())?;
    if candidates.is_empty() {
        writeln!(out, "No block devices found")?;
        return Ok(());
    }

    for candidate in candidates {
        let device = &candidate.device;
        let id = device
            .usb_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "????:????".to_owned());
        let name = device
            .usb_id()
            .and_then(known_bootloader)
            .or(device.model())
            .unwrap_or("Unknown");

        writeln!(
            out,
            "{} ({id}) {name} - {}",
            device.path.display(),
            candidate.verdict
        )?;
    }

    Ok(())
}
