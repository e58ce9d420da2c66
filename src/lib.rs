/// Firmware image naming: which file the build produced for a given half and variant.
pub mod artifact;

/// Command-line interface and the flow of a single invocation.
pub mod cli;

/// Device profiles and the settings one invocation runs with. The built-in table comes from
/// `etc/devices.toml`; another can be loaded with `--devices`.
pub mod config;

/// Mount, copy, settle and unmount a firmware image onto a bootloader volume.
pub mod deploy;

/// USB IDs and the UF2 bootloaders we know by name.
pub mod device_ids;

/// Find the block device a bootloader exposes, by USB vendor and product ID.
pub mod locator;

/// Real host backend: sysfs and udev for discovery, mount/cp/umount for flashing.
pub mod system;

/// Validate UF2 firmware images before they are written anywhere.
pub mod uf2_file;
