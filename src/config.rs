//! Persistent settings, stored as TOML.
//!
//! ```toml
//! verbose = false
//! force = false
//! vid = 0x0403
//! pid = 0x6010
//! clock_khz = 1000
//! adapter = "ftdi"
//! ir_length = 4
//!
//! [[devices]]
//! part_id = 0x1BA01477
//! name = "STM32F103CB"
//! vendor = "STMicroelectronics"
//! flash_size = 131072
//! ram_size = 20480
//! flash_regions = [{ base = 0x08000000, size = 131072, sector_size = 1024 }]
//! ```

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::device::{DeviceCatalog, DeviceDescriptor};
use crate::ftdi::{AdapterInfo, FTDI_VID};
use crate::jtag::DEFAULT_IR_LENGTH;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not access config file {}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Could not parse config file {}", path.display())]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("Could not serialise config")]
    Serialize(#[from] toml::ser::Error),
    #[error("Unsupported adapter type {0}, only \"ftdi\" is available.")]
    UnsupportedAdapter(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raise the default log level to info.
    pub verbose: bool,
    /// Accept a `--device` whose IDCODE does not match the scanned one.
    pub force: bool,
    pub vid: u16,
    pub pid: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// TCK frequency in kHz.
    pub clock_khz: u32,
    pub adapter: String,
    pub ir_length: usize,
    /// Extra devices appended to the built-in catalog.
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbose: false,
            force: false,
            vid: FTDI_VID,
            pid: 0x6010,
            serial: None,
            clock_khz: 1000,
            adapter: "ftdi".to_owned(),
            ir_length: DEFAULT_IR_LENGTH,
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Per-user config file location, if a home directory can be found.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "adamgreig", "tapflash")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load settings from `path`, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            },
            Err(source) => return Err(Error::Io { path: path.to_owned(), source }),
        };
        log::debug!("Loading config from {}", path.display());
        toml::from_str(&text).map_err(|source| Error::Parse { path: path.to_owned(), source })
    }

    /// Write settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| Error::Io { path: parent.to_owned(), source })?;
        }
        std::fs::write(path, text).map_err(|source| Error::Io { path: path.to_owned(), source })
    }

    /// Check the configured adapter type is one we can drive.
    pub fn check_adapter(&self) -> Result<()> {
        if self.adapter.eq_ignore_ascii_case("ftdi") {
            Ok(())
        } else {
            Err(Error::UnsupportedAdapter(self.adapter.clone()))
        }
    }

    /// Adapter selection from the configured VID, PID and serial number.
    pub fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo::from_ids(self.vid, self.pid, self.serial.clone())
    }

    /// The built-in catalog extended with this config's devices.
    pub fn catalog(&self) -> DeviceCatalog {
        let mut catalog = DeviceCatalog::builtin();
        for device in self.devices.iter() {
            catalog.add(device.clone());
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tapflash-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load(&temp_path("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.clock_khz, 1000);
        assert_eq!(config.ir_length, 4);
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("saved").join("config.toml");
        let mut config = Config::default();
        config.verbose = true;
        config.serial = Some("FT1234".to_owned());
        config.devices.push(DeviceCatalog::builtin().find_by_name("LPC1768").unwrap().clone());
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str("clock_khz = 250\npid = 0x6014\n").unwrap();
        assert_eq!(config.clock_khz, 250);
        assert_eq!(config.pid, 0x6014);
        assert_eq!(config.vid, 0x0403);
        assert_eq!(config.adapter, "ftdi");
    }

    #[test]
    fn test_parse_error() {
        let path = temp_path("broken.toml");
        std::fs::write(&path, "clock_khz = \"fast\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Parse { .. })));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_devices_extend_catalog() {
        let text = r#"
            [[devices]]
            part_id = 0x3BA00477
            name = "STM32F105RC"
            vendor = "STMicroelectronics"
            flash_size = 262144
            ram_size = 65536
            flash_regions = [{ base = 0x08000000, size = 262144, sector_size = 2048 }]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        let catalog = config.catalog();
        let device = catalog.find_by_name("stm32f105rc").unwrap();
        assert_eq!(device.flash_regions[0].sector_size, 2048);
        assert!(!device.fpu);
        // Built-in entries still win IDCODE lookups.
        assert_eq!(catalog.find(0x3BA0_0477).unwrap().name, "LPC1768");
    }

    #[test]
    fn test_adapter() {
        let mut config = Config::default();
        assert!(config.check_adapter().is_ok());
        config.adapter = "jlink".to_owned();
        assert!(matches!(config.check_adapter(), Err(Error::UnsupportedAdapter(_))));
        let info = config.adapter_info();
        assert_eq!((info.vid, info.pid), (0x0403, 0x6010));
    }
}
