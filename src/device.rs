//! Catalog of known target devices, keyed by JTAG IDCODE.
//!
//! Lookups compare only the low 28 bits of the IDCODE (the part number and
//! designer), ignoring the 4-bit version field. Some vendors ship silicon
//! with identical debug IDCODEs, so a lookup returns the first registered
//! match and a device name can be supplied to disambiguate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IDCODE 0x{idcode:08X} is not from an ARM debug port.")]
    NotArm { idcode: u32 },
    #[error("Unknown device with IDCODE 0x{idcode:08X}; specify one with --device.")]
    UnknownDevice { idcode: u32 },
    #[error("No device named {name} in catalog.")]
    UnknownName { name: String },
    #[error("Device {name} expects IDCODE 0x{expected:08X} but found 0x{found:08X}; use --force to override.")]
    IdcodeMismatch { name: String, expected: u32, found: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Mask applied to IDCODEs before comparison.
pub const PART_MASK: u32 = 0x0FFF_FFFF;

/// JEP106 designer code of ARM Ltd, as it appears in bits 0-11 of an IDCODE.
const ARM_DESIGNER: u32 = 0x477;

/// A contiguous region of flash with uniform sector size.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRegion {
    pub base: u32,
    pub size: u32,
    pub sector_size: u32,
}

impl FlashRegion {
    /// Address one past the end of the region.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && (address as u64) < self.end()
    }
}

/// Static attributes of a target device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub part_id: u32,
    pub name: String,
    pub vendor: String,
    pub flash_size: u32,
    pub ram_size: u32,
    pub flash_regions: Vec<FlashRegion>,
    #[serde(default)]
    pub fpu: bool,
    #[serde(default)]
    pub dsp: bool,
}

impl DeviceDescriptor {
    /// Returns true if `idcode` matches this device, ignoring the version field.
    pub fn matches(&self, idcode: u32) -> bool {
        self.part_id & PART_MASK == idcode & PART_MASK
    }

    /// Find the flash region holding `address`, if any.
    pub fn region_containing(&self, address: u32) -> Option<&FlashRegion> {
        self.flash_regions.iter().find(|r| r.contains(address))
    }

    /// Base address of the first flash region.
    pub fn flash_base(&self) -> Option<u32> {
        self.flash_regions.first().map(|r| r.base)
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Device: {} ({})", self.name, self.vendor)?;
        writeln!(f, "  Part ID: 0x{:08X}", self.part_id)?;
        writeln!(f, "  Flash: {}KiB, RAM: {}KiB", self.flash_size / 1024, self.ram_size / 1024)?;
        for region in self.flash_regions.iter() {
            writeln!(f, "  Flash region: 0x{:08X}-0x{:08X}, {} byte sectors",
                     region.base, region.end() - 1, region.sector_size)?;
        }
        write!(f, "  FPU: {}, DSP: {}",
               if self.fpu { "yes" } else { "no" },
               if self.dsp { "yes" } else { "no" })
    }
}

/// An ordered, append-only list of device descriptors.
#[derive(Clone, Debug, Default)]
pub struct DeviceCatalog {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding the built-in device table.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.add(descriptor(0x1BA0_1477, "STM32F103C8", "STMicroelectronics",
                               64, 20, &[(0x0800_0000, 64, 1024)], false, false));
        catalog.add(descriptor(0x2BA0_1477, "STM32F407VG", "STMicroelectronics",
                               1024, 192, &[(0x0800_0000, 1024, 16 * 1024)], true, true));
        // Shares its IDCODE with the STM32F103C8.
        catalog.add(descriptor(0x1BA0_1477, "GD32F103C8", "GigaDevice",
                               64, 20, &[(0x0800_0000, 64, 1024)], false, false));
        catalog.add(descriptor(0x4BA0_0477, "LPC1768", "NXP",
                               512, 64, &[(0x0000_0000, 512, 4096)], false, false));
        catalog
    }

    /// Append a descriptor. Earlier entries take priority in `find`.
    pub fn add(&mut self, device: DeviceDescriptor) {
        log::trace!("Adding {} (0x{:08X}) to catalog", device.name, device.part_id);
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Find the first device matching `idcode`.
    pub fn find(&self, idcode: u32) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.matches(idcode))
    }

    /// Find a device by name, ignoring case.
    pub fn find_by_name(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Identify the device behind a scanned `idcode`.
    ///
    /// If `name` is given it selects the device directly; its IDCODE must
    /// still match the scanned one unless `force` is set.
    pub fn identify(&self, idcode: u32, name: Option<&str>, force: bool)
        -> Result<&DeviceDescriptor>
    {
        if idcode & 0xFFF != ARM_DESIGNER {
            return Err(Error::NotArm { idcode });
        }

        if let Some(name) = name {
            let device = self.find_by_name(name)
                             .ok_or_else(|| Error::UnknownName { name: name.to_owned() })?;
            if !device.matches(idcode) {
                if force {
                    log::warn!("Using {} despite IDCODE mismatch (0x{:08X} != 0x{:08X})",
                               device.name, idcode, device.part_id);
                } else {
                    return Err(Error::IdcodeMismatch {
                        name: device.name.clone(),
                        expected: device.part_id,
                        found: idcode,
                    });
                }
            }
            return Ok(device);
        }

        let device = self.find(idcode).ok_or(Error::UnknownDevice { idcode })?;
        let others: Vec<&str> = self.devices.iter()
                                    .filter(|d| d.matches(idcode) && d.name != device.name)
                                    .map(|d| d.name.as_str())
                                    .collect();
        if !others.is_empty() {
            log::warn!("IDCODE 0x{:08X} also matches {}; assuming {}, use --device to override",
                       idcode, others.join(", "), device.name);
        }
        Ok(device)
    }
}

#[allow(clippy::too_many_arguments)]
fn descriptor(part_id: u32, name: &str, vendor: &str, flash_kb: u32, ram_kb: u32,
              regions: &[(u32, u32, u32)], fpu: bool, dsp: bool) -> DeviceDescriptor
{
    DeviceDescriptor {
        part_id,
        name: name.to_owned(),
        vendor: vendor.to_owned(),
        flash_size: flash_kb * 1024,
        ram_size: ram_kb * 1024,
        flash_regions: regions.iter()
                              .map(|&(base, size_kb, sector_size)| FlashRegion {
                                  base, size: size_kb * 1024, sector_size
                              })
                              .collect(),
        fpu,
        dsp,
    }
}
