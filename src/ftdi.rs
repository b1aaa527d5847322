//! This is the lowest-level module. It is responsible for scanning the USB bus
//! to find FTDI USB-to-serial adapters and driving their pins in asynchronous
//! bit-bang mode, which is how the JTAG signals reach the target.
//!
//! Pin mapping on the adapter's first interface (ADBUS):
//!
//! | Bit | Signal | Direction |
//! |-----|--------|-----------|
//! | 0   | TCK    | out       |
//! | 1   | TMS    | out       |
//! | 2   | TDI    | out       |
//! | 3   | TRST   | out       |
//! | 4   | TDO    | in        |
//! | 5   | SRST   | out       |

use std::time::Duration;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use crate::transport::{Error, Pin, PinTransport, Result};

/// FTDI's USB vendor ID.
pub const FTDI_VID: u16 = 0x0403;

/// Product IDs of FTDI parts which support bit-bang mode.
const FTDI_PIDS: &[u16] = &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015];

const REQTYPE_OUT: u8 = 0x40;
const REQTYPE_IN: u8 = 0xC0;

const SIO_RESET: u8 = 0x00;
const SIO_SET_BAUDRATE: u8 = 0x03;
const SIO_SET_BITMODE: u8 = 0x0B;
const SIO_READ_PINS: u8 = 0x0C;

const BITMODE_RESET: u16 = 0x00;
const BITMODE_BITBANG: u16 = 0x01;

/// Interface A: control index and bulk OUT endpoint.
const INTERFACE_INDEX: u16 = 1;
const OUT_EP: u8 = 0x02;

const TIMEOUT: Duration = Duration::from_millis(100);

/// Bit-bang base clock in Hz, before the divisor.
const BASE_CLOCK: u32 = 3_000_000;

const PIN_TCK: u8 = 1 << 0;
const PIN_TMS: u8 = 1 << 1;
const PIN_TDI: u8 = 1 << 2;
const PIN_TRST: u8 = 1 << 3;
const PIN_TDO: u8 = 1 << 4;
const PIN_SRST: u8 = 1 << 5;

const OUTPUT_MASK: u8 = PIN_TCK | PIN_TMS | PIN_TDI | PIN_TRST | PIN_SRST;

/// Both active-low resets are released at start-up.
const INITIAL_STATE: u8 = PIN_TRST | PIN_SRST;

/// Handle to an FTDI adapter driven in bit-bang mode.
pub struct FtdiBitbang {
    handle: DeviceHandle<Context>,
    baudrate: u32,
    state: u8,
    open: bool,
}

impl FtdiBitbang {
    /// Attempt to open an unspecified connected adapter.
    ///
    /// Fails if zero or more than one adapter is detected.
    pub fn new() -> Result<FtdiBitbang> {
        log::debug!("Attempting to open any connected FTDI adapter");
        let adapters = AdapterInfo::list();
        if adapters.is_empty() {
            Err(Error::NoAdaptersFound)
        } else if adapters.len() > 1 {
            Err(Error::MultipleAdaptersFound)
        } else {
            adapters[0].open()
        }
    }

    fn from_device(device: Device<Context>) -> Result<FtdiBitbang> {
        log::trace!("Attempting to open FTDI adapter: {:?}", device);
        let mut handle = device.open()?;
        // Not all platforms support detaching the kernel's serial driver;
        // claiming the interface below reports any real problem.
        handle.set_auto_detach_kernel_driver(true).ok();
        handle.claim_interface(0)?;
        log::debug!("Successfully opened FTDI adapter: {:?}", device);
        Ok(FtdiBitbang { handle, baudrate: 1_000_000, state: INITIAL_STATE, open: false })
    }

    /// Set the rate at which the adapter applies output updates.
    ///
    /// Takes effect on the next `open()`, or immediately if already open.
    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.baudrate = baudrate;
        if self.open {
            self.write_baudrate()?;
        }
        Ok(())
    }

    fn write_baudrate(&self) -> Result<()> {
        let divisor = (BASE_CLOCK / self.baudrate.max(1)).clamp(1, 0x3FFF) as u16;
        log::trace!("Setting bit-bang divisor to {}", divisor);
        self.control(SIO_SET_BAUDRATE, divisor)
    }

    fn control(&self, request: u8, value: u16) -> Result<()> {
        self.handle.write_control(REQTYPE_OUT, request, value, INTERFACE_INDEX, &[], TIMEOUT)?;
        Ok(())
    }

    fn write_state(&self) -> Result<()> {
        self.handle.write_bulk(OUT_EP, &[self.state], TIMEOUT)?;
        Ok(())
    }

    fn read_pins(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.handle.read_control(REQTYPE_IN, SIO_READ_PINS, 0, INTERFACE_INDEX, &mut buf, TIMEOUT)?;
        Ok(buf[0])
    }

    fn mask(pin: Pin) -> u8 {
        match pin {
            Pin::TCK => PIN_TCK,
            Pin::TMS => PIN_TMS,
            Pin::TDI => PIN_TDI,
            Pin::TRST => PIN_TRST,
            Pin::TDO => PIN_TDO,
            Pin::SRST => PIN_SRST,
        }
    }
}

impl PinTransport for FtdiBitbang {
    fn open(&mut self) -> Result<()> {
        log::debug!("Entering bit-bang mode");
        self.control(SIO_RESET, 0)?;
        self.write_baudrate()?;
        self.control(SIO_SET_BITMODE, (BITMODE_BITBANG << 8) | OUTPUT_MASK as u16)?;
        self.state = INITIAL_STATE;
        self.write_state()?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            log::debug!("Leaving bit-bang mode");
            self.control(SIO_SET_BITMODE, BITMODE_RESET << 8).ok();
            self.handle.release_interface(0).ok();
            self.open = false;
        }
    }

    fn set_pin(&mut self, pin: Pin, value: bool) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        let mask = Self::mask(pin);
        if mask & OUTPUT_MASK == 0 {
            return Err(Error::UnsupportedPin(pin));
        }
        if value {
            self.state |= mask;
        } else {
            self.state &= !mask;
        }
        self.write_state()
    }

    fn get_pin(&mut self, pin: Pin) -> Result<bool> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        Ok(self.read_pins()? & Self::mask(pin) != 0)
    }

    fn delay(&mut self, us: u32) {
        if us > 0 {
            std::thread::sleep(Duration::from_micros(us as u64));
        }
    }
}

impl std::ops::Drop for FtdiBitbang {
    fn drop(&mut self) {
        self.close();
    }
}

/// Metadata about an FTDI adapter.
///
/// Used to enumerate available adapters and to specify
/// a specific adapter to attempt to connect to.
#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub name: Option<String>,
    pub vid: u16,
    pub pid: u16,
    pub sn: Option<String>,
}

impl AdapterInfo {
    /// Find all connected FTDI adapters.
    pub fn list() -> Vec<Self> {
        log::trace!("Searching for FTDI adapters");
        match Context::new().and_then(|ctx| ctx.devices()) {
            Ok(devices) => devices.iter().filter_map(|d| Self::from_device(&d)).collect(),
            Err(_) => vec![],
        }
    }

    /// Create an AdapterInfo from a specifier string.
    pub fn from_specifier(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(Error::InvalidSpecifier);
        }
        let vid = u16::from_str_radix(parts[0], 16).or(Err(Error::InvalidSpecifier))?;
        let pid = u16::from_str_radix(parts[1], 16).or(Err(Error::InvalidSpecifier))?;
        let sn = parts.get(2).map(|sn| (*sn).to_owned());
        Ok(AdapterInfo { name: None, vid, pid, sn })
    }

    /// Create an AdapterInfo for a VID/PID pair and optional serial number.
    pub fn from_ids(vid: u16, pid: u16, sn: Option<String>) -> Self {
        AdapterInfo { name: None, vid, pid, sn }
    }

    /// Attempt to open an FtdiBitbang corresponding to this AdapterInfo.
    pub fn open(&self) -> Result<FtdiBitbang> {
        log::trace!("Opening adapter: {}", self);
        let devices = Context::new().and_then(|ctx| ctx.devices())?;
        for device in devices.iter() {
            if let Some(info) = AdapterInfo::from_device(&device) {
                if info.matches(self) {
                    return FtdiBitbang::from_device(device);
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Create an AdapterInfo from an rusb Device if it is an FTDI adapter.
    ///
    /// Returns None if the device could not be read or was not an FTDI device.
    fn from_device(device: &Device<Context>) -> Option<AdapterInfo> {
        let desc = device.device_descriptor().ok()?;
        if desc.vendor_id() != FTDI_VID || !FTDI_PIDS.contains(&desc.product_id()) {
            return None;
        }

        // Strings are optional; an adapter we cannot open is still listed.
        let strings = device.open().ok().and_then(|handle| {
            let language = handle.read_languages(TIMEOUT).ok()?.first().cloned()?;
            let name = handle.read_product_string(language, &desc, TIMEOUT).ok();
            let sn = handle.read_serial_number_string(language, &desc, TIMEOUT).ok();
            Some((name, sn))
        });
        let (name, sn) = strings.unwrap_or((None, None));

        Some(Self { name, vid: desc.vendor_id(), pid: desc.product_id(), sn })
    }

    /// Check if this `AdapterInfo` is valid for `target`.
    ///
    /// Always checks `vid` and `pid`, checks `sn` if not None.
    fn matches(&self, target: &Self) -> bool {
        if self.vid == target.vid && self.pid == target.pid {
            match target.sn {
                None => true,
                Some(_) => self.sn == target.sn,
            }
        } else {
            false
        }
    }
}

impl std::fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.name.clone().unwrap_or_else(|| "Unknown".to_owned());
        let sn = self.sn.clone().unwrap_or_default();
        write!(f, "{:04x}:{:04x}:{} {}", self.vid, self.pid, sn, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_specifier() {
        let info = AdapterInfo::from_specifier("0403:6010").unwrap();
        assert_eq!((info.vid, info.pid, info.sn), (0x0403, 0x6010, None));

        let info = AdapterInfo::from_specifier("0403:6014:FT123").unwrap();
        assert_eq!(info.sn.as_deref(), Some("FT123"));

        assert!(AdapterInfo::from_specifier("0403").is_err());
        assert!(AdapterInfo::from_specifier("0403:zzzz").is_err());
        assert!(AdapterInfo::from_specifier("0403:6010:a:b").is_err());
    }

    #[test]
    fn test_matches() {
        let found = AdapterInfo::from_ids(0x0403, 0x6010, Some("A1".to_owned()));
        assert!(found.matches(&AdapterInfo::from_ids(0x0403, 0x6010, None)));
        assert!(found.matches(&AdapterInfo::from_ids(0x0403, 0x6010, Some("A1".to_owned()))));
        assert!(!found.matches(&AdapterInfo::from_ids(0x0403, 0x6010, Some("B2".to_owned()))));
        assert!(!found.matches(&AdapterInfo::from_ids(0x0403, 0x6014, None)));
    }
}
