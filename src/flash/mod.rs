//! On-chip flash programming.
//!
//! `Flash` walks erase and program requests across sectors and pages,
//! delegating the controller-specific register sequences to a `FlashDriver`
//! chosen from the identified device's name.

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use crate::dap::{Dap, MemoryAccess, Error as DapError};
use crate::device::DeviceDescriptor;
use crate::transport::PinTransport;

pub mod stm32f1;

pub use stm32f1::Stm32f1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Debug access error")]
    Dap(#[from] DapError),
    #[error("No flash driver available for {name}.")]
    NoDriver { name: String },
    #[error("Flash controller still busy at 0x{address:08X}.")]
    Timeout { address: u32 },
    #[error("Flash controller reported an error (SR=0x{status:08X}) at 0x{address:08X}.")]
    Controller { address: u32, status: u32 },
    #[error("Failed to erase sector at 0x{address:08X}")]
    Erase { address: u32, source: Box<Error> },
    #[error("Failed to program page at 0x{address:08X}")]
    Program { address: u32, source: Box<Error> },
    #[error("Failed to read back page at 0x{address:08X} for verification")]
    Verify { address: u32, source: Box<Error> },
    #[error("Readback verification failed for page at 0x{address:08X}.")]
    VerifyMismatch { address: u32 },
    #[error("Range of {length} bytes at 0x{address:08X} is outside device flash.")]
    OutOfRange { address: u32, length: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";

/// Reads are split into chunks of this size so progress can be reported.
const READ_CHUNK: usize = 1024;

/// Snapshot of a flash controller's status register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlashStatus {
    pub busy: bool,
    pub error: bool,
    pub eop: bool,
}

/// Controller-specific flash operations.
///
/// Every method receives the memory access path to the target, so a driver
/// holds only its own configuration.
pub trait FlashDriver {
    /// Short name of the controller family.
    fn name(&self) -> &str;

    /// Prepare the controller for erase and program operations.
    fn init(&mut self, access: &mut dyn MemoryAccess) -> Result<()>;

    /// Read the controller's current status.
    fn status(&mut self, access: &mut dyn MemoryAccess) -> Result<FlashStatus>;

    /// Erase the sector starting at `address`.
    fn erase_sector(&mut self, access: &mut dyn MemoryAccess, address: u32) -> Result<()>;

    /// Program `data` at `address`. The area must already be erased.
    fn program_page(&mut self, access: &mut dyn MemoryAccess, address: u32, data: &[u8])
        -> Result<()>;

    /// Read back `data.len()` bytes at `address` and compare against `data`.
    fn verify(&mut self, access: &mut dyn MemoryAccess, address: u32, data: &[u8])
        -> Result<bool>;

    /// Size of the sector starting at `address`.
    fn sector_size(&self, address: u32) -> u32;

    /// Size of each chunk passed to `program_page`.
    fn page_size(&self) -> usize;

    /// Return the controller to its locked state.
    fn finish(&mut self, _access: &mut dyn MemoryAccess) -> Result<()> {
        Ok(())
    }
}

/// Pick the flash driver matching `device`'s name, if any.
pub fn select_driver(device: &DeviceDescriptor) -> Option<Box<dyn FlashDriver>> {
    let name = device.name.to_ascii_lowercase();
    if stm32f1::PATTERNS.iter().any(|p| name.contains(p)) {
        Some(Box::new(Stm32f1::new(device)))
    } else {
        None
    }
}

/// Flash programming session for one device.
pub struct Flash<'a, A: MemoryAccess> {
    access: &'a mut A,
    device: DeviceDescriptor,
    driver: Option<Box<dyn FlashDriver>>,
    initialised: bool,
}

impl<'a, A: MemoryAccess> Flash<'a, A> {
    /// Create a new Flash with no driver loaded; call `detect()` next.
    pub fn new(access: &'a mut A, device: &DeviceDescriptor) -> Self {
        Flash { access, device: device.clone(), driver: None, initialised: false }
    }

    /// Create a new Flash using a specific driver.
    pub fn with_driver(access: &'a mut A, device: &DeviceDescriptor,
                       driver: Box<dyn FlashDriver>) -> Self
    {
        Flash { access, device: device.clone(), driver: Some(driver), initialised: false }
    }

    /// Select a driver for this device by name.
    ///
    /// Returns the driver's name, or `Error::NoDriver` if none matches.
    pub fn detect(&mut self) -> Result<&str> {
        match select_driver(&self.device) {
            Some(driver) => {
                log::debug!("Using {} flash driver for {}", driver.name(), self.device.name);
                self.load_driver(driver);
                Ok(self.driver.as_ref().map(|d| d.name()).unwrap_or_default())
            },
            None => {
                log::warn!("No flash driver matches {}", self.device.name);
                Err(Error::NoDriver { name: self.device.name.clone() })
            },
        }
    }

    /// Replace the current driver.
    pub fn load_driver(&mut self, driver: Box<dyn FlashDriver>) {
        self.driver = Some(driver);
        self.initialised = false;
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Run the driver's initialisation if it has not run since loading.
    pub fn init(&mut self) -> Result<()> {
        if !self.initialised {
            let (driver, access) = self.parts()?;
            driver.init(access)?;
            self.initialised = true;
        }
        Ok(())
    }

    /// Erase every sector overlapping `address..address+length`.
    pub fn erase(&mut self, address: u32, length: usize) -> Result<()> {
        self.erase_cb(address, length, |_| {})
    }

    /// Erase every sector overlapping `address..address+length`, drawing a progress bar.
    pub fn erase_progress(&mut self, address: u32, length: usize) -> Result<()> {
        let pb = progress_bar(length, "Erasing");
        let result = self.erase_cb(address, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Erase every sector overlapping `address..address+length`.
    ///
    /// The first sector erased is the one containing `address`.
    /// Calls `cb` with the number of requested bytes covered so far.
    pub fn erase_cb<F: Fn(usize)>(&mut self, address: u32, length: usize, cb: F) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.check_range(address, length)?;
        self.init()?;
        let start = self.sector_start(address)?;
        let end = address as u64 + length as u64;
        let (driver, access) = self.parts()?;

        log::debug!("Erasing 0x{:08X}-0x{:08X}", start, end - 1);
        cb(0);
        let mut sector = start as u64;
        while sector < end {
            let size = driver.sector_size(sector as u32);
            if size == 0 {
                return Err(Error::OutOfRange { address: sector as u32, length });
            }
            log::debug!("Erasing sector at 0x{:08X}", sector);
            if let Err(e) = driver.erase_sector(access, sector as u32) {
                log::error!("Erase failed at 0x{:08X}: {}", sector, e);
                return Err(Error::Erase { address: sector as u32, source: Box::new(e) });
            }
            sector += size as u64;
            cb(sector.saturating_sub(address as u64).min(length as u64) as usize);
        }
        Ok(())
    }

    /// Program `data` at `address`, verifying each page after it is written.
    ///
    /// The area must already be erased.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.program_cb(address, data, |_| {})
    }

    /// Program and verify `data` at `address`, drawing a progress bar.
    pub fn program_progress(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let pb = progress_bar(data.len(), "Writing");
        let result = self.program_cb(address, data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Program and verify `data` at `address` one page at a time.
    ///
    /// Stops at the first page which fails to program or verify.
    /// Calls `cb` with the number of bytes programmed so far.
    pub fn program_cb<F: Fn(usize)>(&mut self, address: u32, data: &[u8], cb: F) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(address, data.len())?;
        self.init()?;
        let (driver, access) = self.parts()?;
        let page_size = driver.page_size().max(1);

        log::trace!("Programming {} bytes to 0x{:08X}, page size {} bytes",
                    data.len(), address, page_size);
        let mut total_bytes = 0;
        cb(total_bytes);
        for page in data.chunks(page_size) {
            let page_address = address + total_bytes as u32;
            log::debug!("Programming {} bytes at 0x{:08X}", page.len(), page_address);
            if let Err(e) = driver.program_page(access, page_address, page) {
                log::error!("Program failed at 0x{:08X}: {}", page_address, e);
                return Err(Error::Program { address: page_address, source: Box::new(e) });
            }
            match driver.verify(access, page_address, page) {
                Ok(true) => (),
                Ok(false) => {
                    log::error!("Verify failed at 0x{:08X}", page_address);
                    return Err(Error::VerifyMismatch { address: page_address });
                },
                Err(e) => {
                    log::error!("Readback failed at 0x{:08X}: {}", page_address, e);
                    return Err(Error::Verify { address: page_address, source: Box::new(e) });
                },
            }
            total_bytes += page.len();
            cb(total_bytes);
        }
        Ok(())
    }

    /// Read `length` bytes of flash starting at `address`.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.read_cb(address, length, |_| {})
    }

    /// Read `length` bytes starting at `address`.
    ///
    /// Neither needs to be word aligned; the surrounding words are read and
    /// trimmed. Calls `cb` with the number of bytes read so far.
    pub fn read_cb<F: Fn(usize)>(&mut self, address: u32, length: usize, cb: F)
        -> Result<Vec<u8>>
    {
        let start = address & !3;
        let end = match (address as u64).checked_add(length as u64) {
            Some(end) if end <= 1 << 32 => (end + 3) & !3,
            _ => return Err(Error::OutOfRange { address, length }),
        };
        let mut data = Vec::with_capacity((end - start as u64) as usize);
        cb(0);
        let mut current = start as u64;
        while current < end {
            let size = (end - current).min(READ_CHUNK as u64) as usize;
            data.extend(self.access.read_memory(current as u32, size)?);
            current += size as u64;
            cb((data.len().saturating_sub((address - start) as usize)).min(length));
        }
        let skip = (address - start) as usize;
        Ok(data[skip..skip + length].to_vec())
    }

    /// Finish programming, relocking the controller.
    pub fn finish(&mut self) -> Result<()> {
        let (driver, access) = self.parts()?;
        log::debug!("Locking flash controller");
        driver.finish(access)?;
        self.initialised = false;
        Ok(())
    }

    /// Current status of the flash controller.
    pub fn status(&mut self) -> Result<FlashStatus> {
        let (driver, access) = self.parts()?;
        driver.status(access)
    }

    fn parts(&mut self) -> Result<(&mut Box<dyn FlashDriver>, &mut A)> {
        match self.driver.as_mut() {
            Some(driver) => Ok((driver, &mut *self.access)),
            None => Err(Error::NoDriver { name: self.device.name.clone() }),
        }
    }

    /// Start of the sector containing `address`, relative to its region's base.
    fn sector_start(&mut self, address: u32) -> Result<u32> {
        let base = self.device.region_containing(address)
                              .map(|r| r.base)
                              .ok_or(Error::OutOfRange { address, length: 0 })?;
        let (driver, _) = self.parts()?;
        let size = driver.sector_size(address);
        if size == 0 {
            return Err(Error::OutOfRange { address, length: 0 });
        }
        Ok(base + ((address - base) / size) * size)
    }

    fn check_range(&self, address: u32, length: usize) -> Result<()> {
        let last = (length as u64).checked_sub(1)
                                  .and_then(|n| (address as u64).checked_add(n))
                                  .filter(|&last| last <= u32::MAX as u64);
        let ok = match last {
            Some(last) => self.device.region_containing(address).is_some()
                          && self.device.region_containing(last as u32).is_some(),
            None => false,
        };
        if ok {
            Ok(())
        } else {
            log::error!("Range 0x{:08X}+{} is outside the flash of {}",
                        address, length, self.device.name);
            Err(Error::OutOfRange { address, length })
        }
    }
}

impl<'a, T: PinTransport> Flash<'a, Dap<T>> {
    /// Pick a driver for `device`, then halt the core ready for programming.
    ///
    /// The core is left running if no driver matches.
    pub fn attach(dap: &'a mut Dap<T>, device: &DeviceDescriptor) -> Result<Self> {
        let driver = match select_driver(device) {
            Some(driver) => driver,
            None => {
                log::warn!("No flash driver matches {}", device.name);
                return Err(Error::NoDriver { name: device.name.clone() });
            },
        };
        log::debug!("Using {} flash driver for {}", driver.name(), device.name);
        dap.halt()?;
        Ok(Flash::with_driver(dap, device, driver))
    }
}

fn progress_bar(length: usize, msg: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template(DATA_PROGRESS_TPL)
        .map(|style| style.progress_chars(DATA_PROGRESS_CHARS))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let pb = ProgressBar::new(length as u64).with_style(style);
    pb.set_message(msg);
    pb
}
