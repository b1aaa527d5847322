//! Flash driver for the STM32F1 family and compatible parts.
//!
//! Flash is erased in pages (the region's sector size) and programmed one
//! half-word at a time while CR.PG is set.

use crate::dap::MemoryAccess;
use crate::device::{DeviceDescriptor, FlashRegion};
use super::{Error, FlashDriver, FlashStatus, Result};

/// Lower-case device name fragments handled by this driver.
pub const PATTERNS: &[&str] = &[
    "stm32f101", "stm32f102", "stm32f103", "stm32f105", "stm32f107", "gd32f10",
];

/// Default number of status register reads before giving up on BSY.
pub const DEFAULT_POLL_LIMIT: usize = 10_000;

const PAGE_SIZE: usize = 1024;
const DEFAULT_SECTOR_SIZE: u32 = 1024;

const FLASH_KEYR: u32 = 0x4002_2004;
const FLASH_SR: u32 = 0x4002_200C;
const FLASH_CR: u32 = 0x4002_2010;
const FLASH_AR: u32 = 0x4002_2014;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;

fn decode_status(sr: u32) -> FlashStatus {
    FlashStatus {
        busy: sr & SR_BSY != 0,
        error: sr & (SR_PGERR | SR_WRPRTERR) != 0,
        eop: sr & SR_EOP != 0,
    }
}

pub struct Stm32f1 {
    regions: Vec<FlashRegion>,
    poll_limit: usize,
}

impl Stm32f1 {
    pub fn new(device: &DeviceDescriptor) -> Self {
        Stm32f1 { regions: device.flash_regions.clone(), poll_limit: DEFAULT_POLL_LIMIT }
    }

    /// Set the number of status reads allowed per operation.
    pub fn with_poll_limit(mut self, poll_limit: usize) -> Self {
        self.poll_limit = poll_limit;
        self
    }

    /// Poll SR until BSY clears, reporting any latched error against `address`.
    fn wait_ready(&self, access: &mut dyn MemoryAccess, address: u32) -> Result<()> {
        for _ in 0..self.poll_limit {
            let sr = access.read_word(FLASH_SR)?;
            let status = decode_status(sr);
            if !status.busy {
                if status.error {
                    log::error!("Flash controller error at 0x{:08X}, SR=0x{:08X}", address, sr);
                    return Err(Error::Controller { address, status: sr });
                }
                return Ok(());
            }
        }
        log::error!("Flash controller busy for {} polls at 0x{:08X}", self.poll_limit, address);
        Err(Error::Timeout { address })
    }

    fn write_cr(&self, access: &mut dyn MemoryAccess, value: u32) -> Result<()> {
        log::trace!("FLASH_CR <- 0x{:08X}", value);
        access.write_word(FLASH_CR, value)?;
        Ok(())
    }
}

impl FlashDriver for Stm32f1 {
    fn name(&self) -> &str {
        "stm32f1"
    }

    /// Unlock the controller and clear any stale status flags.
    fn init(&mut self, access: &mut dyn MemoryAccess) -> Result<()> {
        // Writing keys to an unlocked controller locks it until reset.
        if access.read_word(FLASH_CR)? & CR_LOCK != 0 {
            log::debug!("Unlocking flash controller");
            access.write_word(FLASH_KEYR, KEY1)?;
            access.write_word(FLASH_KEYR, KEY2)?;
        }
        access.write_word(FLASH_SR, SR_PGERR | SR_WRPRTERR | SR_EOP)?;
        Ok(())
    }

    fn status(&mut self, access: &mut dyn MemoryAccess) -> Result<FlashStatus> {
        Ok(decode_status(access.read_word(FLASH_SR)?))
    }

    fn erase_sector(&mut self, access: &mut dyn MemoryAccess, address: u32) -> Result<()> {
        self.wait_ready(access, address)?;
        access.write_word(FLASH_AR, address)?;
        self.write_cr(access, CR_PER)?;
        self.write_cr(access, CR_PER | CR_STRT)?;
        self.wait_ready(access, address)?;
        self.write_cr(access, 0)
    }

    fn program_page(&mut self, access: &mut dyn MemoryAccess, address: u32, data: &[u8])
        -> Result<()>
    {
        self.wait_ready(access, address)?;
        self.write_cr(access, CR_PG)?;
        for (idx, pair) in data.chunks(2).enumerate() {
            // An odd trailing byte leaves the upper byte erased.
            let half = u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0xFF)]);
            let half_address = address + 2 * idx as u32;
            access.write_half_word(half_address, half)?;
            self.wait_ready(access, half_address)?;
        }
        self.write_cr(access, 0)
    }

    fn verify(&mut self, access: &mut dyn MemoryAccess, address: u32, data: &[u8])
        -> Result<bool>
    {
        let start = address & !3;
        let end = (address as usize + data.len() + 3) & !3;
        let readback = access.read_memory(start, end - start as usize)?;
        let offset = (address - start) as usize;
        Ok(&readback[offset..offset + data.len()] == data)
    }

    fn sector_size(&self, address: u32) -> u32 {
        self.regions.iter()
                    .find(|r| r.contains(address))
                    .map(|r| r.sector_size)
                    .unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn finish(&mut self, access: &mut dyn MemoryAccess) -> Result<()> {
        self.write_cr(access, CR_LOCK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::Dap;
    use crate::device::DeviceCatalog;
    use crate::flash::Flash;
    use crate::jtag::Tap;
    use crate::sim::SimTransport;

    const BASE: u32 = 0x0800_0000;

    fn dap() -> Dap<SimTransport> {
        let mut dap = Dap::new(Tap::new(SimTransport::new(0x1BA0_1477)).unwrap());
        dap.power_up().unwrap();
        dap
    }

    fn device() -> DeviceDescriptor {
        DeviceCatalog::builtin().find_by_name("STM32F103C8").unwrap().clone()
    }

    #[test]
    fn test_erase_program_verify() {
        let mut dap = dap();
        let device = device();
        let data: Vec<u8> = (0..2501u32).map(|x| (x * 7 + 3) as u8).collect();
        {
            let mut flash = Flash::new(&mut dap, &device);
            flash.detect().unwrap();
            flash.erase(BASE, data.len()).unwrap();
            flash.program(BASE, &data).unwrap();
            assert_eq!(flash.read(BASE, data.len()).unwrap(), data);
            assert!(!flash.status().unwrap().busy);
            flash.finish().unwrap();
        }
        let target = &dap.transport().target;
        assert_eq!(target.erased_pages, vec![BASE, BASE + 0x400, BASE + 0x800]);
        assert_eq!(target.halfword_writes, 1251);
        // The padding byte after the odd tail stays erased.
        assert_eq!(target.peek(BASE + 2500) & 0xFF00, 0xFF00);
        assert!(target.is_locked());
    }

    #[test]
    fn test_stuck_busy_times_out() {
        let mut dap = dap();
        dap.transport_mut().target.stuck_busy = true;
        let device = device();
        let driver = Stm32f1::new(&device).with_poll_limit(20);
        let mut flash = Flash::with_driver(&mut dap, &device, Box::new(driver));
        match flash.erase(BASE + 0x400, 1024) {
            Err(Error::Erase { address, source }) => {
                assert_eq!(address, BASE + 0x400);
                assert!(matches!(*source, Error::Timeout { address: 0x0800_0400 }));
            },
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_corruption_is_verify_mismatch() {
        let mut dap = dap();
        dap.transport_mut().target.corrupt_at = Some(BASE + 0x402);
        let device = device();
        let mut flash = Flash::new(&mut dap, &device);
        flash.detect().unwrap();
        flash.erase(BASE, 2048).unwrap();
        let result = flash.program(BASE, &[0x55; 2048]);
        assert!(matches!(result, Err(Error::VerifyMismatch { address: 0x0800_0400 })));
    }

    #[test]
    fn test_program_without_erase_fails() {
        let mut dap = dap();
        dap.transport_mut().target.poke(BASE, 0x1234_5678);
        let device = device();
        let mut flash = Flash::new(&mut dap, &device);
        flash.detect().unwrap();
        match flash.program(BASE, &[0xAA; 16]) {
            Err(Error::Program { address, source }) => {
                assert_eq!(address, BASE);
                assert!(matches!(*source, Error::Controller { address: 0x0800_0000, .. }));
            },
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_attach_halts_only_with_driver() {
        let mut dap = dap();
        let catalog = DeviceCatalog::builtin();
        let lpc = catalog.find_by_name("LPC1768").unwrap();
        assert!(matches!(Flash::attach(&mut dap, lpc), Err(Error::NoDriver { .. })));
        assert!(!dap.transport().target.is_halted());
        let device = device();
        let flash = Flash::attach(&mut dap, &device).unwrap();
        assert_eq!(flash.device().name, "STM32F103C8");
        assert!(dap.transport().target.is_halted());
    }

    #[test]
    fn test_sector_size_from_regions() {
        let catalog = DeviceCatalog::builtin();
        let f407 = Stm32f1::new(catalog.find_by_name("STM32F407VG").unwrap());
        assert_eq!(f407.sector_size(0x0800_4000), 16 * 1024);
        assert_eq!(f407.sector_size(0x2000_0000), DEFAULT_SECTOR_SIZE);
        assert_eq!(Stm32f1::new(&device()).page_size(), 1024);
    }

    #[test]
    fn test_decode_status() {
        assert_eq!(decode_status(0x01), FlashStatus { busy: true, error: false, eop: false });
        assert_eq!(decode_status(0x14), FlashStatus { busy: false, error: true, eop: false });
        assert_eq!(decode_status(0x20), FlashStatus { busy: false, error: false, eop: true });
    }
}
