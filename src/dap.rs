//! The DAP module implements ARM ADIv5 debug port access through a JTAG-DP,
//! reaching target memory through a MEM-AP and the core's fixed debug
//! registers through that memory.
//!
//! Each DPACC/APACC scan is 35 bits wide. On the way in it carries RnW in
//! bit 0, A[3:2] in bits 1-2 and the data word in bits 3-34. On the way out
//! it carries a 3-bit acknowledgement and the result of the *previous*
//! transaction, so reads are completed by a following read of DP RDBUFF.

use thiserror::Error;
use num_enum::IntoPrimitive;
use crate::bitvec::{BitVec, Error as BitVecError};
use crate::jtag::{Tap, Instruction, Error as JTAGError};
use crate::transport::PinTransport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JTAG error")]
    JTAG(#[from] JTAGError),
    #[error("Bit vector error")]
    BitVec(#[from] BitVecError),
    #[error("Unexpected acknowledgement 0b{ack:03b} from debug port.")]
    Protocol { ack: u8 },
    #[error("Debug port still responding WAIT after {retries} retries.")]
    WaitTimeout { retries: usize },
    #[error("Access of {length} bytes at 0x{address:08X} is not aligned.")]
    Alignment { address: u32, length: usize },
    #[error("Access of {length} bytes at 0x{address:08X} runs past the end of the address space.")]
    AddressRange { address: u32, length: usize },
    #[error("Bus fault during access of {length} bytes at 0x{address:08X}.")]
    Fault { address: u32, length: usize },
    #[error("Debug power-up request was not acknowledged.")]
    PowerUp,
}

pub type Result<T> = std::result::Result<T, Error>;

const ACK_OK: u8 = 0b010;
const ACK_WAIT: u8 = 0b001;

/// Number of times a WAIT response is retried before aborting.
pub const DEFAULT_RETRIES: usize = 32;

const POWER_UP_POLLS: usize = 100;

const CDBGPWRUPREQ: u32 = 1 << 28;
const CDBGPWRUPACK: u32 = 1 << 29;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CSYSPWRUPACK: u32 = 1 << 31;
const STICKYERR: u32 = 1 << 5;

const DAPABORT: u32 = 1 << 0;

/// CSW with DbgSwEnable, HPROT data access, no auto-increment.
const CSW_BASE: u32 = 0x2300_0000;
const CSW_SIZE_HALF: u32 = 1;
const CSW_SIZE_WORD: u32 = 2;

const DHCSR: u32 = 0xE000_EDF0;
const DHCSR_HALT: u32 = 0xA05F_0003;
const DHCSR_RUN: u32 = 0xA05F_0001;
const DHCSR_S_HALT: u32 = 1 << 17;
const AIRCR: u32 = 0xE000_ED0C;
const AIRCR_SYSRESETREQ: u32 = 0x05FA_0004;

#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[repr(u8)]
enum DPRegister {
    Abort       = 0x0,
    CtrlStat    = 0x4,
    Select      = 0x8,
    RdBuff      = 0xC,
}

#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[repr(u8)]
enum APRegister {
    CSW         = 0x00,
    TAR         = 0x04,
    DRW         = 0x0C,
    IDR         = 0xFC,
}

/// Word-level access to target memory.
///
/// Implemented by `Dap` and consumed by flash drivers, which never see the
/// JTAG layer directly.
pub trait MemoryAccess {
    /// Read `length` bytes from `address`. Both must be multiples of 4.
    fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>>;

    /// Write `data` to `address`. Both address and length must be multiples of 4.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Write a single 16-bit half-word at a 2-byte aligned `address`.
    fn write_half_word(&mut self, address: u32, value: u16) -> Result<()>;

    fn read_word(&mut self, address: u32) -> Result<u32> {
        let bytes = self.read_memory(address, 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[..4]);
        Ok(u32::from_le_bytes(word))
    }

    fn write_word(&mut self, address: u32, value: u32) -> Result<()> {
        self.write_memory(address, &value.to_le_bytes())
    }
}

/// An ARM JTAG-DP reached through a single TAP.
///
/// Caches the loaded instruction and the last SELECT, CSW and TAR values
/// so repeated accesses skip redundant scans. The caches are dropped
/// whenever a transfer fails.
pub struct Dap<T: PinTransport> {
    tap: Tap<T>,
    ap: u8,
    ir: Option<Instruction>,
    select: Option<u32>,
    csw: Option<u32>,
    tar: Option<u32>,
    retries: usize,
}

impl<T: PinTransport> Dap<T> {
    pub fn new(tap: Tap<T>) -> Self {
        Dap { tap, ap: 0, ir: None, select: None, csw: None, tar: None, retries: DEFAULT_RETRIES }
    }

    /// Set how many WAIT responses are retried before giving up.
    pub fn set_retries(&mut self, retries: usize) {
        self.retries = retries;
    }

    pub fn transport(&self) -> &T {
        self.tap.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.tap.transport_mut()
    }

    /// Request debug and system power-up and wait for both acknowledgements.
    pub fn power_up(&mut self) -> Result<()> {
        log::debug!("Requesting debug power-up");
        self.dp_write(DPRegister::CtrlStat, CDBGPWRUPREQ | CSYSPWRUPREQ)?;
        for _ in 0..POWER_UP_POLLS {
            let stat = self.dp_read(DPRegister::CtrlStat)?;
            log::trace!("CTRL/STAT: 0x{:08X}", stat);
            if stat & (CDBGPWRUPACK | CSYSPWRUPACK) == CDBGPWRUPACK | CSYSPWRUPACK {
                return Ok(());
            }
        }
        log::error!("Debug power-up not acknowledged");
        Err(Error::PowerUp)
    }

    /// Write SELECT to choose access port `ap` and the bank holding `register`.
    pub fn select_ap(&mut self, ap: u8, register: u32) -> Result<()> {
        let select = ((ap as u32) << 24) | (register & 0xF0);
        log::trace!("Selecting AP {} bank 0x{:02X}", ap, register & 0xF0);
        self.dp_write(DPRegister::Select, select)?;
        self.ap = ap;
        self.select = Some(select);
        self.csw = None;
        self.tar = None;
        Ok(())
    }

    /// Perform one 32-bit transfer through the selected MEM-AP at memory `address`.
    ///
    /// Writes send `*data`; reads store the result in `*data`.
    pub fn ap_transfer(&mut self, address: u32, write: bool, data: &mut u32) -> Result<()> {
        self.set_csw(CSW_SIZE_WORD)?;
        self.set_tar(address)?;
        if write {
            self.ap_write(APRegister::DRW, *data)
        } else {
            *data = self.ap_read(APRegister::DRW)?;
            Ok(())
        }
    }

    /// Read the identification register of the selected access port.
    pub fn read_ap_idr(&mut self) -> Result<u32> {
        self.ap_read(APRegister::IDR)
    }

    /// Halt the core through DHCSR.
    pub fn halt(&mut self) -> Result<()> {
        log::debug!("Halting core");
        self.write_word(DHCSR, DHCSR_HALT)
    }

    /// Resume the core, leaving debug enabled.
    pub fn resume(&mut self) -> Result<()> {
        log::debug!("Resuming core");
        self.write_word(DHCSR, DHCSR_RUN)
    }

    /// Request a system reset through AIRCR.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Requesting system reset");
        self.write_word(AIRCR, AIRCR_SYSRESETREQ)
    }

    pub fn is_halted(&mut self) -> Result<bool> {
        Ok(self.read_word(DHCSR)? & DHCSR_S_HALT != 0)
    }

    /// Check CTRL/STAT for a bus fault latched since the last check.
    ///
    /// The DP drops every AP transaction while STICKYERR is set, so it is
    /// cleared here before reporting the fault against `address`.
    fn check_fault(&mut self, address: u32, length: usize) -> Result<()> {
        let stat = self.dp_read(DPRegister::CtrlStat)?;
        if stat & STICKYERR == 0 {
            return Ok(());
        }
        log::error!("Bus fault accessing {} bytes at 0x{:08X}, CTRL/STAT=0x{:08X}",
                    length, address, stat);
        self.dp_write(DPRegister::CtrlStat, CDBGPWRUPREQ | CSYSPWRUPREQ | STICKYERR)?;
        self.invalidate();
        Err(Error::Fault { address, length })
    }

    fn invalidate(&mut self) {
        self.ir = None;
        self.select = None;
        self.csw = None;
        self.tar = None;
    }

    fn set_instruction(&mut self, instruction: Instruction) -> Result<()> {
        if self.ir != Some(instruction) {
            let ir = self.tap.instruction(instruction);
            self.tap.shift_instruction(&ir)?;
            self.ir = Some(instruction);
        }
        Ok(())
    }

    /// Run one 35-bit DPACC/APACC scan, retrying while the DP answers WAIT.
    ///
    /// Returns the data field of the response, which belongs to the previous
    /// transaction.
    fn scan(&mut self, instruction: Instruction, address: u8, read: bool, value: u32)
        -> Result<u32>
    {
        let result = self.scan_inner(instruction, address, read, value);
        if result.is_err() {
            self.invalidate();
        }
        result
    }

    fn scan_inner(&mut self, instruction: Instruction, address: u8, read: bool, value: u32)
        -> Result<u32>
    {
        self.set_instruction(instruction)?;
        let request = ((value as u64) << 3) | ((((address >> 2) & 0b11) as u64) << 1) | read as u64;
        let request = BitVec::from_u64(request, 35);
        for attempt in 0..=self.retries {
            let response = self.tap.shift_data(Some(&request), 35)?.word(35)?;
            let ack = (response & 0b111) as u8;
            let data = (response >> 3) as u32;
            match ack {
                ACK_OK => {
                    log::trace!("{:?} A=0x{:X} {} 0x{:08X} -> 0x{:08X}",
                                instruction, address, if read { "R" } else { "W" }, value, data);
                    return Ok(data);
                },
                ACK_WAIT => {
                    if attempt == 0 {
                        log::warn!("Debug port responded WAIT, retrying");
                    }
                },
                ack => {
                    log::error!("Unexpected ACK 0b{:03b} for {:?} A=0x{:X}", ack, instruction, address);
                    return Err(Error::Protocol { ack });
                },
            }
        }
        log::error!("Debug port stuck in WAIT, aborting transaction");
        self.abort()?;
        Err(Error::WaitTimeout { retries: self.retries })
    }

    /// Issue a DAPABORT to cancel a stalled transaction.
    fn abort(&mut self) -> Result<()> {
        self.set_instruction(Instruction::Abort)?;
        let request = (DAPABORT as u64) << 3 | ((u8::from(DPRegister::Abort) >> 2) as u64) << 1;
        self.tap.shift_data(Some(&BitVec::from_u64(request, 35)), 35)?;
        self.invalidate();
        Ok(())
    }

    fn dp_read(&mut self, register: DPRegister) -> Result<u32> {
        self.scan(Instruction::DPACC, register.into(), true, 0)?;
        self.scan(Instruction::DPACC, DPRegister::RdBuff.into(), true, 0)
    }

    fn dp_write(&mut self, register: DPRegister, value: u32) -> Result<()> {
        self.scan(Instruction::DPACC, register.into(), false, value)?;
        Ok(())
    }

    fn set_bank(&mut self, register: APRegister) -> Result<()> {
        let select = ((self.ap as u32) << 24) | (u8::from(register) as u32 & 0xF0);
        if self.select != Some(select) {
            self.dp_write(DPRegister::Select, select)?;
            self.select = Some(select);
        }
        Ok(())
    }

    fn ap_read(&mut self, register: APRegister) -> Result<u32> {
        self.set_bank(register)?;
        self.scan(Instruction::APACC, u8::from(register) & 0xC, true, 0)?;
        self.scan(Instruction::DPACC, DPRegister::RdBuff.into(), true, 0)
    }

    fn ap_write(&mut self, register: APRegister, value: u32) -> Result<()> {
        self.set_bank(register)?;
        self.scan(Instruction::APACC, u8::from(register) & 0xC, false, value)?;
        Ok(())
    }

    fn set_csw(&mut self, size: u32) -> Result<()> {
        let csw = CSW_BASE | size;
        if self.csw != Some(csw) {
            self.ap_write(APRegister::CSW, csw)?;
            self.csw = Some(csw);
        }
        Ok(())
    }

    fn set_tar(&mut self, address: u32) -> Result<()> {
        if self.tar != Some(address) {
            self.ap_write(APRegister::TAR, address)?;
            self.tar = Some(address);
        }
        Ok(())
    }
}

impl<T: PinTransport> MemoryAccess for Dap<T> {
    fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        check_access(address, length)?;
        log::trace!("Reading {} bytes from 0x{:08X}", length, address);
        let mut data = Vec::with_capacity(length);
        for offset in (0..length).step_by(4) {
            let mut word = 0;
            self.ap_transfer(address + offset as u32, false, &mut word)?;
            data.extend_from_slice(&word.to_le_bytes());
        }
        self.check_fault(address, length)?;
        Ok(data)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_access(address, data.len())?;
        log::trace!("Writing {} bytes to 0x{:08X}", data.len(), address);
        for (idx, chunk) in data.chunks_exact(4).enumerate() {
            let mut word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.ap_transfer(address + 4 * idx as u32, true, &mut word)?;
        }
        self.check_fault(address, data.len())
    }

    fn write_half_word(&mut self, address: u32, value: u16) -> Result<()> {
        if address % 2 != 0 {
            return Err(Error::Alignment { address, length: 2 });
        }
        self.set_csw(CSW_SIZE_HALF)?;
        self.set_tar(address)?;
        // Half-words travel on the byte lanes matching their address.
        self.ap_write(APRegister::DRW, (value as u32) << ((address & 2) * 8))?;
        self.check_fault(address, 2)
    }
}

/// Word-aligned accesses which stay inside the 32-bit address space.
fn check_access(address: u32, length: usize) -> Result<()> {
    if address % 4 != 0 || length % 4 != 0 {
        return Err(Error::Alignment { address, length });
    }
    match (address as u64).checked_add(length as u64) {
        Some(end) if end <= 1 << 32 => Ok(()),
        _ => Err(Error::AddressRange { address, length }),
    }
}
