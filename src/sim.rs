//! A simulated target behind a `PinTransport`, for tests.
//!
//! Models a TAP with a 4-bit IR, an ARM JTAG-DP with a single MEM-AP,
//! RAM, the core debug registers and an STM32F1-style flash controller.
//! Faults (WAIT responses, missing ACKs, a stuck BSY flag, corrupted
//! programming) can be injected through the public fields. Accesses to
//! unmapped memory or to a missing AP latch STICKYERR, after which AP
//! transactions are dropped until it is cleared through CTRL/STAT.

use std::collections::HashMap;
use std::convert::TryFrom;
use crate::jtag::{Instruction, TapState};
use crate::transport::{Error, Pin, PinTransport, Result};

const IR_LEN: usize = 4;

const ACK_OK: u64 = 0b010;
const ACK_WAIT: u64 = 0b001;
const ACK_INVALID: u64 = 0b111;

const CDBGPWRUPREQ: u32 = 1 << 28;
const CDBGPWRUPACK: u32 = 1 << 29;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CSYSPWRUPACK: u32 = 1 << 31;
const STICKYERR: u32 = 1 << 5;

pub const AP_IDR: u32 = 0x2477_0011;

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: u32 = 64 * 1024;
pub const FLASH_PAGE: u32 = 1024;

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

const DHCSR: u32 = 0xE000_EDF0;
const AIRCR: u32 = 0xE000_ED0C;

pub struct SimTransport {
    open: bool,
    connected: bool,
    tck: bool,
    tms: bool,
    tdi: bool,
    state: TapState,
    ir: u8,
    ir_shift: u64,
    dr: u64,
    dr_len: usize,
    idcode: u32,
    /// Count of every pin access, to check when the transport is left untouched.
    pub activity: usize,
    pub dp: SimDp,
    pub target: SimTarget,
}

#[derive(Default)]
pub struct SimDp {
    ctrl_stat: u32,
    select: u32,
    csw: u32,
    tar: u32,
    read_result: u32,
    last_ack: u64,
    /// Number of upcoming DPACC/APACC scans to answer with WAIT.
    pub wait_count: usize,
    /// Answer every DPACC/APACC scan with an invalid ACK.
    pub no_ack: bool,
    pub aborts: usize,
    pub select_writes: usize,
}

impl SimTransport {
    pub fn new(idcode: u32) -> Self {
        SimTransport {
            open: false,
            connected: true,
            tck: false,
            tms: false,
            tdi: false,
            state: TapState::TestLogicReset,
            ir: Instruction::IDCODE.into(),
            ir_shift: 0,
            dr: 0,
            dr_len: 1,
            idcode,
            activity: 0,
            dp: SimDp::default(),
            target: SimTarget::new(),
        }
    }

    /// A transport whose TDO line floats high, as with no target attached.
    pub fn disconnected() -> Self {
        SimTransport { connected: false, ..Self::new(0) }
    }

    pub fn tap_state(&self) -> TapState {
        self.state
    }

    fn clock(&mut self) {
        match self.state {
            TapState::CaptureDR => self.capture_dr(),
            TapState::ShiftDR => {
                self.dr = (self.dr >> 1) | ((self.tdi as u64) << (self.dr_len - 1));
            },
            TapState::CaptureIR => self.ir_shift = 0b0001,
            TapState::ShiftIR => {
                self.ir_shift = (self.ir_shift >> 1) | ((self.tdi as u64) << (IR_LEN - 1));
            },
            _ => (),
        }
        self.state = self.state.next(self.tms);
        match self.state {
            TapState::TestLogicReset => self.ir = Instruction::IDCODE.into(),
            TapState::UpdateIR => self.ir = (self.ir_shift & 0xF) as u8,
            TapState::UpdateDR => self.update_dr(),
            _ => (),
        }
    }

    fn capture_dr(&mut self) {
        match Instruction::try_from(self.ir) {
            Ok(Instruction::IDCODE) => {
                self.dr = self.idcode as u64;
                self.dr_len = 32;
            },
            Ok(Instruction::DPACC) | Ok(Instruction::APACC) => {
                let ack = if self.dp.no_ack {
                    ACK_INVALID
                } else if self.dp.wait_count > 0 {
                    self.dp.wait_count -= 1;
                    ACK_WAIT
                } else {
                    ACK_OK
                };
                self.dp.last_ack = ack;
                self.dr = ((self.dp.read_result as u64) << 3) | ack;
                self.dr_len = 35;
            },
            Ok(Instruction::Abort) => {
                self.dr = 0;
                self.dr_len = 35;
            },
            _ => {
                self.dr = 0;
                self.dr_len = 1;
            },
        }
    }

    fn update_dr(&mut self) {
        let ir = Instruction::try_from(self.ir).ok();
        if ir == Some(Instruction::Abort) {
            if (self.dr >> 3) & 1 == 1 {
                self.dp.aborts += 1;
                self.dp.wait_count = 0;
            }
            return;
        }
        if ir != Some(Instruction::DPACC) && ir != Some(Instruction::APACC) {
            return;
        }
        // A request answered with WAIT is discarded by the DP.
        if self.dp.last_ack != ACK_OK {
            return;
        }
        let read = self.dr & 1 == 1;
        let addr = (((self.dr >> 1) & 0b11) << 2) as u32;
        let data = (self.dr >> 3) as u32;
        if ir == Some(Instruction::DPACC) {
            self.dp_access(addr, read, data);
        } else {
            self.ap_access(addr, read, data);
        }
    }

    fn dp_access(&mut self, addr: u32, read: bool, data: u32) {
        match (addr, read) {
            (0x4, true) => self.dp.read_result = self.dp.ctrl_stat,
            (0x4, false) => {
                // STICKYERR is write-one-to-clear.
                let sticky = self.dp.ctrl_stat & STICKYERR & !data;
                let mut ctrl = (data & !(CDBGPWRUPACK | CSYSPWRUPACK | STICKYERR)) | sticky;
                if data & CDBGPWRUPREQ != 0 {
                    ctrl |= CDBGPWRUPACK;
                }
                if data & CSYSPWRUPREQ != 0 {
                    ctrl |= CSYSPWRUPACK;
                }
                self.dp.ctrl_stat = ctrl;
            },
            (0x8, false) => {
                self.dp.select = data;
                self.dp.select_writes += 1;
            },
            // RDBUFF returns the previous result again.
            _ => (),
        }
    }

    fn ap_access(&mut self, addr: u32, read: bool, data: u32) {
        let apsel = self.dp.select >> 24;
        let reg = (self.dp.select & 0xF0) | addr;
        if self.dp.ctrl_stat & STICKYERR != 0 {
            return;
        }
        if apsel != 0 {
            self.dp.ctrl_stat |= STICKYERR;
            return;
        }
        let size = self.dp.csw & 0b111;
        match (reg, read) {
            (0x0C, _) if !SimTarget::is_mapped(self.dp.tar) => self.dp.ctrl_stat |= STICKYERR,
            (0x00, true) => self.dp.read_result = self.dp.csw,
            (0x00, false) => self.dp.csw = data,
            (0x04, true) => self.dp.read_result = self.dp.tar,
            (0x04, false) => self.dp.tar = data,
            (0x0C, true) => self.dp.read_result = self.target.read(self.dp.tar),
            (0x0C, false) => self.target.write(self.dp.tar, size, data),
            (0xFC, true) => self.dp.read_result = AP_IDR,
            _ => (),
        }
    }
}

impl PinTransport for SimTransport {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn set_pin(&mut self, pin: Pin, value: bool) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        self.activity += 1;
        match pin {
            Pin::TCK => {
                let rising = !self.tck && value;
                self.tck = value;
                if rising && self.connected {
                    self.clock();
                }
            },
            Pin::TMS => self.tms = value,
            Pin::TDI => self.tdi = value,
            Pin::TRST => if !value {
                self.state = TapState::TestLogicReset;
                self.ir = Instruction::IDCODE.into();
            },
            Pin::SRST => if !value {
                self.target.resets += 1;
            },
            Pin::TDO => return Err(Error::UnsupportedPin(pin)),
        }
        Ok(())
    }

    fn get_pin(&mut self, pin: Pin) -> Result<bool> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        self.activity += 1;
        if pin != Pin::TDO {
            return Err(Error::UnsupportedPin(pin));
        }
        if !self.connected {
            return Ok(true);
        }
        Ok(match self.state {
            TapState::ShiftDR => self.dr & 1 == 1,
            TapState::ShiftIR => self.ir_shift & 1 == 1,
            _ => false,
        })
    }

    fn delay(&mut self, _us: u32) {}
}

/// The memory system behind the simulated MEM-AP.
pub struct SimTarget {
    words: HashMap<u32, u32>,
    flash_cr: u32,
    flash_sr: u32,
    flash_ar: u32,
    key_state: u8,
    dhcsr: u32,
    /// Keep the flash controller's BSY flag set forever.
    pub stuck_busy: bool,
    /// Flip bit 0 of the half-word programmed at this address.
    pub corrupt_at: Option<u32>,
    pub resets: usize,
    pub erased_pages: Vec<u32>,
    pub halfword_writes: usize,
}

impl SimTarget {
    fn new() -> Self {
        SimTarget {
            words: HashMap::new(),
            flash_cr: CR_LOCK,
            flash_sr: 0,
            flash_ar: 0,
            key_state: 0,
            dhcsr: 0,
            stuck_busy: false,
            corrupt_at: None,
            resets: 0,
            erased_pages: Vec::new(),
            halfword_writes: 0,
        }
    }

    /// Code and SRAM, peripherals, and the system region respond; the rest faults.
    fn is_mapped(addr: u32) -> bool {
        addr < 0x3000_0000 || (0x4000_0000..0x6000_0000).contains(&addr) || addr >= 0xE000_0000
    }

    fn in_flash(addr: u32) -> bool {
        (FLASH_BASE..FLASH_BASE + FLASH_SIZE).contains(&addr)
    }

    /// Read the aligned word containing `addr`, bypassing peripherals.
    pub fn peek(&self, addr: u32) -> u32 {
        let addr = addr & !3;
        match self.words.get(&addr) {
            Some(word) => *word,
            None if Self::in_flash(addr) => 0xFFFF_FFFF,
            None => 0,
        }
    }

    /// Write an aligned word, bypassing peripherals and flash rules.
    pub fn poke(&mut self, addr: u32, value: u32) {
        self.words.insert(addr & !3, value);
    }

    pub fn is_locked(&self) -> bool {
        self.flash_cr & CR_LOCK != 0
    }

    pub fn is_halted(&self) -> bool {
        self.dhcsr & 0b11 == 0b11
    }

    fn read(&mut self, addr: u32) -> u32 {
        match addr & !3 {
            FLASH_SR => {
                let busy = if self.stuck_busy { SR_BSY } else { 0 };
                self.flash_sr | busy
            },
            FLASH_CR => self.flash_cr,
            FLASH_AR => self.flash_ar,
            FLASH_KEYR => 0,
            // S_HALT mirrors C_HALT, S_REGRDY always set.
            DHCSR => {
                let s_halt = if self.is_halted() { 1 << 17 } else { 0 };
                self.dhcsr | s_halt | 1 << 16
            },
            aligned => self.peek(aligned),
        }
    }

    fn write(&mut self, addr: u32, size: u32, value: u32) {
        match addr & !3 {
            FLASH_KEYR => self.write_key(value),
            FLASH_SR => self.flash_sr &= !(value & (SR_PGERR | SR_WRPRTERR | SR_EOP)),
            FLASH_CR => self.write_cr(value),
            FLASH_AR => self.flash_ar = value,
            DHCSR => if value >> 16 == 0xA05F {
                self.dhcsr = value & 0xFFFF;
            },
            AIRCR => if value >> 16 == 0x05FA {
                self.resets += 1;
            },
            _ if Self::in_flash(addr) => self.write_flash(addr, size, value),
            aligned => {
                let mask = lane_mask(addr, size);
                let word = (self.peek(aligned) & !mask) | (value & mask);
                self.poke(aligned, word);
            },
        }
    }

    fn write_key(&mut self, value: u32) {
        if value == KEY1 {
            self.key_state = 1;
        } else if value == KEY2 && self.key_state == 1 {
            self.flash_cr &= !CR_LOCK;
            self.key_state = 0;
        } else {
            self.key_state = 0;
        }
    }

    fn write_cr(&mut self, value: u32) {
        if self.is_locked() {
            return;
        }
        if value & CR_LOCK != 0 {
            self.flash_cr = CR_LOCK;
            return;
        }
        self.flash_cr = value & !CR_STRT;
        if value & (CR_PER | CR_STRT) == CR_PER | CR_STRT {
            let page = self.flash_ar & !(FLASH_PAGE - 1);
            for addr in (page..page + FLASH_PAGE).step_by(4) {
                self.words.remove(&addr);
            }
            self.erased_pages.push(page);
            self.flash_sr |= SR_EOP;
        }
    }

    fn write_flash(&mut self, addr: u32, size: u32, value: u32) {
        // Only half-word writes with PG set may program flash.
        if size != 1 || self.flash_cr & CR_PG == 0 {
            self.flash_sr |= SR_PGERR;
            return;
        }
        let shift = (addr & 2) * 8;
        let mut half = (value >> shift) & 0xFFFF;
        let current = (self.peek(addr) >> shift) & 0xFFFF;
        if current != 0xFFFF && half != 0 {
            self.flash_sr |= SR_PGERR;
            return;
        }
        if self.corrupt_at == Some(addr) {
            half ^= 1;
        }
        let word = (self.peek(addr) & !(0xFFFF << shift)) | (half << shift);
        self.poke(addr, word);
        self.halfword_writes += 1;
        self.flash_sr |= SR_EOP;
    }
}

fn lane_mask(addr: u32, size: u32) -> u32 {
    match size {
        0 => 0xFF << ((addr & 3) * 8),
        1 => 0xFFFF << ((addr & 2) * 8),
        _ => 0xFFFF_FFFF,
    }
}
