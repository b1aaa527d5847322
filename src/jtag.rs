//! The JTAG module drives an IEEE 1149.1 TAP by bit-banging a `PinTransport`.
//!
//! Every public operation starts and ends in Run-Test/Idle.

use std::time::Duration;
use thiserror::Error;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::bitvec::{BitVec, Error as BitVecError};
use crate::transport::{Pin, PinTransport, Error as TransportError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error")]
    Transport(#[from] TransportError),
    #[error("Bit vector error")]
    BitVec(#[from] BitVecError),
    #[error("No device responding on the JTAG link (read IDCODE 0x{idcode:08X}).")]
    NoDevice { idcode: u32 },
    #[error("Invalid shift length {len}: must be at least 1 and no longer than the data.")]
    InvalidLength { len: usize },
    #[error("Invalid IR length {len}: must be between 4 and 64 bits.")]
    InvalidIrLength { len: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Instructions understood by an ARM JTAG-DP TAP.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    Abort   = 0x8,
    DPACC   = 0xA,
    APACC   = 0xB,
    IDCODE  = 0xE,
    Bypass  = 0xF,
}

/// Default instruction register length of an ARM JTAG-DP.
pub const DEFAULT_IR_LENGTH: usize = 4;

/// Longest instruction register supported.
pub const MAX_IR_LENGTH: usize = 64;

/// The sixteen states of the TAP controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDRScan,
    CaptureDR,
    ShiftDR,
    Exit1DR,
    PauseDR,
    Exit2DR,
    UpdateDR,
    SelectIRScan,
    CaptureIR,
    ShiftIR,
    Exit1IR,
    PauseIR,
    Exit2IR,
    UpdateIR,
}

impl TapState {
    /// State entered on the next rising TCK edge with the given TMS level.
    pub fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, false) => RunTestIdle,
            (TestLogicReset, true)  => TestLogicReset,
            (RunTestIdle, false)    => RunTestIdle,
            (RunTestIdle, true)     => SelectDRScan,
            (SelectDRScan, false)   => CaptureDR,
            (SelectDRScan, true)    => SelectIRScan,
            (CaptureDR, false)      => ShiftDR,
            (CaptureDR, true)       => Exit1DR,
            (ShiftDR, false)        => ShiftDR,
            (ShiftDR, true)         => Exit1DR,
            (Exit1DR, false)        => PauseDR,
            (Exit1DR, true)         => UpdateDR,
            (PauseDR, false)        => PauseDR,
            (PauseDR, true)         => Exit2DR,
            (Exit2DR, false)        => ShiftDR,
            (Exit2DR, true)         => UpdateDR,
            (UpdateDR, false)       => RunTestIdle,
            (UpdateDR, true)        => SelectDRScan,
            (SelectIRScan, false)   => CaptureIR,
            (SelectIRScan, true)    => TestLogicReset,
            (CaptureIR, false)      => ShiftIR,
            (CaptureIR, true)       => Exit1IR,
            (ShiftIR, false)        => ShiftIR,
            (ShiftIR, true)         => Exit1IR,
            (Exit1IR, false)        => PauseIR,
            (Exit1IR, true)         => UpdateIR,
            (PauseIR, false)        => PauseIR,
            (PauseIR, true)         => Exit2IR,
            (Exit2IR, false)        => ShiftIR,
            (Exit2IR, true)         => UpdateIR,
            (UpdateIR, false)       => RunTestIdle,
            (UpdateIR, true)        => SelectDRScan,
        }
    }
}

/// A single TAP controller reached through a bit-banged transport.
pub struct Tap<T: PinTransport> {
    transport: T,
    state: TapState,
    ir_length: usize,
    half_period_us: u32,
}

impl<T: PinTransport> Tap<T> {
    /// Open `transport` and bring the TAP to Run-Test/Idle.
    pub fn new(mut transport: T) -> Result<Tap<T>> {
        transport.open()?;
        let mut tap = Tap {
            transport,
            state: TapState::TestLogicReset,
            ir_length: DEFAULT_IR_LENGTH,
            half_period_us: 0,
        };
        tap.reset()?;
        Ok(tap)
    }

    /// Set the TCK frequency in kHz. Frequencies above 500kHz run unthrottled.
    pub fn set_clock(&mut self, khz: u32) {
        self.half_period_us = if khz == 0 { 0 } else { 500 / khz };
        log::debug!("Setting TCK to {}kHz, half period {}us", khz, self.half_period_us);
    }

    /// Set the instruction register length used by `instruction()`.
    ///
    /// The length must hold a 4-bit ARM instruction and fit in 64 bits.
    pub fn set_ir_length(&mut self, ir_length: usize) -> Result<()> {
        if !(DEFAULT_IR_LENGTH..=MAX_IR_LENGTH).contains(&ir_length) {
            return Err(Error::InvalidIrLength { len: ir_length });
        }
        self.ir_length = ir_length;
        Ok(())
    }

    pub fn ir_length(&self) -> usize {
        self.ir_length
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Build the bits of `instruction` at this TAP's IR length.
    pub fn instruction(&self, instruction: Instruction) -> BitVec {
        BitVec::from_u64(u8::from(instruction) as u64, self.ir_length)
    }

    /// Force Test-Logic-Reset with five TMS=1 clocks, then enter Run-Test/Idle.
    ///
    /// Works from any state. Any loaded instruction is replaced by IDCODE.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting TAP");
        self.sequence()
            .mode(5, true)      // Test-Logic-Reset
            .mode(1, false)     // Run-Test/Idle
            .execute()?;
        self.state = TapState::RunTestIdle;
        Ok(())
    }

    /// Shift `bits` into the instruction register.
    pub fn shift_instruction(&mut self, bits: &BitVec) -> Result<()> {
        if bits.is_empty() {
            return Err(Error::InvalidLength { len: 0 });
        }
        log::trace!("Shift IR {:02X?} ({} bits)", bits.as_bytes(), bits.len());
        self.sequence()
            .mode(2, true)      // Select-DR-Scan, Select-IR-Scan
            .mode(2, false)     // Capture-IR, Shift-IR
            .shift(Some(bits), bits.len(), false)   // ... Exit1-IR
            .mode(1, true)      // Update-IR
            .mode(1, false)     // Run-Test/Idle
            .execute()?;
        Ok(())
    }

    /// Shift `len` bits through the data register, returning the captured TDO bits.
    ///
    /// If `bits` is None, TDI is held low.
    pub fn shift_data(&mut self, bits: Option<&BitVec>, len: usize) -> Result<BitVec> {
        if len == 0 || bits.map(|b| b.len() < len).unwrap_or(false) {
            return Err(Error::InvalidLength { len });
        }
        let out = self.sequence()
            .mode(1, true)      // Select-DR-Scan
            .mode(2, false)     // Capture-DR, Shift-DR
            .shift(bits, len, true)     // ... Exit1-DR
            .mode(1, true)      // Update-DR
            .mode(1, false)     // Run-Test/Idle
            .execute()?;
        log::trace!("Shift DR {:02X?} -> {:02X?} ({} bits)",
                    bits.map(|b| b.as_bytes()), out.as_bytes(), len);
        Ok(out)
    }

    /// Read the 32-bit IDCODE of the TAP.
    ///
    /// Returns `Error::NoDevice` if the link reads as all zeros or all ones.
    pub fn read_idcode(&mut self) -> Result<u32> {
        self.reset()?;
        let ir = self.instruction(Instruction::IDCODE);
        self.shift_instruction(&ir)?;
        let idcode = self.shift_data(None, 32)?.word(32)? as u32;
        log::debug!("Read IDCODE 0x{:08X}", idcode);
        if idcode == 0x0000_0000 || idcode == 0xFFFF_FFFF {
            Err(Error::NoDevice { idcode })
        } else {
            Ok(idcode)
        }
    }

    /// Pulse the active-low system reset line for `duration`.
    pub fn pulse_srst(&mut self, duration: Duration) -> Result<()> {
        log::debug!("Pulsing nSRST");
        self.pulse(Pin::SRST, duration)
    }

    /// Pulse the active-low TAP reset line for `duration`, then resynchronise.
    pub fn pulse_trst(&mut self, duration: Duration) -> Result<()> {
        log::debug!("Pulsing nTRST");
        self.pulse(Pin::TRST, duration)?;
        self.reset()
    }

    fn pulse(&mut self, pin: Pin, duration: Duration) -> Result<()> {
        self.transport.set_pin(pin, false)?;
        std::thread::sleep(duration);
        self.transport.set_pin(pin, true)?;
        Ok(())
    }

    fn sequence(&mut self) -> Sequence<'_, T> {
        Sequence::new(self)
    }
}

impl<T: PinTransport> std::ops::Drop for Tap<T> {
    fn drop(&mut self) {
        log::debug!("TAP dropped, closing transport");
        self.transport.close();
    }
}

#[derive(Copy, Clone, Debug)]
struct Clock {
    tms: bool,
    tdi: bool,
    capture: bool,
}

/// A queued series of TCK cycles, executed in order by `execute()`.
pub struct Sequence<'a, T: PinTransport> {
    tap: &'a mut Tap<T>,
    clocks: Vec<Clock>,
}

impl<'a, T: PinTransport> Sequence<'a, T> {
    fn new(tap: &'a mut Tap<T>) -> Self {
        Sequence { tap, clocks: Vec::new() }
    }

    /// Clock `n` cycles with a fixed TMS level and TDI low.
    pub fn mode(mut self, n: usize, tms: bool) -> Self {
        self.clocks.extend(std::iter::repeat(Clock { tms, tdi: false, capture: false }).take(n));
        self
    }

    /// Clock `len` bits of `tdi` (or zeros), raising TMS on the final bit.
    pub fn shift(mut self, tdi: Option<&BitVec>, len: usize, capture: bool) -> Self {
        for idx in 0..len {
            let bit = tdi.and_then(|bits| bits.get(idx)).unwrap_or(false);
            self.clocks.push(Clock { tms: idx == len - 1, tdi: bit, capture });
        }
        self
    }

    /// Drive every queued clock and return the captured TDO bits.
    ///
    /// TDO is sampled while TCK is low, before the rising edge.
    pub fn execute(self) -> Result<BitVec> {
        let Sequence { tap, clocks } = self;
        let mut captured = BitVec::new();
        let mut tms = None;
        let mut tdi = None;
        for clock in clocks {
            if tms != Some(clock.tms) {
                tap.transport.set_pin(Pin::TMS, clock.tms)?;
                tms = Some(clock.tms);
            }
            if tdi != Some(clock.tdi) {
                tap.transport.set_pin(Pin::TDI, clock.tdi)?;
                tdi = Some(clock.tdi);
            }
            tap.transport.set_pin(Pin::TCK, false)?;
            tap.transport.delay(tap.half_period_us);
            if clock.capture {
                captured.push(tap.transport.get_pin(Pin::TDO)?);
            }
            tap.transport.set_pin(Pin::TCK, true)?;
            tap.transport.delay(tap.half_period_us);
            tap.state = tap.state.next(clock.tms);
        }
        debug_assert!(matches!(tap.state, TapState::RunTestIdle | TapState::TestLogicReset),
                      "TAP left in {:?}", tap.state);
        Ok(captured)
    }
}
