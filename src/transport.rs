//! The transport module is the boundary to physical hardware: a `PinTransport`
//! provides raw access to the JTAG signals of one adapter. Everything above
//! this layer only ever toggles and samples these pins.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid specifier, use VID:PID or VID:PID:Serial.")]
    InvalidSpecifier,
    #[error("specified adapter not found.")]
    NotFound,
    #[error("no FTDI adapters found.")]
    NoAdaptersFound,
    #[error("multiple FTDI adapters found, select a specific adapter.")]
    MultipleAdaptersFound,
    #[error("adapter is not open.")]
    NotOpen,
    #[error("pin {0:?} is not supported by this adapter.")]
    UnsupportedPin(Pin),
    #[error("USB error")]
    USB(#[from] rusb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pin {
    TCK,
    TMS,
    TDI,
    TDO,
    TRST,
    SRST,
}

/// Trait for adapters which give direct access to the JTAG pins.
///
/// Implementations must apply each `set_pin` before returning, so that
/// the order of pin changes seen by the target matches the call order.
pub trait PinTransport {
    /// Open and configure the adapter.
    fn open(&mut self) -> Result<()>;

    /// Release the adapter. Calling this on a closed adapter does nothing.
    fn close(&mut self);

    /// Drive an output pin high (`true`) or low (`false`).
    fn set_pin(&mut self, pin: Pin, value: bool) -> Result<()>;

    /// Sample the current level of a pin.
    fn get_pin(&mut self, pin: Pin) -> Result<bool>;

    /// Busy-wait or sleep for `us` microseconds.
    fn delay(&mut self, us: u32);
}

impl<T: PinTransport + ?Sized> PinTransport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn set_pin(&mut self, pin: Pin, value: bool) -> Result<()> {
        (**self).set_pin(pin, value)
    }

    fn get_pin(&mut self, pin: Pin) -> Result<bool> {
        (**self).get_pin(pin)
    }

    fn delay(&mut self, us: u32) {
        (**self).delay(us)
    }
}
