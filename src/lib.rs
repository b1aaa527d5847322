// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! tapflash
//!
//! Identify, debug and program ARM microcontrollers over a bit-banged JTAG adapter.
//!
//! The stack is layered leaves first: a `PinTransport` drives the raw pins,
//! `jtag::Tap` runs the TAP state machine over it, `dap::Dap` performs ARM
//! debug port and memory accesses through the TAP, and `flash::Flash`
//! erases and programs on-chip flash through a `MemoryAccess`.

pub mod bitvec;
pub mod transport;
pub mod ftdi;
pub mod jtag;
pub mod dap;
pub mod device;
pub mod flash;
pub mod config;

#[cfg(test)]
mod sim;

pub use dap::{Dap, MemoryAccess};
pub use device::{DeviceCatalog, DeviceDescriptor, FlashRegion};
pub use flash::{Flash, FlashDriver, FlashStatus};
pub use jtag::Tap;
pub use transport::{Pin, PinTransport};
