//! Serial port sink for log output.
//!
//! UART 16550 on COM1, the only output channel the storage core
//! assumes. Everything above it goes through the `log` facade.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// Standard COM1 port address
const SERIAL_IO_PORT: u16 = 0x3F8;

lazy_static! {
    /// Global serial port instance protected by spinlock
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Force initialization of the lazily created port.
pub fn init() {
    let _ = SERIAL1.lock();
}

/// Print to serial port (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    // Disable interrupts to prevent deadlock
    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Printing to serial failed");
    });
}
