//! Serial port interface for UART 16550 communication.
//!
//! COM1 is the kernel's only output device; the logger and the
//! `serial_print!` macros both write here.

use crate::constants::ports::SERIAL_PORT;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    /// COM1, initialized on first access.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    SERIAL1
        .lock()
        .write_fmt(args)
        .expect("Printing to serial failed");
}

/// Writes one byte.
pub fn print_char(byte: u8) {
    SERIAL1.lock().send(byte);
}

/// Writes `s` unformatted.
pub fn print_str(s: &str) {
    let mut port = SERIAL1.lock();
    s.bytes().for_each(|byte| port.send(byte));
}

/// Prints formatted text to the serial port.
///
/// # Examples
/// ```ignore
/// serial_print!("{} frames free", 42);
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
