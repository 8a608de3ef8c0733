//! Serial port logging for kernel diagnostics
#![no_std]

use conquer_once::spin::OnceCell;
use spin::Mutex;
use uart_16550::SerialPort;

/// The global serial writer used by the print macros.
///
/// Until [`init`] is called the cell is empty and the macros discard
/// their output, so library code may log unconditionally.
pub static SERIAL1: OnceCell<Mutex<SerialPort>> = OnceCell::uninit();

/// I/O port base of the primary UART
const COM1: u16 = 0x3F8;

/// Install and initialize the primary serial port
pub fn init() {
    SERIAL1.init_once(|| {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    });
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    if let Some(serial) = SERIAL1.get() {
        serial
            .lock()
            .write_fmt(args)
            .expect("Printing to serial failed");
    }
}

/// Prints to the host through the serial interface.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::_print(format_args!($($arg)*))
    };
}

/// Prints to the host through the serial interface, appending a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
