//! Serial console and print utilities.

use crate::pio::Pio;
use core::fmt::Write;
use spin::Mutex;

const COM1: u16 = 0x3f8;

/// Initialize the serial console.
///
/// # Safety
/// Reprograms the UART; call once during boot.
pub unsafe fn init() {
    Pio::new(COM1 + 2).write_u8(0);
    Pio::new(COM1 + 3).write_u8(0x80);
    Pio::new(COM1).write_u8((115200 / 9600) as u8);
    Pio::new(COM1 + 1).write_u8(0);
    Pio::new(COM1 + 3).write_u8(0x3 & !0x80);
    Pio::new(COM1 + 4).write_u8(0);
    Pio::new(COM1 + 1).write_u8(1);
    Pio::new(COM1 + 2).read_u8();
    Pio::new(COM1).read_u8();
}

fn write_str(s: &str) {
    for b in s.as_bytes() {
        for _ in 0..12800 {
            if Pio::new(COM1 + 5).read_u8() & 0x20 != 0 {
                break;
            }
            // delay
            Pio::new(0x84).read_u8();
        }
        Pio::new(COM1).write_u8(*b);
    }
}

/// Serial console writer.
pub struct Serial {
    _p: (),
}

impl Serial {
    /// Create a new serial device interface.
    pub const fn new() -> Self {
        Serial { _p: () }
    }
}

impl core::fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        write_str(s);
        Ok(())
    }
}

static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let _ = write!(&mut *SERIAL.lock(), "{}", fmt);
}

/// Prints out the message.
///
/// Use the format! syntax. This holds the console lock for the duration of
/// one write.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
