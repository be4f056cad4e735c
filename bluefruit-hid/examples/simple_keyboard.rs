//! Drives the keyboard service against a scripted coprocessor: the fake
//! SPI slave acknowledges every SDEP frame and answers each completed AT
//! command with a canned reply, so the whole pump can be watched on a host.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};

use bluefruit_hid::{BleKeyboard, KeyboardConfig, Report};
use bluefruit_sdep::sdep::{SdepType, SDEP_MAX_PAYLOAD};
use bluefruit_sdep::time::Clock;
use bluefruit_sdep::BluefruitLe;

#[derive(Default)]
struct FakeFriend {
    /// Raw frame bytes received from the driver.
    wire: Vec<u8>,
    /// AT command fragments reassembled so far.
    partial: Vec<u8>,
    /// Response bytes queued for the driver; IRQ follows this.
    rx: VecDeque<u8>,
}

impl FakeFriend {
    /// Consumes complete frames from the wire and replies to finished
    /// commands.
    fn pump(&mut self) {
        while self.wire.len() >= 4 {
            let len = usize::from(self.wire[3] & 0x7F);
            if self.wire.len() < 4 + len {
                return;
            }
            let more = self.wire[3] & 0x80 != 0;
            let frame: Vec<u8> = self.wire.drain(..4 + len).collect();
            self.partial.extend_from_slice(&frame[4..]);
            if !more {
                let cmd = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                self.respond(&cmd);
            }
        }
    }

    fn respond(&mut self, cmd: &str) {
        println!("  coprocessor <- {cmd}");
        let text = match cmd {
            "AT+GAPGETCONN" => "1\r\nOK\r\n",
            "AT+EVENTSTATUS" => "0x1\r\nOK\r\n",
            "AT+HWVBAT" => "3278\r\nOK\r\n",
            _ => "OK\r\n",
        };
        let chunks: Vec<&[u8]> = text.as_bytes().chunks(SDEP_MAX_PAYLOAD).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let more = i + 1 < chunks.len();
            self.rx.push_back(SdepType::Response as u8);
            self.rx.push_back(0x00);
            self.rx.push_back(0x0A);
            self.rx.push_back(chunk.len() as u8 | ((more as u8) << 7));
            self.rx.extend(chunk.iter());
        }
    }
}

#[derive(Debug)]
struct NoErr;

impl embedded_hal::spi::Error for NoErr {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}

impl embedded_hal::digital::Error for NoErr {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

struct FakeSpi(Rc<RefCell<FakeFriend>>);

impl SpiErrorType for FakeSpi {
    type Error = NoErr;
}

impl SpiBus<u8> for FakeSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), NoErr> {
        let mut f = self.0.borrow_mut();
        for w in words {
            *w = f.rx.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), NoErr> {
        let mut f = self.0.borrow_mut();
        f.wire.extend_from_slice(words);
        f.pump();
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), NoErr> {
        read.fill(0x00); // always ready
        self.write(write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), NoErr> {
        let copy = words.to_vec();
        self.transfer(words, &copy)
    }

    fn flush(&mut self) -> Result<(), NoErr> {
        Ok(())
    }
}

struct FakePin;

impl PinErrorType for FakePin {
    type Error = NoErr;
}

impl OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), NoErr> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), NoErr> {
        Ok(())
    }
}

struct FakeIrq(Rc<RefCell<FakeFriend>>);

impl PinErrorType for FakeIrq {
    type Error = NoErr;
}

impl InputPin for FakeIrq {
    fn is_high(&mut self) -> Result<bool, NoErr> {
        Ok(!self.0.borrow().rx.is_empty())
    }

    fn is_low(&mut self) -> Result<bool, NoErr> {
        self.is_high().map(|h| !h)
    }
}

struct HostDelay;

impl DelayNs for HostDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(std::time::Duration::from_nanos(u64::from(ns)));
    }
}

struct HostClock(Instant);

impl Clock for HostClock {
    fn now_ms(&mut self) -> u16 {
        self.0.elapsed().as_millis() as u16
    }
}

fn main() {
    let friend = Rc::new(RefCell::new(FakeFriend::default()));
    let ble = BluefruitLe::new(
        FakeSpi(friend.clone()),
        FakePin,
        FakeIrq(friend.clone()),
        FakePin,
        HostDelay,
        HostClock(Instant::now()),
    );
    let mut keyboard = BleKeyboard::new(ble, KeyboardConfig::default());

    println!("configuring:");
    keyboard.enable_keyboard().expect("init script failed");

    println!("typing \"hi\", then a volume-up tap:");
    for key in [0x0B, 0x0C] {
        keyboard.send_keys(0, &[key]);
        keyboard.send_keys(0, &[]); // release
    }
    keyboard
        .try_send(Report::Consumer { usage: 0x00E9 })
        .unwrap();
    while keyboard.queued_reports() > 0 {
        keyboard.task();
    }

    println!("waiting out the connection poll interval...");
    std::thread::sleep(std::time::Duration::from_millis(1100));
    keyboard.task();

    println!(
        "configured: {}, connected: {}, battery: {} mV",
        keyboard.is_configured(),
        keyboard.is_connected(),
        keyboard.battery_voltage_mv(),
    );
}
