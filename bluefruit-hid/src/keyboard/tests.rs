use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};

use bluefruit_sdep::sdep::{SdepType, SDEP_MAX_PAYLOAD};
use bluefruit_sdep::time::Clock;
use bluefruit_sdep::BluefruitLe;

use super::*;

/// Scripted coprocessor shared by the hardware mocks. Time only advances
/// when the service delays or reads the clock, and the IRQ line follows the
/// scripted response bytes.
#[derive(Default)]
struct Shared {
    now_us: u64,
    cs_low: bool,
    not_ready: u32,
    written: Vec<u8>,
    rx: VecDeque<u8>,
}

#[derive(Debug)]
struct MockErr;

impl embedded_hal::spi::Error for MockErr {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}

impl embedded_hal::digital::Error for MockErr {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

struct MockSpi(Rc<RefCell<Shared>>);

impl SpiErrorType for MockSpi {
    type Error = MockErr;
}

impl SpiBus<u8> for MockSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), MockErr> {
        let mut s = self.0.borrow_mut();
        for w in words {
            *w = s.rx.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), MockErr> {
        self.0.borrow_mut().written.extend_from_slice(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), MockErr> {
        let mut s = self.0.borrow_mut();
        if s.not_ready > 0 {
            s.not_ready -= 1;
            read.fill(SdepType::SlaveNotReady as u8);
        } else {
            read.fill(0x00);
            s.written.extend_from_slice(write);
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), MockErr> {
        let copy = words.to_vec();
        self.transfer(words, &copy)
    }

    fn flush(&mut self) -> Result<(), MockErr> {
        Ok(())
    }
}

struct MockCs(Rc<RefCell<Shared>>);

impl PinErrorType for MockCs {
    type Error = MockErr;
}

impl OutputPin for MockCs {
    fn set_low(&mut self) -> Result<(), MockErr> {
        self.0.borrow_mut().cs_low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), MockErr> {
        self.0.borrow_mut().cs_low = false;
        Ok(())
    }
}

struct MockIrq(Rc<RefCell<Shared>>);

impl PinErrorType for MockIrq {
    type Error = MockErr;
}

impl InputPin for MockIrq {
    fn is_high(&mut self) -> Result<bool, MockErr> {
        Ok(!self.0.borrow().rx.is_empty())
    }

    fn is_low(&mut self) -> Result<bool, MockErr> {
        self.is_high().map(|h| !h)
    }
}

struct MockRst;

impl PinErrorType for MockRst {
    type Error = MockErr;
}

impl OutputPin for MockRst {
    fn set_low(&mut self) -> Result<(), MockErr> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), MockErr> {
        Ok(())
    }
}

struct MockDelay(Rc<RefCell<Shared>>);

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().now_us += u64::from(ns) / 1000;
    }
}

struct MockClock(Rc<RefCell<Shared>>);

impl Clock for MockClock {
    fn now_ms(&mut self) -> u16 {
        let mut s = self.0.borrow_mut();
        s.now_us += 100;
        (s.now_us / 1000) as u16
    }
}

type TestKeyboard = BleKeyboard<MockSpi, MockCs, MockIrq, MockRst, MockDelay, MockClock>;

struct Rig {
    shared: Rc<RefCell<Shared>>,
    kbd: TestKeyboard,
}

fn rig(config: KeyboardConfig) -> Rig {
    let shared = Rc::new(RefCell::new(Shared::default()));
    let ble = BluefruitLe::new(
        MockSpi(shared.clone()),
        MockCs(shared.clone()),
        MockIrq(shared.clone()),
        MockRst,
        MockDelay(shared.clone()),
        MockClock(shared.clone()),
    );
    Rig {
        shared,
        kbd: BleKeyboard::new(ble, config),
    }
}

fn quiet_config() -> KeyboardConfig {
    KeyboardConfig {
        sample_battery: false,
        ..KeyboardConfig::default()
    }
}

/// A rig that has already run the init script successfully.
fn configured_rig(config: KeyboardConfig) -> Rig {
    let mut r = rig(config);
    for _ in 0..6 {
        r.push_response("OK\r\n");
    }
    r.kbd.enable_keyboard().unwrap();
    r.take_commands();
    r
}

impl Rig {
    fn advance_ms(&self, ms: u64) {
        self.shared.borrow_mut().now_us += ms * 1000;
    }

    /// Queues `text` as one or more response frames.
    fn push_response(&self, text: &str) {
        let mut s = self.shared.borrow_mut();
        let chunks: Vec<&[u8]> = if text.is_empty() {
            vec![&[]]
        } else {
            text.as_bytes().chunks(SDEP_MAX_PAYLOAD).collect()
        };
        for (i, chunk) in chunks.iter().enumerate() {
            let more = i + 1 < chunks.len();
            s.rx.push_back(SdepType::Response as u8);
            s.rx.push_back(0x00);
            s.rx.push_back(0x0A);
            s.rx.push_back(chunk.len() as u8 | ((more as u8) << 7));
            s.rx.extend(chunk.iter());
        }
    }

    /// Reassembles and clears the AT commands the service has sent.
    fn take_commands(&self) -> Vec<String> {
        let mut s = self.shared.borrow_mut();
        let mut commands = Vec::new();
        let mut current = Vec::new();
        let mut bytes = s.written.as_slice();
        while !bytes.is_empty() {
            assert_eq!(bytes[0], SdepType::Command as u8);
            assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), 0x0A00);
            let len = usize::from(bytes[3] & 0x7F);
            let more = bytes[3] & 0x80 != 0;
            assert!(len <= SDEP_MAX_PAYLOAD);
            current.extend_from_slice(&bytes[4..4 + len]);
            if !more {
                commands.push(String::from_utf8(core::mem::take(&mut current)).unwrap());
            }
            bytes = &bytes[4 + len..];
        }
        assert!(current.is_empty(), "unterminated command fragment");
        s.written.clear();
        commands
    }
}

#[test]
fn enable_keyboard_runs_the_init_script_in_order() {
    let mut r = rig(quiet_config());
    for _ in 0..6 {
        r.push_response("OK\r\n");
    }
    r.kbd.enable_keyboard().unwrap();
    assert!(r.kbd.is_configured());
    assert_eq!(
        r.take_commands(),
        [
            "ATE=0",
            "AT+GAPINTERVALS=10,30,,",
            "AT+GAPDEVNAME=PS/2 keyboard converter",
            "AT+BLEHIDEN=1",
            "AT+BLEPOWERLEVEL=-12",
            "ATZ",
        ]
    );
}

#[test]
fn a_failing_init_command_aborts_and_is_retried() {
    let mut r = rig(quiet_config());
    r.push_response("OK\r\n");
    r.push_response("ERROR\r\n");
    r.kbd.task();
    assert!(!r.kbd.is_configured());
    assert_eq!(r.take_commands().len(), 2, "script must stop at the failure");

    for _ in 0..6 {
        r.push_response("OK\r\n");
    }
    r.kbd.task();
    assert!(r.kbd.is_configured());
    assert_eq!(r.take_commands().len(), 6, "retry restarts from the top");
}

#[test]
fn key_report_format_is_bit_compatible() {
    let mut r = configured_rig(quiet_config());
    r.kbd
        .try_send(Report::Keys {
            modifier: 0x02,
            keys: [0x04, 0x05, 0, 0, 0, 0],
        })
        .unwrap();
    r.kbd.task();
    assert_eq!(
        r.take_commands(),
        ["AT+BLEKEYBOARDCODE=02-00-04-05-00-00-00-00"]
    );
}

#[test]
fn consumer_report_format_is_bit_compatible() {
    let mut r = configured_rig(quiet_config());
    r.kbd.try_send(Report::Consumer { usage: 0x00E9 }).unwrap();
    r.kbd.task();
    assert_eq!(r.take_commands(), ["AT+BLEHIDCONTROLKEY=0x00e9"]);
}

#[test]
fn mouse_report_issues_move_then_buttons() {
    let mut r = configured_rig(quiet_config());
    r.kbd
        .try_send(Report::MouseMove {
            x: -3,
            y: 4,
            scroll: 1,
            pan: 0,
            buttons: MOUSE_BTN_LEFT | MOUSE_BTN_MIDDLE,
        })
        .unwrap();
    r.kbd.task();
    assert_eq!(
        r.take_commands(),
        ["AT+BLEHIDMOUSEMOVE=-3,4,1,0", "AT+BLEHIDMOUSEBUTTON=LM"]
    );
    assert_eq!(r.kbd.queued_reports(), 0);
}

#[test]
fn mouse_report_with_no_buttons_sends_zero() {
    let mut r = configured_rig(quiet_config());
    r.kbd
        .try_send(Report::MouseMove {
            x: 1,
            y: 0,
            scroll: 0,
            pan: 0,
            buttons: 0,
        })
        .unwrap();
    r.kbd.task();
    assert_eq!(
        r.take_commands(),
        ["AT+BLEHIDMOUSEMOVE=1,0,0,0", "AT+BLEHIDMOUSEBUTTON=0"]
    );
}

#[test]
fn the_queue_holds_forty_reports_and_delivers_fifo() {
    let mut r = configured_rig(quiet_config());
    for i in 0..SEND_QUEUE_DEPTH as u8 {
        r.kbd
            .try_send(Report::Keys {
                modifier: 0,
                keys: [i, 0, 0, 0, 0, 0],
            })
            .unwrap();
    }
    let overflow = Report::Consumer { usage: 1 };
    assert_eq!(r.kbd.try_send(overflow), Err(overflow));
    assert_eq!(r.kbd.queued_reports(), SEND_QUEUE_DEPTH);

    // One acknowledgement per pump step keeps exactly one command in
    // flight; every report still leaves in order.
    for _ in 0..SEND_QUEUE_DEPTH {
        r.push_response("OK\r\n");
    }
    for _ in 0..=SEND_QUEUE_DEPTH {
        r.kbd.task();
    }

    let commands = r.take_commands();
    assert_eq!(commands.len(), SEND_QUEUE_DEPTH);
    for (i, cmd) in commands.iter().enumerate() {
        assert_eq!(
            *cmd,
            format!("AT+BLEKEYBOARDCODE=00-00-{i:02x}-00-00-00-00-00")
        );
    }
    assert_eq!(r.kbd.queued_reports(), 0);
}

#[test]
fn no_new_report_is_sent_while_a_response_is_outstanding() {
    let mut r = configured_rig(quiet_config());
    r.kbd
        .try_send(Report::Consumer { usage: 0x01 })
        .unwrap();
    r.kbd.task();
    assert_eq!(r.take_commands().len(), 1);

    r.kbd
        .try_send(Report::Consumer { usage: 0x02 })
        .unwrap();
    r.kbd.task();
    assert_eq!(
        r.take_commands(),
        Vec::<String>::new(),
        "back-pressure must hold the second report"
    );
}

#[test]
fn a_stuck_coprocessor_is_abandoned_after_two_timeouts() {
    let mut r = configured_rig(quiet_config());
    r.kbd.try_send(Report::Consumer { usage: 0x01 }).unwrap();
    r.kbd.task();
    r.take_commands();
    r.kbd.try_send(Report::Consumer { usage: 0x02 }).unwrap();

    // IRQ stays low past the head-of-line deadline: the outstanding entry
    // is discarded and the queued report proceeds.
    r.advance_ms(2 * u64::from(SDEP_TIMEOUT_MS) + 1);
    r.kbd.task();
    assert_eq!(r.take_commands(), ["AT+BLEHIDCONTROLKEY=0x0002"]);
}

#[test]
fn send_keys_chunks_across_reports() {
    let mut r = configured_rig(quiet_config());
    r.kbd.send_keys(0x01, &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(r.kbd.queued_reports(), 2);

    r.push_response("OK\r\n");
    r.push_response("OK\r\n");
    for _ in 0..3 {
        r.kbd.task();
    }
    assert_eq!(
        r.take_commands(),
        [
            "AT+BLEKEYBOARDCODE=01-00-01-02-03-04-05-06",
            "AT+BLEKEYBOARDCODE=01-00-07-08-00-00-00-00",
        ]
    );
}

#[test]
fn first_connection_poll_probes_event_support() {
    let mut r = configured_rig(quiet_config());
    r.advance_ms(1001);
    r.push_response("OK\r\n"); // AT+EVENTENABLE=0x1
    r.push_response("OK\r\n"); // AT+EVENTENABLE=0x2
    r.push_response("1\r\nOK\r\n"); // AT+GAPGETCONN
    r.kbd.task();

    assert!(r.kbd.is_connected());
    assert_eq!(
        r.take_commands(),
        ["AT+EVENTENABLE=0x1", "AT+EVENTENABLE=0x2", "AT+GAPGETCONN"]
    );
}

#[test]
fn later_connection_polls_skip_the_probe() {
    let mut r = configured_rig(quiet_config());
    r.advance_ms(1001);
    r.push_response("OK\r\n");
    r.push_response("OK\r\n");
    r.push_response("1\r\nOK\r\n");
    r.kbd.task();
    r.take_commands();

    r.advance_ms(1001);
    r.push_response("0x0\r\nOK\r\n"); // event poll sees no change
    r.push_response("0\r\nOK\r\n"); // AT+GAPGETCONN
    r.kbd.task();

    assert!(!r.kbd.is_connected());
    assert_eq!(r.take_commands(), ["AT+EVENTSTATUS", "AT+GAPGETCONN"]);
}

#[test]
fn event_status_bits_drive_the_connection_state() {
    let mut r = configured_rig(quiet_config());
    r.advance_ms(1001);
    r.push_response("OK\r\n");
    r.push_response("OK\r\n");
    r.push_response("0\r\nOK\r\n");
    r.kbd.task();
    r.take_commands();
    assert!(!r.kbd.is_connected());

    // Bit 0: connected.
    r.push_response("0x1\r\nOK\r\n");
    r.kbd.task();
    assert!(r.kbd.is_connected());
    assert_eq!(r.take_commands(), ["AT+EVENTSTATUS"]);

    // Bit 1: disconnected.
    r.push_response("0x2\r\nOK\r\n");
    r.kbd.task();
    assert!(!r.kbd.is_connected());
}

#[test]
fn battery_is_sampled_on_its_own_interval() {
    let mut r = configured_rig(KeyboardConfig::default());
    r.advance_ms(10_001);
    r.push_response("OK\r\n"); // AT+EVENTENABLE=0x1
    r.push_response("OK\r\n"); // AT+EVENTENABLE=0x2
    r.push_response("0\r\nOK\r\n"); // AT+GAPGETCONN
    r.push_response("3300\r\nOK\r\n"); // AT+HWVBAT
    r.kbd.task();

    assert_eq!(r.kbd.battery_voltage_mv(), 3300);
    let commands = r.take_commands();
    assert_eq!(commands.last().unwrap(), "AT+HWVBAT");
}

#[test]
fn mode_leds_require_configuration_and_follow_the_connection() {
    let mut r = rig(quiet_config());
    assert!(!r.kbd.set_mode_leds(true));

    let mut r = configured_rig(quiet_config());
    assert!(r.kbd.set_mode_leds(true));
    // Not connected: the blue LED stays off.
    assert_eq!(r.take_commands(), ["AT+HWMODELED=1", "AT+HWGPIO=19,0"]);
}

#[test]
fn power_level_is_formatted_as_a_signed_integer() {
    let mut r = configured_rig(quiet_config());
    assert!(r.kbd.set_power_level(-8));
    assert_eq!(r.take_commands(), ["AT+BLEPOWERLEVEL=-8"]);
}

#[test]
fn hex_masks_and_integers_parse_leniently() {
    assert_eq!(parse_hex_mask("0x1"), Some(1));
    assert_eq!(parse_hex_mask(" 0X0102 "), Some(0x102));
    assert_eq!(parse_hex_mask("0x0000000000000002"), Some(2));
    assert_eq!(parse_hex_mask("zz"), None);

    assert_eq!(parse_decimal("3300"), 3300);
    assert_eq!(parse_decimal(" 1 "), 1);
    assert_eq!(parse_decimal("garbage"), 0);
}
