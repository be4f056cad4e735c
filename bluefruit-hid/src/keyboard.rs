//! The keyboard service: report queue, transport pump, and link upkeep.

use core::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use heapless::{Deque, String};
use log::{debug, info, warn};

use bluefruit_sdep::sdep::SystemEvent;
use bluefruit_sdep::time::{millis_since, Clock};
use bluefruit_sdep::{
    BluefruitLe, SdepError, SDEP_SHORT_TIMEOUT_MS, SDEP_TIMEOUT_MS,
};

use crate::report::{Report, MOUSE_BTN_LEFT, MOUSE_BTN_MIDDLE, MOUSE_BTN_RIGHT};

/// Reports that can pile up while the coprocessor is slow to acknowledge.
pub const SEND_QUEUE_DEPTH: usize = 40;

/// Tunables for the keyboard service.
#[derive(Debug, Clone)]
pub struct KeyboardConfig {
    /// Name advertised over BLE (`AT+GAPDEVNAME`).
    pub device_name: &'static str,
    /// Transmit power (`AT+BLEPOWERLEVEL`), turned down a bit by default.
    pub power_level_dbm: i8,
    /// How often to refresh the connection state when not using events.
    pub connection_update_interval_ms: u16,
    /// How often to sample the battery voltage.
    pub battery_update_interval_ms: u16,
    /// Whether to sample the battery at all.
    pub sample_battery: bool,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            device_name: "PS/2 keyboard converter",
            power_level_dbm: -12,
            connection_update_interval_ms: 1000,
            battery_update_interval_ms: 10_000,
            sample_battery: true,
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    initialized: bool,
    configured: bool,
    is_connected: bool,
    /// Whether we have asked the coprocessor about event support yet.
    /// Event notifications only exist in firmware > 0.6.7, so they are
    /// probed once and polling stays as the fallback.
    probed_events: bool,
    using_events: bool,
    last_connection_update: u16,
    last_battery_update: u16,
    vbat_mv: u32,
}

#[derive(Debug, Clone, Copy)]
struct QueueItem {
    /// Enqueue timestamp, kept for send-latency diagnostics.
    added: u16,
    report: Report,
}

/// BLE HID keyboard service over a [`BluefruitLe`] transport.
///
/// Constructed once by the outer firmware loop, which then invokes
/// [`task`](Self::task) periodically alongside the matrix scan.
pub struct BleKeyboard<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK> {
    ble: BluefruitLe<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK>,
    config: KeyboardConfig,
    state: LinkState,
    send_queue: Deque<QueueItem, SEND_QUEUE_DEPTH>,
}

impl<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK, TSPIERR, TPINERR>
    BleKeyboard<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK>
where
    TSPIERR: core::fmt::Debug,
    TPINERR: core::fmt::Debug,
    TSPI: SpiBus<u8, Error = TSPIERR>,
    TCS: OutputPin<Error = TPINERR>,
    TIRQ: InputPin<Error = TPINERR>,
    TRST: OutputPin<Error = TPINERR>,
    TDELAY: DelayNs,
    TCLK: Clock,
{
    pub fn new(
        ble: BluefruitLe<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK>,
        config: KeyboardConfig,
    ) -> Self {
        Self {
            ble,
            config,
            state: LinkState::default(),
            send_queue: Deque::new(),
        }
    }

    /// Whether a central is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected
    }

    /// Whether the init script has completed since the last reset.
    pub fn is_configured(&self) -> bool {
        self.state.configured
    }

    /// Last sampled battery voltage in millivolts, raw as reported.
    pub fn battery_voltage_mv(&self) -> u32 {
        self.state.vbat_mv
    }

    /// Reports waiting in the send queue.
    pub fn queued_reports(&self) -> usize {
        self.send_queue.len()
    }

    /// Resets the module if needed and runs the configuration script.
    ///
    /// Any command failing aborts the script with `configured` still false;
    /// the next [`task`](Self::task) retries from the top.
    pub fn enable_keyboard(&mut self) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        if !self.state.initialized {
            self.ble.hardware_reset()?;
            self.state.initialized = true;
            self.state.is_connected = false;
        }

        self.state.configured = false;

        // Disable command echo.
        self.configure("ATE=0")?;
        // Ask the central to poll us every 10-30 ms; tighter isn't allowed
        // and looser is noticeable when typing.
        self.configure("AT+GAPINTERVALS=10,30,,")?;

        let mut cmd: String<64> = String::new();
        let _ = write!(cmd, "AT+GAPDEVNAME={}", self.config.device_name);
        self.configure(&cmd)?;

        self.configure("AT+BLEHIDEN=1")?;

        let mut cmd: String<46> = String::new();
        let _ = write!(cmd, "AT+BLEPOWERLEVEL={}", self.config.power_level_dbm);
        self.configure(&cmd)?;

        // Reset so the settings above take effect.
        self.configure("ATZ")?;

        self.state.configured = true;
        // Check the connection in a little while; allow the ATZ time to
        // kick in.
        self.state.last_connection_update = self.ble.now_ms();
        Ok(())
    }

    fn configure(&mut self, cmd: &str) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        let mut resp = [0u8; 128];
        match self.ble.at_command_with_response(cmd, &mut resp, SDEP_TIMEOUT_MS) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!("ble: config command {cmd} failed");
                Err(err)
            }
        }
    }

    /// One pump step, invoked periodically by the outer loop.
    ///
    /// Configures the module if needed, then: collects outstanding replies,
    /// forwards at most one queued report, folds in connection events, and
    /// refreshes the connection and battery state on their intervals.
    pub fn task(&mut self) {
        if !self.state.configured && self.enable_keyboard().is_err() {
            return;
        }

        self.ble.drain_responses(true);
        self.send_one(SDEP_SHORT_TIMEOUT_MS);
        self.poll_events();
        self.poll_connection();
        self.sample_battery();
    }

    /// Enqueues a report without blocking; the report is handed back when
    /// the queue is full, in which case the caller should run the pump.
    pub fn try_send(&mut self, report: Report) -> Result<(), Report> {
        let item = QueueItem {
            added: self.ble.now_ms(),
            report,
        };
        self.send_queue.push_back(item).map_err(|item| item.report)
    }

    /// Queues a key report, splitting more than six keys across several
    /// reports. Spins the pump while the queue is full.
    pub fn send_keys(&mut self, modifier: u8, keys: &[u8]) {
        let added = self.ble.now_ms();
        let mut rest = keys;
        loop {
            let mut chunk = [0u8; 6];
            let n = rest.len().min(6);
            chunk[..n].copy_from_slice(&rest[..n]);
            self.enqueue_spin(QueueItem {
                added,
                report: Report::Keys {
                    modifier,
                    keys: chunk,
                },
            });
            if rest.len() <= 6 {
                return;
            }
            rest = &rest[6..];
        }
    }

    /// Queues a consumer-control usage. Spins the pump while the queue is
    /// full.
    pub fn send_consumer_key(&mut self, usage: u16) {
        let item = QueueItem {
            added: self.ble.now_ms(),
            report: Report::Consumer { usage },
        };
        self.enqueue_spin(item);
    }

    /// Queues a mouse movement report. Spins the pump while the queue is
    /// full.
    pub fn send_mouse_move(&mut self, x: i8, y: i8, scroll: i8, pan: i8, buttons: u8) {
        let item = QueueItem {
            added: self.ble.now_ms(),
            report: Report::MouseMove {
                x,
                y,
                scroll,
                pan,
                buttons,
            },
        };
        self.enqueue_spin(item);
    }

    /// Turns the red mode LED on or off; the blue connection LED is only
    /// re-lit when a central is actually connected. Returns false until the
    /// module is configured.
    pub fn set_mode_leds(&mut self, on: bool) -> bool {
        if !self.state.configured {
            return false;
        }
        let cmd = if on { "AT+HWMODELED=1" } else { "AT+HWMODELED=0" };
        let _ = self.ble.at_command(cmd, SDEP_TIMEOUT_MS);

        let cmd = if on && self.state.is_connected {
            "AT+HWGPIO=19,1"
        } else {
            "AT+HWGPIO=19,0"
        };
        let _ = self.ble.at_command(cmd, SDEP_TIMEOUT_MS);
        true
    }

    /// Adjusts the transmit power. Returns false until the module is
    /// configured.
    pub fn set_power_level(&mut self, level_dbm: i8) -> bool {
        if !self.state.configured {
            return false;
        }
        let mut cmd: String<46> = String::new();
        let _ = write!(cmd, "AT+BLEPOWERLEVEL={level_dbm}");
        self.ble.at_command(&cmd, SDEP_TIMEOUT_MS).is_ok()
    }

    fn enqueue_spin(&mut self, item: QueueItem) {
        let mut logged = false;
        while self.send_queue.push_back(item).is_err() {
            if !logged {
                debug!("ble: waiting for queue space");
                logged = true;
            }
            self.ble.drain_responses(true);
            self.send_one(SDEP_TIMEOUT_MS);
        }
    }

    fn send_one(&mut self, timeout_ms: u16) {
        // Don't send anything more until the last command is acknowledged.
        if self.ble.responses_pending() {
            return;
        }
        let Some(&item) = self.send_queue.front() else {
            return;
        };

        if self.process_item(&item, timeout_ms).is_ok() {
            self.send_queue.pop_front();
            debug!("ble: {} reports still queued", self.send_queue.len());
        } else {
            debug!("ble: send failed, will retry");
            self.ble.delay_ms(u32::from(SDEP_TIMEOUT_MS));
            self.ble.drain_responses(true);
        }
    }

    fn process_item(
        &mut self,
        item: &QueueItem,
        timeout_ms: u16,
    ) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        // Re-check the connection once the keys have settled.
        self.state.last_connection_update = self.ble.now_ms();

        let waited = millis_since(self.state.last_connection_update, item.added);
        if waited > 0 {
            debug!("ble: send latency {waited}ms");
        }

        match item.report {
            Report::Keys { modifier, keys } => {
                let mut cmd: String<48> = String::new();
                let _ = write!(
                    cmd,
                    "AT+BLEKEYBOARDCODE={modifier:02x}-00-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
                    keys[0], keys[1], keys[2], keys[3], keys[4], keys[5],
                );
                self.ble.at_command(&cmd, timeout_ms)
            }
            Report::Consumer { usage } => {
                let mut cmd: String<48> = String::new();
                let _ = write!(cmd, "AT+BLEHIDCONTROLKEY=0x{usage:04x}");
                self.ble.at_command(&cmd, timeout_ms)
            }
            Report::MouseMove {
                x,
                y,
                scroll,
                pan,
                buttons,
            } => {
                let mut cmd: String<48> = String::new();
                let _ = write!(cmd, "AT+BLEHIDMOUSEMOVE={x},{y},{scroll},{pan}");
                self.ble.at_command(&cmd, timeout_ms)?;

                let mut cmd: String<48> = String::new();
                let _ = cmd.push_str("AT+BLEHIDMOUSEBUTTON=");
                if buttons & MOUSE_BTN_LEFT != 0 {
                    let _ = cmd.push('L');
                }
                if buttons & MOUSE_BTN_RIGHT != 0 {
                    let _ = cmd.push('R');
                }
                if buttons & MOUSE_BTN_MIDDLE != 0 {
                    let _ = cmd.push('M');
                }
                if buttons == 0 {
                    let _ = cmd.push('0');
                }
                self.ble.at_command(&cmd, timeout_ms)
            }
        }
    }

    fn poll_events(&mut self) {
        if self.ble.responses_pending() || !self.state.using_events || !self.ble.irq_asserted() {
            return;
        }

        // Data ready with nothing outstanding must be an event update.
        let mut resp = [0u8; 48];
        let Ok(body) = self
            .ble
            .at_command_with_response("AT+EVENTSTATUS", &mut resp, SDEP_TIMEOUT_MS)
        else {
            return;
        };
        let Some(mask) = parse_hex_mask(body) else {
            return;
        };

        if mask & SystemEvent::Connected.mask() != 0 {
            self.set_connected(true);
        } else if mask & SystemEvent::Disconnected.mask() != 0 {
            self.set_connected(false);
        }
    }

    fn poll_connection(&mut self) {
        let now = self.ble.now_ms();
        if millis_since(now, self.state.last_connection_update)
            <= self.config.connection_update_interval_ms
        {
            return;
        }

        if !self.state.probed_events {
            // Ask for connection-change notifications. Only firmware newer
            // than 0.6.7 understands this, hence the one-time probe with
            // polling kept as the fallback.
            let mut resp = [0u8; 48];
            if self
                .ble
                .at_command_with_response("AT+EVENTENABLE=0x1", &mut resp, SDEP_TIMEOUT_MS)
                .is_ok()
            {
                let _ = self
                    .ble
                    .at_command_with_response("AT+EVENTENABLE=0x2", &mut resp, SDEP_TIMEOUT_MS);
                self.state.using_events = true;
            }
            self.state.probed_events = true;
        }

        self.state.last_connection_update = self.ble.now_ms();

        let mut resp = [0u8; 48];
        if let Ok(body) =
            self.ble
                .at_command_with_response("AT+GAPGETCONN", &mut resp, SDEP_TIMEOUT_MS)
        {
            self.set_connected(parse_decimal(body) != 0);
        }
    }

    fn sample_battery(&mut self) {
        if !self.config.sample_battery {
            return;
        }
        let now = self.ble.now_ms();
        if millis_since(now, self.state.last_battery_update)
            <= self.config.battery_update_interval_ms
            || self.ble.responses_pending()
        {
            return;
        }

        self.state.last_battery_update = self.ble.now_ms();

        let mut resp = [0u8; 48];
        if let Ok(body) = self
            .ble
            .at_command_with_response("AT+HWVBAT", &mut resp, SDEP_TIMEOUT_MS)
        {
            self.state.vbat_mv = parse_decimal(body);
        }
    }

    fn set_connected(&mut self, connected: bool) {
        if connected != self.state.is_connected {
            if connected {
                info!("ble: connected");
            } else {
                info!("ble: disconnected");
            }
            self.state.is_connected = connected;
        }
    }
}

/// Parses an `AT+EVENTSTATUS` hex mask, keeping the low 32 bits.
fn parse_hex_mask(body: &str) -> Option<u32> {
    let text = body.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(text, 16).ok().map(|mask| mask as u32)
}

/// Parses an integer reply; garbage counts as zero.
fn parse_decimal(body: &str) -> u32 {
    body.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests;
