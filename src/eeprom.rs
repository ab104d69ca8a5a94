//! Bit-banged two-wire serial EEPROM.
//!
//! The chip hangs off port B: three derived line levels (power, clock,
//! data) arrive through [`Eeprom::update`] on every port write, and the
//! protocol state machine reacts to the edges. Contents persist through an
//! injected [`EepromStorage`] as a hex blob, written out on every stop
//! condition that ends a write session.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BIT_WIDTH: u32 = 12;

/// Backing store for the EEPROM contents. Two hex digits per byte; case
/// does not matter. Implementations must not fail loudly: a missing or
/// unreadable blob just means a blank chip.
pub trait EepromStorage {
    fn load(&mut self) -> Option<String>;
    fn save(&mut self, blob: &str);
}

/// In-memory store, shared through a handle so tests and embedders can
/// inspect what was persisted.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    blob: Rc<RefCell<Option<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: &str) -> Self {
        Self {
            blob: Rc::new(RefCell::new(Some(blob.to_string()))),
        }
    }

    pub fn blob(&self) -> Option<String> {
        self.blob.borrow().clone()
    }
}

impl EepromStorage for MemoryStorage {
    fn load(&mut self) -> Option<String> {
        self.blob.borrow().clone()
    }

    fn save(&mut self, blob: &str) {
        *self.blob.borrow_mut() = Some(blob.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EepromState {
    Disabled,
    Command,
    Address,
    Read,
    Write,
}

pub struct Eeprom {
    data: Vec<u8>,
    storage: Box<dyn EepromStorage>,
    /// Number of address bytes a write command must supply.
    address_width: u32,
    mask: usize,

    state: EepromState,
    address: usize,
    address_bytes: u32,
    shift_in: u8,
    shift_out: u8,
    /// Falling-edge counter within the current byte cycle. Every byte is
    /// nine clocks: eight data bits plus the acknowledge slot.
    bit_count: u8,
    last_clock: bool,
    last_data: bool,
    output: bool,
}

impl Eeprom {
    pub fn new(bit_width: u32, mut storage: Box<dyn EepromStorage>) -> Self {
        let size = 1usize << bit_width;
        let data = storage
            .load()
            .and_then(|blob| decode_hex(&blob))
            .filter(|data| data.len() == size)
            .unwrap_or_else(|| vec![0; size]);

        Eeprom {
            data,
            storage,
            address_width: bit_width.div_ceil(8),
            mask: size - 1,
            state: EepromState::Disabled,
            address: 0,
            address_bytes: 0,
            shift_in: 0,
            shift_out: 0,
            bit_count: 0,
            last_clock: false,
            last_data: false,
            output: true,
        }
    }

    /// Level of the data line as driven by the chip (high = released/NACK,
    /// low = acknowledging or outputting a zero bit).
    pub fn output(&self) -> bool {
        self.output
    }

    pub fn state(&self) -> EepromState {
        self.state
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Feeds new line levels into the state machine. Called on every port
    /// write that recomputes the derived bus lines.
    pub fn update(&mut self, power: bool, clock: bool, data: bool) {
        let clock_edge = clock != self.last_clock;
        let data_edge = data != self.last_data;
        self.last_clock = clock;
        self.last_data = data;

        // Without power the chip is inert and releases the data line.
        if !power {
            self.state = EepromState::Disabled;
            self.output = true;
            return;
        }

        if !clock_edge && !data_edge {
            return;
        }

        if clock_edge && data_edge {
            log::warn!("eeprom: clock and data lines transitioned at the same time");
        }

        // Data transition while the clock is held high: start or stop.
        if clock && data_edge {
            if data {
                if self.state == EepromState::Write {
                    self.persist();
                }
                self.state = EepromState::Disabled;
                self.output = false;
            } else {
                self.state = EepromState::Command;
                self.output = false;
                self.bit_count = 0;
                self.shift_in = 0;
                self.shift_out = 0;
            }
        }

        if self.state == EepromState::Disabled {
            return;
        }

        if clock_edge && clock {
            // Rising clock: sample the incoming bit, MSB first.
            self.shift_in = (self.shift_in << 1) | data as u8;
        } else if clock_edge {
            // Falling clock: deliver output bits, or dispatch the
            // completed byte on the ninth edge.
            if self.bit_count < 8 {
                self.output = self.shift_out & 0x80 != 0;
                self.shift_out <<= 1;
            } else {
                self.shift_out = 0xFF;
                match self.state {
                    EepromState::Command => match self.shift_in & 0xF1 {
                        0xA0 => {
                            self.state = EepromState::Address;
                            self.address = 0;
                            self.address_bytes = 0;
                        }
                        0xA1 => {
                            self.state = EepromState::Read;
                            self.load_output();
                        }
                        _ => {}
                    },
                    EepromState::Address => {
                        self.address = (self.address << 8) | self.shift_in as usize;
                        self.address_bytes += 1;
                        if self.address_bytes >= self.address_width {
                            self.state = EepromState::Write;
                        }
                    }
                    EepromState::Read => self.load_output(),
                    EepromState::Write => {
                        self.address &= self.mask;
                        self.data[self.address] = self.shift_in;
                        self.address += 1;
                    }
                    EepromState::Disabled => {}
                }
                // Acknowledge
                self.output = false;
            }
            self.bit_count = (self.bit_count + 1) % 9;
        }
    }

    fn load_output(&mut self) {
        self.address &= self.mask;
        self.shift_out = self.data[self.address];
        self.address += 1;
    }

    fn persist(&mut self) {
        let blob: String = self.data.iter().map(|b| format!("{b:02x}")).collect();
        self.storage.save(&blob);
    }

    pub(crate) fn snapshot(&self) -> EepromSnapshot {
        EepromSnapshot {
            data: self.data.clone(),
            state: self.state,
            address: self.address as u64,
            address_bytes: self.address_bytes,
            shift_in: self.shift_in,
            shift_out: self.shift_out,
            bit_count: self.bit_count,
            last_clock: self.last_clock,
            last_data: self.last_data,
            output: self.output,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &EepromSnapshot) {
        if snapshot.data.len() == self.data.len() {
            self.data.copy_from_slice(&snapshot.data);
        }
        self.state = snapshot.state;
        self.address = snapshot.address as usize;
        self.address_bytes = snapshot.address_bytes;
        self.shift_in = snapshot.shift_in;
        self.shift_out = snapshot.shift_out;
        self.bit_count = snapshot.bit_count;
        self.last_clock = snapshot.last_clock;
        self.last_data = snapshot.last_data;
        self.output = snapshot.output;
    }
}

/// Serializable protocol state, embedded in the machine save state.
#[derive(Serialize, Deserialize)]
pub struct EepromSnapshot {
    pub data: Vec<u8>,
    pub state: EepromState,
    pub address: u64,
    pub address_bytes: u32,
    pub shift_in: u8,
    pub shift_out: u8,
    pub bit_count: u8,
    pub last_clock: bool,
    pub last_data: bool,
    pub output: bool,
}

fn decode_hex(blob: &str) -> Option<Vec<u8>> {
    let blob = blob.trim();
    if blob.len() % 2 != 0 || !blob.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    blob.as_bytes()
        .chunks(2)
        .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).ok()?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the chip the way the firmware does: one line transition per
    /// update call, power always on.
    struct Host {
        eeprom: Eeprom,
        clock: bool,
        data: bool,
    }

    impl Host {
        fn new(eeprom: Eeprom) -> Self {
            let mut host = Host {
                eeprom,
                clock: false,
                data: false,
            };
            // Idle bus: both lines pulled high
            host.set_data(true);
            host.set_clock(true);
            host
        }

        fn set_clock(&mut self, level: bool) {
            self.clock = level;
            self.eeprom.update(true, self.clock, self.data);
        }

        fn set_data(&mut self, level: bool) {
            self.data = level;
            self.eeprom.update(true, self.clock, self.data);
        }

        fn start(&mut self) {
            // Data falls while the clock is high
            self.set_data(false);
        }

        fn stop(&mut self) {
            self.set_clock(false);
            self.set_data(false);
            self.set_clock(true);
            self.set_data(true);
        }

        fn write_byte(&mut self, byte: u8) {
            for bit in (0..8).rev() {
                self.set_clock(false);
                self.set_data(byte & (1 << bit) != 0);
                self.set_clock(true);
            }
            // Acknowledge slot
            self.set_clock(false);
            self.set_data(true);
            self.set_clock(true);
        }

        fn read_byte(&mut self) -> u8 {
            let mut byte = 0u8;
            for _ in 0..8 {
                self.set_clock(false);
                byte = (byte << 1) | self.eeprom.output() as u8;
                self.set_clock(true);
            }
            // Acknowledge slot
            self.set_clock(false);
            self.set_clock(true);
            byte
        }
    }

    fn blank_eeprom() -> Eeprom {
        Eeprom::new(DEFAULT_BIT_WIDTH, Box::new(MemoryStorage::new()))
    }

    #[test]
    fn powered_off_chip_is_disabled_and_nacks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut eeprom = blank_eeprom();
        eeprom.update(true, true, true);
        eeprom.update(true, true, false); // start
        assert_eq!(eeprom.state(), EepromState::Command);

        eeprom.update(false, true, false);
        assert_eq!(eeprom.state(), EepromState::Disabled);
        assert!(eeprom.output());
    }

    #[test]
    fn start_condition_enters_command_state() {
        let mut host = Host::new(blank_eeprom());
        host.start();
        assert_eq!(host.eeprom.state(), EepromState::Command);
    }

    #[test]
    fn write_command_walks_address_into_write_state() {
        let mut host = Host::new(blank_eeprom());
        host.start();
        host.write_byte(0xA0);
        assert_eq!(host.eeprom.state(), EepromState::Address);
        host.write_byte(0x01);
        assert_eq!(host.eeprom.state(), EepromState::Address);
        host.write_byte(0x23);
        assert_eq!(host.eeprom.state(), EepromState::Write);
    }

    #[test]
    fn write_session_stores_bytes_sequentially() {
        let mut host = Host::new(blank_eeprom());
        host.start();
        host.write_byte(0xA0);
        host.write_byte(0x01);
        host.write_byte(0x00);
        host.write_byte(0xDE);
        host.write_byte(0xAD);
        host.stop();

        assert_eq!(host.eeprom.data()[0x100], 0xDE);
        assert_eq!(host.eeprom.data()[0x101], 0xAD);
        assert_eq!(host.eeprom.state(), EepromState::Disabled);
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut host = Host::new(blank_eeprom());
        let payload = [0x11, 0x22, 0x33, 0x44];

        host.start();
        host.write_byte(0xA0);
        host.write_byte(0x00);
        host.write_byte(0x40);
        for byte in payload {
            host.write_byte(byte);
        }
        host.stop();

        // Random read: set the address with a write command, then restart
        // into a read session.
        host.start();
        host.write_byte(0xA0);
        host.write_byte(0x00);
        host.write_byte(0x40);
        host.start();
        host.write_byte(0xA1);
        for expected in payload {
            assert_eq!(host.read_byte(), expected);
        }
        host.stop();
    }

    #[test]
    fn address_wraps_at_capacity() {
        let mut host = Host::new(blank_eeprom());
        host.start();
        host.write_byte(0xA0);
        host.write_byte(0x0F);
        host.write_byte(0xFF); // last byte of the 4 KiB array
        host.write_byte(0xAA);
        host.write_byte(0xBB); // wraps to address 0
        host.stop();

        assert_eq!(host.eeprom.data()[0xFFF], 0xAA);
        assert_eq!(host.eeprom.data()[0x000], 0xBB);
    }

    #[test]
    fn stop_after_write_persists_hex_blob() {
        let storage = MemoryStorage::new();
        let mut host = Host::new(Eeprom::new(DEFAULT_BIT_WIDTH, Box::new(storage.clone())));

        host.start();
        host.write_byte(0xA0);
        host.write_byte(0x00);
        host.write_byte(0x00);
        host.write_byte(0x5A);
        host.stop();

        let blob = storage.blob().expect("stop condition persists");
        assert_eq!(blob.len(), 2 << DEFAULT_BIT_WIDTH);
        assert!(blob.starts_with("5a"));

        // Reloading from the persisted blob reproduces the array exactly.
        let reloaded = Eeprom::new(DEFAULT_BIT_WIDTH, Box::new(storage));
        assert_eq!(reloaded.data(), host.eeprom.data());
    }

    #[test]
    fn stop_without_write_session_does_not_persist() {
        let storage = MemoryStorage::new();
        let mut host = Host::new(Eeprom::new(DEFAULT_BIT_WIDTH, Box::new(storage.clone())));

        host.start();
        host.write_byte(0xA1); // read command
        host.read_byte();
        host.stop();

        assert!(storage.blob().is_none());
    }

    #[test]
    fn malformed_blob_falls_back_to_blank_array() {
        let storage = MemoryStorage::with_blob("zz-not-hex");
        let eeprom = Eeprom::new(DEFAULT_BIT_WIDTH, Box::new(storage));
        assert!(eeprom.data().iter().all(|&b| b == 0));
        assert_eq!(eeprom.data().len(), 1 << DEFAULT_BIT_WIDTH);
    }

    #[test]
    fn wrong_length_blob_falls_back_to_blank_array() {
        let storage = MemoryStorage::with_blob("aabb");
        let eeprom = Eeprom::new(DEFAULT_BIT_WIDTH, Box::new(storage));
        assert!(eeprom.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn hex_decode_accepts_upper_and_lower_case() {
        assert_eq!(decode_hex("DEad01"), Some(vec![0xDE, 0xAD, 0x01]));
        assert_eq!(decode_hex("0g"), None);
        assert_eq!(decode_hex("abc"), None);
    }
}
