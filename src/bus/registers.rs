//! Control-register dispatch for the 0x3000-0x3FFF block.
//!
//! Behavior is selected by register index, so the same pair of handlers
//! serves all sixteen mirrors of the block. Registers without special
//! behavior fall back to plain pass-through storage; unknown ones
//! additionally leave a debug trace.

use super::Bus;

pub(crate) const REG_BANK_SELECT: u8 = 0x00;
pub(crate) const REG_PORTA_DIR: u8 = 0x11;
pub(crate) const REG_PORTA_DATA: u8 = 0x12;
pub(crate) const REG_PORTB_DIR: u8 = 0x15;
pub(crate) const REG_PORTB_DATA: u8 = 0x16;
pub(crate) const REG_IRQ_ENABLE_HI: u8 = 0x70;
pub(crate) const REG_IRQ_ENABLE_LO: u8 = 0x71;
pub(crate) const REG_IRQ_PENDING_HI: u8 = 0x73;
pub(crate) const REG_IRQ_PENDING_LO: u8 = 0x74;
pub(crate) const REG_NMI_ENABLE: u8 = 0x76;

/// Accessory power line in port A: when driven high, the figure contacts
/// are switched off the input path.
const PORTA_ACCESSORY_POWER: u8 = 0x10;

/// Registers with no side effects whose traffic is expected; they read and
/// write as plain storage without a trace.
fn is_plain(reg: u8) -> bool {
    matches!(
        reg,
        0x01 | 0x04 | 0x10 | 0x14 | 0x31 | REG_IRQ_ENABLE_HI | REG_IRQ_ENABLE_LO | REG_NMI_ENABLE
    )
}

impl Bus {
    pub(crate) fn register_read(&self, reg: u8) -> u8 {
        match reg {
            REG_PORTA_DATA => self.read_porta(),
            REG_PORTB_DATA => self.read_portb(),
            REG_BANK_SELECT
            | REG_PORTA_DIR
            | REG_PORTB_DIR
            | REG_IRQ_PENDING_HI
            | REG_IRQ_PENDING_LO => self.cpureg[reg as usize],
            // Reads of this register always see 0xFF, whatever was stored.
            0xB7 => {
                log::debug!(
                    "unhandled register read ({:#06x}) -> 0xff",
                    0x3000 + reg as u16
                );
                0xFF
            }
            _ if is_plain(reg) => self.cpureg[reg as usize],
            _ => {
                log::debug!("unhandled register read ({:#06x})", 0x3000 + reg as u16);
                self.cpureg[reg as usize]
            }
        }
    }

    pub(crate) fn register_write(&mut self, reg: u8, data: u8) {
        match reg {
            REG_BANK_SELECT => {
                self.cpureg[reg as usize] = data;
                self.set_rom_page(data);
            }
            // Port A has no outgoing wiring; the latch alone matters.
            REG_PORTA_DIR | REG_PORTA_DATA => {
                self.cpureg[reg as usize] = data;
            }
            REG_PORTB_DIR | REG_PORTB_DATA => {
                self.cpureg[reg as usize] = data;
                self.update_eeprom_lines();
            }
            // Write-1-to-clear pending interrupt flags
            REG_IRQ_PENDING_HI | REG_IRQ_PENDING_LO => {
                self.cpureg[reg as usize] &= !data;
            }
            _ if is_plain(reg) => {
                self.cpureg[reg as usize] = data;
            }
            _ => {
                log::debug!(
                    "unhandled register write ({:#06x}) = {:#04x}",
                    0x3000 + reg as u16,
                    data
                );
                self.cpureg[reg as usize] = data;
            }
        }
    }

    /// Port A input: keypad bits merged with the figure-present bits, the
    /// latter gated off while the accessory power line is driven.
    fn read_porta(&self) -> u8 {
        let dir = self.cpureg[REG_PORTA_DIR as usize];
        let data = self.cpureg[REG_PORTA_DATA as usize];
        let accessory_power = dir & data & PORTA_ACCESSORY_POWER;
        let figure = if accessory_power != 0 {
            0
        } else {
            self.figure.is_some() as u8
        };
        let input = self.keys | (figure << 5);
        (dir & data) | (!dir & input)
    }

    /// Port B input: the EEPROM data line shows through the undriven bits.
    fn read_portb(&self) -> u8 {
        let dir = self.cpureg[REG_PORTB_DIR as usize];
        let input = self.eeprom.output() as u8;
        (dir & self.cpureg[REG_PORTB_DATA as usize]) | (!dir & input)
    }

    /// Recomputes the EEPROM bus lines from direction mask, pulled-up
    /// defaults, and the data latch, then clocks the protocol state
    /// machine. Runs on every write to either port B register.
    fn update_eeprom_lines(&mut self) {
        let dir = self.cpureg[REG_PORTB_DIR as usize];
        let lines = !dir | self.cpureg[REG_PORTB_DATA as usize];
        self.eeprom
            .update(lines & 0x04 != 0, lines & 0x02 != 0, lines & 0x01 != 0);
    }
}
