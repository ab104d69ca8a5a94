//! Whole-machine snapshot, serialized as JSON.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::eeprom::EepromSnapshot;
use crate::emulator::Emulator;

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("save state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("save state format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("save state version {found} is not supported (current: {current})")]
    Version { found: u32, current: u32 },
    #[error("save state field `{field}` has the wrong length")]
    BadLength { field: &'static str },
}

#[derive(Serialize, Deserialize)]
pub struct CpuSaveState {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,
    pub cycles: f64,
}

#[derive(Serialize, Deserialize)]
pub struct SaveState {
    pub version: u32,
    pub cpu: CpuSaveState,
    pub wram: Vec<u8>,
    pub dram: Vec<u8>,
    pub cpureg: Vec<u8>,
    pub keys: u8,
    pub figure: Option<Vec<u8>>,
    pub eeprom: EepromSnapshot,
    pub tick_timer: i64,
}

impl SaveState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn capture(emulator: &Emulator) -> Self {
        SaveState {
            version: Self::CURRENT_VERSION,
            cpu: CpuSaveState {
                a: emulator.cpu.a,
                x: emulator.cpu.x,
                y: emulator.cpu.y,
                sp: emulator.cpu.sp,
                pc: emulator.cpu.pc,
                status: emulator.cpu.status_byte(),
                cycles: emulator.cpu.cycles,
            },
            wram: emulator.bus.wram.to_vec(),
            dram: emulator.bus.dram.to_vec(),
            cpureg: emulator.bus.cpureg.to_vec(),
            keys: emulator.bus.keys,
            figure: emulator.bus.figure.clone(),
            eeprom: emulator.bus.eeprom.snapshot(),
            tick_timer: emulator.tick_timer(),
        }
    }

    /// Restores a captured state into the machine. The banked window is
    /// reinstalled from the restored bank register and access flags start
    /// out cleared.
    pub fn apply(&self, emulator: &mut Emulator) -> Result<(), SaveStateError> {
        if self.version > Self::CURRENT_VERSION {
            return Err(SaveStateError::Version {
                found: self.version,
                current: Self::CURRENT_VERSION,
            });
        }
        if self.wram.len() != emulator.bus.wram.len() {
            return Err(SaveStateError::BadLength { field: "wram" });
        }
        if self.dram.len() != emulator.bus.dram.len() {
            return Err(SaveStateError::BadLength { field: "dram" });
        }
        if self.cpureg.len() != emulator.bus.cpureg.len() {
            return Err(SaveStateError::BadLength { field: "cpureg" });
        }

        emulator.cpu.a = self.cpu.a;
        emulator.cpu.x = self.cpu.x;
        emulator.cpu.y = self.cpu.y;
        emulator.cpu.sp = self.cpu.sp;
        emulator.cpu.pc = self.cpu.pc;
        emulator.cpu.set_status_byte(self.cpu.status);
        emulator.cpu.cycles = self.cpu.cycles;

        emulator.bus.wram.copy_from_slice(&self.wram);
        emulator.bus.dram.copy_from_slice(&self.dram);
        emulator.bus.cpureg.copy_from_slice(&self.cpureg);
        emulator.bus.keys = self.keys;
        emulator.bus.figure = self.figure.clone();
        emulator.bus.eeprom.restore(&self.eeprom);
        emulator.set_tick_timer(self.tick_timer);

        let bank = emulator.bus.cpureg[0];
        emulator.bus.set_rom_page(bank);
        emulator.bus.clear_access_flags();
        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), SaveStateError> {
        let json = serde_json::to_string(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, SaveStateError> {
        let mut file = File::open(path)?;
        let mut json = String::new();
        file.read_to_string(&mut json)?;
        let state: SaveState = serde_json::from_str(&json)?;
        if state.version > Self::CURRENT_VERSION {
            return Err(SaveStateError::Version {
                found: state.version,
                current: Self::CURRENT_VERSION,
            });
        }
        Ok(state)
    }
}

impl Emulator {
    pub fn save_state(&self) -> SaveState {
        SaveState::capture(self)
    }

    pub fn load_state(&mut self, state: &SaveState) -> Result<(), SaveStateError> {
        state.apply(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::irq::VECTOR_TABLE_OFFSET;
    use crate::bus::BANK_WINDOW;

    fn test_boot_image() -> Vec<u8> {
        let mut image = vec![0xEA; BANK_WINDOW * 2];
        for line in 0..16usize {
            image[VECTOR_TABLE_OFFSET + line * 2] = 0x00;
            image[VECTOR_TABLE_OFFSET + line * 2 + 1] = 0xE1;
        }
        image[0x3FFC] = 0x00;
        image[0x3FFD] = 0xE0;
        image
    }

    #[test]
    fn round_trip_restores_machine() {
        let mut emulator = Emulator::new(test_boot_image()).unwrap();
        emulator.cpu.a = 0x42;
        emulator.cpu.cycles = -1.5;
        emulator.bus.write(0x0123, 0x77);
        emulator.bus.write(0x1042, 0x88);
        emulator.bus.write(0x3000, 1); // switch to bank 1
        emulator.set_keys(0x0B);
        emulator.insert_figure(vec![1, 2, 3]);
        let state = emulator.save_state();

        let mut restored = Emulator::new(test_boot_image()).unwrap();
        restored.load_state(&state).unwrap();

        assert_eq!(restored.cpu.a, 0x42);
        assert_eq!(restored.cpu.cycles, -1.5);
        assert_eq!(restored.bus.peek(0x0123), 0x77);
        assert_eq!(restored.bus.peek(0x1042), 0x88);
        assert_eq!(restored.keys(), 0x0B);
        assert_eq!(restored.bus.figure(), Some(&[1u8, 2, 3][..]));
        // The banked window follows the restored bank register
        assert_eq!(restored.bus.registers()[0], 1);
        assert_eq!(restored.bus.peek(0x4000), emulator.bus.peek(0x4000));
    }

    #[test]
    fn file_round_trip() {
        let mut emulator = Emulator::new(test_boot_image()).unwrap();
        emulator.cpu.x = 0x5A;
        let path = std::env::temp_dir().join("tamago-savestate-test.json");

        emulator.save_state().save_to_file(&path).unwrap();
        let state = SaveState::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(state.cpu.x, 0x5A);
        assert_eq!(state.version, SaveState::CURRENT_VERSION);
    }

    #[test]
    fn future_version_is_rejected() {
        let emulator = Emulator::new(test_boot_image()).unwrap();
        let mut state = emulator.save_state();
        state.version = SaveState::CURRENT_VERSION + 1;

        let mut target = Emulator::new(test_boot_image()).unwrap();
        assert!(matches!(
            target.load_state(&state),
            Err(SaveStateError::Version { .. })
        ));
    }
}
