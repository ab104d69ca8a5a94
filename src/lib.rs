//! Emulator core for a 6502-based Tamagotchi handheld.
//!
//! The crate models the hard hardware core only: cycle-counted instruction
//! execution, a banked and mirrored 16-bit bus with per-address access
//! tracking, a priority-encoded interrupt controller, a bit-banged two-wire
//! serial EEPROM, and the wall-clock scheduler that drives them. Rendering,
//! disassembly, and other inspectors live outside the crate and consume the
//! read-only observer surface on [`Emulator`].

pub mod bus;
pub mod cpu;
pub mod cpu_bus;
pub mod eeprom;
pub mod emulator;
pub mod opcodes;
pub mod savestate;
pub mod storage;

pub use bus::{Access, Bus};
pub use cpu::{Cpu, CpuError, CpuSnapshot, Operand, StatusFlags};
pub use cpu_bus::CpuBus;
pub use eeprom::{Eeprom, EepromState, EepromStorage, MemoryStorage};
pub use emulator::{Emulator, EmulatorError, CLOCK_RATE};
pub use opcodes::{AddressingMode, Opcode, Operation, OPCODE_TABLE};
pub use savestate::{SaveState, SaveStateError};
pub use storage::FileStorage;
