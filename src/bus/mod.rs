//! Banked, mirrored memory bus.
//!
//! All 65536 addresses dispatch through two slot tables built at
//! construction time, one for reads and one for writes. A slot pairs a
//! region strategy with the byte offset it was bound to when its 256-byte
//! bank was installed, so lookups never compute a mirror address at access
//! time. Every address has exactly one read slot and one write slot; there
//! are no unmapped holes.

use bitflags::bitflags;

use crate::cpu_bus::CpuBus;
use crate::eeprom::{Eeprom, EepromStorage, DEFAULT_BIT_WIDTH};

pub(crate) mod irq;
mod registers;

pub const WRAM_SIZE: usize = 0x600;
pub const DRAM_SIZE: usize = 0x200;
/// Minimum boot image: the static window alone needs this much.
pub const BOOT_IMAGE_MIN: usize = 0x4000;
/// Size of one bankable window, and the stride between banks in the image.
pub const BANK_WINDOW: usize = 0x8000;
pub const BANK_COUNT: usize = 20;

bitflags! {
    /// Per-address access tracking bits, cleared by observers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
    }
}

/// Read dispatch strategy, bound to its backing offset at install time.
#[derive(Clone, Copy)]
enum ReadSlot {
    Wram(u16),
    Dram(u16),
    Register(u8),
    /// Absolute offset into the boot image (static or banked window).
    Rom(u32),
    /// 0xFFFE: low byte of the priority-encoded IRQ vector.
    VectorLo,
    /// 0xFFFF: high byte of the priority-encoded IRQ vector.
    VectorHi,
}

#[derive(Clone, Copy)]
enum WriteSlot {
    Wram(u16),
    Dram(u16),
    Register(u8),
    /// Writes into ROM windows are silently discarded.
    Discard,
}

pub struct Bus {
    read_map: Vec<ReadSlot>,
    write_map: Vec<WriteSlot>,
    access: Vec<u8>,

    pub(crate) wram: [u8; WRAM_SIZE],
    pub(crate) dram: [u8; DRAM_SIZE],
    pub(crate) cpureg: [u8; 0x100],

    boot: Vec<u8>,
    /// One vector per possible pending mask, precomputed at construction.
    irq_vectors: Vec<u16>,

    pub(crate) eeprom: Eeprom,

    /// Keypad bitmask, four active-low buttons.
    pub(crate) keys: u8,
    pub(crate) figure: Option<Vec<u8>>,
}

impl Bus {
    /// `boot` must already be validated to hold at least [`BOOT_IMAGE_MIN`]
    /// bytes.
    pub(crate) fn new(boot: Vec<u8>, storage: Box<dyn EepromStorage>) -> Self {
        let irq_vectors = irq::build_vector_table(&boot);
        let mut bus = Bus {
            read_map: vec![ReadSlot::Rom(0); 0x10000],
            write_map: vec![WriteSlot::Discard; 0x10000],
            access: vec![0; 0x10000],
            wram: [0; WRAM_SIZE],
            dram: [0; DRAM_SIZE],
            cpureg: [0; 0x100],
            boot,
            irq_vectors,
            eeprom: Eeprom::new(DEFAULT_BIT_WIDTH, storage),
            keys: 0x0F,
            figure: None,
        };
        bus.map_regions();
        bus
    }

    /// Installs every region's slots, bank by bank. Called once; only the
    /// bankable window is ever reinstalled afterwards.
    fn map_regions(&mut self) {
        // System RAM, mirrored across 0x0000-0x0FFF
        for bank in (0x0000..0x1000).step_by(0x100) {
            let base = bank % WRAM_SIZE;
            for i in 0..0x100 {
                self.read_map[bank + i] = ReadSlot::Wram((base + i) as u16);
                self.write_map[bank + i] = WriteSlot::Wram((base + i) as u16);
            }
        }

        // Display RAM, mirrored across 0x1000-0x2FFF
        for bank in (0x1000..0x3000).step_by(0x100) {
            let base = bank % DRAM_SIZE;
            for i in 0..0x100 {
                self.read_map[bank + i] = ReadSlot::Dram((base + i) as u16);
                self.write_map[bank + i] = WriteSlot::Dram((base + i) as u16);
            }
        }

        // Control registers, replicated across all sixteen mirrors
        for bank in (0x3000..0x4000).step_by(0x100) {
            for i in 0..0x100 {
                self.read_map[bank + i] = ReadSlot::Register(i as u8);
                self.write_map[bank + i] = WriteSlot::Register(i as u8);
            }
        }

        // Bankable ROM window
        self.set_rom_page(0);

        // Static boot ROM
        for addr in 0xC000..=0xFFFF {
            self.read_map[addr] = ReadSlot::Rom((addr - 0xC000) as u32);
            self.write_map[addr] = WriteSlot::Discard;
        }

        // The top two addresses source the interrupt vector table instead
        // of raw ROM.
        self.read_map[0xFFFE] = ReadSlot::VectorLo;
        self.read_map[0xFFFF] = ReadSlot::VectorHi;
    }

    /// Reinstalls the bankable window for the selected bank. The whole
    /// 0x4000-0xBFFF range is remapped on every bank-register write.
    pub(crate) fn set_rom_page(&mut self, bank: u8) {
        let offset = BANK_WINDOW * (bank as usize % BANK_COUNT);
        for addr in 0x4000..0xC000 {
            self.read_map[addr] = ReadSlot::Rom((offset + addr - 0x4000) as u32);
            self.write_map[addr] = WriteSlot::Discard;
        }
    }

    /// Tracked read: marks the address as read-accessed.
    pub fn read(&mut self, addr: u16) -> u8 {
        self.access[addr as usize] |= Access::READ.bits();
        self.peek(addr)
    }

    /// Untracked read for inspectors; identical dispatch, no access flag.
    pub fn peek(&self, addr: u16) -> u8 {
        match self.read_map[addr as usize] {
            ReadSlot::Wram(offset) => self.wram[offset as usize],
            ReadSlot::Dram(offset) => self.dram[offset as usize],
            ReadSlot::Register(reg) => self.register_read(reg),
            ReadSlot::Rom(offset) => {
                // Banks past the end of the image read as unprogrammed ROM.
                self.boot.get(offset as usize).copied().unwrap_or(0xFF)
            }
            ReadSlot::VectorLo => (self.irq_vectors[self.pending_irq() as usize] & 0xFF) as u8,
            ReadSlot::VectorHi => (self.irq_vectors[self.pending_irq() as usize] >> 8) as u8,
        }
    }

    pub fn write(&mut self, addr: u16, data: u8) {
        self.access[addr as usize] |= Access::WRITE.bits();
        match self.write_map[addr as usize] {
            WriteSlot::Wram(offset) => self.wram[offset as usize] = data,
            WriteSlot::Dram(offset) => self.dram[offset as usize] = data,
            WriteSlot::Register(reg) => self.register_write(reg, data),
            WriteSlot::Discard => {}
        }
    }

    pub fn wram(&self) -> &[u8] {
        &self.wram
    }

    pub fn dram(&self) -> &[u8] {
        &self.dram
    }

    pub fn registers(&self) -> &[u8] {
        &self.cpureg
    }

    pub fn access_flags(&self) -> &[u8] {
        &self.access
    }

    pub fn clear_access_flags(&mut self) {
        self.access.fill(0);
    }

    pub fn keys(&self) -> u8 {
        self.keys
    }

    pub fn set_keys(&mut self, keys: u8) {
        self.keys = keys & 0x0F;
    }

    /// Takes ownership of an accessory image; its presence feeds the port A
    /// input bits until another figure replaces it.
    pub fn insert_figure(&mut self, data: Vec<u8>) {
        self.figure = Some(data);
    }

    pub fn figure(&self) -> Option<&[u8]> {
        self.figure.as_deref()
    }

    pub fn eeprom(&self) -> &Eeprom {
        &self.eeprom
    }
}

impl CpuBus for Bus {
    fn read(&mut self, addr: u16) -> u8 {
        Bus::read(self, addr)
    }

    fn write(&mut self, addr: u16, data: u8) {
        Bus::write(self, addr, data)
    }

    fn pending_irq(&self) -> u16 {
        Bus::pending_irq(self)
    }
}
