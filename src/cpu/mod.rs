use bitflags::bitflags;
use thiserror::Error;

use crate::cpu_bus::CpuBus;
use crate::opcodes::{AddressingMode, Operation, OPCODE_TABLE};


bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const CARRY = 0b0000_0001;
        const ZERO = 0b0000_0010;
        const INTERRUPT_DISABLE = 0b0000_0100;
        const DECIMAL = 0b0000_1000;
        const BREAK = 0b0001_0000;
        const UNUSED = 0b0010_0000;
        const OVERFLOW = 0b0100_0000;
        const NEGATIVE = 0b1000_0000;
    }
}

/// Fatal execution failure. The only error that crosses the step boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CpuError {
    #[error("system has crashed (invalid operation {opcode:#04x} at {pc:#06x})")]
    InvalidOpcode { opcode: u8, pc: u16 },
}

/// A resolved operand location. Accumulator and implied modes never touch
/// the bus; everything else is a plain 16-bit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Memory(u16),
    Accumulator,
}

/// Read-only register view for inspectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSnapshot {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,
    pub cycles: f64,
}

pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: StatusFlags,
    /// Cycle budget countdown. The scheduler adds emulated cycles, each
    /// executed instruction subtracts its table cost.
    pub cycles: f64,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            a: 0,
            x: 0,
            y: 0,
            sp: 0,
            pc: 0,
            status: StatusFlags::empty(),
            cycles: 0.0,
        }
    }

    /// Clears registers, flags, and the cycle budget, then loads the program
    /// counter from the reset vector at 0xFFFC.
    pub fn reset(&mut self, bus: &mut dyn CpuBus) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0;
        self.status = StatusFlags::empty();
        self.cycles = 0.0;
        self.pc = bus.read_u16(0xFFFC);
    }

    /// Packed status byte. Bit 5 reads as set; BREAK is never stored and
    /// only appears on the stack frame of a BRK-sourced interrupt.
    pub fn status_byte(&self) -> u8 {
        ((self.status - StatusFlags::BREAK) | StatusFlags::UNUSED).bits()
    }

    pub fn set_status_byte(&mut self, value: u8) {
        self.status =
            StatusFlags::from_bits_truncate(value) - StatusFlags::BREAK - StatusFlags::UNUSED;
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            a: self.a,
            x: self.x,
            y: self.y,
            sp: self.sp,
            pc: self.pc,
            status: self.status_byte(),
            cycles: self.cycles,
        }
    }

    /// Executes one instruction, servicing a pending IRQ first when
    /// interrupts are enabled. Returns the cycle cost of the executed
    /// instruction.
    pub fn step(&mut self, bus: &mut dyn CpuBus) -> Result<u8, CpuError> {
        if !self.status.contains(StatusFlags::INTERRUPT_DISABLE) && bus.pending_irq() != 0 {
            self.irq(bus, false);
        }

        let pc = self.pc;
        let opcode = self.fetch(bus);
        let Some(entry) = OPCODE_TABLE[opcode as usize] else {
            log::error!("invalid operation {:#04x} at {:#06x}", opcode, pc);
            return Err(CpuError::InvalidOpcode { opcode, pc });
        };

        let operand = self.resolve(entry.mode, bus);
        self.execute(entry.operation, operand, bus);
        self.cycles -= entry.cycles as f64;
        Ok(entry.cycles)
    }

    /// Non-maskable interrupt entry. Pushes PC and status (without BREAK)
    /// and vectors through 0xFFFA. Does not set INTERRUPT_DISABLE.
    pub fn nmi(&mut self, bus: &mut dyn CpuBus) {
        self.push(bus, (self.pc >> 8) as u8);
        self.push(bus, (self.pc & 0xFF) as u8);
        self.push(bus, self.status_byte());
        self.pc = bus.read_u16(0xFFFA);
    }

    /// Maskable interrupt entry. The vector read at 0xFFFE/0xFFFF goes
    /// through the bus, which resolves it against the priority table.
    pub fn irq(&mut self, bus: &mut dyn CpuBus, from_break: bool) {
        let brk = if from_break {
            StatusFlags::BREAK.bits()
        } else {
            0
        };
        self.push(bus, (self.pc >> 8) as u8);
        self.push(bus, (self.pc & 0xFF) as u8);
        self.push(bus, self.status_byte() | brk);
        self.pc = bus.read_u16(0xFFFE);
        self.status.insert(StatusFlags::INTERRUPT_DISABLE);
    }

    fn fetch(&mut self, bus: &mut dyn CpuBus) -> u8 {
        let data = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        data
    }

    fn fetch_u16(&mut self, bus: &mut dyn CpuBus) -> u16 {
        let lo = self.fetch(bus) as u16;
        let hi = self.fetch(bus) as u16;
        (hi << 8) | lo
    }

    fn push(&mut self, bus: &mut dyn CpuBus, data: u8) {
        bus.write(0x100 | self.sp as u16, data);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pull(&mut self, bus: &mut dyn CpuBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x100 | self.sp as u16)
    }

    fn resolve(&mut self, mode: AddressingMode, bus: &mut dyn CpuBus) -> Operand {
        match mode {
            AddressingMode::Implied | AddressingMode::Accumulator => Operand::Accumulator,
            AddressingMode::Immediate => {
                let addr = self.pc;
                self.pc = self.pc.wrapping_add(1);
                Operand::Memory(addr)
            }
            AddressingMode::ZeroPage => Operand::Memory(self.fetch(bus) as u16),
            AddressingMode::ZeroPageX => {
                Operand::Memory(self.fetch(bus).wrapping_add(self.x) as u16)
            }
            AddressingMode::ZeroPageY => {
                Operand::Memory(self.fetch(bus).wrapping_add(self.y) as u16)
            }
            AddressingMode::Relative => {
                let offset = self.fetch(bus) as i8;
                Operand::Memory(self.pc.wrapping_add(offset as u16))
            }
            AddressingMode::Absolute => Operand::Memory(self.fetch_u16(bus)),
            AddressingMode::AbsoluteX => {
                Operand::Memory(self.fetch_u16(bus).wrapping_add(self.x as u16))
            }
            AddressingMode::AbsoluteY => {
                Operand::Memory(self.fetch_u16(bus).wrapping_add(self.y as u16))
            }
            AddressingMode::Indirect => {
                // The high pointer byte is fetched without a page carry,
                // reproducing the hardware JMP (indirect) quirk.
                let ptr = self.fetch_u16(bus);
                let lo = bus.read(ptr) as u16;
                let hi = bus.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF)) as u16;
                Operand::Memory((hi << 8) | lo)
            }
            AddressingMode::IndirectX => {
                let zp = self.fetch(bus).wrapping_add(self.x);
                let lo = bus.read(zp as u16) as u16;
                let hi = bus.read(zp.wrapping_add(1) as u16) as u16;
                Operand::Memory((hi << 8) | lo)
            }
            AddressingMode::IndirectY => {
                let zp = self.fetch(bus);
                let lo = bus.read(zp as u16) as u16;
                let hi = bus.read(zp.wrapping_add(1) as u16) as u16;
                Operand::Memory(((hi << 8) | lo).wrapping_add(self.y as u16))
            }
        }
    }

    // Operand reads and writes funnel through these two entry points so
    // accumulator-mode instructions share code with memory-mode ones.
    fn load(&mut self, operand: Operand, bus: &mut dyn CpuBus) -> u8 {
        match operand {
            Operand::Memory(addr) => bus.read(addr),
            Operand::Accumulator => self.a,
        }
    }

    fn store(&mut self, operand: Operand, bus: &mut dyn CpuBus, value: u8) {
        match operand {
            Operand::Memory(addr) => bus.write(addr, value),
            Operand::Accumulator => self.a = value,
        }
    }

    fn execute(&mut self, operation: Operation, operand: Operand, bus: &mut dyn CpuBus) {
        match operation {
            Operation::Lda => {
                self.a = self.load(operand, bus);
                self.set_zn(self.a);
            }
            Operation::Ldx => {
                self.x = self.load(operand, bus);
                self.set_zn(self.x);
            }
            Operation::Ldy => {
                self.y = self.load(operand, bus);
                self.set_zn(self.y);
            }
            Operation::Sta => self.store(operand, bus, self.a),
            Operation::Stx => self.store(operand, bus, self.x),
            Operation::Sty => self.store(operand, bus, self.y),

            Operation::Tax => {
                self.x = self.a;
                self.set_zn(self.x);
            }
            Operation::Tay => {
                self.y = self.a;
                self.set_zn(self.y);
            }
            Operation::Tsx => {
                self.x = self.sp;
                self.set_zn(self.x);
            }
            Operation::Txa => {
                self.a = self.x;
                self.set_zn(self.a);
            }
            Operation::Txs => self.sp = self.x,
            Operation::Tya => {
                self.a = self.y;
                self.set_zn(self.a);
            }

            Operation::Pha => self.push(bus, self.a),
            Operation::Php => {
                let status = self.status_byte() | StatusFlags::BREAK.bits();
                self.push(bus, status);
            }
            Operation::Pla => {
                self.a = self.pull(bus);
                self.set_zn(self.a);
            }
            Operation::Plp => {
                let status = self.pull(bus);
                self.set_status_byte(status);
            }

            Operation::Adc => {
                let value = self.load(operand, bus);
                self.adc(value);
            }
            Operation::Sbc => {
                let value = self.load(operand, bus);
                self.sbc(value);
            }
            Operation::Cmp => {
                let value = self.load(operand, bus);
                self.compare(self.a, value);
            }
            Operation::Cpx => {
                let value = self.load(operand, bus);
                self.compare(self.x, value);
            }
            Operation::Cpy => {
                let value = self.load(operand, bus);
                self.compare(self.y, value);
            }

            Operation::And => {
                self.a &= self.load(operand, bus);
                self.set_zn(self.a);
            }
            Operation::Ora => {
                self.a |= self.load(operand, bus);
                self.set_zn(self.a);
            }
            Operation::Eor => {
                self.a ^= self.load(operand, bus);
                self.set_zn(self.a);
            }
            Operation::Bit => {
                let value = self.load(operand, bus);
                self.status.set(StatusFlags::ZERO, self.a & value == 0);
                self.status.set(StatusFlags::NEGATIVE, value & 0x80 != 0);
                self.status.set(StatusFlags::OVERFLOW, value & 0x40 != 0);
            }

            Operation::Asl => {
                let value = self.load(operand, bus);
                self.status.set(StatusFlags::CARRY, value & 0x80 != 0);
                let result = value << 1;
                self.store(operand, bus, result);
                self.set_zn(result);
            }
            Operation::Lsr => {
                let value = self.load(operand, bus);
                self.status.set(StatusFlags::CARRY, value & 0x01 != 0);
                let result = value >> 1;
                self.store(operand, bus, result);
                self.set_zn(result);
            }
            Operation::Rol => {
                let value = self.load(operand, bus);
                let carry_in = self.status.contains(StatusFlags::CARRY) as u8;
                self.status.set(StatusFlags::CARRY, value & 0x80 != 0);
                let result = (value << 1) | carry_in;
                self.store(operand, bus, result);
                self.set_zn(result);
            }
            Operation::Ror => {
                let value = self.load(operand, bus);
                let carry_in = self.status.contains(StatusFlags::CARRY) as u8;
                self.status.set(StatusFlags::CARRY, value & 0x01 != 0);
                let result = (value >> 1) | (carry_in << 7);
                self.store(operand, bus, result);
                self.set_zn(result);
            }

            Operation::Inc => {
                let result = self.load(operand, bus).wrapping_add(1);
                self.store(operand, bus, result);
                self.set_zn(result);
            }
            Operation::Dec => {
                let result = self.load(operand, bus).wrapping_sub(1);
                self.store(operand, bus, result);
                self.set_zn(result);
            }
            Operation::Inx => {
                self.x = self.x.wrapping_add(1);
                self.set_zn(self.x);
            }
            Operation::Iny => {
                self.y = self.y.wrapping_add(1);
                self.set_zn(self.y);
            }
            Operation::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.set_zn(self.x);
            }
            Operation::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.set_zn(self.y);
            }

            Operation::Jmp => {
                if let Operand::Memory(target) = operand {
                    self.pc = target;
                }
            }
            Operation::Jsr => {
                if let Operand::Memory(target) = operand {
                    let ret = self.pc.wrapping_sub(1);
                    self.push(bus, (ret >> 8) as u8);
                    self.push(bus, (ret & 0xFF) as u8);
                    self.pc = target;
                }
            }
            Operation::Rts => {
                let lo = self.pull(bus) as u16;
                let hi = self.pull(bus) as u16;
                self.pc = ((hi << 8) | lo).wrapping_add(1);
            }
            Operation::Rti => {
                let status = self.pull(bus);
                self.set_status_byte(status);
                let lo = self.pull(bus) as u16;
                let hi = self.pull(bus) as u16;
                self.pc = (hi << 8) | lo;
            }

            Operation::Bcc => self.branch(operand, !self.status.contains(StatusFlags::CARRY)),
            Operation::Bcs => self.branch(operand, self.status.contains(StatusFlags::CARRY)),
            Operation::Bne => self.branch(operand, !self.status.contains(StatusFlags::ZERO)),
            Operation::Beq => self.branch(operand, self.status.contains(StatusFlags::ZERO)),
            Operation::Bpl => self.branch(operand, !self.status.contains(StatusFlags::NEGATIVE)),
            Operation::Bmi => self.branch(operand, self.status.contains(StatusFlags::NEGATIVE)),
            Operation::Bvc => self.branch(operand, !self.status.contains(StatusFlags::OVERFLOW)),
            Operation::Bvs => self.branch(operand, self.status.contains(StatusFlags::OVERFLOW)),

            Operation::Clc => self.status.remove(StatusFlags::CARRY),
            Operation::Cld => self.status.remove(StatusFlags::DECIMAL),
            Operation::Cli => self.status.remove(StatusFlags::INTERRUPT_DISABLE),
            Operation::Clv => self.status.remove(StatusFlags::OVERFLOW),
            Operation::Sec => self.status.insert(StatusFlags::CARRY),
            Operation::Sed => self.status.insert(StatusFlags::DECIMAL),
            Operation::Sei => self.status.insert(StatusFlags::INTERRUPT_DISABLE),

            Operation::Brk => {
                // BRK carries a padding byte that the return address skips.
                self.fetch(bus);
                self.irq(bus, true);
            }
            Operation::Nop => {}
        }
    }

    fn branch(&mut self, operand: Operand, condition: bool) {
        if let Operand::Memory(target) = operand {
            if condition {
                self.pc = target;
            }
        }
    }

    fn set_zn(&mut self, value: u8) {
        self.status.set(StatusFlags::ZERO, value == 0);
        self.status.set(StatusFlags::NEGATIVE, value & 0x80 != 0);
    }

    fn adc(&mut self, value: u8) {
        let carry = self.status.contains(StatusFlags::CARRY) as u16;
        let a = self.a as u16;
        let v = value as u16;
        let sum = a + v + carry;

        self.status.set(StatusFlags::ZERO, sum as u8 == 0);
        self.status
            .set(StatusFlags::OVERFLOW, (a ^ sum) & (v ^ sum) & 0x80 != 0);

        if self.status.contains(StatusFlags::DECIMAL) {
            let mut lo = (a & 0x0F) + (v & 0x0F) + carry;
            let mut hi = (a & 0xF0) + (v & 0xF0);
            if lo > 0x09 {
                lo += 0x06;
                hi += 0x10;
            }
            if hi > 0x90 {
                hi += 0x60;
            }
            self.status.set(StatusFlags::CARRY, hi > 0xFF);
            let result = ((hi & 0xF0) | (lo & 0x0F)) as u8;
            self.status.set(StatusFlags::NEGATIVE, result & 0x80 != 0);
            self.a = result;
        } else {
            self.status.set(StatusFlags::CARRY, sum > 0xFF);
            let result = sum as u8;
            self.status.set(StatusFlags::NEGATIVE, result & 0x80 != 0);
            self.a = result;
        }
    }

    fn sbc(&mut self, value: u8) {
        let borrow = 1 - self.status.contains(StatusFlags::CARRY) as i16;
        let a = self.a as i16;
        let v = value as i16;
        let diff = a - v - borrow;

        let result = diff as u8;
        self.status.set(StatusFlags::ZERO, result == 0);
        self.status.set(StatusFlags::NEGATIVE, result & 0x80 != 0);
        self.status
            .set(StatusFlags::OVERFLOW, (a ^ v) & (a ^ diff) & 0x80 != 0);
        self.status.set(StatusFlags::CARRY, diff >= 0);

        if self.status.contains(StatusFlags::DECIMAL) {
            let mut lo = (a & 0x0F) - (v & 0x0F) - borrow;
            let mut hi = (a & 0xF0) - (v & 0xF0);
            if lo < 0 {
                lo -= 0x06;
                hi -= 0x10;
            }
            if hi < 0 {
                hi -= 0x60;
            }
            self.a = (hi as u8 & 0xF0) | (lo as u8 & 0x0F);
        } else {
            self.a = result;
        }
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.status.set(StatusFlags::CARRY, register >= value);
        self.set_zn(register.wrapping_sub(value));
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
