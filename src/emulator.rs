//! The machine facade: CPU plus bus plus the real-time scheduler.

use std::time::Instant;

use thiserror::Error;

use crate::bus::{Bus, BOOT_IMAGE_MIN};
use crate::cpu::{Cpu, CpuError, CpuSnapshot};
use crate::eeprom::{EepromStorage, MemoryStorage};

/// Emulated CPU clock, 4 MHz.
pub const CLOCK_RATE: f64 = 4_000_000.0;

/// Longest wall-clock slice converted per realtime call. Anything above
/// this (a paused tab, a stopped debugger) is dropped instead of replayed
/// as a burst.
const MAX_ADVANCE: f64 = 1.0;

/// Cycle-domain period of the periodic tick line: half the clock rate.
const TICK_PERIOD: i64 = 2_000_000;

/// Periodic interrupt line, phase-locked to emulated time.
const IRQ_LINE_TICK: u8 = 13;
/// Fired once per scheduler invocation. The cadence is the host callback
/// rate, not a hardware rate; kept as-is.
const IRQ_LINE_FRAME: u8 = 10;
const NMI_LINE_FRAME: u8 = 6;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("boot image too small: {len} bytes (need at least {BOOT_IMAGE_MIN:#x})")]
    BootImageTooSmall { len: usize },
}

pub struct Emulator {
    pub cpu: Cpu,
    pub bus: Bus,
    previous_clock: Option<Instant>,
    /// Cycle-domain accumulator for the periodic tick line.
    tick_timer: i64,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("previous_clock", &self.previous_clock)
            .field("tick_timer", &self.tick_timer)
            .finish_non_exhaustive()
    }
}

impl Emulator {
    /// Builds a machine around a boot image with an in-memory EEPROM store.
    pub fn new(boot: Vec<u8>) -> Result<Self, EmulatorError> {
        Self::with_storage(boot, Box::new(MemoryStorage::new()))
    }

    /// Builds a machine with an injected EEPROM store (loaded here, saved
    /// on every serial stop condition that ends a write session).
    pub fn with_storage(
        boot: Vec<u8>,
        storage: Box<dyn EepromStorage>,
    ) -> Result<Self, EmulatorError> {
        if boot.len() < BOOT_IMAGE_MIN {
            return Err(EmulatorError::BootImageTooSmall { len: boot.len() });
        }

        let mut emulator = Emulator {
            cpu: Cpu::new(),
            bus: Bus::new(boot, storage),
            previous_clock: None,
            tick_timer: 0,
        };
        emulator.reset();
        Ok(emulator)
    }

    /// CPU reset sequence. Bank mapping and register contents survive, as
    /// they do on the hardware's reset line.
    pub fn reset(&mut self) {
        self.cpu.reset(&mut self.bus);
        self.previous_clock = None;
    }

    /// Executes a single instruction.
    pub fn step(&mut self) -> Result<u8, CpuError> {
        self.cpu.step(&mut self.bus)
    }

    /// Converts elapsed wall-clock time into emulated cycles and runs the
    /// machine until the budget is spent.
    pub fn step_realtime(&mut self) -> Result<(), CpuError> {
        let now = Instant::now();
        let elapsed = match self.previous_clock {
            Some(previous) => now.duration_since(previous).as_secs_f64().min(MAX_ADVANCE),
            None => 0.0,
        };
        self.previous_clock = Some(now);
        self.advance(elapsed)
    }

    /// Deterministic scheduler entry point: advances the machine by an
    /// explicit number of seconds. Periodic interrupts fire before any
    /// instruction executes, so work raised this tick is visible to the
    /// very next step.
    pub fn advance(&mut self, seconds: f64) -> Result<(), CpuError> {
        self.cpu.cycles += CLOCK_RATE * seconds;

        // The tick line follows emulated time through a running remainder,
        // not wall time.
        let ticks = self.cpu.cycles.floor() as i64;
        self.tick_timer += ticks;
        while self.tick_timer >= TICK_PERIOD {
            self.bus.fire_irq(IRQ_LINE_TICK);
            self.tick_timer -= TICK_PERIOD;
        }

        self.bus.fire_irq(IRQ_LINE_FRAME);
        self.fire_nmi(NMI_LINE_FRAME);

        while self.cpu.cycles > 0.0 {
            self.cpu.step(&mut self.bus)?;
        }
        Ok(())
    }

    pub fn fire_irq(&mut self, line: u8) {
        self.bus.fire_irq(line);
    }

    /// Delivers an NMI if the line is enabled. Not gated by the CPU's
    /// interrupt-disable flag.
    pub fn fire_nmi(&mut self, line: u8) {
        if self.bus.nmi_enabled(line) {
            self.cpu.nmi(&mut self.bus);
        }
    }

    pub fn insert_figure(&mut self, data: Vec<u8>) {
        self.bus.insert_figure(data);
    }

    pub fn keys(&self) -> u8 {
        self.bus.keys()
    }

    pub fn set_keys(&mut self, keys: u8) {
        self.bus.set_keys(keys);
    }

    /// Presses or releases one of the four active-low buttons.
    pub fn set_key(&mut self, key: u8, pressed: bool) {
        debug_assert!(key < 4);
        let bit = 1 << key;
        if pressed {
            self.bus.keys &= !bit;
        } else {
            self.bus.keys |= bit;
        }
        self.bus.keys &= 0x0F;
    }

    pub fn cpu_snapshot(&self) -> CpuSnapshot {
        self.cpu.snapshot()
    }

    pub fn pending_irq(&self) -> u16 {
        self.bus.pending_irq()
    }

    pub(crate) fn tick_timer(&self) -> i64 {
        self.tick_timer
    }

    pub(crate) fn set_tick_timer(&mut self, tick_timer: i64) {
        self.tick_timer = tick_timer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::irq::VECTOR_TABLE_OFFSET;
    use crate::bus::BANK_WINDOW;

    /// Two-bank image: reset vector at 0xE000, interrupt vectors on
    /// 0xE100 + line * 4 (NOP-filled), and a NOP + JMP idle loop at the
    /// reset target so long advances stay bounded.
    fn test_boot_image() -> Vec<u8> {
        let mut image = vec![0xEA; BANK_WINDOW * 2];
        for line in 0..16u16 {
            let vector = 0xE100 + line * 4;
            image[VECTOR_TABLE_OFFSET + line as usize * 2] = (vector & 0xFF) as u8;
            image[VECTOR_TABLE_OFFSET + line as usize * 2 + 1] = (vector >> 8) as u8;
        }
        // 0xE000: NOP; JMP $E000 (five cycles per lap)
        image[0x2001] = 0x4C;
        image[0x2002] = 0x00;
        image[0x2003] = 0xE0;
        // Reset vector (0xFFFC maps to image offset 0x3FFC)
        image[0x3FFC] = 0x00;
        image[0x3FFD] = 0xE0;
        // NMI vector
        image[0x3FFA] = 0x00;
        image[0x3FFB] = 0xE0;
        image
    }

    fn test_emulator() -> Emulator {
        Emulator::new(test_boot_image()).unwrap()
    }

    #[test]
    fn undersized_boot_image_is_rejected() {
        let err = Emulator::new(vec![0; 0x1000]).unwrap_err();
        assert!(matches!(err, EmulatorError::BootImageTooSmall { len: 0x1000 }));
    }

    #[test]
    fn reset_loads_pc_from_image() {
        let emulator = test_emulator();
        assert_eq!(emulator.cpu.pc, 0xE000);
    }

    #[test]
    fn step_consumes_table_cycles() {
        let mut emulator = test_emulator();
        emulator.cpu.cycles = 10.0;
        let cost = emulator.step().unwrap(); // NOP
        assert_eq!(cost, 2);
        assert_eq!(emulator.cpu.cycles, 8.0);
    }

    #[test]
    fn advance_runs_budget_to_exhaustion() {
        let mut emulator = test_emulator();
        emulator.advance(0.0001).unwrap(); // 400 cycles
        assert!(emulator.cpu.cycles <= 0.0);
        assert!(emulator.cpu.cycles > -8.0);
    }

    #[test]
    fn advance_with_no_budget_executes_nothing() {
        let mut emulator = test_emulator();
        let pc = emulator.cpu.pc;
        emulator.advance(0.0).unwrap();
        assert_eq!(emulator.cpu.pc, pc);

        // A negative leftover budget also blocks execution
        emulator.cpu.cycles = -5.0;
        emulator.advance(0.0).unwrap();
        assert_eq!(emulator.cpu.pc, pc);
        assert_eq!(emulator.cpu.cycles, -5.0);
    }

    #[test]
    fn periodic_tick_line_fires_every_half_clock() {
        let mut emulator = test_emulator();
        // Enable only the tick line (13): pending bit 0x8000 >> 13 lives in
        // the low enable register.
        emulator.bus.write(0x3071, (0x8000u16 >> 13) as u8);
        // Keep the CPU from servicing it so the pending bit stays visible
        emulator
            .cpu
            .status
            .insert(crate::cpu::StatusFlags::INTERRUPT_DISABLE);

        // A quarter second of emulated time is under the two-million-cycle
        // period: no fire yet.
        emulator.advance(0.25).unwrap();
        assert_eq!(emulator.pending_irq(), 0);

        // The accumulator carries across calls; the next quarter second
        // completes the period.
        emulator.advance(0.25).unwrap();
        assert_eq!(emulator.pending_irq(), 0x8000 >> 13);

        // Clear and run half a second more: the line fires again.
        emulator.bus.write(0x3074, 0xFF);
        emulator.advance(0.5).unwrap();
        assert_eq!(emulator.pending_irq(), 0x8000 >> 13);
    }

    #[test]
    fn frame_lines_fire_once_per_invocation() {
        let mut emulator = test_emulator();
        emulator.bus.write(0x3071, (0x8000u16 >> 10) as u8);
        emulator.cpu.status.insert(crate::cpu::StatusFlags::INTERRUPT_DISABLE);

        emulator.advance(0.0).unwrap();
        assert_eq!(emulator.pending_irq(), 0x8000 >> 10);
    }

    #[test]
    fn frame_nmi_respects_enable_register() {
        let mut emulator = test_emulator();
        let sp = emulator.cpu.sp;
        emulator.advance(0.0).unwrap();
        // NMI line 6 disabled: nothing pushed
        assert_eq!(emulator.cpu.sp, sp);

        emulator.bus.write(0x3076, 0x80 >> 6);
        emulator.advance(0.0).unwrap();
        assert_eq!(emulator.cpu.sp, sp.wrapping_sub(3));
        assert_eq!(emulator.cpu.pc, 0xE000);
    }

    #[test]
    fn irq_vectors_through_priority_table() {
        let mut emulator = test_emulator();
        emulator.bus.write(0x3070, 0xFF);
        emulator.bus.write(0x3071, 0xFF);
        emulator.fire_irq(5);
        emulator.fire_irq(9);

        // Put a NOP stream at the winning vector and step: line 5 wins.
        emulator.step().unwrap();
        assert_eq!(emulator.cpu.pc, 0xE100 + 5 * 4 + 1);
    }

    #[test]
    fn keypad_buttons_are_active_low() {
        let mut emulator = test_emulator();
        assert_eq!(emulator.keys(), 0x0F);
        emulator.set_key(2, true);
        assert_eq!(emulator.keys(), 0x0B);
        emulator.set_key(2, false);
        assert_eq!(emulator.keys(), 0x0F);
    }

    #[test]
    fn write_then_read_identity_by_region() {
        let mut emulator = test_emulator();
        // RAM, display RAM, and pass-through registers read back
        for &addr in &[0x0000u16, 0x0ABC, 0x1000, 0x2ABC, 0x3010] {
            emulator.bus.write(addr, 0x5A);
            assert_eq!(emulator.bus.peek(addr), 0x5A, "addr {addr:#06x}");
        }
        // ROM windows discard writes
        for &addr in &[0x4000u16, 0xC000] {
            let before = emulator.bus.peek(addr);
            emulator.bus.write(addr, !before);
            assert_eq!(emulator.bus.peek(addr), before, "addr {addr:#06x}");
        }
    }
}
