//! Cold-start bootstrap and run-loop orchestration for the MX-26301 virtual
//! machine: a flat-memory CPU with a legacy 16-bit boot mode and a primary
//! 32-bit mode, MMIO-driven disk/audio/video, and a tracing JIT.

pub mod bridge;
pub mod buzzer;
pub mod disk;
pub mod error;
pub mod gpu;
mod interp16;
mod interp32;
mod jit;
pub mod memory;
pub mod mmio;
pub mod registers;

use bridge::HostBridge;
use disk::Disk;
use error::VmError;
use jit::Jit;
use memory::Memory;
use mmio::Ports;
use registers::Registers;

/// The BIOS's bootstrap program: latch sector 0 / address 0x200 / command 1
/// (load boot sector), set the stack pointer, then jump into the loaded
/// sector. Runs in 16-bit mode, since the CPU always cold-starts there.
const BIOS_PROGRAM: [u8; 30] = [
    0x20, 0x00, 0x10, // movi r0, 0x10
    0x21, 0x00, 0x00, // movi r1, 0
    0x70, 0x10, 0x00, // out r0, r1 (latch sector)
    0x20, 0x00, 0x11, // movi r0, 0x11
    0x21, 0x02, 0x00, // movi r1, 0x200
    0x70, 0x10, 0x00, // out r0, r1 (latch load address)
    0x20, 0x00, 0x12, // movi r0, 0x12
    0x21, 0x00, 0x01, // movi r1, 1
    0x70, 0x10, 0x00, // out r0, r1 (execute load)
    0x2e, 0xaf, 0xff, // movi r14, 0xafff
    0x2f, 0x02, 0x00, // movi r15, 0x200
];

/// Why the run loop stopped, so `main` can pick the right exit code.
#[derive(Debug)]
pub enum StopReason {
    /// HALT executed in 32-bit mode, or the 16-bit interpreter has no halt
    /// of its own and simply keeps running until one of the other reasons.
    Halted,
    /// A fatal guest trap (see [`VmError`]) was logged and the VM stopped.
    FatalTrap(VmError),
    /// The host requested shutdown (SIGINT).
    Shutdown,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum CpuMode {
    Legacy,
    Primary,
}

pub struct Vm {
    regs: Registers,
    memory: Memory,
    ports: Ports,
    jit: Jit,
    mode: CpuMode,
    cycle_counter: u64,
}

impl Vm {
    /// Cold-starts the machine: installs the BIOS ROM image (with its
    /// hardware-descriptor sub-table) at address 0, opens the disk image,
    /// and leaves the CPU in 16-bit mode at PC 0, matching the original's
    /// default-constructed register file.
    pub fn new() -> Self {
        let mut memory = Memory::new();

        let mut bios_rom = vec![0u8; memory::BOOT_SECTOR_START - memory::BIOS_START];
        bios_rom[..BIOS_PROGRAM.len()].copy_from_slice(&BIOS_PROGRAM);
        bios_rom[0x101] = 3; // graphics type
        bios_rom[0x103] = 1; // disk ports present
        bios_rom[0x105] = 1; // buzzer ports present
        bios_rom[0x107] = 2; // wait port present
        memory.install(memory::BIOS_START, &bios_rom);

        let disk = Disk::open(disk::DISK_PATH);
        let bridge = HostBridge::new();

        Vm {
            regs: Registers::new(),
            memory,
            ports: Ports::new(disk, bridge),
            jit: Jit::new(),
            mode: CpuMode::Legacy,
            cycle_counter: 0,
        }
    }

    /// Clone of the shutdown flag, for wiring up a SIGINT handler.
    pub fn stop_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.ports.bridge.stop_handle()
    }

    /// Runs until HALT, a fatal trap, or a host shutdown signal.
    pub fn run(&mut self) -> StopReason {
        loop {
            if self.ports.bridge.should_stop() {
                log::info!("shutdown signal received, halting");
                return StopReason::Shutdown;
            }

            let halted = match self.mode {
                CpuMode::Legacy => {
                    let switched = interp16::step(&mut self.regs, &mut self.memory, &mut self.ports);
                    if switched {
                        log::debug!("cpu switched to 32-bit mode, pc = {:#010x}", self.regs.pc());
                        self.mode = CpuMode::Primary;
                    }
                    None
                }
                CpuMode::Primary => {
                    match interp32::step(&mut self.regs, &mut self.memory, &mut self.ports, &mut self.jit) {
                        Ok(halted) => Some(halted).filter(|h| *h),
                        Err(err) => {
                            log::error!("{err}");
                            return StopReason::FatalTrap(err);
                        }
                    }
                }
            };

            self.cycle_counter = self.cycle_counter.wrapping_add(1);
            self.ports.bridge.tick(self.cycle_counter, &mut self.memory);

            if halted.is_some() {
                return StopReason::Halted;
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
