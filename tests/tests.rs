//! Boots the VM through its real cold-start path (BIOS -> loaded boot sector
//! -> primary mode) and checks it reaches a graceful HALT, rather than
//! exercising individual opcodes directly — those are covered by the
//! interpreter unit tests.

use std::fs;

use mx26301::disk::DISK_PATH;
use mx26301::{StopReason, Vm};

const SECTOR_SIZE: usize = 512;
const DISK_SIZE: usize = 1440 * 1024;

/// Writes `disk.bin` with a boot sector that switches the CPU to primary
/// mode and then immediately halts, restoring whatever was there before on
/// drop.
struct ScratchDisk {
    original: Option<Vec<u8>>,
}

impl ScratchDisk {
    fn install() -> Self {
        let original = fs::read(DISK_PATH).ok();

        let mut image = vec![0u8; DISK_SIZE];
        let boot_sector = &mut image[0..SECTOR_SIZE];

        // movi r0, 0xFF; movi r1, 1; out r0, r1 -- switches to primary mode,
        // landing at interp16::PRIMARY_MODE_ENTRY (0x300), which is 0x100
        // bytes into this same sector once loaded at 0x200.
        boot_sector[0..3].copy_from_slice(&[0x20, 0x00, 0xFF]);
        boot_sector[3..6].copy_from_slice(&[0x21, 0x00, 0x01]);
        boot_sector[6..9].copy_from_slice(&[0x70, 0x10, 0x00]);

        // A bare HALT (opcode 0x01) in primary mode.
        boot_sector[0x100..0x108].copy_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0]);

        fs::write(DISK_PATH, &image).expect("failed to stage test disk image");
        ScratchDisk { original }
    }
}

impl Drop for ScratchDisk {
    fn drop(&mut self) {
        match self.original.take() {
            Some(bytes) => {
                let _ = fs::write(DISK_PATH, bytes);
            }
            None => {
                let _ = fs::remove_file(DISK_PATH);
            }
        }
    }
}

#[test]
fn cold_boot_reaches_halt() {
    let _scratch = ScratchDisk::install();

    let mut vm = Vm::new();
    let reason = vm.run();

    assert!(matches!(reason, StopReason::Halted), "expected a graceful halt");
}
