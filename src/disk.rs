//! Sector-addressable disk image backed by a host file.
//!
//! The VM buffers a pending sector number and target memory address across
//! separate `OUT` writes (see `mmio::handle_out`); `execute_command` performs
//! the load or save once the command port fires.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::memory::Memory;

pub const SECTOR_SIZE: usize = 512;
pub const DEFAULT_IMAGE_SIZE: usize = 1440 * 1024;
pub const DISK_PATH: &str = "disk.bin";

pub struct Disk {
    path: PathBuf,
    content: Vec<u8>,
    pending_sector: u32,
    pending_addr: u32,
}

impl Disk {
    /// Loads the backing file, or falls back to a zero-filled image if it is
    /// missing — a host resource failure that is absorbed rather than fatal
    /// (see error handling policy 3).
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let content = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("disk image {:?} unavailable ({err}); starting with a blank image", path);
                vec![0u8; DEFAULT_IMAGE_SIZE]
            }
        };
        Disk { path, content, pending_sector: 0, pending_addr: 0 }
    }

    pub fn latch_sector(&mut self, sector: u32) {
        self.pending_sector = sector;
    }

    pub fn latch_addr(&mut self, addr: u32) {
        self.pending_addr = addr;
    }

    /// Command 1 = load a sector into memory; command 2 = save memory into a
    /// sector and rewrite the entire backing file. Any other command is
    /// silently ignored.
    pub fn execute_command(&mut self, command: u32, memory: &mut Memory) {
        match command {
            1 => self.load(memory),
            2 => self.save(memory),
            _ => {}
        }
    }

    fn load(&self, memory: &mut Memory) {
        let start = self.pending_sector as usize * SECTOR_SIZE;
        if start + SECTOR_SIZE > self.content.len() {
            return;
        }
        let dest = memory.slice_mut(self.pending_addr as usize, SECTOR_SIZE);
        dest.copy_from_slice(&self.content[start..start + SECTOR_SIZE]);
    }

    fn save(&mut self, memory: &mut Memory) {
        let start = self.pending_sector as usize * SECTOR_SIZE;
        if start + SECTOR_SIZE > self.content.len() {
            self.content.resize(start + SECTOR_SIZE, 0);
        }
        let addr = self.pending_addr as usize;
        if addr + SECTOR_SIZE <= crate::memory::MEM_SIZE {
            self.content[start..start + SECTOR_SIZE].copy_from_slice(memory.slice(addr, SECTOR_SIZE));
        } else {
            // Wraps past the top of memory: tail first, then head.
            let first_part = crate::memory::MEM_SIZE - addr;
            self.content[start..start + first_part].copy_from_slice(memory.slice(addr, first_part));
            let remaining = SECTOR_SIZE - first_part;
            self.content[start + first_part..start + SECTOR_SIZE].copy_from_slice(memory.slice(0, remaining));
        }
        self.flush();
    }

    fn flush(&self) {
        match fs::File::create(&self.path).and_then(|mut f| f.write_all(&self.content).and_then(|_| f.sync_all())) {
            Ok(()) => {}
            Err(err) => log::warn!("failed to persist disk image {:?}: {err}", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    #[test]
    fn roundtrip_through_a_sector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.bin");
        std::fs::write(&path, vec![0u8; DEFAULT_IMAGE_SIZE]).unwrap();

        let mut disk = Disk::open(&path);
        let mut mem = Memory::new();
        for (i, b) in mem.slice_mut(0x10000, SECTOR_SIZE).iter_mut().enumerate() {
            *b = i as u8;
        }
        disk.latch_sector(7);
        disk.latch_addr(0x10000);
        disk.execute_command(2, &mut mem); // save

        let mut mem2 = Memory::new();
        let mut disk2 = Disk::open(&path);
        disk2.latch_sector(7);
        disk2.latch_addr(0x20000);
        disk2.execute_command(1, &mut mem2); // load

        assert_eq!(mem2.slice(0x20000, SECTOR_SIZE), mem.slice(0x10000, SECTOR_SIZE));
    }

    #[test]
    fn missing_file_falls_back_to_blank_image() {
        let disk = Disk::open("/nonexistent/path/to/disk.bin");
        assert_eq!(disk.content.len(), DEFAULT_IMAGE_SIZE);
        assert!(disk.content.iter().all(|&b| b == 0));
    }
}
