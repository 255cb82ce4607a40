//! Host bridge: the shared-memory framebuffer mirror and input mailbox that
//! connect this process to an external display/input process.
//!
//! Layout matches the shared-memory table: a 640x480 paletted VRAM mirror,
//! an IPS double, a video-mode byte, a single-slot key cell, and mouse
//! x/y/button fields. Every field past the VRAM mirror happens to land on a
//! naturally aligned offset, so a plain `#[repr(C)]` struct reproduces the
//! packed host layout without manual padding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use shared_memory::{Shmem, ShmemConf};

use crate::memory::Memory;

pub const SHARED_MEM_NAME: &str = "mx26301_vm_shared_memory";
const VRAM_MIRROR_LEN: usize = 307_200;

/// Top-of-memory cell the 16-bit legacy ISA (which has no IN opcode) polls
/// via PEEK to read keyboard input. Published only while free (zero), so a
/// guest that hasn't consumed the previous byte doesn't lose a keystroke.
pub const LEGACY_KEY_SHADOW_CELL: u32 = 0xFFFF;

/// Every N guest cycles the bridge drains input and, if dirty, mirrors VRAM.
pub const BRIDGE_WINDOW_MASK: u64 = 0x1FFF; // 8192 - 1

#[repr(C)]
struct Mailbox {
    vram: [u8; VRAM_MIRROR_LEN],
    ips: f64,
    video_mode: u8,
    key: u8,
    mouse_x: u16,
    mouse_y: u16,
    mouse_btn: u8,
}

pub struct HostBridge {
    shmem: Option<Shmem>,
    key_fifo: VecDeque<u8>,
    stop: Arc<AtomicBool>,
    cycles_since_ips: u64,
    last_ips_instant: Instant,
}

impl HostBridge {
    pub fn new() -> Self {
        let shmem = match ShmemConf::new().size(std::mem::size_of::<Mailbox>()).os_id(SHARED_MEM_NAME).create() {
            Ok(shmem) => Some(shmem),
            Err(err) => {
                log::warn!("couldn't create shared memory ({err}); running with no video output");
                None
            }
        };
        HostBridge {
            shmem,
            key_fifo: VecDeque::new(),
            stop: Arc::new(AtomicBool::new(false)),
            cycles_since_ips: 0,
            last_ips_instant: Instant::now(),
        }
    }

    fn mailbox(&self) -> Option<&Mailbox> {
        self.shmem.as_ref().map(|s| unsafe { &*(s.as_ptr() as *const Mailbox) })
    }

    fn mailbox_mut(&mut self) -> Option<&mut Mailbox> {
        self.shmem.as_mut().map(|s| unsafe { &mut *(s.as_ptr() as *mut Mailbox) })
    }

    /// Clone of the shutdown flag, to be set from a SIGINT handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn set_video_mode(&mut self, mode: u8) {
        if let Some(m) = self.mailbox_mut() {
            m.video_mode = mode;
        }
    }

    pub fn mouse_x(&self) -> u32 {
        self.mailbox().map(|m| m.mouse_x as u32).unwrap_or(0)
    }

    pub fn mouse_y(&self) -> u32 {
        self.mailbox().map(|m| m.mouse_y as u32).unwrap_or(0)
    }

    pub fn mouse_btn(&self) -> u32 {
        self.mailbox().map(|m| m.mouse_btn as u32).unwrap_or(0)
    }

    /// Pops one queued key, or 0 if none is pending.
    pub fn pop_key(&mut self) -> u32 {
        self.key_fifo.pop_front().unwrap_or(0) as u32
    }

    /// Drains the mailbox's single key slot into the internal FIFO, then, if
    /// the legacy shadow cell is free, publishes the next queued key there —
    /// the only way a 16-bit legacy-mode guest can observe keyboard input,
    /// since that ISA has no IN opcode.
    fn drain_input(&mut self, memory: &mut Memory) {
        if let Some(m) = self.mailbox_mut() {
            if m.key != 0 {
                self.key_fifo.push_back(m.key);
                m.key = 0;
            }
        }

        if memory.read8(LEGACY_KEY_SHADOW_CELL, false) == 0 {
            if let Some(key) = self.key_fifo.pop_front() {
                memory.write8(LEGACY_KEY_SHADOW_CELL, key);
            }
        }
    }

    fn mirror_vram(&mut self, memory: &mut Memory) {
        if memory.vram_dirty() {
            if let Some(m) = self.mailbox_mut() {
                m.vram.copy_from_slice(memory.vram());
            }
            memory.clear_vram_dirty();
        }
    }

    fn publish_ips(&mut self, ips: f64) {
        if let Some(m) = self.mailbox_mut() {
            m.ips = ips;
        }
    }

    /// Called once per guest cycle. At the 8192-cycle boundary, drains input
    /// and mirrors VRAM if dirty; roughly twice a second, samples IPS.
    pub fn tick(&mut self, cycle_counter: u64, memory: &mut Memory) {
        self.cycles_since_ips += 1;

        if cycle_counter & BRIDGE_WINDOW_MASK == 0 {
            self.drain_input(memory);
            self.mirror_vram(memory);
        }

        let elapsed = self.last_ips_instant.elapsed().as_secs_f64();
        if elapsed >= 0.5 {
            let ips = self.cycles_since_ips as f64 / elapsed;
            self.publish_ips(ips);
            self.cycles_since_ips = 0;
            self.last_ips_instant = Instant::now();
        }
    }
}
