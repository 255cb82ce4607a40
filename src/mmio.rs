//! MMIO port dispatch shared by both interpreters. Ports are numeric
//! channels addressed by the OUT/IN opcodes rather than by memory address
//! (see the port map).

use std::io::Write;
use std::time::Instant;

use crate::bridge::HostBridge;
use crate::buzzer;
use crate::disk::Disk;
use crate::memory::Memory;

pub struct Ports {
    pub disk: Disk,
    pub bridge: HostBridge,
    buzzer_freq: u32,
    buzzer_duration: u32,
    started_at: Instant,
}

impl Ports {
    pub fn new(disk: Disk, bridge: HostBridge) -> Self {
        Ports { disk, bridge, buzzer_freq: 0, buzzer_duration: 0, started_at: Instant::now() }
    }

    /// Milliseconds since this VM instance started, for the TIME opcode's
    /// steady-clock reading.
    pub fn elapsed_ms(&self) -> u32 {
        self.started_at.elapsed().as_millis() as u32
    }

    /// Handles an OUT port/data pair. Unassigned ports are silently ignored
    /// (error policy 2). `port` 0xFF (CPU mode switch) is handled by the
    /// 16-bit interpreter directly, since it is meaningless once in 32-bit
    /// mode.
    pub fn out(&mut self, port: u32, data: u32, memory: &mut Memory) {
        match port {
            0x01 => {
                print!("{}", data as u8 as char);
                let _ = std::io::stdout().flush();
            }
            0x02 => {
                print!("{}", data);
                let _ = std::io::stdout().flush();
            }
            0x03 => {
                print!("{}", data as i32);
                let _ = std::io::stdout().flush();
            }
            0x04 => {
                print!("{:x}", data);
                let _ = std::io::stdout().flush();
            }
            0x05 => {
                print!("{:.4}", f32::from_bits(data));
                let _ = std::io::stdout().flush();
            }
            0x10 => self.disk.latch_sector(data),
            0x11 => self.disk.latch_addr(data),
            0x12 => self.disk.execute_command(data, memory),
            0x20 => self.bridge.set_video_mode(data as u8),
            0x30 => self.buzzer_freq = data,
            0x31 => self.buzzer_duration = data,
            0x32 => buzzer::play_tone(self.buzzer_freq, self.buzzer_duration),
            0x40 => std::thread::sleep(std::time::Duration::from_millis(data as u64)),
            _ => {}
        }
    }

    /// Handles an IN port read. Unassigned ports return 0 (error policy 2).
    pub fn in_(&mut self, port: u32) -> u32 {
        match port {
            0x01 => self.bridge.pop_key(),
            0x02 => self.bridge.mouse_x(),
            0x03 => self.bridge.mouse_y(),
            0x04 => self.bridge.mouse_btn(),
            0xFF => 0x26301,
            _ => 0,
        }
    }
}
