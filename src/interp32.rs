//! 32-bit primary interpreter. Instruction word is 8 bytes: opcode, reg_a
//! (high nibble of byte 1), reg_b (low nibble of byte 1), reg_c (high nibble
//! of byte 2), mode flags (byte 3), 32-bit big-endian immediate (bytes 4-7).
//!
//! Mode bits: bit0 use-immediate, bit1 indirect-source, bit2
//! indirect-destination, bit3 signed, bits4-5 operand size (0=byte, 1=word,
//! 2=dword). PC advances by 8 unless the instruction jumped.

use crate::error::VmError;
use crate::gpu;
use crate::jit::Jit;
use crate::memory::Memory;
use crate::mmio::Ports;
use crate::registers::{Registers, PC};

/// Executes one 32-bit instruction, or lets a compiled JIT block run in its
/// place. Returns `Ok(true)` if the instruction was HALT, `Err` on a fatal
/// trap (divide/modulo by zero, misaligned PC); the caller is responsible
/// for the log-and-halt policy in both cases.
pub fn step(regs: &mut Registers, memory: &mut Memory, ports: &mut Ports, jit: &mut Jit) -> Result<bool, VmError> {
    let pc = regs.pc();

    if jit.try_execute(pc, regs, memory) {
        return Ok(false);
    }
    if jit.record_entry(pc, memory) {
        return Ok(false);
    }

    if pc % 8 != 0 {
        return Err(VmError::MisalignedPc { pc });
    }

    let opcode = memory.read8(pc, false) as u8;
    let b1 = memory.read8(pc + 1, false) as u8;
    let reg_a = (b1 >> 4) as usize;
    let reg_b = (b1 & 0x0F) as usize;
    let reg_c = (memory.read8(pc + 2, false) as u8 >> 4) as usize;
    let mode = memory.read8(pc + 3, false) as u8;
    let imm = memory.read32(pc + 4);

    let use_imm = mode & 0x01 != 0;
    let indirect_src = mode & 0x02 != 0;
    let indirect_dest = mode & 0x04 != 0;
    let is_signed = mode & 0x08 != 0;
    let size = (mode >> 4) & 0x03;

    let mut jumped = false;

    match opcode {
        0x00 => {} // nop
        0x01 => return Ok(true), // halt: PC stays frozen at this instruction
        0x02..=0x08 => {
            let taken = match opcode {
                0x02 => true,                                      // jmp
                0x03 => regs.get(reg_a) == regs.get(reg_b),         // je
                0x04 => regs.get(reg_a) != regs.get(reg_b),         // jne
                0x05 => regs.get(reg_a) as i32 > regs.get(reg_b) as i32, // jg
                0x06 => regs.get(reg_a) as i32 >= regs.get(reg_b) as i32, // jge
                0x07 => (regs.get(reg_a) as i32) < regs.get(reg_b) as i32, // jl
                0x08 => regs.get(reg_a) as i32 <= regs.get(reg_b) as i32, // jle
                _ => unreachable!(),
            };
            if taken {
                regs.set_pc(jump_target(regs, memory, imm, use_imm, indirect_dest, reg_c));
                jumped = true;
            }
        }
        0x09 => {
            // call: target resolves through reg_a, not reg_c
            let sp = regs.sp().wrapping_sub(4);
            regs.set_sp(sp);
            memory.write32(sp, pc.wrapping_add(8));
            regs.set_pc(jump_target(regs, memory, imm, use_imm, indirect_dest, reg_a));
            jumped = true;
        }
        0x0A | 0x0C => {
            // ret / iret
            let sp = regs.sp();
            regs.set_pc(memory.read32(sp));
            regs.set_sp(sp.wrapping_add(4));
            jumped = true;
        }
        0x0B => {
            // int
            let sp = regs.sp().wrapping_sub(4);
            regs.set_sp(sp);
            memory.write32(sp, pc.wrapping_add(8));
            regs.set_pc(memory.read32(regs.get(reg_a).wrapping_mul(4)));
            jumped = true;
        }
        0x10 => {
            // mov
            if use_imm {
                jumped = regs.set(reg_a, imm);
            } else if indirect_dest && indirect_src {
                let src = regs.get(reg_b);
                match size {
                    0 => memory.write8(regs.get(reg_a), memory.read8(src, is_signed) as u8),
                    1 => memory.write16(regs.get(reg_a), memory.read16(src, is_signed) as u16),
                    _ => memory.write32(regs.get(reg_a), memory.read32(src)),
                }
            } else if indirect_dest {
                let dest = regs.get(reg_a);
                let src = regs.get(reg_b);
                match size {
                    0 => memory.write8(dest, src as u8),
                    1 => memory.write16(dest, src as u16),
                    _ => memory.write32(dest, src),
                }
            } else if indirect_src {
                let addr = regs.get(reg_b);
                let value = match size {
                    0 => memory.read8(addr, is_signed),
                    1 => memory.read16(addr, is_signed),
                    _ => memory.read32(addr),
                };
                jumped = regs.set(reg_a, value);
            } else {
                jumped = regs.set(reg_a, regs.get(reg_b));
            }
        }
        0x11 => {
            // push: always a full 32-bit word regardless of the size field
            let sp = regs.sp().wrapping_sub(4);
            regs.set_sp(sp);
            let value = if use_imm {
                imm
            } else if indirect_src {
                memory.read32(regs.get(reg_a))
            } else {
                regs.get(reg_a)
            };
            memory.write32(sp, value);
        }
        0x12 => {
            // pop
            let sp = regs.sp();
            jumped = regs.set(reg_a, memory.read32(sp));
            regs.set_sp(sp.wrapping_add(4));
        }
        0x20..=0x24 => {
            let val_b = if use_imm { imm } else { regs.get(reg_b) };
            if matches!(opcode, 0x23 | 0x24) && narrowed_is_zero(val_b, size) {
                return Err(if opcode == 0x23 {
                    VmError::DivideByZero { pc }
                } else {
                    VmError::ModuloByZero { pc }
                });
            }
            let result = arithmetic(opcode, regs.get(reg_a), val_b, size, is_signed);
            jumped = regs.set(reg_a, result);
        }
        0x30..=0x33 => {
            let val_b = if use_imm { imm } else { regs.get(reg_b) };
            let result = bitwise(opcode, regs.get(reg_a), val_b, size);
            jumped = regs.set(reg_a, result);
        }
        0x40..=0x44 => {
            let count = if use_imm { imm } else { regs.get(reg_b) } & 0x1F;
            if count != 0 || opcode == 0x40 || opcode == 0x41 || opcode == 0x42 {
                let result = shift(opcode, regs.get(reg_a), count, size);
                jumped = regs.set(reg_a, result);
            }
        }
        0x50..=0x54 => {
            let a = f32::from_bits(regs.get(reg_a));
            let b = f32::from_bits(if use_imm { imm } else { regs.get(reg_b) });
            if matches!(opcode, 0x53 | 0x54) && b == 0.0 {
                return Err(if opcode == 0x53 {
                    VmError::FloatDivideByZero { pc }
                } else {
                    VmError::FloatModuloByZero { pc }
                });
            }
            let result = match opcode {
                0x50 => a + b,
                0x51 => a - b,
                0x52 => a * b,
                0x53 => a / b,
                _ => a % b,
            };
            jumped = regs.set(reg_a, result.to_bits());
        }
        0x60 => {
            // fsqrt
            let a = f32::from_bits(regs.get(reg_a));
            let result = if a < 0.0 { f32::NAN } else { a.sqrt() };
            jumped = regs.set(reg_a, result.to_bits());
        }
        0x61 => {
            let input = f32::from_bits(regs.get(reg_b));
            jumped = regs.set(reg_a, input.sin().to_bits());
        }
        0x62 => {
            let input = f32::from_bits(regs.get(reg_b));
            jumped = regs.set(reg_a, input.cos().to_bits());
        }
        0x63 => {
            let a = f32::from_bits(regs.get(reg_a));
            jumped = regs.set(reg_a, a.abs().to_bits());
        }
        0x64 => {
            // f2i: truncate toward zero
            let f_val = f32::from_bits(regs.get(reg_a));
            jumped = regs.set(reg_a, f_val as i32 as u32);
        }
        0x65 => {
            // i2f
            let result = regs.get(reg_a) as i32 as f32;
            jumped = regs.set(reg_a, result.to_bits());
        }
        0x70..=0x76 => {
            let color = (regs.get(reg_c) & 0xFF) as u8;
            match opcode {
                0x70 => gpu::gpuclear(memory, regs.get(reg_a), regs.get(reg_b), color),
                0x71 => gpu::gpublit(memory, regs.get(reg_a), regs.get(reg_b), regs.get(reg_c)),
                0x72 => gpu::gpurect(memory, regs.get(reg_a), regs.get(reg_b), color),
                0x73 => gpu::gpuline(memory, regs.get(reg_a), regs.get(reg_b), color),
                0x74 => gpu::gpurectfill(memory, regs.get(reg_a), regs.get(reg_b), color),
                0x75 => gpu::gpucirc(memory, regs.get(reg_a), regs.get(reg_b) & 0xFFFF, color),
                _ => gpu::gpucircfill(memory, regs.get(reg_a), regs.get(reg_b) & 0xFFFF, color),
            }
        }
        0x80 => {
            // time: host steady-clock milliseconds since VM start, truncated
            // to 32 bits
            let _ = regs.set(reg_a, ports.elapsed_ms());
        }
        0x81 => {
            // wait
            std::thread::sleep(std::time::Duration::from_millis(regs.get(reg_a) as u64));
        }
        0x82 => {
            // rand
            let value: u32 = rand::random();
            let _ = regs.set(reg_a, value);
        }
        0xF0 => {
            ports.out(regs.get(reg_a), regs.get(reg_b), memory);
        }
        0xF1 => {
            // in: result written to reg_a, but this never counts as a jump,
            // even when reg_a is r15 — verbatim from the original's omission.
            let value = ports.in_(regs.get(reg_b));
            regs.set(reg_a, value);
        }
        _ => {} // unrecognized opcode: treated as NOP (documented undefined behavior)
    }

    if !jumped {
        regs.set_pc(regs.pc().wrapping_add(8));
    }

    Ok(false)
}

fn jump_target(regs: &Registers, memory: &Memory, imm: u32, use_imm: bool, indirect_dest: bool, reg: usize) -> u32 {
    if use_imm {
        imm
    } else if indirect_dest {
        memory.read32(regs.get(reg))
    } else {
        regs.get(reg)
    }
}

/// Whether the divisor is zero once narrowed to the instruction's operand
/// width — not the raw 32-bit value. `arithmetic` divides/mods on the
/// width-masked (or sign-extended, for the signed path) operand, so a
/// byte/word DIV whose raw immediate or register is nonzero but whose low
/// byte/word is zero (e.g. size=byte, value 0x100) must still be treated as
/// a divide/modulo by zero, or the division below would panic instead of
/// raising the documented fatal trap.
fn narrowed_is_zero(b: u32, size: u8) -> bool {
    let mask: u32 = match size {
        0 => 0xFF,
        1 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    };
    (b & mask) == 0
}

/// Signed path sign-extends both narrow operands to `i32` *before* the
/// operation, so the sum/difference/product is computed at full 32-bit
/// precision and may exceed the narrow width's own range before being
/// stored — not "compute narrow, truncate, then sign-extend".
fn arithmetic(opcode: u8, a: u32, b: u32, size: u8, is_signed: bool) -> u32 {
    if is_signed {
        let (sa, sb): (i32, i32) = match size {
            0 => (a as i8 as i32, b as i8 as i32),
            1 => (a as i16 as i32, b as i16 as i32),
            _ => (a as i32, b as i32),
        };
        (match opcode {
            0x20 => sa.wrapping_add(sb),
            0x21 => sa.wrapping_sub(sb),
            0x22 => sa.wrapping_mul(sb),
            0x23 => sa.wrapping_div(sb),
            _ => sa.wrapping_rem(sb),
        }) as u32
    } else {
        let mask: u32 = match size {
            0 => 0xFF,
            1 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        };
        let (ua, ub) = (a & mask, b & mask);
        (match opcode {
            0x20 => ua.wrapping_add(ub),
            0x21 => ua.wrapping_sub(ub),
            0x22 => ua.wrapping_mul(ub),
            0x23 => ua / ub,
            _ => ua % ub,
        }) & mask
    }
}

fn bitwise(opcode: u8, a: u32, b: u32, size: u8) -> u32 {
    let mask: u32 = match size {
        0 => 0xFF,
        1 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    };
    match opcode {
        0x30 => (a & b) & mask,
        0x31 => (a | b) & mask,
        0x32 => (a ^ b) & mask,
        _ => (!a) & mask,
    }
}

fn shift(opcode: u8, a: u32, count: u32, size: u8) -> u32 {
    match opcode {
        0x40 => {
            let mask: u32 = match size {
                0 => 0xFF,
                1 => 0xFFFF,
                _ => 0xFFFF_FFFF,
            };
            a.wrapping_shl(count) & mask
        }
        0x41 => match size {
            0 => (a & 0xFF) >> count,
            1 => (a & 0xFFFF) >> count,
            _ => a.wrapping_shr(count),
        },
        0x42 => match size {
            // Narrow operands promote to i32 before the shift, same as the
            // C++ int promotion this is ported from, since count may exceed
            // the narrow width's own bit count.
            0 => ((a as i8 as i32) >> count) as u32,
            1 => ((a as i16 as i32) >> count) as u32,
            _ => ((a as i32) >> count) as u32,
        },
        0x43 => rotate_left(a, count, size),
        _ => rotate_right(a, count, size),
    }
}

/// Operates on the narrow value widened into `u32`, mirroring the int
/// promotion the C++ source gets for free: at `n == 0` the `8 - n`/`16 - n`
/// shift equals the full width, which zeroes that half out rather than
/// wrapping back to the original value.
fn rotate_left(a: u32, count: u32, size: u8) -> u32 {
    match size {
        0 => {
            let val = a & 0xFF;
            let n = count % 8;
            ((val << n) | (val >> (8 - n))) & 0xFF
        }
        1 => {
            let val = a & 0xFFFF;
            let n = count % 16;
            ((val << n) | (val >> (16 - n))) & 0xFFFF
        }
        _ => a.wrapping_shl(count) | a.wrapping_shr(32 - count),
    }
}

fn rotate_right(a: u32, count: u32, size: u8) -> u32 {
    match size {
        0 => {
            let val = a & 0xFF;
            let n = count % 8;
            ((val >> n) | (val << (8 - n))) & 0xFF
        }
        1 => {
            let val = a & 0xFFFF;
            let n = count % 16;
            ((val >> n) | (val << (16 - n))) & 0xFFFF
        }
        _ => a.wrapping_shr(count) | a.wrapping_shl(32 - count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostBridge;
    use crate::disk::Disk;

    fn ports() -> Ports {
        Ports::new(Disk::open("/nonexistent/disk.bin"), HostBridge::new())
    }

    fn enc(opcode: u8, reg_a: u8, reg_b: u8, reg_c: u8, mode: u8, imm: u32) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = opcode;
        bytes[1] = (reg_a << 4) | reg_b;
        bytes[2] = reg_c << 4;
        bytes[3] = mode;
        bytes[4..8].copy_from_slice(&imm.to_be_bytes());
        bytes
    }

    #[test]
    fn non_jumping_instruction_advances_pc_by_8() {
        let mut regs = Registers::new();
        let mut mem = Memory::new();
        mem.install(0, &enc(0x00, 0, 0, 0, 0, 0)); // nop
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.pc(), 8);
    }

    #[test]
    fn signed_byte_add_sign_extends_overflow() {
        let mut regs = Registers::new();
        regs.set(0, 0x7F);
        let mut mem = Memory::new();
        // add r0, r0, #1 (signed, byte size, use_imm)
        mem.install(0, &enc(0x20, 0, 0, 0, 0b0000_1001, 1));
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.get(0), 0xFFFF_FF80);
    }

    #[test]
    fn unsigned_byte_add_wraps_to_zero() {
        let mut regs = Registers::new();
        regs.set(0, 0xFF);
        let mut mem = Memory::new();
        // add r0, r0, #1 (unsigned, byte size, use_imm)
        mem.install(0, &enc(0x20, 0, 0, 0, 0b0000_0001, 1));
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.get(0), 0);
    }

    #[test]
    fn sar_of_min_dword_by_one_sign_extends() {
        let mut regs = Registers::new();
        regs.set(0, 0x8000_0000);
        let mut mem = Memory::new();
        // sar r0, #1 (dword size, use_imm)
        mem.install(0, &enc(0x42, 0, 0, 0, 0b0010_0001, 1));
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.get(0), 0xC000_0000);
    }

    #[test]
    fn divide_by_zero_is_fatal() {
        let mut regs = Registers::new();
        regs.set(0, 10);
        let mut mem = Memory::new();
        // div r0, #0 (dword, use_imm)
        mem.install(0, &enc(0x23, 0, 0, 0, 0b0010_0001, 0));
        let mut p = ports();
        let mut jit = Jit::new();
        let err = step(&mut regs, &mut mem, &mut p, &mut jit).unwrap_err();
        assert_eq!(err, VmError::DivideByZero { pc: 0 });
    }

    #[test]
    fn byte_sized_divide_by_narrowed_zero_is_fatal_not_a_panic() {
        let mut regs = Registers::new();
        regs.set(0, 10);
        let mut mem = Memory::new();
        // div r0, #0x100 (byte size, use_imm): low byte of the immediate is
        // zero even though the raw 32-bit value isn't.
        mem.install(0, &enc(0x23, 0, 0, 0, 0b0000_0001, 0x100));
        let mut p = ports();
        let mut jit = Jit::new();
        let err = step(&mut regs, &mut mem, &mut p, &mut jit).unwrap_err();
        assert_eq!(err, VmError::DivideByZero { pc: 0 });
    }

    #[test]
    fn call_then_ret_is_identity_on_pc_and_sp() {
        let mut regs = Registers::new();
        regs.set_sp(0x2000);
        let mut mem = Memory::new();
        // call 0x100 (use_imm)
        mem.install(0, &enc(0x09, 0, 0, 0, 0b0000_0001, 0x100));
        // ret
        mem.install(0x100, &enc(0x0A, 0, 0, 0, 0, 0));
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap(); // call
        assert_eq!(regs.pc(), 0x100);
        assert_eq!(regs.sp(), 0x1FFC);
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap(); // ret
        assert_eq!(regs.pc(), 8); // call site's pc (0) + 8
        assert_eq!(regs.sp(), 0x2000);
    }

    #[test]
    fn push_pop_roundtrip_preserves_sp() {
        let mut regs = Registers::new();
        regs.set_sp(0x2000);
        regs.set(0, 0xDEAD_BEEF);
        let mut mem = Memory::new();
        mem.install(0, &enc(0x11, 0, 0, 0, 0, 0)); // push r0
        mem.install(8, &enc(0x12, 1, 0, 0, 0, 0)); // pop r1
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.sp(), 0x1FFC);
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.sp(), 0x2000);
        assert_eq!(regs.get(1), 0xDEAD_BEEF);
    }

    #[test]
    fn interrupt_pushes_return_address_and_jumps_through_vector_table() {
        let mut regs = Registers::new();
        regs.set_sp(0x2000);
        regs.set(0, 8);
        let mut mem = Memory::new();
        mem.write32(0x20, 0x1000);
        mem.install(0, &enc(0x0B, 0, 0, 0, 0, 0)); // int r0
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.pc(), 0x1000);
        assert_eq!(mem.read32(0x1FFC), 8);
    }

    #[test]
    fn gpu_dispatch_sets_vram_dirty() {
        let mut regs = Registers::new();
        regs.set(0, 0); // top-left packed (0,0)
        regs.set(1, (5 << 16) | 5); // bottom-right packed (5,5)
        regs.set(2, 0xAA);
        let mut mem = Memory::new();
        mem.install(0, &enc(0x74, 0, 1, 2, 0, 0)); // gpurectfill
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert!(mem.vram_dirty());
    }

    #[test]
    fn in_port_never_counts_as_jump_even_through_pc() {
        // IN never sets the jumped flag, even writing through R15: the
        // unconditional PC+=8 still runs on top of whatever IN just wrote.
        let mut regs = Registers::new();
        regs.set(1, 0xFF); // port: system id
        let mut mem = Memory::new();
        mem.install(0, &enc(0xF1, PC as u8, 1, 0, 0, 0)); // in r15, [r1]
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.get(PC), 0x26301 + 8);
    }

    #[test]
    fn time_opcode_reads_increasing_elapsed_milliseconds() {
        let mut regs = Registers::new();
        let mut mem = Memory::new();
        mem.install(0, &enc(0x80, 0, 0, 0, 0, 0)); // time -> r0
        mem.install(8, &enc(0x80, 1, 0, 0, 0, 0)); // time -> r1
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert!(regs.get(1) >= regs.get(0));
    }

    #[test]
    fn unassigned_out_port_is_silently_ignored() {
        let mut regs = Registers::new();
        regs.set(0, 0xAB); // no such port
        regs.set(1, 123);
        let mut mem = Memory::new();
        mem.install(0, &enc(0xF0, 0, 1, 0, 0, 0));
        let mut p = ports();
        let mut jit = Jit::new();
        step(&mut regs, &mut mem, &mut p, &mut jit).unwrap();
        assert_eq!(regs.pc(), 8);
    }
}
