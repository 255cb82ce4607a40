//! Tracing JIT: compiles hot basic blocks of simple register arithmetic into
//! native x86-64 and caches them by entry PC.
//!
//! Only the subset of 32-bit opcodes that touch nothing but registers and
//! immediates is recognized (MOV, ADD, SUB, MUL, register-register or
//! register-immediate, dword width, no indirect addressing); anything else
//! ends the block at the last recognized instruction. A block is invoked as
//! `fn(regs_ptr, memory_ptr)`; `memory_ptr` is part of the invocation
//! contract but unused by the opcodes currently compiled.
//!
//! The original targets the Windows x64 calling convention (first two
//! arguments in rcx/rdx); this port targets the System V AMD64 convention
//! used on the hosts this crate actually runs on, so the emitted prologue
//! reads its arguments from rdi/rsi instead. The recognized-opcode set and
//! block-ending rules are otherwise unchanged.

use std::collections::HashMap;
use std::ffi::c_void;

use crate::memory::Memory;
use crate::registers::{Registers, PC};

const HOT_THRESHOLD: i64 = 50;
const MAX_BLOCK_BYTES: u32 = 512;
const ARENA_SIZE: usize = 1 << 20;

type CompiledBlock = unsafe extern "C" fn(*mut u32, *mut u8);

struct Arena {
    base: *mut u8,
    len: usize,
}

impl Arena {
    fn new() -> Self {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ARENA_SIZE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!("failed to map JIT code arena: {}", std::io::Error::last_os_error());
        }
        Arena { base: base as *mut u8, len: 0 }
    }

    /// Appends `code`, returning a pointer to the start of this block.
    fn append(&mut self, code: &[u8]) -> *const u8 {
        assert!(self.len + code.len() <= ARENA_SIZE, "JIT arena exhausted");
        unsafe {
            let dst = self.base.add(self.len);
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            dst
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, ARENA_SIZE);
        }
    }
}

pub struct Jit {
    arena: Arena,
    blocks: HashMap<u32, CompiledBlock>,
    hot_counts: HashMap<u32, i64>,
}

impl Jit {
    pub fn new() -> Self {
        Jit { arena: Arena::new(), blocks: HashMap::new(), hot_counts: HashMap::new() }
    }

    /// Runs the cached block at `pc`, if any. Returns whether it ran.
    pub fn try_execute(&self, pc: u32, regs: &mut Registers, memory: &mut Memory) -> bool {
        match self.blocks.get(&pc) {
            Some(block) => {
                unsafe { block(regs.as_mut_ptr(), memory.as_mut_ptr()) };
                true
            }
            None => false,
        }
    }

    /// Records one interpreted entry at `pc`. Once the hot count crosses the
    /// threshold, compiles the block and returns `true` — the caller must
    /// skip executing this cycle's instruction, matching the original's
    /// "compile instead of interpret" behavior on the triggering entry.
    pub fn record_entry(&mut self, pc: u32, memory: &Memory) -> bool {
        if self.blocks.contains_key(&pc) {
            return false;
        }
        let count = self.hot_counts.entry(pc).or_insert(0);
        *count += 1;
        if *count > HOT_THRESHOLD {
            self.compile_block(pc, memory);
            true
        } else {
            false
        }
    }

    fn compile_block(&mut self, addr: u32, memory: &Memory) {
        let mut code: Vec<u8> = Vec::new();
        let mut current_pc = addr;
        let mut instructions_compiled = false;

        loop {
            if current_pc.wrapping_sub(addr) > MAX_BLOCK_BYTES {
                break;
            }
            let opcode = memory.read8(current_pc, false) as u8;
            let reg_a = memory.read8(current_pc + 1, false) as u8 >> 4;
            let reg_b = memory.read8(current_pc + 1, false) as u8 & 0x0F;
            let mode = memory.read8(current_pc + 3, false) as u8;
            let imm = memory.read32(current_pc + 4);

            let use_imm = mode & 0x01 != 0;
            let indirect = mode & 0x06 != 0;
            let size = (mode >> 4) & 0x03;

            if indirect || size != 2 {
                break;
            }

            let disp_a = i32::from(reg_a) * 4;
            let disp_b = i32::from(reg_b) * 4;

            match (opcode, use_imm) {
                (0x10, true) => emit_mov_imm(&mut code, disp_a, imm),
                (0x10, false) => emit_mov_reg(&mut code, disp_a, disp_b),
                (0x20, true) => emit_binop_imm(&mut code, disp_a, imm, BinOp::Add),
                (0x20, false) => emit_binop_reg(&mut code, disp_a, disp_b, BinOp::Add),
                (0x21, true) => emit_binop_imm(&mut code, disp_a, imm, BinOp::Sub),
                (0x21, false) => emit_binop_reg(&mut code, disp_a, disp_b, BinOp::Sub),
                (0x22, true) => emit_binop_imm(&mut code, disp_a, imm, BinOp::Mul),
                (0x22, false) => emit_binop_reg(&mut code, disp_a, disp_b, BinOp::Mul),
                _ => break,
            }
            instructions_compiled = true;
            current_pc = current_pc.wrapping_add(8);
        }

        if !instructions_compiled {
            log::debug!("jit: poisoning pc {addr:#010x}, nothing compiled");
            self.hot_counts.insert(addr, -100);
            return;
        }

        // Epilogue: write the post-block PC into the regs[15] slot, then ret.
        let pc_slot_disp = i32::from(PC) * 4;
        code.extend_from_slice(&[0xC7, 0x87]);
        code.extend_from_slice(&pc_slot_disp.to_le_bytes());
        code.extend_from_slice(&current_pc.to_le_bytes());
        code.push(0xC3);

        log::debug!("jit: compiled block at {addr:#010x}, {} bytes of guest code", current_pc - addr);
        let entry = self.arena.append(&code);
        let block: CompiledBlock = unsafe { std::mem::transmute(entry) };
        self.blocks.insert(addr, block);
    }
}

enum BinOp {
    Add,
    Sub,
    Mul,
}

/// `mov dword [rdi + disp], imm32`
fn emit_mov_imm(code: &mut Vec<u8>, disp: i32, imm: u32) {
    code.extend_from_slice(&[0xC7, 0x87]);
    code.extend_from_slice(&disp.to_le_bytes());
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `eax = [rdi + disp_b]; [rdi + disp_a] = eax`
fn emit_mov_reg(code: &mut Vec<u8>, disp_a: i32, disp_b: i32) {
    load_eax(code, disp_b);
    store_eax(code, disp_a);
}

/// `eax = [rdi + disp_a]; eax op= imm32; [rdi + disp_a] = eax`
fn emit_binop_imm(code: &mut Vec<u8>, disp_a: i32, imm: u32, op: BinOp) {
    load_eax(code, disp_a);
    match op {
        BinOp::Add => {
            code.push(0x05);
            code.extend_from_slice(&imm.to_le_bytes());
        }
        BinOp::Sub => {
            code.push(0x2D);
            code.extend_from_slice(&imm.to_le_bytes());
        }
        BinOp::Mul => {
            code.extend_from_slice(&[0x69, 0xC0]);
            code.extend_from_slice(&imm.to_le_bytes());
        }
    }
    store_eax(code, disp_a);
}

/// `eax = [rdi + disp_a]; edx = [rdi + disp_b]; eax op= edx; [rdi + disp_a] = eax`
fn emit_binop_reg(code: &mut Vec<u8>, disp_a: i32, disp_b: i32, op: BinOp) {
    load_eax(code, disp_a);
    load_edx(code, disp_b);
    match op {
        BinOp::Add => code.extend_from_slice(&[0x01, 0xD0]),
        BinOp::Sub => code.extend_from_slice(&[0x29, 0xD0]),
        BinOp::Mul => code.extend_from_slice(&[0x0F, 0xAF, 0xC2]),
    }
    store_eax(code, disp_a);
}

fn load_eax(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0x8B, 0x87]);
    code.extend_from_slice(&disp.to_le_bytes());
}

fn load_edx(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0x8B, 0x97]);
    code.extend_from_slice(&disp.to_le_bytes());
}

fn store_eax(code: &mut Vec<u8>, disp: i32) {
    code.extend_from_slice(&[0x89, 0x87]);
    code.extend_from_slice(&disp.to_le_bytes());
}
