//! x86-64 snapshot and trap-frame adapter.
//!
//! There is no reserved marker key on x86: the image uses the dedicated
//! undefined opcodes, with UD2 (`0F 0B`) ending the test and every other
//! illegal instruction acting as an implicit compare point. Markers are
//! 2 bytes.

use std::io;

use bytemuck::{Pod, Zeroable};

use crate::snapshot::{MarkerOp, Snapshot};

/// UD2, little-endian halfword.
pub const UD2: u16 = 0x0b0f;

/// Registers the execution environment does not reproduce faithfully
/// (stack, segment and fault bookkeeping slots) carry this sentinel.
const REG_SENTINEL: u64 = 0xdead_beef;

/// Number of general registers in the signal context.
const NGREG: usize = 23;

// Indices into the greg array, in Linux mcontext order.
const REG_RSP: usize = 15;
const REG_RIP: usize = 16;
const REG_EFL: usize = 17;
const REG_CSGSFS: usize = 18;
const REG_ERR: usize = 19;
const REG_TRAPNO: usize = 20;
const REG_OLDMASK: usize = 21;
const REG_CR2: usize = 22;

const REG_NAMES: [&str; NGREG] = [
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rdi", "rsi", "rbp", "rbx", "rdx",
    "rax", "rcx", "rsp", "rip", "efl", "csgsfs", "err", "trapno", "oldmask", "cr2",
];

fn is_masked(index: usize) -> bool {
    matches!(
        index,
        REG_RSP | REG_EFL | REG_CSGSFS | REG_ERR | REG_TRAPNO | REG_OLDMASK | REG_CR2
    )
}

pub fn decode_marker(insn: u32) -> Option<MarkerOp> {
    if insn as u16 == UD2 {
        Some(MarkerOp::TestEnd)
    } else {
        None
    }
}

/// Canonicalized x86-64 state. 192 bytes, no implicit padding.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RegState {
    pub faulting_insn: u32,
    reserved: u32,
    pub gregs: [u64; NGREG],
}

impl Snapshot for RegState {
    fn marker_op(&self) -> Option<MarkerOp> {
        decode_marker(self.faulting_insn)
    }

    fn arg(&self) -> u64 {
        // rax, by analogy with the result register of the other ISAs.
        self.gregs[13]
    }

    fn write_dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "  faulting insn {:08x}", self.faulting_insn)?;
        for (name, value) in REG_NAMES.iter().zip(self.gregs.iter()) {
            writeln!(w, "  {name:7}: {value:016x}")?;
        }
        Ok(())
    }

    fn write_mismatch(&self, other: &Self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "mismatch detail (master : apprentice):")?;
        if self.faulting_insn != other.faulting_insn {
            writeln!(
                w,
                "  faulting insn mismatch {:08x} vs {:08x}",
                self.faulting_insn, other.faulting_insn
            )?;
        }
        for (i, (m, a)) in self.gregs.iter().zip(other.gregs.iter()).enumerate() {
            if m != a {
                writeln!(w, "  {:7}: {m:016x} vs {a:016x}", REG_NAMES[i])?;
            }
        }
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use frame::TrapFrame;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod frame {
    use super::*;
    use crate::engine::FrameOps;

    pub struct TrapFrame<'a> {
        uc: &'a mut libc::ucontext_t,
    }

    impl<'a> TrapFrame<'a> {
        /// # Safety
        ///
        /// `uc` must be the `ucontext` argument of a `SA_SIGINFO` signal
        /// handler, and no other reference to it may exist.
        pub unsafe fn from_ucontext(uc: *mut libc::c_void) -> TrapFrame<'a> {
            TrapFrame {
                uc: &mut *(uc as *mut libc::ucontext_t),
            }
        }

        pub fn capture(&mut self, image_base: u64, _test_fp_exc: bool) -> RegState {
            let gregs = &self.uc.uc_mcontext.gregs;
            let rip = gregs[libc::REG_RIP as usize] as u64;

            let mut state = RegState::zeroed();
            for (i, slot) in state.gregs.iter_mut().enumerate() {
                *slot = if is_masked(i) {
                    REG_SENTINEL
                } else if i == REG_RIP {
                    rip.wrapping_sub(image_base)
                } else {
                    gregs[i] as u64
                };
            }
            // Wider than any marker, but enough to tell two different
            // undefined encodings apart.
            state.faulting_insn = unsafe { std::ptr::read_unaligned(rip as *const u32) };
            state
        }

        pub fn advance_pc(&mut self) {
            // UD1 and UD2 are both two bytes.
            self.uc.uc_mcontext.gregs[libc::REG_RIP as usize] += 2;
        }
    }

    impl FrameOps for TrapFrame<'_> {
        fn set_result_reg(&mut self, value: u64) {
            self.uc.uc_mcontext.gregs[libc::REG_RAX as usize] = value as libc::greg_t;
        }
    }
}
