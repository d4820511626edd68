//! ARM / Thumb snapshot and trap-frame adapter.
//!
//! Markers are undefined encodings in both instruction sets: a 4-byte one
//! in ARM state and a 2-byte one in Thumb state, each with the opcode in
//! the low nibble. Thumb test images may also contain 32-bit Thumb2
//! instructions, so the PC step is decoded from the first halfword.

use std::io;

use bytemuck::{Pod, Zeroable};

use crate::snapshot::{MarkerOp, Snapshot};

/// Marker key for 4-byte (ARM state) encodings.
pub const MARKER_KEY_ARM: u32 = 0xe7fe_5af0;
/// Marker key for 2-byte (Thumb state) encodings.
pub const MARKER_KEY_THUMB: u32 = 0xdee0;

/// NZCVQ + GE. The reserved CPSR bits are not reliably reproduced by every
/// execution environment, so only the architecturally observable subset
/// takes part in comparison.
const CPSR_MASK: u32 = 0xf80f_0000;

/// FPSCR with the UNK/SBZP bits discarded.
const FPSCR_MASK: u32 = 0xffff_9f9f;
/// Cumulative exception flags within FPSCR.
const FPSCR_CUMULATIVE: u32 = 0x9f;

/// The stack pointer slot carries this instead of a real value.
const SP_SENTINEL: u32 = 0xdead_beef;

const VFP_MAGIC: u32 = 0x5646_5001;
/// `{magic, size}` header + 32 × 64-bit registers + fpscr.
const VFP_MIN_RECORD_SIZE: usize = 8 + 32 * 8 + 4;

/// Instruction size in bytes for a Thumb-state instruction starting with
/// this halfword.
pub fn thumb_insn_size(first_halfword: u16) -> u32 {
    match first_halfword & 0xf800 {
        0xe800 | 0xf000 | 0xf800 => 4,
        _ => 2,
    }
}

pub fn decode_marker(insn: u32, insn_size: u32) -> Option<MarkerOp> {
    let key = if insn_size == 2 {
        MARKER_KEY_THUMB
    } else {
        MARKER_KEY_ARM
    };
    if insn & !0xf != key {
        return None;
    }
    MarkerOp::from_nibble(insn & 0xf)
}

/// Canonicalized ARM state. 336 bytes, no implicit padding.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RegState {
    pub fpregs: [u64; 32],
    pub faulting_insn: u32,
    pub faulting_insn_size: u32,
    pub gpregs: [u32; 16],
    pub cpsr: u32,
    pub fpscr: u32,
}

impl RegState {
    fn insn_width(&self) -> usize {
        if self.faulting_insn_size == 2 {
            4
        } else {
            8
        }
    }
}

impl Snapshot for RegState {
    fn marker_op(&self) -> Option<MarkerOp> {
        decode_marker(self.faulting_insn, self.faulting_insn_size)
    }

    fn arg(&self) -> u64 {
        u64::from(self.gpregs[0])
    }

    fn write_dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(
            w,
            "  faulting insn {:0width$x}",
            self.faulting_insn,
            width = self.insn_width()
        )?;
        for (i, r) in self.gpregs.iter().enumerate() {
            writeln!(w, "  r{i}: {r:08x}")?;
        }
        writeln!(w, "  cpsr: {:08x}", self.cpsr)?;
        for (i, r) in self.fpregs.iter().enumerate() {
            writeln!(w, "  d{i}: {r:016x}")?;
        }
        writeln!(w, "  fpscr: {:08x}", self.fpscr)?;
        Ok(())
    }

    fn write_mismatch(&self, other: &Self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "mismatch detail (master : apprentice):")?;
        if self.faulting_insn_size != other.faulting_insn_size {
            writeln!(
                w,
                "  faulting insn size mismatch {} vs {}",
                self.faulting_insn_size, other.faulting_insn_size
            )?;
        } else if self.faulting_insn != other.faulting_insn {
            let width = self.insn_width();
            writeln!(
                w,
                "  faulting insn mismatch {:0width$x} vs {:0width$x}",
                self.faulting_insn, other.faulting_insn
            )?;
        }
        for (i, (m, a)) in self.gpregs.iter().zip(other.gpregs.iter()).enumerate() {
            if m != a {
                writeln!(w, "  r{i}: {m:08x} vs {a:08x}")?;
            }
        }
        if self.cpsr != other.cpsr {
            writeln!(w, "  cpsr: {:08x} vs {:08x}", self.cpsr, other.cpsr)?;
        }
        for (i, (m, a)) in self.fpregs.iter().zip(other.fpregs.iter()).enumerate() {
            if m != a {
                writeln!(w, "  d{i}: {m:016x} vs {a:016x}")?;
            }
        }
        if self.fpscr != other.fpscr {
            writeln!(w, "  fpscr: {:08x} vs {:08x}", self.fpscr, other.fpscr)?;
        }
        Ok(())
    }
}

/// Extract the VFP register file and FPSCR from the signal context's
/// register space, a `{magic: u32, size: u32, payload}` record chain.
///
/// FPSCR is masked to its defined bits, and the cumulative exception flags
/// are stripped unless they were explicitly put under test. Whenever they
/// are stripped, they are also cleared in the live record, so execution
/// resumes with clean flags on both peers instead of accumulating.
///
/// A missing or malformed VFP record (a no-VFP kernel) leaves everything
/// zero, which still compares meaningfully when both peers agree.
pub(crate) fn vfp_state(regspace: &mut [u8], test_fp_exc: bool) -> ([u64; 32], u32) {
    let mut off = 0;
    while off + 8 <= regspace.len() {
        let magic = read_u32(regspace, off);
        let size = read_u32(regspace, off + 4) as usize;
        if magic == 0 || size < 8 || off + size > regspace.len() {
            break;
        }
        if magic == VFP_MAGIC && size >= VFP_MIN_RECORD_SIZE {
            let mut fpregs = [0u64; 32];
            for (i, r) in fpregs.iter_mut().enumerate() {
                let at = off + 8 + i * 8;
                *r = u64::from_ne_bytes(regspace[at..at + 8].try_into().unwrap());
            }
            let fpscr_at = off + 8 + 32 * 8;
            let raw = read_u32(regspace, fpscr_at);
            let mut fpscr = raw & FPSCR_MASK;
            if !test_fp_exc {
                fpscr &= !FPSCR_CUMULATIVE;
                let cleared = raw & !FPSCR_CUMULATIVE;
                regspace[fpscr_at..fpscr_at + 4].copy_from_slice(&cleared.to_ne_bytes());
            }
            return (fpregs, fpscr);
        }
        off += size;
    }
    ([0; 32], 0)
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap())
}

#[cfg(all(target_os = "linux", target_arch = "arm"))]
pub use frame::TrapFrame;

#[cfg(all(target_os = "linux", target_arch = "arm"))]
mod frame {
    use super::*;
    use crate::engine::FrameOps;

    const CPSR_THUMB: libc::c_ulong = 0x20;

    /// The glibc ARM ucontext layout. Defined here because the libc
    /// binding does not expose `uc_regspace`, where the kernel parks the
    /// VFP record chain.
    #[allow(dead_code)]
    #[repr(C)]
    struct UContext {
        uc_flags: libc::c_ulong,
        uc_link: *mut UContext,
        uc_stack: libc::stack_t,
        uc_mcontext: MContext,
        uc_sigmask: [u8; 128],
        uc_regspace: RegSpace,
    }

    #[allow(dead_code)]
    #[repr(C)]
    struct MContext {
        trap_no: libc::c_ulong,
        error_code: libc::c_ulong,
        oldmask: libc::c_ulong,
        arm_r0: libc::c_ulong,
        arm_r1: libc::c_ulong,
        arm_r2: libc::c_ulong,
        arm_r3: libc::c_ulong,
        arm_r4: libc::c_ulong,
        arm_r5: libc::c_ulong,
        arm_r6: libc::c_ulong,
        arm_r7: libc::c_ulong,
        arm_r8: libc::c_ulong,
        arm_r9: libc::c_ulong,
        arm_r10: libc::c_ulong,
        arm_fp: libc::c_ulong,
        arm_ip: libc::c_ulong,
        arm_sp: libc::c_ulong,
        arm_lr: libc::c_ulong,
        arm_pc: libc::c_ulong,
        arm_cpsr: libc::c_ulong,
        fault_address: libc::c_ulong,
    }

    #[repr(C, align(8))]
    struct RegSpace([u8; 512]);

    pub struct TrapFrame<'a> {
        uc: &'a mut UContext,
    }

    impl<'a> TrapFrame<'a> {
        /// # Safety
        ///
        /// `uc` must be the `ucontext` argument of a `SA_SIGINFO` signal
        /// handler, and no other reference to it may exist.
        pub unsafe fn from_ucontext(uc: *mut libc::c_void) -> TrapFrame<'a> {
            TrapFrame {
                uc: &mut *(uc as *mut UContext),
            }
        }

        fn insn_size(&self) -> u32 {
            if self.uc.uc_mcontext.arm_cpsr & CPSR_THUMB != 0 {
                let halfword =
                    unsafe { std::ptr::read_unaligned(self.uc.uc_mcontext.arm_pc as *const u16) };
                thumb_insn_size(halfword)
            } else {
                4
            }
        }

        pub fn capture(&mut self, image_base: u64, test_fp_exc: bool) -> RegState {
            let mut state = RegState::zeroed();
            {
                let mc = &self.uc.uc_mcontext;
                state.gpregs[0] = mc.arm_r0 as u32;
                state.gpregs[1] = mc.arm_r1 as u32;
                state.gpregs[2] = mc.arm_r2 as u32;
                state.gpregs[3] = mc.arm_r3 as u32;
                state.gpregs[4] = mc.arm_r4 as u32;
                state.gpregs[5] = mc.arm_r5 as u32;
                state.gpregs[6] = mc.arm_r6 as u32;
                state.gpregs[7] = mc.arm_r7 as u32;
                state.gpregs[8] = mc.arm_r8 as u32;
                state.gpregs[9] = mc.arm_r9 as u32;
                state.gpregs[10] = mc.arm_r10 as u32;
                state.gpregs[11] = mc.arm_fp as u32;
                state.gpregs[12] = mc.arm_ip as u32;
                state.gpregs[13] = SP_SENTINEL;
                state.gpregs[14] = mc.arm_lr as u32;
                state.gpregs[15] = (mc.arm_pc as u32).wrapping_sub(image_base as u32);
                state.cpsr = mc.arm_cpsr as u32 & CPSR_MASK;

                state.faulting_insn_size = self.insn_size();
                state.faulting_insn =
                    unsafe { std::ptr::read_unaligned(mc.arm_pc as *const u16) } as u32;
                if state.faulting_insn_size != 2 {
                    let cont = unsafe {
                        std::ptr::read_unaligned((mc.arm_pc as *const u16).add(1))
                    };
                    state.faulting_insn |= u32::from(cont) << 16;
                }
            }

            let (fpregs, fpscr) = vfp_state(&mut self.uc.uc_regspace.0, test_fp_exc);
            state.fpregs = fpregs;
            state.fpscr = fpscr;
            state
        }

        pub fn advance_pc(&mut self) {
            let step = self.insn_size();
            self.uc.uc_mcontext.arm_pc += libc::c_ulong::from(step);
        }
    }

    impl FrameOps for TrapFrame<'_> {
        fn set_result_reg(&mut self, value: u64) {
            self.uc.uc_mcontext.arm_r0 = value as libc::c_ulong;
        }
    }
}
