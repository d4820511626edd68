use std::io;

use bytemuck::Pod;

/// The operation a marker instruction asks the harness to perform, carried
/// in the low nibble of the (otherwise fixed) marker encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOp {
    /// Exchange snapshots, compare, continue.
    Compare,
    /// As Compare, but a successful match ends the test.
    TestEnd,
    /// GP register 0 holds the base address of this peer's memory block.
    SetMemBlock,
    /// Add the memory-block base to GP register 0, in place.
    GetMemBlock,
    /// Exchange the full memory block and compare it byte for byte.
    CompareMem,
}

impl MarkerOp {
    pub fn from_nibble(op: u32) -> Option<MarkerOp> {
        match op {
            0 => Some(MarkerOp::Compare),
            1 => Some(MarkerOp::TestEnd),
            2 => Some(MarkerOp::SetMemBlock),
            3 => Some(MarkerOp::GetMemBlock),
            4 => Some(MarkerOp::CompareMem),
            _ => None,
        }
    }
}

/// A canonicalized, bit-comparable view of architectural state, captured
/// from a trap frame.
///
/// Implementations are `#[repr(C)]`, padding-free and fully initialized, so
/// the wire payload is exactly the in-memory bytes (`bytemuck::bytes_of`)
/// and `==` coincides with byte equality. The program counter is stored as
/// an offset from the image base; unreliable fields (stack pointer, segment
/// state, ...) carry a fixed sentinel so they never contribute mismatches.
pub trait Snapshot: Pod + PartialEq {
    /// The marker opcode embedded in the faulting instruction, or `None`
    /// for an illegal instruction that is not a marker. `None` is handled
    /// with `Compare` semantics: if both peers genuinely hit the same
    /// undefined encoding their snapshots still match.
    fn marker_op(&self) -> Option<MarkerOp>;

    /// GP register 0, the argument of SetMemBlock / GetMemBlock.
    fn arg(&self) -> u64;

    /// Print every field, one register per line, hex width matching the
    /// field width.
    fn write_dump(&self, w: &mut dyn io::Write) -> io::Result<()>;

    /// Print only the fields that differ, master values on the left.
    fn write_mismatch(&self, other: &Self, w: &mut dyn io::Write) -> io::Result<()>;
}
