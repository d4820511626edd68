//! The lockstep engine: one step per trap, on either side of the wire.
//!
//! Both step functions run inside the SIGILL handler, so everything on the
//! non-terminal paths sticks to operations that are safe there: the receive
//! buffers are preallocated, nothing locks, and nothing prints. The outer
//! handler turns `Continue` into a PC advance and anything else into a
//! process exit.

use std::io::{self, Write};

use bytemuck::{bytes_of, bytes_of_mut, Zeroable};
use thiserror::Error;

use crate::comms::{Comms, CommsError, Received};
use crate::snapshot::{MarkerOp, Snapshot};

/// Length of the memory block a test image registers for store testing.
pub const MEM_BLOCK_LEN: usize = 8192;

/// The master's ruling on one exchange, also the byte that goes over the
/// wire: 0 continue, 1 match and end of test, 2 mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    TestEnd,
    Mismatch,
}

impl Verdict {
    pub fn as_byte(self) -> u8 {
        match self {
            Verdict::Continue => 0,
            Verdict::TestEnd => 1,
            Verdict::Mismatch => 2,
        }
    }

    /// Bytes outside the alphabet mean the channel is in an unknown state;
    /// the only useful reaction is to stop.
    pub fn from_byte(byte: u8) -> Verdict {
        match byte {
            0 => Verdict::Continue,
            1 => Verdict::TestEnd,
            _ => Verdict::Mismatch,
        }
    }
}

/// The engine's window onto the live trap frame: the one register write
/// GetMemBlock needs. PC adjustment stays with the outer handler.
pub trait FrameOps {
    fn set_result_reg(&mut self, value: u64);
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Comms(#[from] CommsError),
    #[error("memory operation before a memory block was registered")]
    NoMemBlock,
}

fn mem_block(base: u64) -> Result<&'static [u8], StepError> {
    if base == 0 {
        return Err(StepError::NoMemBlock);
    }
    // Safety: the image registered `base` via SetMemBlock and the block
    // lives inside the image mapping, which stays mapped for the whole
    // process lifetime.
    Ok(unsafe { std::slice::from_raw_parts(base as *const u8, MEM_BLOCK_LEN) })
}

/// The apprentice side: offers its state and obeys the verdicts.
pub struct Apprentice {
    comms: Comms,
    mem_base: u64,
}

impl Apprentice {
    pub fn new(comms: Comms) -> Apprentice {
        Apprentice { comms, mem_base: 0 }
    }

    pub fn step<S: Snapshot>(
        &mut self,
        state: &S,
        frame: &mut dyn FrameOps,
    ) -> Result<Verdict, StepError> {
        match state.marker_op() {
            Some(MarkerOp::SetMemBlock) => {
                self.mem_base = state.arg();
                Ok(Verdict::Continue)
            }
            Some(MarkerOp::GetMemBlock) => {
                mem_block(self.mem_base)?;
                frame.set_result_reg(state.arg().wrapping_add(self.mem_base));
                Ok(Verdict::Continue)
            }
            Some(MarkerOp::CompareMem) => {
                let block = mem_block(self.mem_base)?;
                let verdict = self.comms.send_data_pkt(block)?;
                Ok(Verdict::from_byte(verdict))
            }
            // Explicit compare, end of test, or an undefined encoding that
            // is not a marker: all exchange a snapshot. For a genuine UNDEF
            // the faulting-insn field itself is what gets compared.
            Some(MarkerOp::Compare) | Some(MarkerOp::TestEnd) | None => {
                let verdict = self.comms.send_data_pkt(bytes_of(state))?;
                Ok(Verdict::from_byte(verdict))
            }
        }
    }
}

/// The master side: receives the apprentice's state, compares it against
/// its own, and rules.
pub struct Master<S: Snapshot> {
    comms: Comms,
    mem_base: u64,
    master_state: S,
    apprentice_state: S,
    apprentice_mem: Box<[u8]>,
    packet_mismatch: bool,
    mem_used: bool,
}

impl<S: Snapshot> Master<S> {
    pub fn new(comms: Comms) -> Master<S> {
        Master {
            comms,
            mem_base: 0,
            master_state: S::zeroed(),
            apprentice_state: S::zeroed(),
            apprentice_mem: vec![0; MEM_BLOCK_LEN].into_boxed_slice(),
            packet_mismatch: false,
            mem_used: false,
        }
    }

    pub fn step(&mut self, state: &S, frame: &mut dyn FrameOps) -> Result<Verdict, StepError> {
        // Retained on every step so the end-of-session report always shows
        // the state at the point of divergence.
        self.master_state = *state;

        match state.marker_op() {
            Some(MarkerOp::SetMemBlock) => {
                self.mem_base = state.arg();
                Ok(Verdict::Continue)
            }
            Some(MarkerOp::GetMemBlock) => {
                mem_block(self.mem_base)?;
                frame.set_result_reg(state.arg().wrapping_add(self.mem_base));
                Ok(Verdict::Continue)
            }
            Some(MarkerOp::CompareMem) => {
                self.mem_used = true;
                let local = mem_block(self.mem_base)?;
                let verdict = match self.comms.recv_data_pkt(&mut self.apprentice_mem)? {
                    Received::LengthMismatch { .. } => {
                        self.packet_mismatch = true;
                        Verdict::Mismatch
                    }
                    Received::Ok if local != &self.apprentice_mem[..] => Verdict::Mismatch,
                    Received::Ok => Verdict::Continue,
                };
                self.comms.send_response_byte(verdict.as_byte())?;
                Ok(verdict)
            }
            op @ (Some(MarkerOp::Compare) | Some(MarkerOp::TestEnd) | None) => {
                let received = self
                    .comms
                    .recv_data_pkt(bytes_of_mut(&mut self.apprentice_state))?;
                let verdict = match received {
                    Received::LengthMismatch { .. } => {
                        self.packet_mismatch = true;
                        Verdict::Mismatch
                    }
                    Received::Ok if self.master_state != self.apprentice_state => Verdict::Mismatch,
                    Received::Ok if op == Some(MarkerOp::TestEnd) => Verdict::TestEnd,
                    Received::Ok => Verdict::Continue,
                };
                self.comms.send_response_byte(verdict.as_byte())?;
                Ok(verdict)
            }
        }
    }

    pub fn packet_mismatch(&self) -> bool {
        self.packet_mismatch
    }

    /// The end-of-session report. Returns true for a clean match.
    ///
    /// Called after a terminal verdict, outside the lockstep loop, so it is
    /// free to format as much as it likes.
    pub fn report(&self, w: &mut dyn Write) -> io::Result<bool> {
        writeln!(w, "match status...")?;
        if self.packet_mismatch {
            writeln!(
                w,
                "packet mismatch (probably disagreement about UNDEF on load/store)"
            )?;
            // The apprentice state is whatever the draining left behind,
            // not a snapshot; show only our own side.
            writeln!(w, "master register state:")?;
            self.master_state.write_dump(w)?;
            return Ok(false);
        }

        let mut ok = true;
        if self.master_state != self.apprentice_state {
            writeln!(w, "mismatch on regs!")?;
            ok = false;
        }
        if self.mem_used {
            if let Ok(local) = mem_block(self.mem_base) {
                if local != &self.apprentice_mem[..] {
                    writeln!(w, "mismatch on memory!")?;
                    ok = false;
                }
            }
        }
        if ok {
            writeln!(w, "match!")?;
            return Ok(true);
        }

        writeln!(w, "master register state:")?;
        self.master_state.write_dump(w)?;
        writeln!(w, "apprentice register state:")?;
        self.apprentice_state.write_dump(w)?;
        self.master_state.write_mismatch(&self.apprentice_state, w)?;
        Ok(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::aarch64::RegState;
    use crate::comms::loopback_pair;
    use std::thread;

    const COMPARE: u32 = 0x0000_5af0;
    const TESTEND: u32 = 0x0000_5af1;
    const SETMEMBLOCK: u32 = 0x0000_5af2;
    const GETMEMBLOCK: u32 = 0x0000_5af3;
    const COMPAREMEM: u32 = 0x0000_5af4;

    fn snap(insn: u32) -> RegState {
        let mut state = RegState::zeroed();
        state.faulting_insn = insn;
        state.sp = 0xdead_beef_dead_beef;
        state
    }

    #[derive(Default)]
    struct MockFrame {
        result_reg: u64,
    }

    impl FrameOps for MockFrame {
        fn set_result_reg(&mut self, value: u64) {
            self.result_reg = value;
        }
    }

    #[test]
    fn trivial_success() {
        let (mc, ac) = loopback_pair();
        let apprentice = thread::spawn(move || {
            let mut app = Apprentice::new(ac);
            app.step(&snap(TESTEND), &mut MockFrame::default()).unwrap()
        });

        let mut master = Master::new(mc);
        let verdict = master.step(&snap(TESTEND), &mut MockFrame::default()).unwrap();
        assert_eq!(verdict, Verdict::TestEnd);
        assert_eq!(apprentice.join().unwrap(), Verdict::TestEnd);

        let mut out = Vec::new();
        assert!(master.report(&mut out).unwrap());
        assert!(String::from_utf8(out).unwrap().contains("match!\n"));
    }

    #[test]
    fn register_mismatch_names_the_register() {
        let (mc, ac) = loopback_pair();
        let apprentice = thread::spawn(move || {
            let mut app = Apprentice::new(ac);
            let mut state = snap(COMPARE);
            state.regs[3] = 0x1;
            app.step(&state, &mut MockFrame::default()).unwrap()
        });

        let mut master = Master::new(mc);
        let verdict = master.step(&snap(COMPARE), &mut MockFrame::default()).unwrap();
        assert_eq!(verdict, Verdict::Mismatch);
        assert_eq!(apprentice.join().unwrap(), Verdict::Mismatch);

        let mut out = Vec::new();
        assert!(!master.report(&mut out).unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("mismatch on regs!\n"));
        assert!(text.contains("  X 3   : 0000000000000000 vs 0000000000000001\n"));
        // Only X3 diverged.
        assert_eq!(text.matches(" vs ").count(), 1);
    }

    #[test]
    fn non_marker_undef_acts_as_compare() {
        let (mc, ac) = loopback_pair();
        let apprentice = thread::spawn(move || {
            let mut app = Apprentice::new(ac);
            app.step(&snap(0xbadc_0de0), &mut MockFrame::default()).unwrap()
        });

        let mut master = Master::new(mc);
        let verdict = master
            .step(&snap(0xbadc_0de0), &mut MockFrame::default())
            .unwrap();
        assert_eq!(verdict, Verdict::Continue);
        assert_eq!(apprentice.join().unwrap(), Verdict::Continue);
    }

    #[test]
    fn memblock_relocation_exchanges_nothing() {
        let (mc, ac) = loopback_pair();

        let apprentice = thread::spawn(move || {
            let block = vec![0u8; MEM_BLOCK_LEN];
            let base = block.as_ptr() as u64;
            let mut app = Apprentice::new(ac);
            let mut frame = MockFrame::default();

            let mut set = snap(SETMEMBLOCK);
            set.regs[0] = base;
            assert_eq!(app.step(&set, &mut frame).unwrap(), Verdict::Continue);

            let mut get = snap(GETMEMBLOCK);
            get.regs[0] = 5;
            assert_eq!(app.step(&get, &mut frame).unwrap(), Verdict::Continue);
            assert_eq!(frame.result_reg, base + 5);

            // The stream must still be pristine: a full exchange works.
            app.step(&snap(COMPARE), &mut frame).unwrap()
        });

        let block = vec![0u8; MEM_BLOCK_LEN];
        let base = block.as_ptr() as u64;
        let mut master = Master::new(mc);
        let mut frame = MockFrame::default();

        let mut set = snap(SETMEMBLOCK);
        set.regs[0] = base;
        assert_eq!(master.step(&set, &mut frame).unwrap(), Verdict::Continue);

        let mut get = snap(GETMEMBLOCK);
        get.regs[0] = 5;
        assert_eq!(master.step(&get, &mut frame).unwrap(), Verdict::Continue);
        assert_eq!(frame.result_reg, base + 5);

        assert_eq!(
            master.step(&snap(COMPARE), &mut frame).unwrap(),
            Verdict::Continue
        );
        assert_eq!(apprentice.join().unwrap(), Verdict::Continue);
    }

    #[test]
    fn memory_mismatch_is_reported() {
        let (mc, ac) = loopback_pair();

        let apprentice = thread::spawn(move || {
            let mut block = vec![0u8; MEM_BLOCK_LEN];
            block[42] = 1;
            let mut app = Apprentice::new(ac);
            let mut frame = MockFrame::default();

            let mut set = snap(SETMEMBLOCK);
            set.regs[0] = block.as_ptr() as u64;
            app.step(&set, &mut frame).unwrap();

            assert_eq!(
                app.step(&snap(COMPARE), &mut frame).unwrap(),
                Verdict::Continue
            );

            app.step(&snap(COMPAREMEM), &mut frame).unwrap()
        });

        let block = vec![0u8; MEM_BLOCK_LEN];
        let mut master = Master::new(mc);
        let mut frame = MockFrame::default();

        let mut set = snap(SETMEMBLOCK);
        set.regs[0] = block.as_ptr() as u64;
        master.step(&set, &mut frame).unwrap();

        assert_eq!(
            master.step(&snap(COMPARE), &mut frame).unwrap(),
            Verdict::Continue
        );

        let verdict = master
            .step(&snap(COMPAREMEM), &mut frame)
            .unwrap();
        assert_eq!(verdict, Verdict::Mismatch);
        assert_eq!(apprentice.join().unwrap(), Verdict::Mismatch);

        let mut out = Vec::new();
        assert!(!master.report(&mut out).unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("mismatch on memory!\n"));
    }

    #[test]
    fn framing_mismatch_sets_the_flag_and_fails_cleanly() {
        let (mc, ac) = loopback_pair();

        let apprentice = thread::spawn(move || {
            // An apprentice built against an older snapshot layout: 8 bytes
            // short. Raw send, since the engine can't produce this.
            let mut ac = ac;
            ac.send_data_pkt(&[0u8; 792]).unwrap()
        });

        let mut master = Master::new(mc);
        let verdict = master.step(&snap(COMPARE), &mut MockFrame::default()).unwrap();
        assert_eq!(verdict, Verdict::Mismatch);
        assert!(master.packet_mismatch());
        assert_eq!(apprentice.join().unwrap(), 2);

        let mut out = Vec::new();
        assert!(!master.report(&mut out).unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("packet mismatch"));
        assert!(text.contains("master register state:\n"));
        assert!(!text.contains("apprentice register state:\n"));
    }

    #[test]
    fn snapshot_wire_roundtrip() {
        let (mc, ac) = loopback_pair();

        let mut state = snap(COMPARE);
        for (i, r) in state.regs.iter_mut().enumerate() {
            *r = 0x0101_0101_0101_0101 * i as u64;
        }
        state.pc = 0x1234;
        state.flags = 0x6000_0000;
        state.fpsr = 0x1f;
        state.fpcr = 0x0300_0000;
        for (i, v) in state.vregs.iter_mut().enumerate() {
            *v = u128::from_ne_bytes([i as u8; 16]);
        }

        let sent = state;
        let apprentice = thread::spawn(move || {
            let mut app = Apprentice::new(ac);
            app.step(&sent, &mut MockFrame::default()).unwrap()
        });

        // The master sees the identical state, so a byte-exact round trip
        // must rule Continue.
        let mut master = Master::new(mc);
        let verdict = master.step(&state, &mut MockFrame::default()).unwrap();
        assert_eq!(verdict, Verdict::Continue);
        assert_eq!(apprentice.join().unwrap(), Verdict::Continue);
    }

    #[test]
    fn unknown_verdict_byte_stops_the_apprentice() {
        let (mc, ac) = loopback_pair();

        let apprentice = thread::spawn(move || {
            let mut app = Apprentice::new(ac);
            app.step(&snap(COMPARE), &mut MockFrame::default()).unwrap()
        });

        let mut mc = mc;
        let mut buf = [0u8; std::mem::size_of::<RegState>()];
        mc.recv_data_pkt(&mut buf).unwrap();
        mc.send_response_byte(7).unwrap();
        assert_eq!(apprentice.join().unwrap(), Verdict::Mismatch);
    }

    #[test]
    fn memory_op_without_a_block_is_an_error() {
        let (_mc, ac) = loopback_pair();
        let mut app = Apprentice::new(ac);
        let err = app
            .step(&snap(COMPAREMEM), &mut MockFrame::default())
            .unwrap_err();
        assert!(matches!(err, StepError::NoMemBlock));
    }
}
