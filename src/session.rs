//! Drives one lockstep session: installs the illegal-instruction handler,
//! enters the image, and turns the engine's verdicts into PC advances or
//! process exits.

use std::io;
use std::process;
use std::sync::atomic::{AtomicPtr, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::arch::native::{RegState, TrapFrame};
use crate::comms::Comms;
use crate::engine::{Apprentice, Master, Verdict};
use crate::image::Image;

enum Peer {
    Master(Master<RegState>),
    Apprentice(Apprentice),
}

struct Session {
    peer: Peer,
    image_base: u64,
    test_fp_exc: bool,
}

/// Installed once, before the trap handler is armed; the handler is the
/// only reader afterwards. The trap handler cannot take arguments, so this
/// is the one well-known place it finds its state.
static SESSION: AtomicPtr<Session> = AtomicPtr::new(std::ptr::null_mut());

pub fn run_master(comms: Comms, image: &Image, test_fp_exc: bool) -> ! {
    run(Peer::Master(Master::new(comms)), image, test_fp_exc)
}

pub fn run_apprentice(comms: Comms, image: &Image, test_fp_exc: bool) -> ! {
    run(Peer::Apprentice(Apprentice::new(comms)), image, test_fp_exc)
}

fn run(peer: Peer, image: &Image, test_fp_exc: bool) -> ! {
    let session = Box::new(Session {
        peer,
        image_base: image.base(),
        test_fp_exc,
    });
    SESSION.store(Box::into_raw(session), Ordering::Release);
    install_trap_handler();

    eprintln!("starting image");
    // Safety: loading the file as an image is the user's claim that it is
    // valid code for this machine.
    unsafe { image.enter() };
    eprintln!("image returned unexpectedly");
    process::exit(1);
}

fn install_trap_handler() {
    let action = SigAction::new(
        SigHandler::SigAction(on_illegal_insn),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    if let Err(e) = unsafe { sigaction(Signal::SIGILL, &action) } {
        eprintln!("sigaction failed: {e}");
        process::exit(1);
    }
}

extern "C" fn on_illegal_insn(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    // Safety: SA_SIGINFO delivery hands the handler a live ucontext, and
    // the session pointer was published before the handler was armed.
    let session = unsafe { SESSION.load(Ordering::Acquire).as_mut() };
    let Some(session) = session else {
        process::abort()
    };
    let mut frame = unsafe { TrapFrame::from_ucontext(uc) };
    let state = frame.capture(session.image_base, session.test_fp_exc);

    let result = match &mut session.peer {
        Peer::Master(master) => master.step(&state, &mut frame),
        Peer::Apprentice(apprentice) => apprentice.step(&state, &mut frame),
    };

    match result {
        Ok(Verdict::Continue) => frame.advance_pc(),
        Ok(verdict) => finish(session, verdict),
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }
}

/// A terminal verdict. The master prints its report first; at this point
/// the main thread is parked inside the image, so nothing is holding
/// stderr, and the process is over either way.
fn finish(session: &Session, verdict: Verdict) -> ! {
    match &session.peer {
        Peer::Apprentice(_) => {
            process::exit(if verdict == Verdict::TestEnd { 0 } else { 1 })
        }
        Peer::Master(master) => {
            let mut stderr = io::stderr().lock();
            let ok = master.report(&mut stderr).unwrap_or(false);
            process::exit(if ok { 0 } else { 1 })
        }
    }
}
