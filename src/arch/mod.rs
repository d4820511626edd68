//! Per-architecture snapshot types, marker decoding and trap-frame
//! adapters. The snapshot side of every module is portable (and tested on
//! every host); the trap-frame adapters only exist on their own target.

#[cfg_attr(not(all(target_os = "linux", target_arch = "aarch64")), allow(dead_code))]
pub mod aarch64;
#[cfg_attr(not(all(target_os = "linux", target_arch = "arm")), allow(dead_code))]
pub mod arm;
#[cfg_attr(not(all(target_os = "linux", target_arch = "x86_64")), allow(dead_code))]
pub mod x86_64;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        pub use aarch64 as native;
    } else if #[cfg(all(target_os = "linux", target_arch = "arm"))] {
        pub use arm as native;
    } else if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        pub use x86_64 as native;
    } else {
        compile_error!("lockstep only runs on Linux aarch64, arm or x86_64");
    }
}
