use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lockstep",
    version,
    about = r#"
lockstep runs the same test image on two machines and compares CPU state
after every test instruction.

The master (usually real hardware) arbitrates; the apprentice (usually an
emulator) connects to it and follows its verdicts. A session stops at the
first divergence.

EXAMPLES:
    # On the reference machine:
    lockstep --master test_image.bin

    # On the machine under test:
    lockstep --host refbox test_image.bin
"#
)]
pub struct Opt {
    /// Act as the master (reference) end of the session.
    #[arg(long)]
    pub master: bool,

    /// Host to connect to (apprentice only).
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// TCP port the master listens on and the apprentice connects to.
    #[arg(long, default_value = "9191")]
    pub port: u16,

    /// Include the cumulative FP exception flags in the comparison.
    /// Off by default: too many execution environments get them wrong.
    #[arg(long)]
    pub test_fp_exc: bool,

    /// Path to the test image.
    pub image: PathBuf,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opt::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let opt = Opt::parse_from(["lockstep", "image.bin"]);
        assert!(!opt.master);
        assert_eq!(opt.host, "localhost");
        assert_eq!(opt.port, 9191);
        assert!(!opt.test_fp_exc);
        assert_eq!(opt.image, PathBuf::from("image.bin"));
    }

    #[test]
    fn master_with_port() {
        let opt = Opt::parse_from(["lockstep", "--master", "--port", "4000", "image.bin"]);
        assert!(opt.master);
        assert_eq!(opt.port, 4000);
    }

    #[test]
    fn image_is_required() {
        assert!(Opt::try_parse_from(["lockstep", "--master"]).is_err());
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(Opt::try_parse_from(["lockstep", "--frobnicate", "image.bin"]).is_err());
    }
}
