mod arch;
mod cli;
mod comms;
mod engine;
mod image;
mod session;
mod snapshot;

use clap::Parser;

use comms::Comms;
use image::Image;

fn main() {
    env_logger::init();

    let opt = match cli::Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            // Help and version go to stdout and exit 0; everything else is
            // a usage error.
            let is_usage_error = err.use_stderr();
            let _ = err.print();
            std::process::exit(if is_usage_error { 1 } else { 0 });
        }
    };

    eprintln!("loading test image {}...", opt.image.display());
    let image = match Image::load(&opt.image) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    log::debug!(
        "image mapped at {:#x}, {} bytes",
        image.base(),
        image.len()
    );

    if opt.master {
        eprintln!("master: waiting for connection on port {}...", opt.port);
        let comms = match Comms::listen(opt.port) {
            Ok(comms) => comms,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        };
        session::run_master(comms, &image, opt.test_fp_exc)
    } else {
        log::info!("apprentice: connecting to {}:{}", opt.host, opt.port);
        let comms = match Comms::connect(&opt.host, opt.port) {
            Ok(comms) => comms,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        };
        session::run_apprentice(comms, &image, opt.test_fp_exc)
    }
}
