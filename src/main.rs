use std::sync::atomic::Ordering;

use mx26301::{StopReason, Vm};

fn main() {
    env_logger::init();

    let mut vm = Vm::new();

    let stop = vm.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || {
        stop.store(true, Ordering::Relaxed);
    }) {
        log::warn!("failed to install SIGINT handler: {err}");
    }

    match vm.run() {
        StopReason::Halted => {
            log::info!("halted");
        }
        StopReason::Shutdown => {
            log::info!("shut down by signal");
        }
        StopReason::FatalTrap(err) => {
            eprintln!("fatal trap: {err}");
            std::process::exit(1);
        }
    }
}
