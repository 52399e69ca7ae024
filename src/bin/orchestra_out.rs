use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use orchestra::audio::Interface;
use orchestra::cli::{load_config, report_error, run_playback, OutArgs};
use orchestra::config::OrchestraConfig;
use orchestra::error::ToolError;

const TOOL: &str = "orchestra-out";

fn run(args: &OutArgs, config: &OrchestraConfig, stop: Arc<AtomicBool>) -> Result<(), ToolError> {
    let settings = args.stream.resolve(config)?;
    let mut interface = Interface::with_backend(settings.api)?;

    let report = run_playback(&mut interface, &settings, std::io::stdin(), stop)?;
    eprintln!("{}: played {}", TOOL, report.summary());
    Ok(())
}

fn main() {
    let args = OutArgs::parse();
    let config = load_config();
    if let Err(e) = orchestra::logging::init(args.stream.log_level(&config)) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        eprintln!("Warning: Ctrl-C will not stop playback cleanly: {}", e);
    }

    if let Err(e) = run(&args, &config, stop) {
        report_error(TOOL, &e);
        std::process::exit(1);
    }
}
