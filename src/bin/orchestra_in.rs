use clap::Parser;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use orchestra::audio::Interface;
use orchestra::cli::{load_config, report_error, run_capture, InArgs};
use orchestra::config::OrchestraConfig;
use orchestra::error::ToolError;

const TOOL: &str = "orchestra-in";

fn run(args: &InArgs, config: &OrchestraConfig, stop: Arc<AtomicBool>) -> Result<(), ToolError> {
    let settings = args.stream.resolve(config)?;
    let duration = args.duration()?;
    let mut interface = Interface::with_backend(settings.api)?;

    let stdout = std::io::stdout();
    let writer = BufWriter::new(stdout.lock());
    let report = run_capture(&mut interface, &settings, writer, stop, duration)?;
    eprintln!("{}: recorded {}", TOOL, report.summary());
    Ok(())
}

fn main() {
    let args = InArgs::parse();
    let config = load_config();
    if let Err(e) = orchestra::logging::init(args.stream.log_level(&config)) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        eprintln!("Warning: Ctrl-C will not stop the recording cleanly: {}", e);
    }

    if let Err(e) = run(&args, &config, stop) {
        report_error(TOOL, &e);
        std::process::exit(1);
    }
}
