use clap::Parser;
use log::info;

use orchestra::audio::Interface;
use orchestra::cli::{collect_listing, load_config, report_error, ListArgs};
use orchestra::config::ConfigManager;
use orchestra::error::ToolError;

const TOOL: &str = "orchestra-list";

fn run(args: &ListArgs) -> Result<(), ToolError> {
    let mut interface = Interface::new();
    let apis = match args.api {
        Some(api) => vec![api],
        None => interface.list_api(),
    };

    let listing = collect_listing(&mut interface, &apis);
    if args.json {
        let json = listing
            .render_json()
            .map_err(|e| ToolError::Usage(format!("cannot encode the listing: {}", e)))?;
        println!("{}", json);
    } else {
        print!("{}", listing.render_text());
    }

    if args.save {
        let mut manager = ConfigManager::new()?;
        manager.set_preferred_api(args.api)?;
        info!(
            "saved preferred backend to {}",
            manager.config_path().display()
        );
    }
    Ok(())
}

fn main() {
    let args = ListArgs::parse();
    let config = load_config();
    let level = args.log_level.as_deref().or(config.log_level.as_deref());
    if let Err(e) = orchestra::logging::init(level) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(&args) {
        report_error(TOOL, &e);
        std::process::exit(1);
    }
}
