mod audit;
mod batch;
mod cli;
mod config;
mod container_move;
mod containers;
mod database;
mod dedup;
mod engine;
mod error;
mod items;
mod references;
mod reports;
mod schema;
#[cfg(test)]
mod test_support;
mod utils;

use cli::Cli;
use config::Config;
use directories::ProjectDirs;
use flexi_logger::Logger;
use log::{debug, error};

fn main() {
    let Some(project_dirs) = ProjectDirs::from("", "", "catmerge") else {
        eprintln!("Could not determine the catmerge data directory");
        std::process::exit(1);
    };

    let config = Config::load_config(&project_dirs);

    // Level comes from `logging.catmerge` (or CATMERGE_LOGGING__CATMERGE)
    let _logger = match Logger::try_with_str(format!("catmerge={}", config.logging.catmerge))
        .and_then(|logger| logger.log_to_stderr().start())
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to start logger: {}", e);
            None
        }
    };
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    if let Err(err) = Cli::handle_command_line(&config, project_dirs.data_local_dir()) {
        error!("{:?}", err);
        eprintln!("{}", err);
        // 2: refused before any write; 1: failed during or after a transaction
        std::process::exit(if err.is_pre_transaction() { 2 } else { 1 });
    }
}
