mod cli;
mod core;
mod platform;
mod util;

use std::process;

fn main() {
    env_logger::init();

    let args = cli::parse();

    match cli::commands::dispatch(args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("vessel: {e:#}");
            process::exit(1);
        }
    }
}
