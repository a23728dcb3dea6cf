//! Locatorctl.
//!
//! Drives the locator caches from the command line: resolving single entities, preloading batches
//! of them, sweeping expired locators and inspecting the persisted caches.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
