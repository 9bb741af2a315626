//! Preloader.
//!
//! Preloads the media resources listed in a request manifest into a bounded, expiring
//! in-memory cache and reports what happened to every resource.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;
mod manifest;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
