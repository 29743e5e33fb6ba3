//! Lets loose files replace entries inside `DW_PACK` archives without touching the archives.
//!
//! The library is loaded into the game's process, where a hooking layer routes the game's file
//! calls through the functions in [`hook`]. Reads from archives are then answered by
//! [`redirect::Redirector`].

mod error;
pub mod hook;
#[cfg_attr(test, allow(dead_code))]
mod logging;
pub mod native;
pub mod pack;
pub mod redirect;
pub mod settings;

#[cfg(test)]
mod testing;

pub use error::Fault;

#[cfg(not(test))]
#[ctor::ctor]
fn load() {
    // Load the logging system before everything else so we can log from constructors.
    let log_path = settings::base_dir().join(logging::LOG_FILE_NAME);

    if let Err(err) = logging::init(&log_path) {
        eprintln!("dwpack-redirect: logging unavailable: {:?}", err);
    }

    log::info!("Cargo package version is {}", env!("CARGO_PKG_VERSION"));

    settings::init();
}
