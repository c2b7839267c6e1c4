pub mod build_info;
pub mod callback;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod facility;
pub mod health;
pub mod install;
pub mod java;
pub mod logging;
pub mod memory;
pub mod policy;
pub mod prefs;
pub mod supervisor;
pub mod volumes;
pub mod xml;

#[cfg(test)]
pub(crate) mod test_http;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
