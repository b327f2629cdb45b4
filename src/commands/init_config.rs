use std::path::Path;

use alarmd_core::config::create_default_config;
use anyhow::Result;
use owo_colors::OwoColorize;

pub fn run(path: &Path) -> Result<()> {
    create_default_config(path)?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}
