use std::process::ExitCode;

use anyhow::Result;
use gringo_core::PortAllocator;

pub fn run(from: u16) -> Result<ExitCode> {
    let port = PortAllocator::default().allocate(from)?;
    println!("{port}");
    Ok(ExitCode::SUCCESS)
}
