use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};

/// Exits non-zero unless the given URL answers with a success status.
fn main() -> ExitCode {
    match check(env::args().nth(1)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Health check failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn check(url: Option<String>) -> Result<()> {
    let Some(url) = url else {
        bail!("Missing URL argument")
    };
    let url = reqwest::Url::parse(&url).with_context(|| format!("Invalid URL {url}"))?;

    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        bail!("Request failed with status {}", response.status())
    }
    Ok(())
}
