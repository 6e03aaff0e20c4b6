use anyhow::Result;

use smartcard_control::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
