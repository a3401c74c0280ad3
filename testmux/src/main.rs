// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use testmux::TestmuxApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let opts = TestmuxApp::parse();
    let output = match opts.init_output() {
        Ok(output) => output,
        Err(error) => {
            // Logging isn't set up, so this can only go to stderr directly.
            eprintln!("error: {error}");
            std::process::exit(error.process_exit_code())
        }
    };

    match opts.exec(output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
