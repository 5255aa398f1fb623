mod commands;

use crate::commands::RootCommand;

fn main() {
    let opts: RootCommand = argh::from_env();

    if let Err(code) = opts.run() {
        std::process::exit(code);
    }
}
