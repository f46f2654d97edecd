use std::process;

mod cli;
mod setup;

fn main() {
    match cli::execute() {
        Ok(()) => process::exit(0),
        Err(error) => {
            eprintln!("error: {error}");
            for cause in error.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            process::exit(1);
        }
    }
}
