use clap::Parser;

fn main() {
    let cli = vidqctl::Cli::parse();
    if let Err(err) = vidqctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
