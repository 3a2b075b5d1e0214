use clap::Parser;

fn main() {
    let cli = streamtestctl::Cli::parse();
    match streamtestctl::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
