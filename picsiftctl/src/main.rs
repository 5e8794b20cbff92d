use clap::Parser;

#[tokio::main]
async fn main() {
    picsiftctl::init_tracing();
    let cli = picsiftctl::Cli::parse();
    if let Err(err) = picsiftctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
