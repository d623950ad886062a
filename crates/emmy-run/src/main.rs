use clap::Parser;

fn main() -> miette::Result<()> {
    emmy_run::Cli::parse().run()
}
