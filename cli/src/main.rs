#[macro_use]
extern crate log;

use structopt::StructOpt;

mod export;
mod inputs;
mod mode;

fn main() {
    let opts = mode::Opts::from_args();

    let level = match opts.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(opts) {
        error!("{e:?}");
        std::process::exit(1)
    }
}

fn run(opts: mode::Opts) -> anyhow::Result<()> {
    let config = mode::ExportConfig::resolve(opts);
    let path = export::run(&config)?;
    println!("Model exported to {}", path.display());
    Ok(())
}
