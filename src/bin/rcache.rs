use std::{error::Error, fs, io, path::PathBuf, process, sync::Arc};

use clap::{Parser, Subcommand};
use log::info;

use rcache::{Command, Config, ConsoleError, RemoteCache, execute, prompt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file of KEY=VALUE lines
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Interactive administration console (default)
    Console,
    /// Look one key up and print the outcome
    Get {
        data_type: String,
        key: String,
        #[arg(long)]
        historical: bool,
        #[arg(long, default_value_t = 0)]
        dao_version: u32,
    },
    /// Probe a master
    Healthcheck { host: String, port: u16 },
    /// Print the effective parameters
    Params,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => fs::read_to_string(path)?.parse::<Config>()?,
        None => Config::default(),
    };
    let cache = Arc::new(RemoteCache::new(config));

    {
        let cache = Arc::clone(&cache);
        ctrlc::set_handler(move || {
            info!("interrupted, stopping remote cache");
            cache.stop();
            process::exit(130);
        })?;
    }

    match cli.mode.unwrap_or(Mode::Console) {
        Mode::Console => console(&cache)?,
        Mode::Get {
            data_type,
            key,
            historical,
            dao_version,
        } => {
            let result = cache.get(&data_type, key.as_bytes(), historical, dao_version);
            match result.value {
                Some(value) => println!("{} ({} bytes)", result.status, value.len()),
                None => println!("{}", result.status),
            }
        }
        Mode::Healthcheck { host, port } => println!("{}", cache.healthcheck(&host, port)),
        Mode::Params => println!("{}", cache.parameters()),
    }

    cache.stop();
    Ok(())
}

fn console(cache: &RemoteCache) -> Result<(), ConsoleError> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let command = match prompt(stdin.lock(), stdout.lock()) {
            Ok(command) => command,
            Err(ConsoleError::Closed) => return Ok(()),
            Err(ConsoleError::Command(e)) => {
                eprintln!("error: {e}");
                continue;
            }
            Err(e) => return Err(e),
        };

        if command == Command::Exit {
            return Ok(());
        }
        if let Some(out) = execute(cache, command) {
            println!("{out}");
        }
    }
}
