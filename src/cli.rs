//! Interactive administration console.
//!
//! [`prompt`] reads one [`Command`] from an operator and [`execute`] runs it against a
//! [`RemoteCache`], returning the text to show.
use std::io::{self, BufRead, Write};

use crate::{Command, CommandError, client::RemoteCache, command::HELP};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("console io error: {0}")]
    Io(#[from] io::Error),
    #[error("end of input")]
    Closed,
}

/// Prompts for one command. End of input is [`ConsoleError::Closed`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, ConsoleError>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut line)? == 0 {
        return Err(ConsoleError::Closed);
    }
    Ok(Command::try_from(line.as_str())?)
}

/// Runs `command`, returning what to print. `None` means the console should exit.
pub fn execute(cache: &RemoteCache, command: Command) -> Option<String> {
    let out = match command {
        Command::Exit => return None,
        Command::Help => HELP.to_string(),
        Command::Healthcheck { host, port } => cache.healthcheck(&host, port),
        Command::Disable => {
            cache.stop();
            "remote cache disabled".to_string()
        }
        Command::Enable { primary, secondary } => {
            cache.start(primary, secondary);
            match &cache.config().snapshot().master {
                Some(master) => format!("remote cache enabled, master {master}"),
                None => "remote cache enabled, no master configured".to_string(),
            }
        }
        Command::Persistent(persistent) => {
            cache.set_persistent(persistent);
            if persistent {
                "using persistent connections".to_string()
            } else {
                "using a connection per request".to_string()
            }
        }
        Command::Params => cache.parameters(),
        Command::Set { name, value } => match cache.set_parameter(&name, &value) {
            Ok(()) => format!("{name}={value}"),
            Err(e) => format!("error: {e}"),
        },
        Command::Stats => cache.report(),
        Command::Get {
            data_type,
            key,
            historical,
        } => {
            let result = cache.get(&data_type, key.as_bytes(), historical, 0);
            match result.value {
                Some(value) => format!("{} ({} bytes)", result.status, value.len()),
                None => result.status.to_string(),
            }
        }
    };
    Some(out)
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        protocol::Status,
        testing::{FakeMaster, Reply},
    };

    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_reports_end_of_input() {
        let mut output = Vec::new();
        assert!(matches!(
            prompt(&b""[..], &mut output),
            Err(ConsoleError::Closed)
        ));
    }

    #[test]
    fn prompt_unrecognized_command() {
        let mut output = Vec::new();
        let err = prompt(&b".something_wrong\n"[..], &mut output).unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }

    #[test]
    fn console_session() {
        let master = FakeMaster::start(|key| match key.key.as_slice() {
            b"USD" => Reply::Value(vec![1, 2, 3]),
            _ => Reply::NotFound,
        });
        let config: Config = format!("MASTER_HOST=127.0.0.1\nMASTER_PORT={}", master.port())
            .parse()
            .unwrap();
        let cache = RemoteCache::new(config);
        let run = |line: &str| execute(&cache, Command::try_from(line).unwrap());

        assert_eq!(run("get Currency USD").unwrap(), "VALUE_FOUND (3 bytes)");
        assert_eq!(run("get Currency EUR").unwrap(), Status::NotFound.to_string());
        assert_eq!(run("set max_number_clients 4").unwrap(), "MAX_NUMBER_CLIENTS=4");
        assert!(run("set max_number_clients none").unwrap().starts_with("error"));
        assert!(run("params").unwrap().contains("MAX_NUMBER_CLIENTS=4"));
        assert!(run("stats").unwrap().contains("found=1"));
        assert!(
            run(&format!("healthcheck 127.0.0.1 {}", master.port()))
                .unwrap()
                .ends_with("healthy")
        );

        run("disable");
        assert_eq!(run("get Currency USD").unwrap(), Status::Stopped.to_string());
        assert!(run("enable").unwrap().contains("127.0.0.1"));
        assert_eq!(run("get Currency USD").unwrap(), "VALUE_FOUND (3 bytes)");

        assert_eq!(run(".exit"), None);
    }
}
