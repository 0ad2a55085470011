//! Administrative console commands.
//!
//! The [`Command`] enum is what an operator can ask a running client to do: probe a master,
//! stop or restart the remote cache, switch transports, inspect and change parameters, or
//! issue a lookup by hand.
//!
//! # Example
//! ```rust
//! use rcache::Command;
//!
//! let cmd = Command::try_from("healthcheck cache01 53701").unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Healthcheck {
//!         host: "cache01".into(),
//!         port: 53701
//!     }
//! );
//! ```
use thiserror::Error;

use crate::config::Endpoint;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `.exit`
    Exit,
    /// `help`
    Help,
    /// `healthcheck HOST PORT`
    Healthcheck { host: String, port: u16 },
    /// `disable`: stop every pool.
    Disable,
    /// `enable [HOST PORT [HOST PORT]]`: restart, optionally against new masters.
    Enable {
        primary: Option<Endpoint>,
        secondary: Option<Endpoint>,
    },
    /// `persistent` / `nonpersistent`
    Persistent(bool),
    /// `params`
    Params,
    /// `set NAME VALUE`
    Set { name: String, value: String },
    /// `stats`
    Stats,
    /// `get DATA_TYPE KEY [historical]`
    Get {
        data_type: String,
        key: String,
        historical: bool,
    },
}

pub const HELP: &str = "\
healthcheck HOST PORT            probe a master
disable                          stop the remote cache
enable [HOST PORT [HOST PORT]]   start it, optionally against new masters
persistent | nonpersistent       select the transport
params                           list parameters
set NAME VALUE                   change a parameter
stats                            show counters and pools
get DATA_TYPE KEY [historical]   look a key up
.exit                            leave the console";

fn invalid(command: &str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn endpoint(command: &str, host: &str, port: &str) -> Result<Endpoint, CommandError> {
    let port = port
        .parse::<u16>()
        .map_err(|_| invalid(command, format!("'{port}' is not a port number")))?;
    Ok(Endpoint::new(host, port))
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let parts = line.split_whitespace().collect::<Vec<&str>>();
        let Some((&name, args)) = parts.split_first() else {
            return Err(CommandError::Empty);
        };

        match (name.to_lowercase().as_str(), args) {
            (".exit", []) => Ok(Command::Exit),
            ("help", []) => Ok(Command::Help),
            ("healthcheck", [host, port]) => {
                let Endpoint { host, port } = endpoint(name, host, port)?;
                Ok(Command::Healthcheck { host, port })
            }
            ("healthcheck", _) => Err(invalid(
                name,
                "requires a host and a port. Example: healthcheck cache01 53701",
            )),
            ("disable", []) => Ok(Command::Disable),
            ("enable", []) => Ok(Command::Enable {
                primary: None,
                secondary: None,
            }),
            ("enable", [host, port]) => Ok(Command::Enable {
                primary: Some(endpoint(name, host, port)?),
                secondary: None,
            }),
            ("enable", [host, port, secondary_host, secondary_port]) => Ok(Command::Enable {
                primary: Some(endpoint(name, host, port)?),
                secondary: Some(endpoint(name, secondary_host, secondary_port)?),
            }),
            ("enable", _) => Err(invalid(
                name,
                "takes no argument, a primary, or a primary and a secondary host and port",
            )),
            ("persistent", []) => Ok(Command::Persistent(true)),
            ("nonpersistent", []) => Ok(Command::Persistent(false)),
            ("params", []) => Ok(Command::Params),
            ("set", [option, value]) => Ok(Command::Set {
                name: option.to_uppercase(),
                value: value.to_string(),
            }),
            ("set", _) => Err(invalid(
                name,
                "requires a parameter name and a value. Example: set MAX_NUMBER_CLIENTS 10",
            )),
            ("stats", []) => Ok(Command::Stats),
            ("get", [data_type, key]) => Ok(Command::Get {
                data_type: data_type.to_string(),
                key: key.to_string(),
                historical: false,
            }),
            ("get", [data_type, key, flag]) if flag.eq_ignore_ascii_case("historical") => {
                Ok(Command::Get {
                    data_type: data_type.to_string(),
                    key: key.to_string(),
                    historical: true,
                })
            }
            ("get", _) => Err(invalid(
                name,
                "requires a data type and a key. Example: get FareInfo ATL|DFW",
            )),
            _ => Err(CommandError::UnrecognizedCommand(line.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            ("help", Command::Help),
            ("disable", Command::Disable),
            ("persistent", Command::Persistent(true)),
            ("nonpersistent", Command::Persistent(false)),
            ("params", Command::Params),
            ("stats", Command::Stats),
            (
                "set idle_slave_timeout 30",
                Command::Set {
                    name: "IDLE_SLAVE_TIMEOUT".into(),
                    value: "30".into(),
                },
            ),
            (
                "  get FareInfo ATL|DFW historical ",
                Command::Get {
                    data_type: "FareInfo".into(),
                    key: "ATL|DFW".into(),
                    historical: true,
                },
            ),
        ];

        for (line, expected) in inputs {
            assert_eq!(Command::try_from(line).unwrap(), expected, "{line}");
        }
    }

    #[test]
    fn enable_variants() {
        assert_eq!(
            Command::try_from("enable").unwrap(),
            Command::Enable {
                primary: None,
                secondary: None
            }
        );
        assert_eq!(
            Command::try_from("enable a 1 b 2").unwrap(),
            Command::Enable {
                primary: Some(Endpoint::new("a", 1)),
                secondary: Some(Endpoint::new("b", 2)),
            }
        );
        assert!(matches!(
            Command::try_from("enable a"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Command::try_from("   "), Err(CommandError::Empty));
        assert_eq!(
            Command::try_from("flush all"),
            Err(CommandError::UnrecognizedCommand("flush all".into()))
        );
        assert!(matches!(
            Command::try_from("healthcheck cache01 http"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert!(matches!(
            Command::try_from("get FareInfo k yesterday"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
    }
}
