//! Names of the databases this process reads from.
//!
//! Lookups carry the database name so the master can refuse to answer from a cache warmed
//! against a different database. Connection layers report every attach and detach through
//! [`CurrentDatabase::record`]; the name with the most live connections is current.
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

#[derive(Debug, Default)]
struct Connections {
    current: HashMap<String, usize>,
    historical: HashMap<String, usize>,
}

impl Connections {
    fn of(&mut self, historical: bool) -> &mut HashMap<String, usize> {
        if historical {
            &mut self.historical
        } else {
            &mut self.current
        }
    }
}

#[derive(Debug, Default)]
pub struct CurrentDatabase {
    connections: RwLock<Connections>,
}

impl CurrentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `connections` sessions are now open against `database`.
    pub fn record(&self, database: &str, historical: bool, connections: usize) {
        let mut state = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let names = state.of(historical);
        if connections == 0 {
            names.remove(database);
        } else {
            names.insert(database.to_string(), connections);
        }
    }

    /// Database in use for current or historical data, empty if none is known.
    pub fn name(&self, historical: bool) -> String {
        let state = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let names = if historical {
            &state.historical
        } else {
            &state.current
        };
        names
            .iter()
            .max_by(|(a, m), (b, n)| m.cmp(n).then_with(|| b.cmp(a)))
            .map(|(name, _)| name.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_empty() {
        assert_eq!(CurrentDatabase::new().name(false), "");
    }

    #[test]
    fn most_connections_wins() {
        let db = CurrentDatabase::new();
        db.record("ATSEP", false, 1);
        db.record("ATSEB", false, 3);
        db.record("ATSEH", true, 2);

        assert_eq!(db.name(false), "ATSEB");
        assert_eq!(db.name(true), "ATSEH");

        db.record("ATSEB", false, 0);
        assert_eq!(db.name(false), "ATSEP");
    }

    #[test]
    fn ties_break_by_name() {
        let db = CurrentDatabase::new();
        db.record("B", false, 2);
        db.record("A", false, 2);
        assert_eq!(db.name(false), "A");
    }
}
