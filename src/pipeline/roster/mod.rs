pub mod csv;
pub mod persist;
pub mod schema;
pub mod store;

pub use schema::*;
pub use store::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Roster file is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Roster file layout is invalid: {0}")]
    MalformedSchema(String),

    #[error("Roster file has no header row")]
    Empty,

    #[error("Username '{0}' appears more than once in the roster")]
    DuplicateUsername(String),

    #[error("{} is open in another application ({reason}); close it and retry", path.display())]
    FileLocked {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("Cannot {operation} while roster is {state:?}")]
    InvalidTransition {
        state: RosterState,
        operation: &'static str,
    },
}
