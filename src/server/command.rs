use bytes::Bytes;
use log::debug;

use crate::server::protocol::{Command, Response};
use crate::session::Session;

/// Runs one command against the session. Errors become error responses; the
/// session itself decides what happens to the transaction.
pub fn execute(session: &mut Session, command: Command) -> Response {
    let result = match command {
        Command::Begin => session.begin().map(|_| Vec::new()),
        Command::Commit => session.commit().map(|_| Vec::new()),
        Command::Rollback => session.rollback().map(|_| Vec::new()),
        Command::Query(query) => session.execute(&query),
    };
    match result {
        Ok(lines) => Response::Success(Bytes::from(lines.join("\n"))),
        Err(err) => {
            debug!("command failed: {}", err);
            Response::Error(err.to_string())
        }
    }
}
