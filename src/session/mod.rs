use std::ops::Bound;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, warn};

use crate::database::Database;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::index::LogMode;
use crate::transaction::{IsolationLevel, TxnContext};

/// One parsed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Create { name: String, unique: bool },
    Insert { index: String, key: Vec<u8>, value: Vec<u8> },
    Update { index: String, key: Vec<u8>, value: Vec<u8> },
    Delete { index: String, key: Vec<u8> },
    Get { index: String, key: Vec<u8> },
    /// Both bounds are inclusive.
    Scan {
        index: String,
        from: Option<Vec<u8>>,
        to: Option<Vec<u8>>,
    },
    List,
    Isolation(IsolationLevel),
}

impl FromStr for Statement {
    type Err = QuillStoreError;

    fn from_str(query: &str) -> QuillStoreResult<Self> {
        let words: Vec<&str> = query.split_whitespace().collect();
        let Some((verb, args)) = words.split_first() else {
            return Err(QuillStoreError::Protocol("empty query".to_string()));
        };
        let bytes = |s: &str| s.as_bytes().to_vec();
        let statement = match (verb.to_ascii_lowercase().as_str(), args) {
            ("create", [name]) => Statement::Create {
                name: name.to_string(),
                unique: false,
            },
            ("create", [name, flag]) if flag.eq_ignore_ascii_case("unique") => {
                Statement::Create {
                    name: name.to_string(),
                    unique: true,
                }
            }
            ("insert", [index, key, value]) => Statement::Insert {
                index: index.to_string(),
                key: bytes(key),
                value: bytes(value),
            },
            ("update", [index, key, value]) => Statement::Update {
                index: index.to_string(),
                key: bytes(key),
                value: bytes(value),
            },
            ("delete", [index, key]) => Statement::Delete {
                index: index.to_string(),
                key: bytes(key),
            },
            ("get", [index, key]) => Statement::Get {
                index: index.to_string(),
                key: bytes(key),
            },
            ("scan", [index, range @ ..]) if range.len() <= 2 => Statement::Scan {
                index: index.to_string(),
                from: range.first().map(|s| bytes(s)),
                to: range.get(1).map(|s| bytes(s)),
            },
            ("list", []) => Statement::List,
            ("isolation", [level]) => Statement::Isolation(
                IsolationLevel::from_str(level).map_err(QuillStoreError::Protocol)?,
            ),
            _ => {
                return Err(QuillStoreError::Protocol(format!(
                    "cannot parse '{}'",
                    query.trim()
                )))
            }
        };
        Ok(statement)
    }
}

/// A client's view of the database. Statements outside `begin`/`commit` run
/// in a transaction of their own; the session opens it before the statement
/// and finishes it afterwards.
pub struct Session {
    db: Arc<Database>,
    isolation: IsolationLevel,
    active: Option<TxnContext>,
    explicit: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("isolation", &self.isolation)
            .field("txn", &self.active.as_ref().map(|ctx| ctx.txn_id()))
            .field("explicit", &self.explicit)
            .finish()
    }
}

impl Session {
    pub fn new(db: Arc<Database>) -> Self {
        let isolation = db.default_isolation();
        Self {
            db,
            isolation,
            active: None,
            explicit: false,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    pub fn transaction(&self) -> Option<&TxnContext> {
        self.active.as_ref()
    }

    pub fn begin(&mut self) -> QuillStoreResult<()> {
        if let Some(ctx) = &self.active {
            return Err(QuillStoreError::Transaction(format!(
                "transaction {} already active",
                ctx.txn_id()
            )));
        }
        let ctx = self
            .db
            .begin_with(self.isolation, self.db.options().default_lock_depth)?;
        debug!("session began txn {}", ctx.txn_id());
        self.active = Some(ctx);
        self.explicit = true;
        Ok(())
    }

    pub fn commit(&mut self) -> QuillStoreResult<()> {
        let ctx = self.take_active()?;
        let result = self.db.commit(&ctx);
        if result.is_err() && ctx.transaction().is_running() {
            self.db.rollback(&ctx)?;
        }
        result
    }

    pub fn rollback(&mut self) -> QuillStoreResult<()> {
        let ctx = self.take_active()?;
        self.db.rollback(&ctx)
    }

    fn take_active(&mut self) -> QuillStoreResult<TxnContext> {
        self.explicit = false;
        self.active
            .take()
            .ok_or_else(|| QuillStoreError::Transaction("no active transaction".to_string()))
    }

    /// Parses and runs one query, returning its result lines.
    pub fn execute(&mut self, query: &str) -> QuillStoreResult<Vec<String>> {
        match query.parse::<Statement>()? {
            Statement::Isolation(level) => {
                if self.active.is_some() {
                    return Err(QuillStoreError::Transaction(
                        "isolation cannot change inside a transaction".to_string(),
                    ));
                }
                self.isolation = level;
                Ok(vec![format!("isolation {}", level.as_str())])
            }
            statement => self.run(|db, ctx| run_statement(db, ctx, statement)),
        }
    }

    /// Runs `f` in the session's transaction, opening an implicit one when
    /// none is active and finishing it afterwards.
    pub fn run<T, F>(&mut self, f: F) -> QuillStoreResult<T>
    where
        F: FnOnce(&Database, &TxnContext) -> QuillStoreResult<T>,
    {
        let implicit = self.active.is_none();
        let ctx = match self.active.take() {
            Some(ctx) => ctx,
            None => self
                .db
                .begin_with(self.isolation, self.db.options().default_lock_depth)?,
        };
        let result = f(&self.db, &ctx);
        match &result {
            Ok(_) if implicit => {
                if let Err(err) = self.db.commit(&ctx) {
                    if ctx.transaction().is_running() {
                        self.db.rollback(&ctx)?;
                    }
                    return Err(err);
                }
            }
            Ok(_) => self.active = Some(ctx),
            Err(err) if err.aborts_transaction() || (implicit && !err.is_io()) => {
                debug!("rolling back txn {} after: {}", ctx.txn_id(), err);
                self.explicit = false;
                self.db.rollback(&ctx)?;
            }
            Err(err) => {
                if implicit {
                    warn!(
                        "txn {} left open after i/o error: {}",
                        ctx.txn_id(),
                        err
                    );
                    self.explicit = true;
                }
                self.active = Some(ctx);
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(ctx) = self.active.take() {
            if let Err(err) = self.db.rollback(&ctx) {
                warn!("failed to roll back txn {}: {}", ctx.txn_id(), err);
            }
        }
    }
}

fn show(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn row(key: &[u8], value: &[u8]) -> String {
    format!("{}\t{}", show(key), show(value))
}

fn run_statement(
    db: &Database,
    ctx: &TxnContext,
    statement: Statement,
) -> QuillStoreResult<Vec<String>> {
    let lines = match statement {
        Statement::Create { name, unique } => {
            db.create_index(ctx, &name, &db.index_options(unique))?;
            vec![format!("created {}", name)]
        }
        Statement::Insert { index, key, value } => {
            db.open_index(ctx, &index)?
                .insert(ctx, &key, &value, LogMode::Logged)?;
            vec!["inserted 1".to_string()]
        }
        Statement::Update { index, key, value } => {
            let previous = db
                .open_index(ctx, &index)?
                .update(ctx, &key, &value, LogMode::Logged)?;
            vec![format!("updated {}", usize::from(previous.is_some()))]
        }
        Statement::Delete { index, key } => {
            let removed = db
                .open_index(ctx, &index)?
                .delete(ctx, &key, None, LogMode::Logged)?;
            vec![format!("deleted {}", usize::from(removed.is_some()))]
        }
        Statement::Get { index, key } => db
            .open_index(ctx, &index)?
            .get(ctx, &key)?
            .map(|value| row(&key, &value))
            .into_iter()
            .collect(),
        Statement::Scan { index, from, to } => {
            let range = (
                from.map_or(Bound::Unbounded, Bound::Included),
                to.map_or(Bound::Unbounded, Bound::Included),
            );
            let index = db.open_index(ctx, &index)?;
            let mut lines = Vec::new();
            for entry in index.scan(ctx, range)? {
                let (key, value) = entry?;
                lines.push(row(&key, &value));
            }
            lines
        }
        Statement::List => db
            .list_indexes(ctx)?
            .into_iter()
            .map(|d| {
                format!(
                    "{}\t{}{}",
                    d.name,
                    d.comparator,
                    if d.unique { " unique" } else { "" }
                )
            })
            .collect(),
        Statement::Isolation(_) => {
            return Err(QuillStoreError::Internal(
                "isolation is handled by the session".to_string(),
            ))
        }
    };
    Ok(lines)
}
