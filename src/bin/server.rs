use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use quill_store::config::{DatabaseOptions, ServerConfig};
use quill_store::database::Database;
use quill_store::server::Server;
use quill_store::transaction::IsolationLevel;

#[derive(Debug, Parser, PartialEq)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short = 'd', long, default_value = "quill-data", help = "Database directory")]
    data_dir: PathBuf,
    #[clap(short = 'l', long, help = "Address to listen on")]
    listen: Option<String>,
    #[clap(long, help = "Buffer frames per container")]
    frames: Option<usize>,
    #[clap(long, help = "Page size in bytes; fixed when the database is created")]
    page_size: Option<usize>,
    #[clap(
        long,
        help = "Default isolation level (read-uncommitted|read-committed|repeatable-read|serializable)",
        value_name = "LEVEL"
    )]
    isolation_level: Option<String>,
    #[clap(long, help = "Lock depth for new transactions (0 locks whole indexes)")]
    lock_depth: Option<u8>,
    #[clap(
        long,
        help = "Checkpoint interval in milliseconds (0 to disable)",
        value_name = "MS"
    )]
    checkpoint_interval_ms: Option<u64>,
    #[clap(
        long,
        help = "Background WAL writer interval in milliseconds (0 to disable)",
        value_name = "MS"
    )]
    wal_writer_interval_ms: Option<u64>,
    #[clap(long, help = "Whether WAL flush should fsync (true/false)")]
    wal_sync_on_flush: Option<bool>,
    #[clap(long, help = "Largest accepted query in bytes")]
    max_payload: Option<usize>,
}

fn interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn database_options(args: &Args) -> Result<DatabaseOptions, String> {
    let mut options = DatabaseOptions::new(&args.data_dir);
    if let Some(frames) = args.frames {
        options.buffer.frames = frames;
    }
    if let Some(page_size) = args.page_size {
        options.buffer.page_size = page_size;
    }
    if let Some(level) = &args.isolation_level {
        options.default_isolation = IsolationLevel::from_str(level)?;
    }
    if let Some(depth) = args.lock_depth {
        options.default_lock_depth = depth;
    }
    if let Some(ms) = args.checkpoint_interval_ms {
        options.checkpoint_interval = interval(ms);
    }
    if let Some(ms) = args.wal_writer_interval_ms {
        options.wal.writer_interval = interval(ms);
    }
    if let Some(sync) = args.wal_sync_on_flush {
        options.wal.sync_on_flush = sync;
    }
    Ok(options)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let options = database_options(&args).unwrap_or_else(|e| panic!("invalid arguments: {}", e));
    let mut config = ServerConfig::default();
    if let Some(listen) = args.listen.clone() {
        config.listen_addr = listen;
    }
    if let Some(max_payload) = args.max_payload {
        config.max_payload = max_payload;
    }

    let db = tokio::task::spawn_blocking(move || Database::open(options))
        .await
        .expect("open task")
        .unwrap_or_else(|e| panic!("fail to open {}: {}", args.data_dir.display(), e));
    let db = Arc::new(db);
    let summary = db.recovery_summary();
    info!(
        "recovered: {} record(s) redone, {} loser(s), next txn {}",
        summary.redo_count,
        summary.loser_transactions.len(),
        summary.next_txn_id
    );

    let server = Server::new(db.clone(), config);
    let listener = server.bind().await.expect("bind listener");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(e) = server.serve(listener, shutdown).await {
        error!("server error: {}", e);
    }

    let closed = tokio::task::spawn_blocking(move || db.close()).await;
    match closed {
        Ok(Ok(())) => println!("bye!"),
        Ok(Err(e)) => error!("shutdown failed: {}", e),
        Err(e) => error!("shutdown task failed: {}", e),
    }
}
