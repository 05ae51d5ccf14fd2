mod common;

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use common::options;
use quill_store::config::ServerConfig;
use quill_store::database::Database;
use quill_store::server::protocol::{ClientCodec, Command, Response};
use quill_store::server::Server;
use tempfile::TempDir;

type Client = Framed<TcpStream, ClientCodec>;

async fn connect(addr: std::net::SocketAddr) -> Client {
    Framed::new(TcpStream::connect(addr).await.unwrap(), ClientCodec::new(1024))
}

async fn call(client: &mut Client, command: Command) -> Response {
    client.send(command).await.unwrap();
    client.next().await.unwrap().unwrap()
}

async fn query(client: &mut Client, text: &str) -> Response {
    call(client, Command::Query(text.to_string())).await
}

fn ok(payload: &'static str) -> Response {
    Response::Success(Bytes::from_static(payload.as_bytes()))
}

fn is_error(response: &Response, needle: &str) -> bool {
    matches!(response, Response::Error(message) if message.contains(needle))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_over_tcp() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(options(dir.path())).unwrap());
    let config = ServerConfig::default()
        .with_listen_addr("127.0.0.1:0".to_string())
        .with_max_payload(256usize);
    let server = Server::new(db.clone(), config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await
    });

    let mut first = connect(addr).await;
    assert_eq!(query(&mut first, "create kv unique").await, ok("created kv"));
    assert_eq!(query(&mut first, "insert kv a 1").await, ok("inserted 1"));
    assert!(is_error(&query(&mut first, "insert kv a 2").await, "Duplicate key"));
    assert!(is_error(&query(&mut first, "fetch kv a").await, "cannot parse"));
    assert_eq!(query(&mut first, "list").await, ok("kv\tbytes unique"));

    // an explicit transaction is visible to dirty readers only
    assert_eq!(call(&mut first, Command::Begin).await, ok(""));
    assert_eq!(query(&mut first, "insert kv b 2").await, ok("inserted 1"));
    let mut second = connect(addr).await;
    assert_eq!(
        query(&mut second, "isolation read-uncommitted").await,
        ok("isolation read-uncommitted")
    );
    assert_eq!(query(&mut second, "get kv b").await, ok("b\t2"));
    assert_eq!(call(&mut first, Command::Rollback).await, ok(""));
    assert_eq!(query(&mut second, "get kv b").await, ok(""));
    assert!(is_error(
        &call(&mut first, Command::Commit).await,
        "no active transaction"
    ));

    // a dropped connection takes its transaction with it
    let mut third = connect(addr).await;
    assert_eq!(call(&mut third, Command::Begin).await, ok(""));
    assert_eq!(query(&mut third, "insert kv c 3").await, ok("inserted 1"));
    drop(third);
    assert_eq!(query(&mut first, "get kv c").await, ok(""));
    assert_eq!(query(&mut first, "scan kv").await, ok("a\t1"));

    // a malformed request gets one error response, then the connection ends
    let mut broken = connect(addr).await;
    broken.get_mut().write_all(b"x").await.unwrap();
    let response = broken.next().await.unwrap().unwrap();
    assert!(is_error(&response, "unknown command byte"));
    assert!(broken.next().await.is_none());

    stop.send(()).unwrap();
    serving.await.unwrap().unwrap();
    drop(first);
    drop(second);
    tokio::task::spawn_blocking(move || db.close())
        .await
        .unwrap()
        .unwrap();
}
