pub mod command;
pub mod protocol;

use std::future::Future;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::config::ServerConfig;
use crate::database::Database;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::session::Session;
use protocol::{Response, ServerCodec};

/// Serves a database over TCP, one task per connection. Engine calls block,
/// so they run on tokio's blocking pool.
#[derive(derive_new::new, Debug, Clone)]
pub struct Server {
    db: Arc<Database>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(&self) -> QuillStoreResult<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> QuillStoreResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("accepted connection from {}", peer);
                    let db = self.db.clone();
                    let max_payload = self.config.max_payload;
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(db, stream, max_payload).await {
                            warn!("connection {} failed: {}", peer, err);
                        }
                        debug!("connection from {} closed", peer);
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    db: Arc<Database>,
    stream: TcpStream,
    max_payload: usize,
) -> QuillStoreResult<()> {
    let mut framed = Framed::new(stream, ServerCodec::new(max_payload));
    let mut session = Some(Session::new(db));
    let outcome = loop {
        let command = match framed.next().await {
            None => break Ok(()),
            Some(Ok(command)) => command,
            Some(Err(err)) if err.is_io() => break Err(err),
            Some(Err(err)) => {
                // framing is lost after a malformed request
                let _ = framed.send(Response::Error(err.to_string())).await;
                break Err(err);
            }
        };
        let Some(mut current) = session.take() else {
            break Err(QuillStoreError::Internal("session lost".to_string()));
        };
        let (current, response) = tokio::task::spawn_blocking(move || {
            let response = command::execute(&mut current, command);
            (current, response)
        })
        .await
        .map_err(|err| QuillStoreError::Internal(format!("session task failed: {}", err)))?;
        session = Some(current);
        if let Err(err) = framed.send(response).await {
            break Err(err);
        }
    };
    // rolling back a leftover transaction does I/O
    if let Some(session) = session {
        let _ = tokio::task::spawn_blocking(move || drop(session)).await;
    }
    outcome
}
