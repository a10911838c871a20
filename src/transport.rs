//! Transport Multiplexer (C2).
//!
//! Owns the engine-side connection: a dedicated reader task decodes frames
//! via the C1 codec and forwards them over an `mpsc` channel into the
//! session's execution context; writes are serialized through a mutex-guarded
//! writer half. Grounded on the teacher's accept-loop / per-connection
//! reader-task / writer-task split in `backend-manager::backend_manager`.

use crate::codec::{encode, Frame, FrameDecoder, FrameKind};
use crate::error::{AdapterError, Result};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

/// Either side of a stream-oriented connection abstracted over the two
/// concrete socket kinds the spec allows (a named-pipe backend is a future
/// platform-specific addition with the same split shape).
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    pub fn bind_unix(path: PathBuf) -> Result<Self> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Listener::Unix { listener, path })
    }

    pub async fn bind_tcp(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Listener::Tcp(listener))
    }

    pub async fn accept(&self) -> Result<Connection> {
        match self {
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Tcp(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Multiplexes a single engine connection: spawns the reader task and
/// exposes a write half guarded by a mutex for single-writer discipline.
pub struct Multiplexer {
    write_half: Mutex<WriteHalf>,
    incoming: mpsc::UnboundedReceiver<Result<Frame>>,
}

enum WriteHalf {
    Unix(tokio::net::unix::OwnedWriteHalf),
    Tcp(tokio::net::tcp::OwnedWriteHalf),
}

impl WriteHalf {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            WriteHalf::Unix(w) => w.write_all(bytes).await.map_err(AdapterError::from),
            WriteHalf::Tcp(w) => w.write_all(bytes).await.map_err(AdapterError::from),
        }
    }
}

impl Multiplexer {
    pub fn new(conn: Connection) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let write_half = match conn {
            Connection::Unix(stream) => {
                let (read_half, write_half) = stream.into_split();
                tokio::spawn(reader_loop_unix(read_half, tx));
                WriteHalf::Unix(write_half)
            }
            Connection::Tcp(stream) => {
                let (read_half, write_half) = stream.into_split();
                tokio::spawn(reader_loop_tcp(read_half, tx));
                WriteHalf::Tcp(write_half)
            }
        };
        Self {
            write_half: Mutex::new(write_half),
            incoming: rx,
        }
    }

    /// Writes a complete frame, retrying partial writes via `write_all`.
    pub async fn send(&self, kind: FrameKind, payload: &impl Serialize) -> Result<()> {
        let bytes = encode(kind, payload)?;
        let mut w = self.write_half.lock().await;
        w.write_all(&bytes).await
    }

    /// Receives the next decoded frame. Returns `None` once the reader task
    /// has observed EOF or a fatal framing error and shut the channel down.
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        self.incoming.recv().await
    }
}

macro_rules! reader_loop {
    ($name:ident, $half_ty:ty) => {
        async fn $name(mut read_half: $half_ty, tx: mpsc::UnboundedSender<Result<Frame>>) {
            let mut decoder = FrameDecoder::new();
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        decoder.feed(&buf[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => {
                                    if tx.send(Ok(frame)).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    let _ = tx.send(Err(e));
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(AdapterError::from(e)));
                        return;
                    }
                }
            }
        }
    };
}

reader_loop!(reader_loop_unix, tokio::net::unix::OwnedReadHalf);
reader_loop!(reader_loop_tcp, tokio::net::tcp::OwnedReadHalf);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameKind;
    use serde_json::json;

    #[tokio::test]
    async fn unix_round_trip() {
        let dir = std::env::temp_dir().join(format!("dapper-mux-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("s.sock");

        let listener = Listener::bind_unix(path.clone()).unwrap();
        let client = UnixStream::connect(&path).await.unwrap();

        let (server_conn, _) = match &listener {
            Listener::Unix { listener, .. } => listener.accept().await.unwrap(),
            _ => unreachable!(),
        };

        let mut server_mux = Multiplexer::new(Connection::Unix(server_conn));
        let client_mux = Multiplexer::new(Connection::Unix(client));

        client_mux
            .send(FrameKind::Command, &json!({"hello": "world"}))
            .await
            .unwrap();

        let frame = server_mux.recv().await.unwrap().unwrap();
        assert_eq!(frame.payload, json!({"hello": "world"}));

        drop(server_mux);
        drop(client_mux);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
