//! Coordination protocol: request/response calls between fronts, quorum,
//! and store over TCP. Each call is one connection carrying one
//! length-prefixed bincode frame each way, with a bounded timeout on the
//! caller side. This module is the only place coordination sockets are
//! touched, so a credential layer could wrap `call`/`serve` without
//! changing any protocol logic.

use crate::world::{
    FrontId, NeighborLinks, Object, ObjectId, PlayerId, PlayerRecord, SectionId, SectionSnapshot,
};
use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on a coordination frame; snapshots stay far below this.
pub const MAX_FRAME: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("call timed out")]
    Timeout,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Request {
    /// Front: adopt a player connection (quorum hands the player over).
    AttachPlayer { player: PlayerRecord },
    /// Front: return the player's section snapshot and start their
    /// update feed at its version.
    SectionFeed { player: PlayerId, session: String },
    /// Front: fetch `section` from `source` (the store) and take
    /// ownership, using the supplied neighbor links.
    AdoptSection {
        source: SocketAddr,
        section: SectionId,
        neighbors: NeighborLinks,
    },
    /// Front: accept an object crossing in from another front, together
    /// with its controlling player when one is attached.
    TransferObject {
        object_id: ObjectId,
        object: Object,
        section: SectionId,
        player: Option<PlayerRecord>,
    },
    /// Front: update neighbor links for an owned section.
    PatchNeighbors {
        section: SectionId,
        neighbors: NeighborLinks,
    },
    /// Quorum: assign a front for a player connection.
    AssignFront {
        player: PlayerId,
        addr: SocketAddr,
        session: String,
    },
    /// Quorum: record that an object (and its player, if any) now lives
    /// on `front` in `section`. Mandatory before any visible move.
    ConfirmMove {
        object_id: ObjectId,
        front: SocketAddr,
        section: SectionId,
    },
    /// Store: retrieve the latest snapshot of a section.
    FetchSection { section: SectionId },
    /// Store: install a snapshot and register its owning front.
    RegisterSection {
        section: SectionId,
        snapshot: SectionSnapshot,
        front_id: FrontId,
        front_addr: SocketAddr,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Response {
    Ok,
    Section(SectionSnapshot),
    Front(SocketAddr),
    NotFound,
    Unavailable,
}

pub async fn write_frame<T: Serialize>(
    stream: &mut TcpStream,
    value: &T,
) -> Result<(), CoordError> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME {
        return Err(CoordError::FrameTooLarge(body.len()));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T, CoordError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(CoordError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

/// Performs one request/response exchange within `timeout`.
pub async fn call(
    addr: SocketAddr,
    request: &Request,
    timeout: Duration,
) -> Result<Response, CoordError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, request).await?;
        read_frame::<Response>(&mut stream).await
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| CoordError::Timeout)?
}

/// Like [`call`], but folds transport failures into
/// [`Response::Unavailable`]: a peer we cannot reach refuses by
/// definition, and the caller retries on its next cycle.
pub async fn try_call(addr: SocketAddr, request: &Request, timeout: Duration) -> Response {
    match call(addr, request, timeout).await {
        Ok(response) => response,
        Err(e) => {
            debug!("coordination call to {} failed: {}", addr, e);
            Response::Unavailable
        }
    }
}

/// Accept loop: one spawned task per connection, one request/response
/// exchange per connection.
pub async fn serve<H, Fut>(listener: TcpListener, handler: H)
where
    H: Fn(Request, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response> + Send + 'static,
{
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("error accepting coordination connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            match read_frame::<Request>(&mut stream).await {
                Ok(request) => {
                    let response = handler(request, peer).await;
                    if let Err(e) = write_frame(&mut stream, &response).await {
                        debug!("error answering {}: {}", peer, e);
                    }
                }
                Err(e) => debug!("bad coordination frame from {}: {}", peer, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_request_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:10002".parse().unwrap();
        let requests = vec![
            Request::FetchSection { section: 3 },
            Request::AssignFront {
                player: 1,
                addr,
                session: "A1B2C3".to_string(),
            },
            Request::ConfirmMove {
                object_id: 1,
                front: addr,
                section: 2,
            },
            Request::PatchNeighbors {
                section: 2,
                neighbors: NeighborLinks {
                    west: Some((addr, 1)),
                    ..Default::default()
                },
            },
        ];
        for request in requests {
            let bytes = bincode::serialize(&request).unwrap();
            let back: Request = bincode::deserialize(&bytes).unwrap();
            assert_eq!(back, request);
        }
    }

    #[test]
    fn test_response_roundtrip_with_snapshot() {
        let mut objects = HashMap::new();
        objects.insert(1, Object::new("ship", (1.0, 1.0), 0.0, 90.0));
        let response = Response::Section(SectionSnapshot {
            id: 1,
            name: "Section #1".to_string(),
            version: 12,
            objects,
        });
        let bytes = bincode::serialize(&response).unwrap();
        let back: Response = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, response);
    }

    #[tokio::test]
    async fn test_call_and_serve_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, |request, _peer| async move {
            match request {
                Request::FetchSection { section: 7 } => Response::NotFound,
                _ => Response::Unavailable,
            }
        }));

        let response = call(
            addr,
            &Request::FetchSection { section: 7 },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(response, Response::NotFound);
    }

    #[tokio::test]
    async fn test_try_call_unreachable_is_unavailable() {
        // Nothing listens on this port.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let response = try_call(
            addr,
            &Request::FetchSection { section: 1 },
            Duration::from_millis(200),
        )
        .await;
        assert_eq!(response, Response::Unavailable);
    }
}
