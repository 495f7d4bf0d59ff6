// src/core/rpc.rs

//! Peer RPC (spec §6): a small length-prefixed, bincode-framed
//! request/response protocol implementing the wire contract's named
//! endpoints.
//!
//! Grounded in the teacher's `cluster::client`/custom-framed-TCP pattern
//! (`RespFrameCodec` over `tokio_util::codec`), generalized from RESP frames
//! to an enum of applier RPCs. `serde_yaml::Value` doesn't implement
//! `bincode::Encode`/`Decode` directly, so documents are carried as YAML
//! text inside the envelope and framed/encoded with bincode 2's `serde`
//! compatibility layer instead of a manual derive.

use crate::core::errors::AppError;
use async_trait::async_trait;
use bincode::config::standard;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, info, warn};

pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    LoadFromFile,
    Prepare2pc { yaml: String },
    Commit2pc,
    Abort2pc,
    ValidateConfig { yaml: String },
    ApplyConfig { yaml: String },
    PatchClusterwide { yaml: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    OkDoc { yaml: String },
    Err { message: String },
}

impl Response {
    pub fn from_result(r: Result<(), AppError>) -> Self {
        match r {
            Ok(()) => Response::Ok,
            Err(e) => Response::Err { message: e.to_string() },
        }
    }

    pub fn into_unit_result(self) -> Result<(), AppError> {
        match self {
            Response::Ok | Response::OkDoc { .. } => Ok(()),
            Response::Err { message } => Err(AppError::ConfigApply(message)),
        }
    }
}

type Frame = Framed<TcpStream, LengthDelimitedCodec>;

/// One RPC connection. Each call opens a fresh TCP connection; there is no
/// pooling here (see `core::pool`).
pub struct RpcConn {
    frame: Frame,
}

impl RpcConn {
    pub async fn connect(uri: &str) -> Result<Self, AppError> {
        let stream = TcpStream::connect(uri)
            .await
            .map_err(|e| AppError::ConfigFetch(format!("connecting to '{uri}': {e}")))?;
        Ok(RpcConn {
            frame: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    async fn send_request(&mut self, req: &Request) -> Result<(), AppError> {
        let bytes = bincode::serde::encode_to_vec(req, standard())
            .map_err(|e| AppError::ConfigFetch(format!("encoding request: {e}")))?;
        self.frame
            .send(bytes.into())
            .await
            .map_err(|e| AppError::ConfigFetch(format!("sending request: {e}")))
    }

    async fn recv_response(&mut self) -> Result<Response, AppError> {
        let bytes = self
            .frame
            .next()
            .await
            .ok_or_else(|| AppError::ConfigFetch("connection closed before response".into()))?
            .map_err(|e| AppError::ConfigFetch(format!("reading response: {e}")))?;
        let (resp, _) = bincode::serde::decode_from_slice(&bytes, standard())
            .map_err(|e| AppError::ConfigFetch(format!("decoding response: {e}")))?;
        Ok(resp)
    }

    /// Issues one request and awaits the matching response, optionally under
    /// a deadline (used by `prepare_2pc`'s 5-second client timeout; commit
    /// and abort calls pass `None`, per spec §5).
    pub async fn call(&mut self, req: Request, deadline: Option<Duration>) -> Result<Response, AppError> {
        let fut = async {
            self.send_request(&req).await?;
            self.recv_response().await
        };
        match deadline {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| AppError::ConfigFetch("RPC timed out".into()))?,
            None => fut.await,
        }
    }
}

/// Implemented by the process-wide `Applier` to answer incoming peer calls.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn load_from_file(&self) -> Result<String, AppError>;
    async fn prepare_2pc(&self, yaml: String) -> Result<(), AppError>;
    async fn commit_2pc(&self) -> Result<(), AppError>;
    async fn abort_2pc(&self) -> Result<(), AppError>;
    async fn validate_config(&self, yaml: String) -> Result<(), AppError>;
    async fn apply_config(&self, yaml: String) -> Result<(), AppError>;

    /// Entry point for an administrator's patch (spec §2, component F):
    /// coordinates a full 2PC round across every peer rather than applying
    /// locally only.
    async fn patch_clusterwide(&self, yaml: String) -> Result<(), AppError>;
}

async fn dispatch(handler: &dyn RpcHandler, req: Request) -> Response {
    match req {
        Request::LoadFromFile => match handler.load_from_file().await {
            Ok(yaml) => Response::OkDoc { yaml },
            Err(e) => Response::Err { message: e.to_string() },
        },
        Request::Prepare2pc { yaml } => Response::from_result(handler.prepare_2pc(yaml).await),
        Request::Commit2pc => Response::from_result(handler.commit_2pc().await),
        Request::Abort2pc => Response::from_result(handler.abort_2pc().await),
        Request::ValidateConfig { yaml } => Response::from_result(handler.validate_config(yaml).await),
        Request::ApplyConfig { yaml } => Response::from_result(handler.apply_config(yaml).await),
        Request::PatchClusterwide { yaml } => {
            Response::from_result(handler.patch_clusterwide(yaml).await)
        }
    }
}

/// Runs the peer RPC listener to completion, accepting connections and
/// dispatching every frame to `handler`. Each connection is served on its
/// own task so one slow peer can't stall others.
pub async fn serve(listener: TcpListener, handler: std::sync::Arc<dyn RpcHandler>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let mut frame = Framed::new(stream, LengthDelimitedCodec::new());
            loop {
                let bytes = match frame.next().await {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        warn!("peer {peer}: frame error: {e}");
                        break;
                    }
                    None => break,
                };
                let req: Request = match bincode::serde::decode_from_slice(&bytes, standard()) {
                    Ok((r, _)) => r,
                    Err(e) => {
                        warn!("peer {peer}: decode error: {e}");
                        break;
                    }
                };
                let resp = dispatch(handler.as_ref(), req).await;
                let out = match bincode::serde::encode_to_vec(&resp, standard()) {
                    Ok(b) => b,
                    Err(e) => {
                        error!("peer {peer}: encode error: {e}");
                        break;
                    }
                };
                if frame.send(out.into()).await.is_err() {
                    break;
                }
            }
            info!("peer connection closed: {peer}");
        });
    }
}
