//! Control Stream RPC
//!
//! Length-delimited JSON envelopes exchanged over the control stream.
//! A session performs exactly one call on it: `Auth`.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::TunnelError;

/// Method name of the authentication call
pub const AUTH_METHOD: &str = "Auth";

/// Largest accepted envelope
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Password")]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    #[serde(rename = "OK")]
    pub ok: bool,
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    seq: u64,
    #[serde(default)]
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// An inbound call waiting for a reply
#[derive(Debug)]
pub struct Request {
    seq: u64,
    pub method: String,
    body: Option<Value>,
}

impl Request {
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, TunnelError> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| TunnelError::protocol("request without body"))?;
        serde_json::from_value(body)
            .map_err(|e| TunnelError::protocol(format!("malformed {} request: {}", self.method, e)))
    }
}

/// RPC endpoint over one byte stream
pub struct RpcConn<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    next_seq: u64,
}

impl<S> RpcConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_MESSAGE_SIZE)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            next_seq: 1,
        }
    }

    /// Issue a call and wait for its reply
    pub async fn call<Req, Resp>(&mut self, method: &str, request: &Req) -> Result<Resp, TunnelError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let seq = self.next_seq;
        self.next_seq += 1;

        let body = serde_json::to_value(request)
            .map_err(|e| TunnelError::protocol(format!("cannot encode request: {}", e)))?;
        self.send(&Envelope {
            seq,
            method: method.to_string(),
            body: Some(body),
            error: None,
        })
        .await?;

        let reply = self.recv().await?;
        if reply.seq != seq {
            return Err(TunnelError::protocol(format!(
                "reply sequence {} does not match call {}",
                reply.seq, seq
            )));
        }
        if let Some(error) = reply.error {
            return Err(TunnelError::protocol(format!("remote error: {}", error)));
        }

        let body = reply
            .body
            .ok_or_else(|| TunnelError::protocol("reply without body"))?;
        serde_json::from_value(body)
            .map_err(|e| TunnelError::protocol(format!("malformed {} reply: {}", method, e)))
    }

    /// Wait for the next inbound call
    pub async fn next_request(&mut self) -> Result<Request, TunnelError> {
        let envelope = self.recv().await?;
        Ok(Request {
            seq: envelope.seq,
            method: envelope.method,
            body: envelope.body,
        })
    }

    /// Answer a call with either a body or an error message
    pub async fn reply<T: Serialize>(
        &mut self,
        request: &Request,
        result: Result<&T, String>,
    ) -> Result<(), TunnelError> {
        let envelope = match result {
            Ok(body) => Envelope {
                seq: request.seq,
                method: String::new(),
                body: Some(serde_json::to_value(body).map_err(|e| {
                    TunnelError::protocol(format!("cannot encode reply: {}", e))
                })?),
                error: None,
            },
            Err(error) => Envelope {
                seq: request.seq,
                method: String::new(),
                body: None,
                error: Some(error),
            },
        };
        self.send(&envelope).await
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TunnelError> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| TunnelError::protocol(format!("cannot encode envelope: {}", e)))?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Envelope, TunnelError> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or(TunnelError::TransportClosed)??;
        serde_json::from_slice(&frame)
            .map_err(|e| TunnelError::protocol(format!("malformed envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(AuthRequest {
            user: "u".to_string(),
            password: "p".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"User": "u", "Password": "p"}));

        let result: AuthResult = serde_json::from_str(r#"{"OK":true,"ID":"x"}"#).unwrap();
        assert!(result.ok);
        assert_eq!(result.id, "x");
    }

    #[tokio::test]
    async fn test_call_and_reply() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut conn = RpcConn::new(b);
            let request = conn.next_request().await.unwrap();
            assert_eq!(request.method, AUTH_METHOD);
            let auth: AuthRequest = request.body().unwrap();
            let result = AuthResult {
                ok: auth.user == "alice",
                id: "quiet-otter-00ff".to_string(),
            };
            conn.reply(&request, Ok(&result)).await.unwrap();
        });

        let mut conn = RpcConn::new(a);
        let result: AuthResult = conn
            .call(
                AUTH_METHOD,
                &AuthRequest {
                    user: "alice".to_string(),
                    password: "pw".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.id, "quiet-otter-00ff");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut conn = RpcConn::new(b);
            let request = conn.next_request().await.unwrap();
            conn.reply::<()>(&request, Err("unknown method".to_string()))
                .await
                .unwrap();
        });

        let mut conn = RpcConn::new(a);
        let result: Result<AuthResult, _> = conn.call("Nope", &()).await;
        assert!(matches!(result, Err(TunnelError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_closed_stream_is_transport_closed() {
        let (a, b) = tokio::io::duplex(4096);
        drop(b);
        let mut conn = RpcConn::new(a);
        assert!(conn.next_request().await.is_err());
    }
}
