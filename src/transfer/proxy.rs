//! Master Proxy
//!
//! Forwards a replication request to the volume's master, authenticating
//! as the node's service identity, and relays the master's status code and
//! body back unchanged.

use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::TryStreamExt;
use tokio_util::io::StreamReader;

use crate::cluster::selector::peer_url;
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::replication::{Relay, Transform, CHUNK_SIZE};
use crate::transfer::coordinator::{error_response, relayed, status_for};

/// Forward to the master of `filesystem`. No known master is a 404 so the
/// caller re-resolves; any failure to reach the master is a 500.
pub async fn forward(
    ctx: &NodeContext,
    filesystem: &str,
    method: Method,
    path: &str,
    body: Option<Body>,
) -> Response {
    match try_forward(ctx, filesystem, method, path, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Proxying {} for {} failed: {}", path, filesystem, e);
            let status = if e.is_state_mismatch() {
                status_for(&e)
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_response(status, &e)
        }
    }
}

/// URL of `path` on the master of `filesystem`
pub fn master_url(ctx: &NodeContext, filesystem: &str, path: &str) -> Result<String> {
    let master = ctx.cache.master_for(filesystem).ok_or_else(|| Error::NotMaster {
        filesystem: filesystem.to_string(),
        master: None,
    })?;
    if master == ctx.node_id {
        return Err(Error::Internal(format!(
            "routing error: {} is mastered here but was proxied",
            filesystem
        )));
    }

    let addresses = ctx.cache.addresses_for(&master);
    let address = ctx
        .selector
        .select(&addresses)
        .ok_or_else(|| Error::NoAddresses(master.clone()))?;

    Ok(format!("{}{}", peer_url(&address, ctx.config.api.peer_port), path))
}

async fn try_forward(
    ctx: &NodeContext,
    filesystem: &str,
    method: Method,
    path: &str,
    body: Option<Body>,
) -> Result<Response> {
    let url = master_url(ctx, filesystem, path)?;
    let user = &ctx.config.transfer.service_user;
    let api_key = ctx.secrets.api_key(user).await?;

    tracing::debug!("Proxying {} {} to {}", method, path, url);

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| Error::Internal(format!("unsupported method {}: {}", method, e)))?;
    let mut request = ctx
        .http
        .request(method, &url)
        .basic_auth(user, Some(api_key));

    if let Some(body) = body {
        let (sink, reader) = tokio::io::duplex(CHUNK_SIZE * 2);
        let source = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
        let upload = Relay::new("proxied request", url.clone(), Transform::None).spawn(source, sink);
        request = request.body(reqwest::Body::wrap_stream(relayed(reader, upload)));
    }

    let upstream = request.send().await.map_err(|e| Error::ConnectionFailed {
        address: url.clone(),
        reason: e.to_string(),
    })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let (sink, reader) = tokio::io::duplex(CHUNK_SIZE * 2);
    let source = StreamReader::new(Box::pin(upstream.bytes_stream().map_err(std::io::Error::other)));
    let download = Relay::new(url, "proxied response", Transform::None).spawn(source, sink);

    Ok((status, Body::from_stream(relayed(reader, download))).into_response())
}
