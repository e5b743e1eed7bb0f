use crate::Body;
use http::{Request, Response};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

/// Binds `addr` and serves HTTP/1 connections with `svc` until `drain` is signaled.
///
/// On shutdown the listener stops accepting and each open connection is closed gracefully once
/// its in-flight request completes.
pub async fn serve<S>(
    name: &'static str,
    addr: SocketAddr,
    svc: S,
    drain: drain::Watch,
) -> std::io::Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, server = name, "HTTP server listening");

    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, server = name, "Failed to accept connection");
                    continue;
                }
            },
            release = &mut shutdown => {
                drop(release);
                debug!(server = name, "Stopped accepting connections");
                return Ok(());
            }
        };

        let svc = TowerToHyperService::new(svc.clone());
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let conn = http1::Builder::new().serve_connection(TokioIo::new(io), svc);
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    release = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        release.release_after(conn).await
                    }
                };
                if let Err(error) = res {
                    debug!(%error, "Connection failed");
                }
            }
            .instrument(info_span!("conn", server = name, %client)),
        );
    }
}
