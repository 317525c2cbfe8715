//! The unix domain socket the CSI services are served on.

use futures::{Stream, TryFutureExt};
use snafu::{ResultExt, Snafu};
use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::server::Connected;
use tracing::{debug, error, info};

/// Errors setting up the CSI socket.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum UdsError {
    #[snafu(display("Error removing stale CSI socket {path}: {source}"))]
    RemoveStale {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to bind CSI socket {path}: {source}"))]
    Bind {
        path: String,
        source: std::io::Error,
    },
}

/// A connection accepted on the CSI socket.
#[derive(Debug)]
pub struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Bind the CSI socket, replacing the one left over by a previous run, and stream the
/// connections accepted on it.
pub fn incoming(
    csi_socket: &str,
) -> Result<impl Stream<Item = std::io::Result<UnixStream>>, UdsError> {
    match fs::remove_file(csi_socket) {
        Ok(_) => info!("Removed stale CSI socket {}", csi_socket),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(error).context(RemoveStale { path: csi_socket }),
    }

    let uds = UnixListener::bind(csi_socket).context(Bind { path: csi_socket })?;
    // Allow non-privileged clients, eg: csc, to talk to the plugin.
    match fs::set_permissions(csi_socket, fs::Permissions::from_mode(0o777)) {
        Ok(_) => debug!("Successfully changed file permissions for CSI socket"),
        Err(error) => error!("Failed to change permissions for CSI socket: {:?}", error),
    }
    debug!("CSI RPC server is listening on {}", csi_socket);

    Ok(async_stream::stream! {
        loop {
            let item = uds.accept().map_ok(|(st, _)| UnixStream(st)).await;
            yield item;
        }
    })
}
