//! Shared listen/serve/shutdown machinery for both server variants
//!
//! `ServerBase` binds the configured listener once at construction and owns
//! the lifecycle signals the gRPC and HTTP servers drive: a graceful-stop
//! signal handed to the serve loop, a finished flag the serve task flips on
//! exit, an abort handle for the serve task, and a kill signal that severs
//! accepted connections when the grace period elapses.

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpListener,
    sync::watch,
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;

#[cfg(unix)]
use tokio::net::UnixListener;

use crate::{
    config::ServerConfig,
    error::{Error, Result},
};

/// Grace period for in-flight work before a close forces the stop
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// The one bound listener a server owns
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

#[derive(Debug)]
pub(crate) struct ServerBase {
    config: ServerConfig,
    listener: Mutex<Option<Listener>>,
    graceful: watch::Sender<bool>,
    finished: Arc<watch::Sender<bool>>,
    abort: Mutex<Option<AbortHandle>>,
    kill: CancellationToken,
}

impl ServerBase {
    /// Validate the config and bind its listener
    ///
    /// A configured socket path takes precedence over the TCP address and
    /// port. Port 0 binds an ephemeral TCP port.
    pub(crate) async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = Self::bind_listener(&config).await?;

        // The finished flag starts true so closing a server that never
        // served returns immediately.
        let (graceful, _) = watch::channel(false);
        let (finished, _) = watch::channel(true);

        Ok(Self {
            config,
            listener: Mutex::new(Some(listener)),
            graceful,
            finished: Arc::new(finished),
            abort: Mutex::new(None),
            kill: CancellationToken::new(),
        })
    }

    async fn bind_listener(config: &ServerConfig) -> Result<Listener> {
        if let Some(path) = &config.socket_path {
            #[cfg(unix)]
            {
                let listener = UnixListener::bind(path)?;
                tracing::info!(path = %path.display(), "server listening on unix socket");
                return Ok(Listener::Unix(listener));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not supported on this platform",
                )
                .into());
            }
        }

        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "server listening on tcp");
        Ok(Listener::Tcp(listener))
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bound TCP address, if serving has not started and the listener is TCP
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.listener.lock().expect("server listener lock poisoned") {
            Some(Listener::Tcp(listener)) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Hand the listener to the serve loop; fails once it is gone
    pub(crate) fn take_listener(&self) -> Result<Listener> {
        self.listener
            .lock()
            .expect("server listener lock poisoned")
            .take()
            .ok_or(Error::AlreadyServing)
    }

    /// Future that resolves when a close requests graceful stop
    pub(crate) fn graceful_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut graceful = self.graceful.subscribe();
        async move {
            let _ = graceful.wait_for(|stop| *stop).await;
        }
    }

    /// Signal that severs accepted connections when a close forces the stop
    ///
    /// Serve loops wrap every accepted socket in [`AbortableIo`] carrying
    /// this signal.
    pub(crate) fn force_signal(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Run the serve future on its own task, tracking completion and
    /// keeping an abort handle for the forced-stop path
    pub(crate) fn spawn_serve<F>(&self, serve: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.finished.send_replace(false);
        let finished = Arc::clone(&self.finished);
        let handle = tokio::spawn(async move {
            let result = serve.await;
            finished.send_replace(true);
            result
        });
        *self.abort.lock().expect("server abort lock poisoned") = Some(handle.abort_handle());
        handle
    }

    /// Block until the serve task exits or the caller cancels
    ///
    /// Cancellation returns cleanly while the serve task keeps running; the
    /// owning server's close remains responsible for stopping it.
    pub(crate) async fn await_serve(
        &self,
        cancel: CancellationToken,
        mut handle: JoinHandle<Result<()>>,
    ) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(Error::Serve(err.to_string())),
            },
        }
    }

    /// Request graceful stop and wait for it, bounded by `grace`
    ///
    /// Returns true when the serve task finished within the grace period and
    /// false when it had to be aborted. The listener is released either way.
    pub(crate) async fn close_with_deadline(&self, grace: Duration) -> bool {
        self.graceful.send_replace(true);

        let mut finished = self.finished.subscribe();
        let graceful = tokio::time::timeout(grace, finished.wait_for(|done| *done))
            .await
            .is_ok();
        if !graceful {
            // Accepted connections run on their own tasks and outlive an
            // abort of the serve task; the kill signal fails their IO so
            // in-flight calls stop with it.
            self.kill.cancel();
            if let Some(abort) = self.abort.lock().expect("server abort lock poisoned").take() {
                abort.abort();
            }
            self.finished.send_replace(true);
        }

        self.release_listener();
        graceful
    }

    fn release_listener(&self) {
        let listener = self
            .listener
            .lock()
            .expect("server listener lock poisoned")
            .take();
        drop(listener);

        // The socket file outlives the listener; remove it so a later bind
        // can reuse the path.
        #[cfg(unix)]
        if let Some(path) = &self.config.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Accepted-connection IO severed by the owning server's force stop
///
/// The serve loops run every accepted connection on its own task, so
/// aborting the serve task does not end in-flight calls. Reads and writes
/// through this wrapper fail with `ConnectionAborted` once the kill signal
/// fires, which stops those connection tasks and closes their sockets.
pub(crate) struct AbortableIo<S> {
    inner: S,
    killed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> AbortableIo<S> {
    pub(crate) fn new(inner: S, signal: CancellationToken) -> Self {
        Self {
            inner,
            killed: Box::pin(signal.cancelled_owned()),
        }
    }

    fn poll_killed(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Error> {
        self.killed.as_mut().poll(cx).map(|()| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "server force stopped",
            )
        })
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AbortableIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_killed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AbortableIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_killed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_killed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: Connected> Connected for AbortableIo<S> {
    type ConnectInfo = S::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Listener wrapper handing axum [`AbortableIo`] connections
pub(crate) struct AbortableListener<L> {
    inner: L,
    signal: CancellationToken,
}

impl<L> AbortableListener<L> {
    pub(crate) fn new(inner: L, signal: CancellationToken) -> Self {
        Self { inner, signal }
    }
}

impl<L> axum::serve::Listener for AbortableListener<L>
where
    L: axum::serve::Listener,
{
    type Io = AbortableIo<L::Io>;
    type Addr = L::Addr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (io, addr) = self.inner.accept().await;
        (AbortableIo::new(io, self.signal.clone()), addr)
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
