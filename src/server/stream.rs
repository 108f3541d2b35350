use crate::events::Endpoint;
use socket2::{SockAddr, SockRef, Socket};
use std::{
    io,
    os::fd::OwnedFd,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{tcp, unix, TcpStream, UnixStream},
};

/// Accepted connection socket.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub(crate) fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_nodelay(nodelay),
            Self::Unix(_) => Ok(()),
        }
    }

    pub(crate) fn remote_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(stream) => stream.peer_addr().map(Endpoint::Tcp),
            Self::Unix(stream) => stream
                .peer_addr()
                .map(|addr| Endpoint::Unix(addr.as_pathname().map(Into::into))),
        }
    }

    pub(crate) fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(stream) => stream.local_addr().map(Endpoint::Tcp),
            Self::Unix(stream) => stream
                .local_addr()
                .map(|addr| Endpoint::Unix(addr.as_pathname().map(Into::into))),
        }
    }

    /// Detaches the socket from this worker's reactor, for transfer to
    /// another worker.
    pub(crate) fn into_owned_fd(self) -> io::Result<OwnedFd> {
        Ok(match self {
            Self::Tcp(stream) => stream.into_std()?.into(),
            Self::Unix(stream) => stream.into_std()?.into(),
        })
    }

    /// Registers a transferred socket with the current worker. The socket
    /// family decides between TCP and Unix.
    pub(crate) fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let socket = Socket::from(fd);
        let is_unix = socket.local_addr().as_ref().is_ok_and(SockAddr::is_unix);
        socket.set_nonblocking(true)?;

        let fd = OwnedFd::from(socket);
        Ok(match is_unix {
            true => Self::Unix(UnixStream::from_std(fd.into())?),
            false => Self::Tcp(TcpStream::from_std(fd.into())?),
        })
    }

    pub(crate) fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Self::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Tcp(read), WriteHalf::Tcp(write))
            }
            Self::Unix(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Unix(read), WriteHalf::Unix(write))
            }
        }
    }
}

pub(crate) enum ReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

pub(crate) enum WriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl WriteHalf {
    /// Closes without sending a FIN. With linger set to zero the kernel
    /// resets the connection.
    pub(crate) fn reset(self) {
        let result = match &self {
            Self::Tcp(half) => SockRef::from(half.as_ref()).set_linger(Some(Duration::ZERO)),
            Self::Unix(_) => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "failed to set linger before reset");
        }

        // Dropping a Tokio write half shuts the write side down, which
        // would send a FIN first.
        match self {
            Self::Tcp(half) => half.forget(),
            Self::Unix(half) => half.forget(),
        }
    }
}

impl AsyncRead for ReadHalf {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(half) => Pin::new(half).poll_read(cx, buf),
            Self::Unix(half) => Pin::new(half).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WriteHalf {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(half) => Pin::new(half).poll_write(cx, buf),
            Self::Unix(half) => Pin::new(half).poll_write(cx, buf),
        }
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(half) => Pin::new(half).poll_flush(cx),
            Self::Unix(half) => Pin::new(half).poll_flush(cx),
        }
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(half) => Pin::new(half).poll_shutdown(cx),
            Self::Unix(half) => Pin::new(half).poll_shutdown(cx),
        }
    }
}
