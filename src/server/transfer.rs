//! Socket handle passing over a Unix stream pipe (`SCM_RIGHTS`).

use nix::{
    errno::Errno,
    sys::socket::{recv, recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
};
use std::{
    io::{self, IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};
use tokio::{io::Interest, net::UnixStream};

// Every handle travels with a few payload bytes; stream sockets cannot
// carry ancillary data on its own.
const PAYLOAD: [u8; 4] = [1, 2, 3, 4];

const MAX_HANDLES_PER_READ: usize = 16;

pub(crate) enum TransferOutcome {
    Sent,
    /// The pipe buffer is full; the receiver is not keeping up.
    Busy(OwnedFd),
    /// The receiving side is gone. The handle is returned unharmed.
    TargetGone { error: io::Error, handle: OwnedFd },
}

/// Sends a duplicate of `handle` through `pipe`, then closes the local copy.
///
/// Never waits: a pipe without room returns the handle as
/// [`TransferOutcome::Busy`].
pub(crate) fn send_handle(pipe: &UnixStream, handle: OwnedFd) -> TransferOutcome {
    let result = send_once(pipe.as_raw_fd(), handle.as_fd());
    match result {
        Ok(()) => TransferOutcome::Sent,
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => TransferOutcome::Busy(handle),
        Err(error) => TransferOutcome::TargetGone { error, handle },
    }
}

/// `true` once the receiving end of `pipe` was closed. Receivers never
/// write, so any readable state means end-of-stream or an error.
pub(crate) fn peer_closed(pipe: &UnixStream) -> bool {
    let mut probe = [0u8; 1];
    match recv(pipe.as_raw_fd(), &mut probe, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
        Ok(0) => true,
        Ok(_) => false,
        Err(Errno::EAGAIN | Errno::EINTR) => false,
        Err(_) => true,
    }
}

fn send_once(pipe: RawFd, handle: BorrowedFd<'_>) -> io::Result<()> {
    let fds = [handle.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&PAYLOAD)];

    let sent = sendmsg::<()>(pipe, &iov, &cmsgs, send_flags(), None)?;
    if sent != PAYLOAD.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short write on handle pipe",
        ));
    }
    Ok(())
}

/// Waits for handles on `pipe`. `None` means the sender closed the pipe.
pub(crate) async fn recv_handles(pipe: &UnixStream) -> io::Result<Option<Vec<OwnedFd>>> {
    pipe.async_io(Interest::READABLE, || recv_once(pipe.as_raw_fd()))
        .await
}

fn recv_once(pipe: RawFd) -> io::Result<Option<Vec<OwnedFd>>> {
    let mut buf = [0u8; PAYLOAD.len() * MAX_HANDLES_PER_READ];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut space = nix::cmsg_space!([RawFd; MAX_HANDLES_PER_READ]);

    let msg = recvmsg::<()>(pipe, &mut iov, Some(&mut space), recv_flags())?;
    if msg.bytes == 0 {
        return Ok(None);
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        tracing::warn!("handle pipe control data truncated, handles lost");
    }

    let mut handles = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            handles.extend(fds.into_iter().map(|fd| {
                // SAFETY: SCM_RIGHTS installs fresh descriptors owned by
                // this process and referenced nowhere else.
                unsafe { OwnedFd::from_raw_fd(fd) }
            }));
        }
    }
    Ok(Some(handles))
}

#[inline]
fn send_flags() -> MsgFlags {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    return MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    return MsgFlags::MSG_DONTWAIT;
}

#[inline]
fn recv_flags() -> MsgFlags {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    return MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    return MsgFlags::MSG_DONTWAIT;
}

#[cfg(test)]
mod transfer_tests {
    use super::*;
    use socket2::SockRef;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    #[tokio::test]
    async fn transferred_socket_stays_connected() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let handle: OwnedFd = accepted.into_std().unwrap().into();
        assert!(matches!(send_handle(&sender, handle), TransferOutcome::Sent));

        let mut handles = recv_handles(&receiver).await.unwrap().unwrap();
        assert_eq!(handles.len(), 1);

        let std = std::net::TcpStream::from(handles.remove(0));
        std.set_nonblocking(true).unwrap();
        let mut adopted = TcpStream::from_std(std).unwrap();

        adopted.write_all(b"hi").await.unwrap();
        let mut buf = [0; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn closed_receiver_returns_handle() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(receiver);

        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let handle: OwnedFd = a.into_std().unwrap().into();

        match send_handle(&sender, handle) {
            TransferOutcome::TargetGone { handle, .. } => assert_eq!(handle.as_raw_fd(), raw),
            _ => panic!("send to a closed pipe did not fail"),
        }
    }

    #[tokio::test]
    async fn full_pipe_returns_handle_as_busy() {
        let (sender, _receiver) = UnixStream::pair().unwrap();
        SockRef::from(&sender).set_send_buffer_size(4096).unwrap();
        let handle: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();

        for _ in 0..10_000 {
            let copy = handle.try_clone().unwrap();
            let raw = copy.as_raw_fd();
            match send_handle(&sender, copy) {
                TransferOutcome::Sent => continue,
                TransferOutcome::Busy(busy) => return assert_eq!(busy.as_raw_fd(), raw),
                TransferOutcome::TargetGone { error, .. } => panic!("unexpected failure: {error}"),
            }
        }
        panic!("pipe never filled up");
    }

    #[tokio::test]
    async fn closed_peer_is_detected_without_sending() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        assert!(!peer_closed(&sender));

        drop(receiver);
        assert!(peer_closed(&sender));
    }

    #[tokio::test]
    async fn closed_sender_reads_as_end() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);

        assert!(recv_handles(&receiver).await.unwrap().is_none());
    }
}
