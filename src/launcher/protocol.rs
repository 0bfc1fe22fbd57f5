// Parent/child report plane: JSON-line frames over a socketpair, plus a
// single-byte "go" authorization the child waits on between stages.

use crate::error::{RuntimeError, RuntimeResult};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{close, read, write};
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

pub const STAGE_MASTER: u32 = 1;
pub const STAGE_NAMESPACES: u32 = 2;
pub const STAGE_INIT: u32 = 3;
pub const STAGE_PORTAL: u32 = 4;
pub const STAGE_CONFIGURED: u32 = 5;

const GO_BYTE: u8 = b'G';

/// One message on the report socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Pid { stage: u32, pid: i32 },
    Error { stage: u32, errno: i32, message: String },
}

/// One end of the report socket. The parent holds the master side, the
/// child stages inherit the other across every fork.
#[derive(Debug)]
pub struct ReportSocket {
    fd: RawFd,
    buffer: Vec<u8>,
}

/// A connected socket pair: (master side, child side).
pub fn report_pair() -> RuntimeResult<(ReportSocket, ReportSocket)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| RuntimeError::from_errno(e, "socketpair(launcher)"))?;
    Ok((ReportSocket::from_fd(a), ReportSocket::from_fd(b)))
}

impl ReportSocket {
    pub fn from_fd(fd: RawFd) -> Self {
        ReportSocket {
            fd,
            buffer: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn send_frame(&self, frame: &Frame) -> RuntimeResult<()> {
        let mut line = serde_json::to_vec(frame)
            .map_err(|e| RuntimeError::socket(format!("frame_encode: {}", e)))?;
        line.push(b'\n');
        let mut sent = 0;
        while sent < line.len() {
            match write(self.fd, &line[sent..]) {
                Ok(0) => return Err(RuntimeError::socket("send_frame: peer closed")),
                Ok(n) => sent += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(RuntimeError::from_errno(e, "send_frame")),
            }
        }
        Ok(())
    }

    pub fn send_go(&self) -> RuntimeResult<()> {
        match write(self.fd, &[GO_BYTE]) {
            Ok(1) => Ok(()),
            Ok(_) => Err(RuntimeError::socket("send_go: short write")),
            Err(e) => Err(RuntimeError::from_errno(e, "send_go")),
        }
    }

    fn wait_readable(&self, timeout_ms: i32) -> RuntimeResult<()> {
        let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, timeout_ms) {
                Ok(0) => {
                    return Err(RuntimeError::socket_timeout(format!(
                        "poll(launcher, {}ms)",
                        timeout_ms
                    )))
                }
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(RuntimeError::from_errno(e, "poll(launcher)")),
            }
        }
    }

    fn fill(&mut self, timeout_ms: i32) -> RuntimeResult<()> {
        self.wait_readable(timeout_ms)?;
        let mut chunk = [0u8; 4096];
        loop {
            match read(self.fd, &mut chunk) {
                Ok(0) => return Err(RuntimeError::socket("recv: peer closed")),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(RuntimeError::from_errno(e, "recv(launcher)")),
            }
        }
    }

    /// Receive one frame, waiting up to `timeout_ms` for each read.
    pub fn recv_frame(&mut self, timeout_ms: i32) -> RuntimeResult<Frame> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return serde_json::from_slice(line).map_err(|e| {
                    RuntimeError::socket(format!(
                        "frame_decode({}): {}",
                        String::from_utf8_lossy(line),
                        e
                    ))
                });
            }
            self.fill(timeout_ms)?;
        }
    }

    /// Block until the parent authorizes the next stage.
    pub fn recv_go(&mut self, timeout_ms: i32) -> RuntimeResult<()> {
        // Drain a buffered byte first: go bytes never mix with frames in
        // one direction, but reads are shared with recv_frame's buffer.
        loop {
            if let Some(&byte) = self.buffer.first() {
                self.buffer.remove(0);
                if byte == GO_BYTE {
                    return Ok(());
                }
                return Err(RuntimeError::socket(format!(
                    "recv_go: unexpected byte {:#x}",
                    byte
                )));
            }
            self.fill(timeout_ms)?;
        }
    }
}

impl Drop for ReportSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_the_pair() {
        let (parent, child) = report_pair().unwrap();
        let mut parent = parent;
        let mut child = child;

        child
            .send_frame(&Frame::Pid {
                stage: STAGE_MASTER,
                pid: 1234,
            })
            .unwrap();
        match parent.recv_frame(1000).unwrap() {
            Frame::Pid { stage, pid } => {
                assert_eq!(stage, STAGE_MASTER);
                assert_eq!(pid, 1234);
            }
            other => panic!("unexpected frame {:?}", other),
        }

        parent.send_go().unwrap();
        child.recv_go(1000).unwrap();
    }

    #[test]
    fn error_frames_survive_round_trip() {
        let (mut parent, child) = report_pair().unwrap();
        child
            .send_frame(&Frame::Error {
                stage: STAGE_CONFIGURED,
                errno: libc::EACCES,
                message: "mount(proc)".to_string(),
            })
            .unwrap();
        match parent.recv_frame(1000).unwrap() {
            Frame::Error { stage, errno, message } => {
                assert_eq!(stage, STAGE_CONFIGURED);
                assert_eq!(errno, libc::EACCES);
                assert_eq!(message, "mount(proc)");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn recv_times_out() {
        let (mut parent, _child) = report_pair().unwrap();
        let err = parent.recv_frame(50).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SocketTimeout);
    }

    #[test]
    fn back_to_back_frames_are_split() {
        let (mut parent, child) = report_pair().unwrap();
        child
            .send_frame(&Frame::Pid { stage: 1, pid: 10 })
            .unwrap();
        child
            .send_frame(&Frame::Pid { stage: 2, pid: 20 })
            .unwrap();
        let first = parent.recv_frame(1000).unwrap();
        let second = parent.recv_frame(1000).unwrap();
        assert!(matches!(first, Frame::Pid { stage: 1, pid: 10 }));
        assert!(matches!(second, Frame::Pid { stage: 2, pid: 20 }));
    }
}
