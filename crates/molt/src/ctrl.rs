//! Per-worker side-band channels.
//!
//! Each worker gets two `AF_UNIX` `SOCK_SEQPACKET` socketpairs at spawn
//! time: a control channel the master writes (soft-kill, promote, spawn)
//! and a liveness channel the worker writes (tick/request frames, spawn
//! reports from a mold). Packet sockets keep message boundaries, so every
//! read is one whole frame.
//!
//! A spawn message addressed to a mold carries the new worker's two
//! child-end fds as `SCM_RIGHTS` ancillary data: the mold cannot inherit
//! fds created in the master after it was forked, so they are passed
//! explicitly.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

const CTRL_FRAME: usize = 5;
const LIVE_FRAME: usize = 17;

/// Master-to-worker control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlMessage {
    /// Finish the in-flight request, then exit 0.
    SoftKill,
    /// Become the mold after the in-flight request.
    Promote,
    /// (Molds only.) Fork a worker for slot `nr`; its channel fds ride
    /// along as ancillary data.
    Spawn {
        /// Slot to fill.
        nr: u32,
    },
}

impl CtrlMessage {
    fn encode(self) -> [u8; CTRL_FRAME] {
        let (op, arg) = match self {
            Self::SoftKill => (1u8, 0u32),
            Self::Promote => (2, 0),
            Self::Spawn { nr } => (3, nr),
        };
        let mut frame = [0u8; CTRL_FRAME];
        frame[0] = op;
        frame[1..].copy_from_slice(&arg.to_le_bytes());
        frame
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != CTRL_FRAME {
            return None;
        }
        let arg = u32::from_le_bytes(frame[1..5].try_into().ok()?);
        match frame[0] {
            1 => Some(Self::SoftKill),
            2 => Some(Self::Promote),
            3 => Some(Self::Spawn { nr: arg }),
            _ => None,
        }
    }
}

/// Worker-to-master liveness messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMessage {
    /// Progress report: monotonic tick seconds and requests served.
    Tick {
        /// Monotonic seconds when written.
        tick: u64,
        /// Requests served since fork.
        requests: u64,
    },
    /// (From molds.) A spawn request was served; here is the child pid.
    Spawned {
        /// Slot that was filled.
        nr: u32,
        /// Pid of the forked worker.
        pid: u32,
    },
}

impl LiveMessage {
    fn encode(self) -> [u8; LIVE_FRAME] {
        let (tag, a, b) = match self {
            Self::Tick { tick, requests } => (1u8, tick, requests),
            Self::Spawned { nr, pid } => (2, u64::from(nr), u64::from(pid)),
        };
        let mut frame = [0u8; LIVE_FRAME];
        frame[0] = tag;
        frame[1..9].copy_from_slice(&a.to_le_bytes());
        frame[9..17].copy_from_slice(&b.to_le_bytes());
        frame
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() != LIVE_FRAME {
            return None;
        }
        let a = u64::from_le_bytes(frame[1..9].try_into().ok()?);
        let b = u64::from_le_bytes(frame[9..17].try_into().ok()?);
        match frame[0] {
            1 => Some(Self::Tick {
                tick: a,
                requests: b,
            }),
            2 => Some(Self::Spawned {
                nr: a as u32,
                pid: b as u32,
            }),
            _ => None,
        }
    }
}

/// Result of a non-blocking control read in the worker.
#[derive(Debug)]
pub enum CtrlEvent {
    /// Nothing pending.
    Empty,
    /// The master's end is gone; the worker should stop.
    Closed,
    /// One message, with any fds that rode along.
    Message(CtrlMessage, Vec<OwnedFd>),
}

/// Master-held ends of one worker's channels.
#[derive(Debug)]
pub struct MasterChannel {
    ctrl_w: OwnedFd,
    live_r: OwnedFd,
}

/// Worker-held ends.
#[derive(Debug)]
pub struct ChildChannel {
    ctrl_r: OwnedFd,
    live_w: OwnedFd,
}

/// Create the channel pair for one worker slot.
pub fn channel_pair() -> io::Result<(MasterChannel, ChildChannel)> {
    let (ctrl_w, ctrl_r) = seqpacket_pair()?;
    let (live_w, live_r) = seqpacket_pair()?;
    set_nonblocking(ctrl_w.as_raw_fd())?;
    set_nonblocking(ctrl_r.as_raw_fd())?;
    set_nonblocking(live_w.as_raw_fd())?;
    set_nonblocking(live_r.as_raw_fd())?;
    Ok((
        MasterChannel { ctrl_w, live_r },
        ChildChannel { ctrl_r, live_w },
    ))
}

impl MasterChannel {
    /// Send a control message without fds.
    pub fn send(&self, msg: CtrlMessage) -> io::Result<()> {
        send_with_fds(self.ctrl_w.as_raw_fd(), &msg.encode(), &[])?;
        Ok(())
    }

    /// Send a spawn request to a mold, passing the new worker's child-end
    /// fds along.
    pub fn send_spawn(&self, nr: u32, child: &ChildChannel) -> io::Result<()> {
        let fds = [child.ctrl_r.as_raw_fd(), child.live_w.as_raw_fd()];
        send_with_fds(
            self.ctrl_w.as_raw_fd(),
            &CtrlMessage::Spawn { nr }.encode(),
            &fds,
        )?;
        Ok(())
    }

    /// Drain pending liveness frames. The flag reports whether the worker
    /// end has closed.
    pub fn drain_live(&self) -> (Vec<LiveMessage>, bool) {
        let mut messages = Vec::new();
        let mut closed = false;
        let mut frame = [0u8; LIVE_FRAME];
        loop {
            match recv_with_fds(self.live_r.as_raw_fd(), &mut frame, 0) {
                Ok((0, _)) => {
                    closed = true;
                    break;
                }
                Ok((n, _)) => {
                    if let Some(msg) = LiveMessage::decode(&frame[..n]) {
                        messages.push(msg);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        (messages, closed)
    }

    /// Raw fds, closed in forked children that are not this worker.
    #[must_use]
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.ctrl_w.as_raw_fd(), self.live_r.as_raw_fd()]
    }
}

impl ChildChannel {
    /// Rebuild a channel from fds received over `SCM_RIGHTS`.
    #[must_use]
    pub fn from_fds(ctrl_r: OwnedFd, live_w: OwnedFd) -> Self {
        Self { ctrl_r, live_w }
    }

    /// The control fd, for the worker's readiness wait.
    #[must_use]
    pub fn ctrl_fd(&self) -> RawFd {
        self.ctrl_r.as_raw_fd()
    }

    /// Non-blocking control read.
    pub fn recv(&self) -> CtrlEvent {
        let mut frame = [0u8; CTRL_FRAME];
        match recv_with_fds(self.ctrl_r.as_raw_fd(), &mut frame, 2) {
            Ok((0, _)) => CtrlEvent::Closed,
            Ok((n, fds)) => match CtrlMessage::decode(&frame[..n]) {
                Some(msg) => CtrlEvent::Message(msg, fds),
                None => CtrlEvent::Empty,
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => CtrlEvent::Empty,
            Err(_) => CtrlEvent::Closed,
        }
    }

    /// Publish a liveness frame. Dropped when the master is behind; the
    /// next frame carries newer values anyway.
    pub fn send_tick(&self, tick: u64, requests: u64) {
        let frame = LiveMessage::Tick { tick, requests }.encode();
        let _ = send_with_fds(self.live_w.as_raw_fd(), &frame, &[]);
    }

    /// Report a completed spawn. Retried briefly: the master must see it.
    pub fn send_spawned(&self, nr: u32, pid: u32) -> io::Result<()> {
        let frame = LiveMessage::Spawned { nr, pid }.encode();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match send_with_fds(self.live_w.as_raw_fd(), &frame, &[]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Raw fds, for exec-path environment serialization.
    #[must_use]
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.ctrl_r.as_raw_fd(), self.live_w.as_raw_fd()]
    }

    /// Clear close-on-exec ahead of an exec-based spawn.
    pub fn clear_cloexec(&self) -> io::Result<()> {
        crate::listener::set_cloexec(self.ctrl_r.as_raw_fd(), false)?;
        crate::listener::set_cloexec(self.live_w.as_raw_fd(), false)
    }
}

fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `sendmsg` with optional `SCM_RIGHTS` fd payload.
fn send_with_fds(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let payload = std::mem::size_of_val(fds);
        unsafe {
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(payload as u32) as usize;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as usize;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr().cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                payload,
            );
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// `recvmsg` collecting up to `max_fds` passed fds.
fn recv_with_fds(sock: RawFd, buf: &mut [u8], max_fds: usize) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if max_fds > 0 {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_buf.len();
    }

    let n = loop {
        let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fds = Vec::new();
    if max_fds > 0 {
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let header = libc::CMSG_LEN(0) as usize;
                    let count = ((*cmsg).cmsg_len - header) / std::mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..count.min(max_fds) {
                        fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
    }
    Ok((n, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn ctrl_messages_round_trip() {
        let (master, child) = channel_pair().unwrap();

        master.send(CtrlMessage::SoftKill).unwrap();
        master.send(CtrlMessage::Promote).unwrap();
        master.send(CtrlMessage::Spawn { nr: 7 }).unwrap();

        assert!(matches!(
            child.recv(),
            CtrlEvent::Message(CtrlMessage::SoftKill, _)
        ));
        assert!(matches!(
            child.recv(),
            CtrlEvent::Message(CtrlMessage::Promote, _)
        ));
        match child.recv() {
            CtrlEvent::Message(CtrlMessage::Spawn { nr }, fds) => {
                assert_eq!(nr, 7);
                assert!(fds.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(child.recv(), CtrlEvent::Empty));
    }

    #[test]
    fn closed_master_is_detected() {
        let (master, child) = channel_pair().unwrap();
        drop(master);
        assert!(matches!(child.recv(), CtrlEvent::Closed));
    }

    #[test]
    fn liveness_frames_round_trip() {
        let (master, child) = channel_pair().unwrap();
        child.send_tick(1234, 56);
        child.send_spawned(3, 9999).unwrap();

        let (messages, closed) = master.drain_live();
        assert!(!closed);
        assert_eq!(
            messages,
            vec![
                LiveMessage::Tick {
                    tick: 1234,
                    requests: 56
                },
                LiveMessage::Spawned { nr: 3, pid: 9999 },
            ]
        );

        let (messages, closed) = master.drain_live();
        assert!(messages.is_empty());
        assert!(!closed);
    }

    #[test]
    fn spawn_passes_working_fds() {
        // Master creates a fresh channel pair for a new worker and ships
        // the child ends to a "mold" over an existing control channel.
        let (mold_master, mold_child) = channel_pair().unwrap();
        let (new_master, new_child) = channel_pair().unwrap();

        mold_master.send_spawn(4, &new_child).unwrap();

        let (msg, fds) = match mold_child.recv() {
            CtrlEvent::Message(msg, fds) => (msg, fds),
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(msg, CtrlMessage::Spawn { nr: 4 });
        assert_eq!(fds.len(), 2);

        // The received live-end fd reaches the master's drain.
        let mut fds = fds.into_iter();
        let rebuilt = ChildChannel::from_fds(fds.next().unwrap(), fds.next().unwrap());
        rebuilt.send_tick(1, 2);
        let (messages, _) = new_master.drain_live();
        assert_eq!(
            messages,
            vec![LiveMessage::Tick {
                tick: 1,
                requests: 2
            }]
        );
        drop(new_child);
    }

    #[test]
    fn stream_sockets_also_carry_frames() {
        // Sanity-check the frame codec itself.
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(&LiveMessage::Tick {
            tick: 9,
            requests: 1,
        }
        .encode())
            .unwrap();
        let mut frame = [0u8; LIVE_FRAME];
        b.read_exact(&mut frame).unwrap();
        assert_eq!(
            LiveMessage::decode(&frame),
            Some(LiveMessage::Tick {
                tick: 9,
                requests: 1
            })
        );
    }
}
