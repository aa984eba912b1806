//! Watching descriptors that have no simulated file, through a real kernel epoll.
//!
//! Every call made here must return immediately: registration is a plain `epoll_ctl`, and
//! readiness is checked with a zero-timeout `poll` of one descriptor.

use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use rustix::event::epoll;
use rustix::event::{PollFd, PollFlags};

use crate::linux_api::epoll::{EpollCtlOp, EpollEvents};

/// An auxiliary kernel epoll owned by an [`Epoll`](super::Epoll).
pub(super) struct OsEpoll {
    epoll_fd: OwnedFd,
}

impl OsEpoll {
    pub(super) fn new() -> Result<Self, Errno> {
        let epoll_fd = epoll::create(epoll::CreateFlags::CLOEXEC).map_err(errno_from_rustix)?;
        log::trace!("Created OS epoll {epoll_fd:?}");
        Ok(Self { epoll_fd })
    }

    pub(super) fn ctl(
        &self,
        op: EpollCtlOp,
        fd: RawFd,
        events: EpollEvents,
        data: u64,
    ) -> Result<(), Errno> {
        let source = borrow_fd(fd)?;
        let data = epoll::EventData::new_u64(data);
        let flags = epoll::EventFlags::from_bits_retain(events.bits());

        let rv = match op {
            EpollCtlOp::EPOLL_CTL_ADD => epoll::add(&self.epoll_fd, source, data, flags),
            EpollCtlOp::EPOLL_CTL_MOD => epoll::modify(&self.epoll_fd, source, data, flags),
            EpollCtlOp::EPOLL_CTL_DEL => epoll::delete(&self.epoll_fd, source),
        };

        rv.map_err(errno_from_rustix)
    }

    /// The events in `interest` that are ready on `fd` right now. Errors and hang-ups are always
    /// reported, as with epoll.
    pub(super) fn poll(fd: RawFd, interest: EpollEvents) -> EpollEvents {
        let Ok(source) = borrow_fd(fd) else {
            return EpollEvents::empty();
        };

        let mut fds = [PollFd::from_borrowed_fd(source, events_to_poll(interest))];

        match rustix::event::poll(&mut fds, 0) {
            Ok(0) => EpollEvents::empty(),
            Ok(_) => {
                let revents = fds[0].revents();
                if revents.contains(PollFlags::NVAL) {
                    // not an open descriptor
                    return EpollEvents::empty();
                }
                poll_to_events(revents)
            }
            Err(e) => {
                log::debug!("Polling OS fd {fd} failed: {e}");
                EpollEvents::empty()
            }
        }
    }
}

impl std::fmt::Debug for OsEpoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsEpoll")
            .field("epoll_fd", &self.epoll_fd)
            .finish()
    }
}

fn borrow_fd(fd: RawFd) -> Result<BorrowedFd<'static>, Errno> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }

    // SAFETY: The fd is only used for the duration of a single non-blocking call. If it isn't
    // open, the kernel reports an error instead of touching another object.
    Ok(unsafe { BorrowedFd::borrow_raw(fd) })
}

fn errno_from_rustix(e: rustix::io::Errno) -> Errno {
    Errno::from_i32(e.raw_os_error())
}

const POLL_EVENT_PAIRS: [(EpollEvents, PollFlags); 8] = [
    (EpollEvents::EPOLLIN, PollFlags::IN),
    (EpollEvents::EPOLLPRI, PollFlags::PRI),
    (EpollEvents::EPOLLOUT, PollFlags::OUT),
    (EpollEvents::EPOLLRDNORM, PollFlags::RDNORM),
    (EpollEvents::EPOLLRDBAND, PollFlags::RDBAND),
    (EpollEvents::EPOLLWRNORM, PollFlags::WRNORM),
    (EpollEvents::EPOLLWRBAND, PollFlags::WRBAND),
    (EpollEvents::EPOLLRDHUP, PollFlags::RDHUP),
];

fn events_to_poll(events: EpollEvents) -> PollFlags {
    POLL_EVENT_PAIRS
        .iter()
        .filter(|(e, _)| events.contains(*e))
        .fold(PollFlags::empty(), |acc, (_, p)| acc | *p)
}

fn poll_to_events(revents: PollFlags) -> EpollEvents {
    let mut events = POLL_EVENT_PAIRS
        .iter()
        .filter(|(_, p)| revents.contains(*p))
        .fold(EpollEvents::empty(), |acc, (e, _)| acc | *e);

    events.set(EpollEvents::EPOLLERR, revents.contains(PollFlags::ERR));
    events.set(EpollEvents::EPOLLHUP, revents.contains(PollFlags::HUP));

    events
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn test_poll_pipe() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        let interest = EpollEvents::EPOLLIN | EpollEvents::EPOLLERR | EpollEvents::EPOLLHUP;

        assert_eq!(OsEpoll::poll(read_end.as_raw_fd(), interest), EpollEvents::empty());

        rustix::io::write(&write_end, b"x").unwrap();
        assert_eq!(
            OsEpoll::poll(read_end.as_raw_fd(), interest),
            EpollEvents::EPOLLIN
        );

        drop(write_end);
        assert!(OsEpoll::poll(read_end.as_raw_fd(), interest).contains(EpollEvents::EPOLLHUP));
    }

    #[test]
    fn test_ctl() {
        let os = OsEpoll::new().unwrap();
        let (read_end, _write_end) = rustix::pipe::pipe().unwrap();
        let fd = read_end.as_raw_fd();

        os.ctl(EpollCtlOp::EPOLL_CTL_ADD, fd, EpollEvents::EPOLLIN, 7)
            .unwrap();
        assert_eq!(
            os.ctl(EpollCtlOp::EPOLL_CTL_ADD, fd, EpollEvents::EPOLLIN, 7),
            Err(Errno::EEXIST)
        );
        os.ctl(EpollCtlOp::EPOLL_CTL_MOD, fd, EpollEvents::EPOLLOUT, 8)
            .unwrap();
        os.ctl(EpollCtlOp::EPOLL_CTL_DEL, fd, EpollEvents::empty(), 0)
            .unwrap();

        assert_eq!(
            os.ctl(EpollCtlOp::EPOLL_CTL_ADD, -1, EpollEvents::EPOLLIN, 0),
            Err(Errno::EBADF)
        );
    }

    #[test]
    fn test_flag_translation() {
        let events = EpollEvents::EPOLLIN | EpollEvents::EPOLLOUT | EpollEvents::EPOLLET;
        assert_eq!(events_to_poll(events), PollFlags::IN | PollFlags::OUT);
        assert_eq!(
            poll_to_events(PollFlags::IN | PollFlags::HUP),
            EpollEvents::EPOLLIN | EpollEvents::EPOLLHUP
        );
    }
}
