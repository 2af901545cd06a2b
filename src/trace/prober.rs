//! Probe I/O, abstracted behind [`Prober`] so the scheduler in
//! [`super::scheduler`] can be exercised without real sockets.
//!
//! [`LinuxProber`] is the production implementation: one non-blocking,
//! connected UDP socket per in-flight probe, with `IP_RECVERR` enabled so
//! expired-TTL ICMP replies land on the socket's error queue instead of
//! being delivered as ordinary (nonexistent) datagrams. [`FakeProber`] is
//! a test double that replays a scripted hop topology with no I/O at all.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{self, sockopt, AddressFamily, MsgFlags, SockFlag, SockType, SockaddrIn};

use super::icmp::{self, ProbeOutcome};

/// Opaque handle for one outstanding probe. Production code wraps a raw
/// fd; [`FakeProber`] wraps a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ProbeToken(pub(crate) i32);

/// Result of one `poll()` pass over the outstanding probes of a trace.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub(crate) token: ProbeToken,
    /// An ICMP error or other exceptional condition is readable.
    pub(crate) errored: bool,
}

/// Everything the scheduler needs from the network, parametrized so
/// tests can swap in [`FakeProber`].
pub(crate) trait Prober: Send {
    fn resolve(&self, host: &str) -> io::Result<IpAddr>;

    /// Open and send one probe datagram. Returns a token identifying the
    /// probe for subsequent `poll`/`recv_outcome`/`close` calls.
    fn open_probe(
        &mut self,
        dest: IpAddr,
        ttl: u8,
        dest_port: u16,
        payload: &[u8],
    ) -> io::Result<ProbeToken>;

    /// Poll every token in `tokens` for an error condition, blocking at
    /// most `timeout`.
    fn poll(&mut self, tokens: &[ProbeToken], timeout: Duration) -> io::Result<Vec<PollEvent>>;

    /// Consume and classify the pending error-queue entry for `token`.
    fn recv_outcome(&mut self, token: ProbeToken) -> io::Result<Option<ProbeOutcome>>;

    fn close(&mut self, token: ProbeToken);
}

/// Real Linux implementation: one connected, non-blocking UDP socket per
/// probe, `IP_RECVERR`/`IP_MTU_DISCOVER=DO` set so the kernel surfaces
/// `TIME_EXCEEDED` replies instead of swallowing them.
pub(crate) struct LinuxProber {
    bind_address: Option<IpAddr>,
}

impl LinuxProber {
    pub(crate) fn new(bind_address: Option<IpAddr>) -> Self {
        LinuxProber { bind_address }
    }
}

impl Prober for LinuxProber {
    fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        use std::net::ToSocketAddrs;
        (host, 0)
            .to_socket_addrs()?
            .map(|sa| sa.ip())
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolution returned no results"))
    }

    fn open_probe(
        &mut self,
        dest: IpAddr,
        ttl: u8,
        dest_port: u16,
        payload: &[u8],
    ) -> io::Result<ProbeToken> {
        let sock = socket::socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK,
            None,
        )?;

        if let Some(bind_addr) = self.bind_address {
            let IpAddr::V4(v4) = bind_addr else {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "only IPv4 is supported"));
            };
            socket::bind(sock.as_raw_fd(), &SockaddrIn::from(SocketAddr::new(IpAddr::V4(v4), 0)))?;
        }

        socket::setsockopt(&sock, sockopt::IpTtl, &(ttl as i32))?;
        socket::setsockopt(&sock, sockopt::Ipv4RecvErr, &true)?;
        unsafe {
            let do_pmtu: libc::c_int = libc::IP_PMTUDISC_DO;
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                &do_pmtu as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let IpAddr::V4(dest_v4) = dest else {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "only IPv4 is supported"));
        };
        let dest_sockaddr = SockaddrIn::from(SocketAddr::new(IpAddr::V4(dest_v4), dest_port));
        socket::connect(sock.as_raw_fd(), &dest_sockaddr)?;
        socket::send(sock.as_raw_fd(), payload, MsgFlags::empty())?;

        let fd = sock.as_raw_fd();
        std::mem::forget(sock); // ownership now tracked by the raw fd in our token
        Ok(ProbeToken(fd))
    }

    fn poll(&mut self, tokens: &[ProbeToken], timeout: Duration) -> io::Result<Vec<PollEvent>> {
        use nix::poll::{PollFd, PollFlags, PollTimeout};
        use std::os::fd::BorrowedFd;

        let borrowed: Vec<BorrowedFd> = tokens
            .iter()
            .map(|t| unsafe { BorrowedFd::borrow_raw(t.0) })
            .collect();
        let mut fds: Vec<PollFd> = borrowed
            .iter()
            .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLERR))
            .collect();

        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        nix::poll::poll(&mut fds, PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX))?;

        let mut events = Vec::new();
        for (token, fd) in tokens.iter().zip(fds.iter()) {
            if let Some(flags) = fd.revents() {
                if flags.contains(PollFlags::POLLERR) {
                    events.push(PollEvent {
                        token: *token,
                        errored: true,
                    });
                }
            }
        }
        Ok(events)
    }

    fn recv_outcome(&mut self, token: ProbeToken) -> io::Result<Option<ProbeOutcome>> {
        use std::os::fd::BorrowedFd;
        let fd = unsafe { BorrowedFd::borrow_raw(token.0) };
        let mut buf = [0u8; 0];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let mut cmsg_buf = nix::cmsg_space!(libc::sock_extended_err, libc::sockaddr_in);
        match socket::recvmsg::<()>(fd.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::MSG_ERRQUEUE) {
            Ok(msg) => Ok(icmp::classify(msg.cmsgs()?)),
            Err(nix::errno::Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self, token: ProbeToken) {
        unsafe {
            libc::close(token.0);
        }
    }
}

/// A scripted reply for one probe in a [`FakeProber`] topology.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ScriptedReply {
    Hop(IpAddr),
    Unreachable,
    Silent,
}

/// Deterministic, in-memory [`Prober`] for scheduler tests. `topology`
/// maps `ttl -> ScriptedReply`; any ttl absent from the map is silent.
pub(crate) struct FakeProber {
    topology: HashMap<u8, ScriptedReply>,
    probes: HashMap<RawFd, u8>,
    next_token: i32,
    pending: Vec<ProbeToken>,
}

impl FakeProber {
    pub(crate) fn new(topology: HashMap<u8, ScriptedReply>) -> Self {
        FakeProber {
            topology,
            probes: HashMap::new(),
            next_token: 1,
            pending: Vec::new(),
        }
    }
}

impl Prober for FakeProber {
    fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        host.parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "not a literal address"))
    }

    fn open_probe(
        &mut self,
        _dest: IpAddr,
        ttl: u8,
        _dest_port: u16,
        _payload: &[u8],
    ) -> io::Result<ProbeToken> {
        let token = ProbeToken(self.next_token);
        self.next_token += 1;
        self.probes.insert(token.0, ttl);
        if !matches!(self.topology.get(&ttl), None | Some(ScriptedReply::Silent)) {
            self.pending.push(token);
        }
        Ok(token)
    }

    fn poll(&mut self, tokens: &[ProbeToken], _timeout: Duration) -> io::Result<Vec<PollEvent>> {
        let events = tokens
            .iter()
            .filter(|t| self.pending.contains(t))
            .map(|t| PollEvent {
                token: *t,
                errored: true,
            })
            .collect();
        Ok(events)
    }

    fn recv_outcome(&mut self, token: ProbeToken) -> io::Result<Option<ProbeOutcome>> {
        self.pending.retain(|t| *t != token);
        let Some(ttl) = self.probes.get(&token.0) else {
            return Ok(None);
        };
        Ok(match self.topology.get(ttl) {
            Some(ScriptedReply::Hop(addr)) => Some(ProbeOutcome::Hop(icmp::IcmpOffender { addr: *addr })),
            Some(ScriptedReply::Unreachable) => Some(ProbeOutcome::Unreachable),
            Some(ScriptedReply::Silent) | None => None,
        })
    }

    fn close(&mut self, token: ProbeToken) {
        self.probes.remove(&token.0);
    }
}
