//! ICMP error-queue parsing.
//!
//! A UDP socket with `IP_RECVERR` set surfaces incoming ICMP errors
//! through the socket's error queue rather than as ordinary datagrams;
//! a subsequent `recvmsg(..., MSG_ERRQUEUE)` returns no payload but
//! attaches a `sock_extended_err` control message describing the
//! error. We only care about one shape of that message: a
//! `TIME_EXCEEDED`/`EXC_TTL` report, which means some router on the
//! path replied to an expiring probe and names itself as the offender.

use std::net::IpAddr;

use nix::sys::socket::ControlMessageOwned;

/// A router that answered one of our probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IcmpOffender {
    pub(crate) addr: IpAddr,
}

/// Different-shaped ICMP errors correspond to different outcomes for the
/// probe that triggered them. We only ever surface [`IcmpOffender`] for a
/// true intermediate-hop reply; anything else (e.g. a destination
/// unreachable) is reported as [`ProbeOutcome::Unreachable`] so the
/// scheduler can still retire the slot without mistaking it for a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Hop(IcmpOffender),
    Unreachable,
    Other,
}

/// Inspect the control messages returned alongside an `MSG_ERRQUEUE`
/// receive and classify the extended error they carry, if any.
pub(crate) fn classify(cmsgs: impl Iterator<Item = ControlMessageOwned>) -> Option<ProbeOutcome> {
    for cmsg in cmsgs {
        if let ControlMessageOwned::Ipv4RecvErr(err, addr) = cmsg {
            if err.ee_origin != libc::SO_EE_ORIGIN_ICMP {
                continue;
            }
            return Some(match (err.ee_type as i32, err.ee_code as i32) {
                (libc::ICMP_TIME_EXCEEDED, libc::ICMP_EXC_TTL) => match addr {
                    Some(sin) => ProbeOutcome::Hop(IcmpOffender {
                        addr: IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                    }),
                    None => ProbeOutcome::Other,
                },
                (libc::ICMP_DEST_UNREACH, _) => ProbeOutcome::Unreachable,
                _ => ProbeOutcome::Other,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmsg_iterator_classifies_as_none() {
        assert_eq!(classify(std::iter::empty()), None);
    }
}
