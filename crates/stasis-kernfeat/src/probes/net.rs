//! Socket-layer probes.
//!
//! Covers IPv6 availability, per-socket network-namespace attribution,
//! TCP repair from half-closed states, plain TCP repair (queried lazily),
//! and the netlink namespace-id interfaces. Repair probes need
//! CAP_NET_ADMIN; a refusal classifies the feature as unavailable for
//! this process, which is exactly what the consumer needs to know.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

use tracing::debug;

use crate::probes::owned_fd;
use stasis_common::kernel_version;

const SOL_NETLINK: libc::c_int = 270;
const NETLINK_LISTEN_ALL_NSID: libc::c_int = 8;
const TCP_REPAIR: libc::c_int = 19;

const RTM_GETNSID: u16 = 90;
const RTM_NEWNSID: u16 = 88;
const NETNSA_FD: u16 = 3;
const NLM_F_REQUEST: u16 = 1;

/// Kernel release that added `IFLA_LINK_NETNSID`.
const LINK_NSID_KERNEL: (u32, u32, u32) = (4, 0, 0);

/// IPv6 socket creation works.
pub fn probe_ipv6() -> bool {
    let rc = unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    match owned_fd(rc) {
        Ok(_fd) => true,
        Err(err) => {
            if err.raw_os_error() != Some(libc::EAFNOSUPPORT) {
                debug!(error = %err, "ipv6 socket failed unexpectedly");
            }
            false
        }
    }
}

/// Socket diag can attribute sockets across network namespaces.
///
/// Tested by asking a `NETLINK_SOCK_DIAG` socket to listen in all
/// namespaces; kernels without the attribution reject the option.
pub fn probe_sock_netns() -> bool {
    let rc = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_SOCK_DIAG,
        )
    };
    let fd = match owned_fd(rc) {
        Ok(fd) => fd,
        Err(err) => {
            debug!(error = %err, "sock_diag netlink socket failed");
            return false;
        }
    };

    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_NETLINK,
            NETLINK_LISTEN_ALL_NSID,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!(
            error = %io::Error::last_os_error(),
            "NETLINK_LISTEN_ALL_NSID not accepted"
        );
        return false;
    }
    true
}

/// TCP repair can be entered from a half-closed (CLOSE_WAIT) socket.
///
/// A loopback pair is driven into CLOSE_WAIT by shutting down the client
/// side and draining the FIN, then `TCP_REPAIR` is attempted on the
/// accepted socket. Older kernels only allow repair on established or
/// closed sockets.
pub fn probe_tcp_half_closed() -> bool {
    let outcome = || -> io::Result<bool> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (accepted, _peer) = listener.accept()?;

        client.shutdown(std::net::Shutdown::Write)?;
        // Drain until EOF so the accepted side has processed the FIN
        // and sits in CLOSE_WAIT.
        use std::io::Read;
        let mut sink = [0u8; 16];
        let mut accepted_reader = &accepted;
        loop {
            match accepted_reader.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(set_tcp_repair(accepted.as_raw_fd(), 1))
    };
    match outcome() {
        Ok(supported) => supported,
        Err(err) => {
            debug!(error = %err, "half-closed repair setup failed");
            false
        }
    }
}

/// TCP repair mode usable by this process at all (lazy probe).
pub fn probe_tcp_repair() -> bool {
    let rc = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    let fd = match owned_fd(rc) {
        Ok(fd) => fd,
        Err(err) => {
            debug!(error = %err, "tcp socket for repair probe failed");
            return false;
        }
    };

    if !set_tcp_repair(fd.as_raw_fd(), 1) {
        return false;
    }
    // Leave the scratch socket in a normal state before closing.
    set_tcp_repair(fd.as_raw_fd(), 0);
    true
}

fn set_tcp_repair(fd: libc::c_int, on: libc::c_int) -> bool {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_TCP,
            TCP_REPAIR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EPERM) {
            debug!(error = %err, on, "TCP_REPAIR failed unexpectedly");
        }
        return false;
    }
    true
}

/// Network-namespace ids are queryable over rtnetlink.
///
/// An `RTM_GETNSID` request about our own netns fd is sent on a route
/// socket; any well-formed answer (including "no id assigned") means the
/// interface exists. `EOPNOTSUPP`-class errors mean it does not.
pub fn probe_nsid() -> bool {
    let ns = match std::fs::File::open("/proc/self/ns/net") {
        Ok(file) => file,
        Err(err) => {
            debug!(error = %err, "own netns fd not openable");
            return false;
        }
    };

    let rc = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    let sock = match owned_fd(rc) {
        Ok(fd) => fd,
        Err(err) => {
            debug!(error = %err, "route netlink socket failed");
            return false;
        }
    };

    let request = build_getnsid_request(ns.as_raw_fd());
    let rc = unsafe {
        libc::send(
            sock.as_raw_fd(),
            request.as_ptr() as *const libc::c_void,
            request.len(),
            0,
        )
    };
    if rc < 0 {
        debug!(error = %io::Error::last_os_error(), "RTM_GETNSID send failed");
        return false;
    }

    let mut reply = [0u8; 1024];
    let rc = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            reply.as_mut_ptr() as *mut libc::c_void,
            reply.len(),
            0,
        )
    };
    if rc < 0 {
        debug!(error = %io::Error::last_os_error(), "RTM_GETNSID recv failed");
        return false;
    }

    match parse_nsid_reply(&reply[..rc as usize]) {
        Some(supported) => supported,
        None => {
            debug!("short or malformed RTM_GETNSID reply");
            false
        }
    }
}

/// nlmsghdr + rtgenmsg + one NETNSA_FD attribute, all native-endian as
/// netlink requires.
fn build_getnsid_request(ns_fd: libc::c_int) -> Vec<u8> {
    // header 16 + rtgenmsg 1 padded to 4 + attr header 4 + fd 4
    let len: u32 = 16 + 4 + 4 + 4;
    let mut msg = Vec::with_capacity(len as usize);
    msg.extend_from_slice(&len.to_ne_bytes());
    msg.extend_from_slice(&RTM_GETNSID.to_ne_bytes());
    msg.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    msg.extend_from_slice(&1u32.to_ne_bytes()); // sequence
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid, kernel fills
    msg.extend_from_slice(&[libc::AF_UNSPEC as u8, 0, 0, 0]);
    msg.extend_from_slice(&8u16.to_ne_bytes()); // attr len
    msg.extend_from_slice(&NETNSA_FD.to_ne_bytes());
    msg.extend_from_slice(&(ns_fd as u32).to_ne_bytes());
    msg
}

/// Interpret an RTM_GETNSID reply: `Some(true)` when the interface
/// answered, `Some(false)` when it reported unsupported, `None` for a
/// reply too short to interpret.
fn parse_nsid_reply(reply: &[u8]) -> Option<bool> {
    if reply.len() < 16 {
        return None;
    }
    let msg_type = u16::from_ne_bytes([reply[4], reply[5]]);
    if msg_type == RTM_NEWNSID {
        return Some(true);
    }
    if msg_type != libc::NLMSG_ERROR as u16 {
        return Some(false);
    }
    // NLMSG_ERROR payload starts with the negative errno.
    if reply.len() < 20 {
        return None;
    }
    let errno = i32::from_ne_bytes([reply[16], reply[17], reply[18], reply[19]]);
    if errno == 0 {
        return Some(true);
    }
    let errno = -errno;
    if errno != libc::EOPNOTSUPP && errno != libc::EINVAL {
        debug!(errno, "RTM_GETNSID answered with unexpected errno");
    }
    Some(false)
}

/// Link netnsid attributes are only trustworthy on kernels that emit
/// them; there is no side-effect-free direct probe.
pub fn probe_link_nsid(has_nsid: bool) -> bool {
    if !has_nsid {
        return false;
    }
    let (major, minor, patch) = LINK_NSID_KERNEL;
    match kernel_version() {
        Some(version) => version.at_least(major, minor, patch),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_getnsid_request_layout() {
        let msg = build_getnsid_request(7);
        assert_eq!(msg.len(), 28);
        assert_eq!(u32::from_ne_bytes(msg[0..4].try_into().unwrap()), 28);
        assert_eq!(
            u16::from_ne_bytes(msg[4..6].try_into().unwrap()),
            RTM_GETNSID
        );
        // The attribute tail carries the fd.
        assert_eq!(
            u32::from_ne_bytes(msg[24..28].try_into().unwrap()),
            7
        );
    }

    #[test]
    fn test_parse_nsid_reply_newnsid() {
        let mut reply = vec![0u8; 24];
        reply[4..6].copy_from_slice(&RTM_NEWNSID.to_ne_bytes());
        assert_eq!(parse_nsid_reply(&reply), Some(true));
    }

    #[test]
    fn test_parse_nsid_reply_ack() {
        let mut reply = vec![0u8; 36];
        reply[4..6].copy_from_slice(&(libc::NLMSG_ERROR as u16).to_ne_bytes());
        reply[16..20].copy_from_slice(&0i32.to_ne_bytes());
        assert_eq!(parse_nsid_reply(&reply), Some(true));
    }

    #[test]
    fn test_parse_nsid_reply_unsupported() {
        let mut reply = vec![0u8; 36];
        reply[4..6].copy_from_slice(&(libc::NLMSG_ERROR as u16).to_ne_bytes());
        reply[16..20].copy_from_slice(&(-libc::EOPNOTSUPP).to_ne_bytes());
        assert_eq!(parse_nsid_reply(&reply), Some(false));
    }

    #[test]
    fn test_parse_nsid_reply_short() {
        assert_eq!(parse_nsid_reply(&[]), None);
        assert_eq!(parse_nsid_reply(&[0u8; 8]), None);
        let mut truncated_err = vec![0u8; 18];
        truncated_err[4..6].copy_from_slice(&(libc::NLMSG_ERROR as u16).to_ne_bytes());
        assert_eq!(parse_nsid_reply(&truncated_err), None);
    }

    #[test]
    fn test_probe_link_nsid_requires_nsid() {
        assert!(!probe_link_nsid(false));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_ipv6_deterministic() {
        assert_eq!(probe_ipv6(), probe_ipv6());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_sock_netns_deterministic() {
        assert_eq!(probe_sock_netns(), probe_sock_netns());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_tcp_repair_consistency() {
        // Both repair probes require the same privilege; an unprivileged
        // run must see both refused.
        let plain = probe_tcp_repair();
        let half_closed = probe_tcp_half_closed();
        if !plain {
            assert!(!half_closed);
        }
        assert_eq!(plain, probe_tcp_repair());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_nsid_deterministic() {
        assert_eq!(probe_nsid(), probe_nsid());
    }
}
