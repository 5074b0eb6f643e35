//! Raw socket plumbing: option application before connect and the two
//! kernel queries (TCP_INFO, TCP_CONGESTION) after the exchange.
//!
//! Everything here operates on Linux sockets. A zero/unset knob leaves the
//! kernel default in place; the two inverted booleans (nodelay, quickack)
//! default to enabled and are only turned off by their disable flags.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use libc::{c_int, c_void, socklen_t};
use tracing::warn;

use crate::cli::Request;
use crate::error::{Result, TcpProbeError};
use crate::probe::stats::{TcpInfo, TCP_INFO_SIZE};

fn set_int(fd: RawFd, level: c_int, opt: c_int, value: c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_str(fd: RawFd, level: c_int, opt: c_int, value: &str) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            value.as_ptr() as *const c_void,
            value.len() as socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Apply the configured socket options to a not-yet-connected socket.
///
/// Failures are logged and non-fatal, except for an explicitly requested
/// congestion-control algorithm the kernel rejects.
pub fn apply(fd: RawFd, req: &Request, ipv4: bool) -> Result<()> {
    let set = |op: &'static str, level: c_int, opt: c_int, value: i32| {
        if value == 0 {
            return;
        }
        if let Err(err) = set_int(fd, level, opt, value) {
            warn!("setsockopt {}: {}", op, err);
        }
    };

    set("SO_PRIORITY", libc::SOL_SOCKET, libc::SO_PRIORITY, req.so_priority);
    set("SO_SNDBUF", libc::SOL_SOCKET, libc::SO_SNDBUF, req.so_sndbuf);
    set("SO_RCVBUF", libc::SOL_SOCKET, libc::SO_RCVBUF, req.so_rcvbuf);
    set("TCP_MAXSEG", libc::IPPROTO_TCP, libc::TCP_MAXSEG, req.so_maxseg);

    // inverted booleans: on unless explicitly disabled
    let nodelay = i32::from(!req.tcp_nodelay_disabled);
    let quickack = i32::from(!req.tcp_quickack_disabled);
    if let Err(err) = set_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay) {
        warn!("setsockopt TCP_NODELAY: {}", err);
    }
    if let Err(err) = set_int(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, quickack) {
        warn!("setsockopt TCP_QUICKACK: {}", err);
    }

    if ipv4 {
        set("IP_TOS", libc::IPPROTO_IP, libc::IP_TOS, req.so_tos);
        set("IP_TTL", libc::IPPROTO_IP, libc::IP_TTL, req.so_ttl);
    } else {
        set(
            "IPV6_UNICAST_HOPS",
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            req.so_ttl,
        );
        set("IPV6_TCLASS", libc::IPPROTO_IPV6, libc::IPV6_TCLASS, req.so_tos);
    }

    if !req.so_congestion.is_empty() {
        set_str(fd, libc::IPPROTO_TCP, libc::TCP_CONGESTION, &req.so_congestion).map_err(
            |source| TcpProbeError::Syscall {
                op: "congestion-avoidance algorithm",
                source,
            },
        )?;
    }

    Ok(())
}

/// Read the kernel's per-socket statistics vector.
pub fn tcp_info(fd: RawFd) -> Result<TcpInfo> {
    let mut info = TcpInfo::default();
    let mut len = TCP_INFO_SIZE as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_TCP,
            libc::TCP_INFO,
            &mut info as *mut TcpInfo as *mut c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(TcpProbeError::Syscall {
            op: "getsockopt TCP_INFO",
            source: io::Error::last_os_error(),
        });
    }

    Ok(info)
}

/// Read the socket's congestion-control algorithm name.
pub fn congestion_alg(fd: RawFd) -> Result<String> {
    let mut buf = [0u8; 10];
    let mut len = buf.len() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            buf.as_mut_ptr() as *mut c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(TcpProbeError::Syscall {
            op: "getsockopt TCP_CONGESTION",
            source: io::Error::last_os_error(),
        });
    }

    Ok(String::from_utf8_lossy(&buf)
        .trim_matches('\0')
        .to_string())
}

/// Duplicate a socket fd so TCP_INFO can be sampled after the stream has
/// been handed to the HTTP layer.
pub fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    let rc = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(rc) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn tcp_info_on_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stream = TcpStream::connect(addr).expect("connect");
        let _accepted = listener.accept().expect("accept");

        let info = tcp_info(stream.as_raw_fd()).expect("tcp_info");
        // 1 == TCP_ESTABLISHED
        assert_eq!(info.state, 1);
        assert!(info.rto > 0);

        let alg = congestion_alg(stream.as_raw_fd()).expect("congestion_alg");
        assert!(!alg.is_empty());
        assert!(!alg.contains('\0'));
    }

    #[test]
    fn tcp_info_on_bad_fd() {
        assert!(tcp_info(-1).is_err());
        assert!(congestion_alg(-1).is_err());
    }

    #[test]
    fn dup_keeps_socket_queryable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stream = TcpStream::connect(addr).expect("connect");
        let _accepted = listener.accept().expect("accept");

        let dup_fd = dup(stream.as_raw_fd()).expect("dup");
        drop(stream);
        // the dup keeps the socket alive
        assert!(tcp_info(dup_fd.as_raw_fd()).is_ok());
    }
}
