//! UDP listener socket with destination-address tracking.
//!
//! On a multi-homed host the kernel may pick a reply source address that
//! differs from the destination the stub resolver sent to, which makes
//! the stub discard the reply. The listener therefore records each
//! datagram's destination from the IP_PKTINFO / IPV6_RECVPKTINFO
//! ancillary data and sends the reply with that address as the source.
//! On platforms without ancillary-data support the correction is a
//! no-op and the kernel picks the source.

use std::io;
use std::net::{IpAddr, SocketAddr};

#[cfg(unix)]
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;

pub struct OobUdpSocket {
    socket: UdpSocket,
    bound_addr: SocketAddr,
    is_wildcard: bool,
}

#[cfg(target_os = "linux")]
const IPV4_PKTINFO_OPTION: libc::c_int = libc::IP_PKTINFO;
#[cfg(target_os = "macos")]
const IPV4_PKTINFO_OPTION: libc::c_int = libc::IP_RECVDSTADDR;

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn enable_pktinfo(socket: &Socket, ipv4: bool) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let (level, option) = if ipv4 {
        (libc::IPPROTO_IP, IPV4_PKTINFO_OPTION)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl OobUdpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        enable_pktinfo(&socket, addr.is_ipv4())?;
        socket.bind(&SockAddr::from(addr))?;
        Self::from_std(socket.into())
    }

    /// Wraps a pre-opened listener (socket-activation / privilege-drop
    /// handoff). Destination tracking is enabled best-effort since the
    /// parent may not have set the option.
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let bound_addr = socket.local_addr()?;
        let socket = UdpSocket::from_std(socket)?;
        let is_wildcard = bound_addr.ip().is_unspecified();
        Ok(OobUdpSocket {
            socket,
            bound_addr,
            is_wildcard,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives one datagram, returning its length, the peer address and
    /// the local destination address the client used (when recoverable).
    pub async fn recv_from_dst(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        if !self.is_wildcard {
            // Bound to a concrete address: the kernel can only reply from it
            let (len, peer) = self.socket.recv_from(buf).await?;
            return Ok((len, peer, None));
        }
        self.recv_from_pktinfo(buf).await
    }

    /// Sends a reply, forcing the source address when one was recovered
    /// from the matching request. The address family is chosen by the
    /// destination: IPv6 unless it has an IPv4-mapped form, because the
    /// IPv6 control message silently drops IPv4 addresses.
    pub async fn send_to_from(&self, buf: &[u8], target: SocketAddr, src: Option<IpAddr>) -> io::Result<usize> {
        match src {
            Some(src) if self.is_wildcard && src != self.bound_addr.ip() => {
                self.send_to_pktinfo(buf, target, src).await
            }
            _ => self.socket.send_to(buf, target).await,
        }
    }

    #[cfg(target_os = "linux")]
    async fn recv_from_pktinfo(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrStorage};
        use std::io::IoSliceMut;
        use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

        let fd = self.socket.as_raw_fd();
        loop {
            self.socket.readable().await?;

            let mut iov = [IoSliceMut::new(buf)];
            // Sized for the larger of the two families' control messages
            let mut cmsg_buf = vec![
                0u8;
                nix::sys::socket::cmsg_space::<libc::in6_pktinfo>()
                    .max(nix::sys::socket::cmsg_space::<libc::in_pktinfo>())
            ];

            #[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on some platforms
            let result = self.socket.try_io(tokio::io::Interest::READABLE, || {
                match recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
                    Ok(msg) => {
                        let peer = msg
                            .address
                            .as_ref()
                            .and_then(|sa: &SockaddrStorage| {
                                if let Some(sin) = sa.as_sockaddr_in() {
                                    Some(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())))
                                } else if let Some(sin6) = sa.as_sockaddr_in6() {
                                    Some(SocketAddr::V6(SocketAddrV6::new(
                                        sin6.ip(),
                                        sin6.port(),
                                        sin6.flowinfo(),
                                        sin6.scope_id(),
                                    )))
                                } else {
                                    None
                                }
                            })
                            .ok_or_else(|| io::Error::other("no peer address"))?;
                        let mut dst = None;
                        for cmsg in msg.cmsgs().map_err(io::Error::other)? {
                            match cmsg {
                                ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                                    dst = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(pktinfo.ipi_addr.s_addr))));
                                }
                                ControlMessageOwned::Ipv6PacketInfo(pktinfo) => {
                                    dst = Some(IpAddr::V6(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr)));
                                }
                                _ => {}
                            }
                        }
                        Ok((msg.bytes, peer, dst))
                    }
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {
                        Err(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                    Err(e) => Err(io::Error::other(e)),
                }
            });

            match result {
                Ok(received) => return Ok(received),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn recv_from_pktinfo(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        let (len, peer) = self.socket.recv_from(buf).await?;
        Ok((len, peer, None))
    }

    #[cfg(target_os = "linux")]
    async fn send_to_pktinfo(&self, buf: &[u8], target: SocketAddr, src: IpAddr) -> io::Result<usize> {
        use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, SockaddrIn, SockaddrIn6};
        use std::io::IoSlice;

        // IPv6 control messages ignore IPv4 addresses, so a mapped
        // address has to travel as IPv4
        let src = match src {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };

        let fd = self.socket.as_raw_fd();
        match (target, src) {
            (SocketAddr::V4(dst_v4), IpAddr::V4(src_v4)) => {
                let dst = SockaddrIn::from(dst_v4);
                let pktinfo = libc::in_pktinfo {
                    ipi_ifindex: 0,
                    ipi_spec_dst: libc::in_addr {
                        s_addr: u32::from(src_v4).to_be(),
                    },
                    ipi_addr: libc::in_addr { s_addr: 0 },
                };
                loop {
                    self.socket.writable().await?;
                    let iov = [IoSlice::new(buf)];
                    let cmsg = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
                    #[allow(unreachable_patterns)]
                    let result = self.socket.try_io(tokio::io::Interest::WRITABLE, || {
                        match sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), Some(&dst)) {
                            Ok(sent) => Ok(sent),
                            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {
                                Err(io::Error::from(io::ErrorKind::WouldBlock))
                            }
                            Err(e) => Err(io::Error::other(e)),
                        }
                    });
                    match result {
                        Ok(sent) => return Ok(sent),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            (SocketAddr::V6(dst_v6), IpAddr::V6(src_v6)) => {
                let dst = SockaddrIn6::from(dst_v6);
                let pktinfo = libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: src_v6.octets(),
                    },
                    ipi6_ifindex: 0,
                };
                loop {
                    self.socket.writable().await?;
                    let iov = [IoSlice::new(buf)];
                    let cmsg = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
                    #[allow(unreachable_patterns)]
                    let result = self.socket.try_io(tokio::io::Interest::WRITABLE, || {
                        match sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), Some(&dst)) {
                            Ok(sent) => Ok(sent),
                            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {
                                Err(io::Error::from(io::ErrorKind::WouldBlock))
                            }
                            Err(e) => Err(io::Error::other(e)),
                        }
                    });
                    match result {
                        Ok(sent) => return Ok(sent),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            // Family mismatch between the recovered destination and the
            // client: let the kernel pick
            _ => self.socket.send_to(buf, target).await,
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn send_to_pktinfo(&self, buf: &[u8], target: SocketAddr, _src: IpAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }
}

#[cfg(unix)]
impl AsRawFd for OobUdpSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.socket.as_raw_fd()
    }
}
