//! Socket address values that connections are dialed against.

use std::fmt;
use std::mem;
use std::net;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A dialable socket address. Producing the raw `sockaddr` is separated from
/// connecting so the connect loop can live with the session's retry policy.
pub(crate) enum RpcSocketAddress {
    Unix(PathBuf),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Vsock { cid: u32, port: u32 },
    Inet(net::SocketAddr),
}

pub(crate) struct SockAddrStorage {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddrStorage {
    pub fn family(&self) -> libc::c_int {
        self.storage.ss_family as libc::c_int
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }
}

impl RpcSocketAddress {
    pub fn to_storage(&self) -> Result<SockAddrStorage> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let len = match self {
            RpcSocketAddress::Unix(path) => {
                let bytes = path.as_os_str().as_bytes();
                let sun = unsafe {
                    &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un)
                };
                // one byte must remain for the NUL terminator
                if bytes.len() >= sun.sun_path.len() {
                    tracing::error!(path = %path.display(), "socket path too long");
                    return Err(Error::BadValue);
                }
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
                mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            RpcSocketAddress::Vsock { cid, port } => {
                let vm = unsafe {
                    &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_vm)
                };
                vm.svm_family = libc::AF_VSOCK as libc::sa_family_t;
                vm.svm_cid = *cid;
                vm.svm_port = *port;
                mem::size_of::<libc::sockaddr_vm>()
            }
            RpcSocketAddress::Inet(net::SocketAddr::V4(v4)) => {
                let sin = unsafe {
                    &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
                };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                mem::size_of::<libc::sockaddr_in>()
            }
            RpcSocketAddress::Inet(net::SocketAddr::V6(v6)) => {
                let sin6 = unsafe {
                    &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
                };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                mem::size_of::<libc::sockaddr_in6>()
            }
        };

        Ok(SockAddrStorage {
            storage,
            len: len as libc::socklen_t,
        })
    }
}

impl fmt::Display for RpcSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcSocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            RpcSocketAddress::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
            RpcSocketAddress::Inet(addr) => write!(f, "inet:{addr}"),
        }
    }
}
