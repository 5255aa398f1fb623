use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use netlink_packet_conntrack::Instruction;
use tokio::io::unix::AsyncFd;

/// A `NETLINK_NETFILTER` socket registered with the tokio reactor.
pub struct Socket {
    fd: AsyncFd<OwnedFd>,

    pid: u32,
    seq: AtomicU32,
}

impl Socket {
    /// Must be called from within a tokio runtime.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            );
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }

            OwnedFd::from_raw_fd(fd)
        };

        let enable: libc::c_int = 1;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::FIONBIO, &enable as *const _) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        // let the kernel pick the port id
        let mut addr = unsafe { std::mem::zeroed::<libc::sockaddr_nl>() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let mut addr_len = size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                addr_len,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe {
            libc::getsockname(
                fd.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        debug!(message = "netlink socket opened", pid = addr.nl_pid);

        Ok(Socket {
            fd: AsyncFd::new(fd)?,
            pid: addr.nl_pid,
            seq: AtomicU32::new(1),
        })
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;

            let result = guard.try_io(|fd| {
                let mut addr = unsafe { std::mem::zeroed::<libc::sockaddr_nl>() };
                addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

                let ret = unsafe {
                    libc::sendto(
                        fd.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        0,
                        &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                        size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                    )
                };
                if ret == -1 {
                    return Err(io::Error::last_os_error());
                }

                Ok(ret as usize)
            });

            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram, which may carry several netlink messages.
    pub async fn receive(&self) -> io::Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.readable().await?;

            let result = guard.try_io(|fd| {
                // MSG_TRUNC makes the peek report the real datagram size
                let mut probe = [0u8; 1];
                let size = unsafe {
                    libc::recv(
                        fd.as_raw_fd(),
                        probe.as_mut_ptr() as *mut libc::c_void,
                        probe.len(),
                        libc::MSG_PEEK | libc::MSG_TRUNC,
                    )
                };
                if size == -1 {
                    return Err(io::Error::last_os_error());
                }

                let mut buf = vec![0u8; size as usize];
                let read = unsafe {
                    libc::recv(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if read == -1 {
                    return Err(io::Error::last_os_error());
                }

                buf.truncate(read as usize);
                Ok(buf)
            });

            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Install a classic BPF program, replacing any previous one.
    pub fn attach_filter(&self, program: &[Instruction]) -> io::Result<()> {
        let mut filters = program
            .iter()
            .map(|ins| libc::sock_filter {
                code: ins.code,
                jt: ins.jt,
                jf: ins.jf,
                k: ins.k,
            })
            .collect::<Vec<_>>();
        let prog = libc::sock_fprog {
            len: filters.len() as libc::c_ushort,
            filter: filters.as_mut_ptr(),
        };

        self.setsockopt(libc::SO_ATTACH_FILTER, &prog)
    }

    pub fn detach_filter(&self) -> io::Result<()> {
        let value: libc::c_int = 0;
        self.setsockopt(libc::SO_DETACH_FILTER, &value)
    }

    fn setsockopt<T>(&self, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                name,
                value as *const T as *const libc::c_void,
                size_of::<T>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
