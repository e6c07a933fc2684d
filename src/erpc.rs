//! Agent side of the eRPC command channel.
//!
//! Every request is an `ioctl(fd, RPC_CMD, buf)` on a throwaway socket. The
//! kernel hook consumes the request on syscall entry, so the ioctl itself
//! fails with `ENOTTY` and the failure is expected. Path read-outs are
//! written by the kernel straight into a buffer owned by the caller.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use thiserror::Error;
use tracing::trace;

use secwatch_common::consts::{ERPC_MMAP_BUFFER_LEN, ERPC_REQUEST_LEN, RPC_CMD};
use secwatch_common::erpc::{
    decode_chunks, handle_erpc_request, join_segments, DiscardInodeRequest, DiscardPidRequest, ErpcOp,
    ExpireInodeRequest, ExpirePidRequest, RegisterSpanTlsRequest, ResolvePathRequest, UserSessionRequest,
    CHUNK_HEADER_LEN, ERPC_PAYLOAD_OFFSET,
};
use secwatch_common::event::EventType;
use secwatch_common::kernel::{bytes_of, Plain};
use secwatch_common::path::PathKey;
use secwatch_common::process::USER_SESSION_BLOB_LEN;
use secwatch_common::sim::SimKernel;

/// Size of the read-out buffer handed to the kernel.
pub const READ_OUT_LEN: usize = ERPC_MMAP_BUFFER_LEN;

const USER_BUF_OFFSET: usize = ERPC_PAYLOAD_OFFSET + 16;
const BUF_LEN_OFFSET: usize = ERPC_PAYLOAD_OFFSET + 24;

pub type Request = [u8; ERPC_REQUEST_LEN];

#[derive(Debug, Error)]
pub enum ErpcError {
    #[error("eRPC socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("ioctl failed: {0}")]
    Ioctl(Errno),

    #[error("no segment cached for {0:?}")]
    CacheMiss(PathKey),

    #[error("read-out starts at {got:?}, expected {expected:?}")]
    KeyMismatch { expected: PathKey, got: PathKey },

    #[error("stale read-out: challenge {got:#x}, expected {expected:#x}")]
    ChallengeMismatch { expected: u32, got: u32 },

    #[error("user session blob of {0} bytes is too large")]
    BlobTooLarge(usize),
}

/// How requests reach the kernel hook.
pub trait ErpcTransport {
    fn send(&self, request: &Request) -> Result<(), ErpcError>;

    /// Sends a read-out request whose destination is `out`. The transport
    /// patches the destination address and length into the request.
    fn send_read_out(&self, request: &mut Request, out: &mut [u8]) -> Result<(), ErpcError>;
}

fn patch_destination(request: &mut Request, addr: u64, len: usize) {
    request[USER_BUF_OFFSET..USER_BUF_OFFSET + 8].copy_from_slice(&addr.to_ne_bytes());
    request[BUF_LEN_OFFSET..BUF_LEN_OFFSET + 4].copy_from_slice(&(len as u32).to_ne_bytes());
}

/// The live channel.
pub struct IoctlTransport {
    fd: OwnedFd,
}

impl IoctlTransport {
    pub fn open() -> Result<Self, ErpcError> {
        let fd = socket(AddressFamily::Inet, SockType::Datagram, SockFlag::SOCK_CLOEXEC, None)
            .map_err(|e| ErpcError::Io(e.into()))?;
        Ok(Self { fd })
    }

    fn ioctl(&self, request: &Request) -> Result<(), ErpcError> {
        // SAFETY: the request buffer outlives the call and is ERPC_REQUEST_LEN bytes.
        consumed(unsafe { erpc_ioctl(self.fd.as_raw_fd(), request) })
    }
}

nix::ioctl_write_ptr_bad!(erpc_ioctl, RPC_CMD, Request);

/// The hook consumes the request on entry, so the ioctl is expected to fail
/// with `ENOTTY`, or `EINVAL` on some socket families.
fn consumed(res: nix::Result<libc::c_int>) -> Result<(), ErpcError> {
    match res {
        Ok(_) | Err(Errno::ENOTTY) | Err(Errno::EINVAL) => Ok(()),
        Err(errno) => Err(ErpcError::Ioctl(errno)),
    }
}

impl ErpcTransport for IoctlTransport {
    fn send(&self, request: &Request) -> Result<(), ErpcError> {
        self.ioctl(request)
    }

    fn send_read_out(&self, request: &mut Request, out: &mut [u8]) -> Result<(), ErpcError> {
        patch_destination(request, out.as_mut_ptr() as u64, out.len());
        self.ioctl(request)
    }
}

/// Runs requests against a [`SimKernel`] as the current task.
pub struct SimTransport<'a> {
    kernel: &'a SimKernel,
}

impl<'a> SimTransport<'a> {
    pub fn new(kernel: &'a SimKernel) -> Self {
        Self { kernel }
    }

    fn dispatch(&self, request: &Request) {
        let k = self.kernel;
        let addr = k.alloc_user(ERPC_REQUEST_LEN as u64);
        k.write_user_bytes(addr, request);
        let next = handle_erpc_request(k, RPC_CMD, addr);
        k.run(next);
    }
}

impl ErpcTransport for SimTransport<'_> {
    fn send(&self, request: &Request) -> Result<(), ErpcError> {
        self.dispatch(request);
        Ok(())
    }

    fn send_read_out(&self, request: &mut Request, out: &mut [u8]) -> Result<(), ErpcError> {
        let k = self.kernel;
        let addr = k.alloc_user(out.len() as u64);
        k.write_user_bytes(addr, out);
        patch_destination(request, addr, out.len());
        self.dispatch(request);
        out.copy_from_slice(&k.read_user_bytes(addr, out.len()));
        Ok(())
    }
}

/// Typed requests over an [`ErpcTransport`].
///
/// Read-outs carry a fresh challenge so a chunk left over from an earlier
/// request is never mistaken for the answer. Discarder requests are only
/// honoured by the kernel when the calling thread group is the agent.
///
/// # Example
///
/// ```ignore
/// let client = ErpcClient::new(IoctlTransport::open()?);
///
/// // Turn a path key from an event into a full path
/// let path = client.resolve_path(key)?;
///
/// // Mute opens from a noisy process for ten seconds
/// client.discard_pid(EventType::Open, 4242, 10_000_000_000)?;
/// ```
pub struct ErpcClient<T> {
    transport: T,
    challenge: AtomicU32,
}

impl<T: ErpcTransport> ErpcClient<T> {
    /// Wraps `transport`. The challenge sequence starts from the clock so
    /// two agents in a row do not reuse values.
    pub fn new(transport: T) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(1);
        Self {
            transport,
            challenge: AtomicU32::new(seed),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn next_challenge(&self) -> u32 {
        self.challenge.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn request<P: Plain>(op: ErpcOp, payload: &P) -> Request {
        let mut request = [0u8; ERPC_REQUEST_LEN];
        request[0] = op as u8;
        let bytes = bytes_of(payload);
        request[ERPC_PAYLOAD_OFFSET..ERPC_PAYLOAD_OFFSET + bytes.len()].copy_from_slice(bytes);
        request
    }

    fn send<P: Plain>(&self, op: ErpcOp, payload: &P) -> Result<(), ErpcError> {
        trace!(?op, "eRPC request");
        self.transport.send(&Self::request(op, payload))
    }

    /// Reads the full path of `key` out of the kernel segment cache.
    ///
    /// # Arguments
    /// * `key` - Leaf segment, as carried by a `File` in an event
    ///
    /// # Returns
    /// The path joined leaf to root into `/a/b/c` form. A key the kernel no
    /// longer caches gives [`ErpcError::CacheMiss`]; a read-out that belongs
    /// to another request gives [`ErpcError::ChallengeMismatch`].
    pub fn resolve_path(&self, key: PathKey) -> Result<String, ErpcError> {
        let challenge = self.next_challenge();
        let mut request = Self::request(
            ErpcOp::ResolvePath,
            &ResolvePathRequest {
                key,
                challenge,
                ..Default::default()
            },
        );
        let mut out = vec![0u8; READ_OUT_LEN];
        self.transport.send_read_out(&mut request, &mut out)?;

        let mut segments = Vec::new();
        for chunk in decode_chunks(&out) {
            if chunk.challenge != challenge {
                return Err(ErpcError::ChallengeMismatch {
                    expected: challenge,
                    got: chunk.challenge,
                });
            }
            if segments.is_empty() && chunk.key != key {
                return Err(ErpcError::KeyMismatch {
                    expected: key,
                    got: chunk.key,
                });
            }
            segments.push(chunk.name);
        }
        if segments.is_empty() {
            return Err(ErpcError::CacheMiss(key));
        }
        Ok(join_segments(segments))
    }

    /// Key of the parent segment of `key`.
    pub fn resolve_parent(&self, key: PathKey) -> Result<PathKey, ErpcError> {
        let challenge = self.next_challenge();
        let mut request = Self::request(
            ErpcOp::ResolveParentDentry,
            &ResolvePathRequest {
                key,
                challenge,
                ..Default::default()
            },
        );
        let mut out = [0u8; CHUNK_HEADER_LEN];
        self.transport.send_read_out(&mut request, &mut out)?;

        let got = u32::from_ne_bytes([out[16], out[17], out[18], out[19]]);
        if got == 0 && out[..16].iter().all(|&b| b == 0) {
            return Err(ErpcError::CacheMiss(key));
        }
        if got != challenge {
            return Err(ErpcError::ChallengeMismatch { expected: challenge, got });
        }
        secwatch_common::kernel::read_plain(&out).ok_or(ErpcError::CacheMiss(key))
    }

    /// Stops reporting `event_type` for the inode, and for everything under
    /// it unless `is_leaf`.
    ///
    /// # Arguments
    /// * `mount_id`, `ino` - The inode, as seen in a path key
    /// * `timeout` - Lifetime in nanoseconds; 0 keeps it until the next
    ///   revision bump
    pub fn discard_inode(
        &self,
        event_type: EventType,
        mount_id: u32,
        ino: u64,
        is_leaf: bool,
        timeout: u64,
    ) -> Result<(), ErpcError> {
        self.send(
            ErpcOp::DiscardInode,
            &DiscardInodeRequest {
                event_type: event_type as u32,
                is_leaf: is_leaf as u32,
                timeout,
                ino,
                mount_id,
                _pad: 0,
            },
        )
    }

    /// Stops reporting `event_type` for the thread group `pid`.
    ///
    /// # Arguments
    /// * `pid` - Thread group id
    /// * `timeout` - Lifetime in nanoseconds; 0 keeps it until it is expired
    pub fn discard_pid(&self, event_type: EventType, pid: u32, timeout: u64) -> Result<(), ErpcError> {
        self.send(
            ErpcOp::DiscardPid,
            &DiscardPidRequest {
                event_type: event_type as u32,
                pid,
                timeout,
            },
        )
    }

    /// Drops every discarder on the inode.
    pub fn expire_inode_discarder(&self, mount_id: u32, ino: u64) -> Result<(), ErpcError> {
        self.send(
            ErpcOp::ExpireInodeDiscarder,
            &ExpireInodeRequest {
                ino,
                mount_id,
                _pad: 0,
            },
        )
    }

    /// Drops every discarder on the thread group.
    pub fn expire_pid_discarder(&self, pid: u32) -> Result<(), ErpcError> {
        self.send(ErpcOp::ExpirePidDiscarder, &ExpirePidRequest { pid, _pad: 0 })
    }

    /// Invalidates every discarder at once.
    pub fn bump_discarders_revision(&self) -> Result<(), ErpcError> {
        self.send(ErpcOp::BumpDiscardersRevision, &0u64)
    }

    /// Points the kernel at the thread-local span slots of the current
    /// process.
    pub fn register_span_tls(&self, format: u64, max_threads: u64, base: u64) -> Result<(), ErpcError> {
        self.send(
            ErpcOp::RegisterSpanTls,
            &RegisterSpanTlsRequest {
                format,
                max_threads,
                base,
            },
        )
    }

    /// Attaches an opaque blob, at most `USER_SESSION_BLOB_LEN` bytes, to
    /// `session_id`.
    pub fn user_session_context(&self, session_id: u64, blob: &[u8]) -> Result<(), ErpcError> {
        if blob.len() > USER_SESSION_BLOB_LEN {
            return Err(ErpcError::BlobTooLarge(blob.len()));
        }
        let mut request = UserSessionRequest {
            session_id,
            blob: [0; USER_SESSION_BLOB_LEN],
        };
        request.blob[..blob.len()].copy_from_slice(blob);
        self.send(ErpcOp::UserSessionContext, &request)
    }

    /// Asks the kernel to sample ring buffer usage into the telemetry map.
    pub fn request_ringbuf_usage(&self) -> Result<(), ErpcError> {
        self.send(ErpcOp::GetRingbufUsage, &0u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secwatch_common::consts::RuntimeConst;
    use secwatch_common::kernel::{Kernel, Map};

    const AGENT: u32 = 4242;

    fn kernel() -> SimKernel {
        let k = SimKernel::new();
        k.set_constant(RuntimeConst::RuntimePid, AGENT as u64);
        k.set_current(AGENT, AGENT);
        k
    }

    #[test]
    fn only_consumed_ioctls_count_as_sent() {
        assert!(consumed(Ok(0)).is_ok());
        assert!(consumed(Err(Errno::ENOTTY)).is_ok());
        assert!(consumed(Err(Errno::EINVAL)).is_ok());
        assert!(matches!(
            consumed(Err(Errno::EPERM)),
            Err(ErpcError::Ioctl(Errno::EPERM))
        ));
    }

    #[test]
    fn resolves_a_cached_path() {
        let k = kernel();
        let root = k.root_dentry(2);
        let etc = k.add_dentry(root, "etc", 10);
        let passwd = k.add_dentry(etc, "passwd", 11);
        let key = k.resolve_dentry(passwd, 1);

        let client = ErpcClient::new(SimTransport::new(&k));
        assert_eq!(client.resolve_path(key).unwrap(), "/etc/passwd");

        let parent = client.resolve_parent(key).unwrap();
        assert_eq!(parent.ino, 10);
        assert_eq!(client.resolve_path(parent).unwrap(), "/etc");
    }

    #[test]
    fn unknown_key_is_a_cache_miss() {
        let k = kernel();
        let client = ErpcClient::new(SimTransport::new(&k));
        let key = PathKey::new(999, 1, 0);
        assert!(matches!(client.resolve_path(key), Err(ErpcError::CacheMiss(_))));
        assert_eq!(k.resolver_stats_total().erpc_cache_miss, 1);
    }

    /// Replays a read-out stamped with a fixed challenge.
    struct Replay(Vec<u8>);

    impl ErpcTransport for Replay {
        fn send(&self, _: &Request) -> Result<(), ErpcError> {
            Ok(())
        }

        fn send_read_out(&self, _: &mut Request, out: &mut [u8]) -> Result<(), ErpcError> {
            out[..self.0.len()].copy_from_slice(&self.0);
            Ok(())
        }
    }

    #[test]
    fn stale_read_out_is_rejected() {
        let key = PathKey::new(11, 1, 0);
        let mut chunk = bytes_of(&key).to_vec();
        chunk.extend_from_slice(&0x0bad_0bad_u32.to_ne_bytes());
        chunk.extend_from_slice(b"passwd\0");

        let client = ErpcClient::new(Replay(chunk));
        client.challenge.store(7, Ordering::Relaxed);
        match client.resolve_path(key) {
            Err(ErpcError::ChallengeMismatch { expected, got }) => {
                assert_eq!(expected, 8);
                assert_eq!(got, 0x0bad_0bad);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn discarders_only_change_on_agent_requests() {
        let k = kernel();
        let client = ErpcClient::new(SimTransport::new(&k));

        k.set_current(77, 77);
        client.discard_pid(EventType::Open, 1234, 0).unwrap();
        assert!(!k.pid_discarders().contains(&1234));
        assert_eq!(k.resolver_stats_total().erpc_denied, 1);

        k.set_current(AGENT, AGENT);
        client.discard_pid(EventType::Open, 1234, 0).unwrap();
        assert!(k.pid_discarders().contains(&1234));

        client.expire_pid_discarder(1234).unwrap();
        client.bump_discarders_revision().unwrap();
        assert_eq!(k.discarders_revision().lookup(&0), Some(1));
    }

    #[test]
    fn ringbuf_usage_is_sampled() {
        let k = kernel();
        k.set_ringbuf_usage(4096);
        ErpcClient::new(SimTransport::new(&k)).request_ringbuf_usage().unwrap();
        assert_eq!(k.telemetry().lookup(&0).map(|t| t.ringbuf_usage), Some(4096));
    }

    #[test]
    fn oversized_session_blob_is_refused() {
        let k = kernel();
        let client = ErpcClient::new(SimTransport::new(&k));
        let blob = vec![1u8; USER_SESSION_BLOB_LEN + 1];
        assert!(matches!(
            client.user_session_context(1, &blob),
            Err(ErpcError::BlobTooLarge(_))
        ));
    }
}
