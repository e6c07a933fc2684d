//! eRPC: the command channel driven by the agent.
//!
//! The agent issues `ioctl(fd, RPC_CMD, buf)`. The ioctl hook reads the
//! request from `buf`: an opcode byte, seven bytes of padding and a
//! per-opcode payload. Nothing is returned through the syscall; results are
//! written into agent memory or sampled into maps.
//!
//! Path read-out stream, one chunk per segment, leaf first:
//!
//! ```text
//!   ┌──────────────┬───────────┬────────────────────┐
//!   │ PathKey (16) │ challenge │ name ... NUL        │  ... next chunk
//!   └──────────────┴───────────┴────────────────────┘
//! ```
//!
//! The stream ends after the root segment (name `/`), after an empty
//! sentinel segment for a truncated walk, or at the first zero key.

use crate::consts::{
    RuntimeConst, DR_ERPC_KEY_CHUNK, DR_MAX_TAIL_CALL, ERPC_MMAP_BUFFER_LEN, ERPC_REQUEST_LEN,
};
use crate::discarders;
use crate::event::EventType;
use crate::kernel::{bytes_of, plain, read_plain, Kernel, Map, Next, Prog, UpdateFlag};
use crate::path::{lookup_segment, PathKey};
use crate::process::{UserSession, USER_SESSION_BLOB_LEN};
use crate::span::SpanTls;
use crate::stats;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErpcOp {
    ResolvePath = 1,
    ResolveParentDentry = 2,
    RegisterSpanTls = 3,
    UserSessionContext = 4,
    DiscardInode = 5,
    DiscardPid = 6,
    ExpireInodeDiscarder = 7,
    ExpirePidDiscarder = 8,
    BumpDiscardersRevision = 9,
    GetRingbufUsage = 10,
}

impl ErpcOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => ErpcOp::ResolvePath,
            2 => ErpcOp::ResolveParentDentry,
            3 => ErpcOp::RegisterSpanTls,
            4 => ErpcOp::UserSessionContext,
            5 => ErpcOp::DiscardInode,
            6 => ErpcOp::DiscardPid,
            7 => ErpcOp::ExpireInodeDiscarder,
            8 => ErpcOp::ExpirePidDiscarder,
            9 => ErpcOp::BumpDiscardersRevision,
            10 => ErpcOp::GetRingbufUsage,
            _ => return None,
        })
    }

    pub fn mutates_discarders(self) -> bool {
        matches!(
            self,
            ErpcOp::DiscardInode
                | ErpcOp::DiscardPid
                | ErpcOp::ExpireInodeDiscarder
                | ErpcOp::ExpirePidDiscarder
                | ErpcOp::BumpDiscardersRevision
        )
    }
}

/// Offset of the payload in a request buffer.
pub const ERPC_PAYLOAD_OFFSET: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolvePathRequest {
    pub key: PathKey,
    pub user_buf: u64,
    pub buf_len: u32,
    pub challenge: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSpanTlsRequest {
    pub format: u64,
    pub max_threads: u64,
    pub base: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserSessionRequest {
    pub session_id: u64,
    pub blob: [u8; USER_SESSION_BLOB_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscardInodeRequest {
    pub event_type: u32,
    pub is_leaf: u32,
    pub timeout: u64,
    pub ino: u64,
    pub mount_id: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscardPidRequest {
    pub event_type: u32,
    pub pid: u32,
    pub timeout: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpireInodeRequest {
    pub ino: u64,
    pub mount_id: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpirePidRequest {
    pub pid: u32,
    pub _pad: u32,
}

/// Read-out progress, carried across tail calls in a per-CPU slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErpcResolveState {
    pub key: PathKey,
    pub user_buf: u64,
    pub buf_len: u32,
    pub challenge: u32,
    pub cursor: u32,
    pub iteration: u32,
}

/// Shared read-out area used instead of user writes when mmap mode is on.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ErpcBuffer {
    pub data: [u8; ERPC_MMAP_BUFFER_LEN],
}

plain!(
    ResolvePathRequest,
    RegisterSpanTlsRequest,
    UserSessionRequest,
    DiscardInodeRequest,
    DiscardPidRequest,
    ExpireInodeRequest,
    ExpirePidRequest,
    ErpcResolveState,
    ErpcBuffer,
);

/// Size of the key and challenge prefix of every chunk.
pub const CHUNK_HEADER_LEN: usize = 20;

/// Entry point from the ioctl hook.
pub fn handle_erpc_request<K: Kernel>(k: &K, cmd: u64, arg: u64) -> Next {
    if cmd != crate::consts::RPC_CMD {
        return Next::Done;
    }
    let mut request = [0u8; ERPC_REQUEST_LEN];
    if !k.read_user(arg, &mut request) {
        stats::resolver(k, |s| s.erpc_read_fault += 1);
        return Next::Done;
    }
    let Some(op) = ErpcOp::from_u8(request[0]) else {
        return Next::Done;
    };
    if op.mutates_discarders() && !k.is_agent() {
        stats::resolver(k, |s| s.erpc_denied += 1);
        return Next::Done;
    }
    let payload = &request[ERPC_PAYLOAD_OFFSET..];

    match op {
        ErpcOp::ResolvePath => read_payload(k, payload).map_or(Next::Done, |req| start_resolve_path(k, &req)),
        ErpcOp::ResolveParentDentry => {
            if let Some(req) = read_payload(k, payload) {
                resolve_parent(k, &req);
            }
            Next::Done
        }
        ErpcOp::RegisterSpanTls => {
            if let Some(req) = read_payload::<_, RegisterSpanTlsRequest>(k, payload) {
                let tls = SpanTls {
                    format: req.format,
                    max_threads: req.max_threads,
                    base: req.base,
                };
                let _ = crate::span::register_span_tls(k, k.tgid(), &tls);
            }
            Next::Done
        }
        ErpcOp::UserSessionContext => {
            if let Some(req) = read_payload::<_, UserSessionRequest>(k, payload) {
                let session = UserSession { blob: req.blob };
                let _ = crate::process::commit_user_session(k, k.tgid(), req.session_id, &session);
            }
            Next::Done
        }
        ErpcOp::DiscardInode => {
            if let Some(req) = read_payload::<_, DiscardInodeRequest>(k, payload) {
                if let Some(t) = EventType::from_u32(req.event_type) {
                    discarders::discard_inode(k, t, req.mount_id, req.ino, req.is_leaf != 0, req.timeout);
                }
            }
            Next::Done
        }
        ErpcOp::DiscardPid => {
            if let Some(req) = read_payload::<_, DiscardPidRequest>(k, payload) {
                if let Some(t) = EventType::from_u32(req.event_type) {
                    discarders::discard_pid(k, t, req.pid, req.timeout);
                }
            }
            Next::Done
        }
        ErpcOp::ExpireInodeDiscarder => {
            if let Some(req) = read_payload::<_, ExpireInodeRequest>(k, payload) {
                discarders::expire_inode_discarders(k, req.mount_id, req.ino);
            }
            Next::Done
        }
        ErpcOp::ExpirePidDiscarder => {
            if let Some(req) = read_payload::<_, ExpirePidRequest>(k, payload) {
                discarders::expire_pid_discarder(k, req.pid);
            }
            Next::Done
        }
        ErpcOp::BumpDiscardersRevision => {
            discarders::bump_discarders_revision(k);
            Next::Done
        }
        ErpcOp::GetRingbufUsage => {
            let usage = k.ringbuf_usage();
            let now = k.now_ns();
            let _ = k.telemetry().with_mut(&0, |t| {
                t.ringbuf_usage = usage;
                t.sampled_at = now;
            });
            Next::Done
        }
    }
}

fn read_payload<K: Kernel, T: crate::kernel::Plain>(k: &K, payload: &[u8]) -> Option<T> {
    let value = read_plain::<T>(payload);
    if value.is_none() {
        stats::resolver(k, |s| s.erpc_read_fault += 1);
    }
    value
}

fn use_mmap<K: Kernel>(k: &K) -> bool {
    k.constant(RuntimeConst::ErpcUseMmap) != 0
}

/// Writes `data` at `cursor` of the read-out destination.
fn write_out<K: Kernel>(k: &K, state: &ErpcResolveState, cursor: u32, data: &[u8]) -> bool {
    if use_mmap(k) {
        let start = cursor as usize;
        let end = start + data.len();
        if end > ERPC_MMAP_BUFFER_LEN {
            return false;
        }
        k.erpc_mmap()
            .with_mut(&0, |buf| buf.data[start..end].copy_from_slice(data))
            .is_some()
    } else {
        k.write_user(state.user_buf.wrapping_add(cursor as u64), data)
    }
}

fn start_resolve_path<K: Kernel>(k: &K, req: &ResolvePathRequest) -> Next {
    let state = ErpcResolveState {
        key: req.key,
        user_buf: req.user_buf,
        buf_len: req.buf_len,
        challenge: req.challenge,
        cursor: 0,
        iteration: 0,
    };
    if k.erpc_state().store(&0, &state, UpdateFlag::Any).is_err() {
        return Next::Done;
    }
    Next::TailCall(Prog::ErpcResolvePath)
}

fn resolve_parent<K: Kernel>(k: &K, req: &ResolvePathRequest) {
    let state = ErpcResolveState {
        key: req.key,
        user_buf: req.user_buf,
        buf_len: req.buf_len,
        challenge: req.challenge,
        ..ErpcResolveState::default()
    };
    let Some(leaf) = lookup_segment(k, &req.key) else {
        stats::resolver(k, |s| s.erpc_cache_miss += 1);
        return;
    };
    if (state.buf_len as usize) < CHUNK_HEADER_LEN {
        stats::resolver(k, |s| s.erpc_size_exceeded += 1);
        return;
    }
    let mut chunk = [0u8; CHUNK_HEADER_LEN];
    chunk[..16].copy_from_slice(bytes_of(&leaf.parent));
    chunk[16..].copy_from_slice(&req.challenge.to_ne_bytes());
    if !write_out(k, &state, 0, &chunk) {
        stats::resolver(k, |s| s.erpc_write_fault += 1);
    }
}

/// Body of the `ErpcResolvePath` tail-call target.
pub fn erpc_resolve_path_program<K: Kernel>(k: &K) -> Next {
    let Some(mut state) = k.erpc_state().lookup(&0) else {
        return Next::Done;
    };

    let mut finished = false;
    for _ in 0..DR_ERPC_KEY_CHUNK {
        let Some(leaf) = lookup_segment(k, &state.key) else {
            stats::resolver(k, |s| s.erpc_cache_miss += 1);
            finished = true;
            break;
        };
        let name = leaf.name_bytes();
        let chunk_len = CHUNK_HEADER_LEN + name.len() + 1;
        if state.cursor as usize + chunk_len > state.buf_len as usize {
            stats::resolver(k, |s| s.erpc_size_exceeded += 1);
            finished = true;
            break;
        }

        let mut header = [0u8; CHUNK_HEADER_LEN];
        header[..16].copy_from_slice(bytes_of(&state.key));
        header[16..].copy_from_slice(&state.challenge.to_ne_bytes());
        let cursor = state.cursor;
        if !write_out(k, &state, cursor, &header)
            || !write_out(k, &state, cursor + CHUNK_HEADER_LEN as u32, &leaf.name[..name.len() + 1])
        {
            stats::resolver(k, |s| s.erpc_write_fault += 1);
            finished = true;
            break;
        }
        state.cursor += chunk_len as u32;

        if leaf.is_root() {
            finished = true;
            break;
        }
        state.key = leaf.parent;
    }

    if finished {
        return Next::Done;
    }
    state.iteration += 1;
    if state.iteration >= DR_MAX_TAIL_CALL {
        stats::resolver(k, |s| s.erpc_tail_call_exhausted += 1);
        return Next::Done;
    }
    let _ = k.erpc_state().store(&0, &state, UpdateFlag::Any);
    Next::TailCall(Prog::ErpcResolvePath)
}

/// One decoded read-out chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub key: PathKey,
    pub challenge: u32,
    pub name: &'a [u8],
}

/// Splits a read-out buffer into chunks. Stops at the first zero key.
pub fn decode_chunks(buf: &[u8]) -> impl Iterator<Item = Chunk<'_>> {
    let mut rest = buf;
    core::iter::from_fn(move || {
        let key: PathKey = read_plain(rest)?;
        if key.is_zero() {
            return None;
        }
        let challenge = u32::from_ne_bytes(rest.get(16..20)?.try_into().ok()?);
        let tail = rest.get(CHUNK_HEADER_LEN..)?;
        let nul = tail.iter().position(|&b| b == 0)?;
        let name = &tail[..nul];
        rest = &tail[nul + 1..];
        Some(Chunk { key, challenge, name })
    })
}

/// Reassembles a path from leaf-first segments.
#[cfg(any(feature = "std", test))]
pub fn join_segments<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut parts: Vec<&[u8]> = segments
        .into_iter()
        .filter(|s| !s.is_empty() && *s != b"/")
        .collect();
    parts.reverse();
    let mut path = String::new();
    for part in parts {
        path.push('/');
        path.push_str(&String::from_utf8_lossy(part));
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Reads a path straight from the segment store, as a read-out would.
#[cfg(any(feature = "std", test))]
pub fn read_path<K: Kernel>(k: &K, key: PathKey) -> Option<String> {
    let mut names = Vec::new();
    let mut key = key;
    for _ in 0..(crate::consts::DR_MAX_SEGMENTS + 1) {
        let leaf = lookup_segment(k, &key)?;
        if leaf.is_root() {
            if leaf.len == 0 {
                // truncated walk
                return None;
            }
            names.push(leaf.name_bytes().to_vec());
            return Some(join_segments(names.iter().map(|n| n.as_slice())));
        }
        names.push(leaf.name_bytes().to_vec());
        key = leaf.parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Map;
    use crate::sim::SimKernel;

    const AGENT: u32 = 4242;

    fn resolve_request(key: PathKey, buf: u64, len: u32, challenge: u32) -> [u8; ERPC_REQUEST_LEN] {
        let mut request = [0u8; ERPC_REQUEST_LEN];
        request[0] = ErpcOp::ResolvePath as u8;
        let req = ResolvePathRequest {
            key,
            user_buf: buf,
            buf_len: len,
            challenge,
        };
        request[ERPC_PAYLOAD_OFFSET..ERPC_PAYLOAD_OFFSET + 32].copy_from_slice(bytes_of(&req));
        request
    }

    #[test]
    fn path_read_out_writes_leaf_first_chunks() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let etc = k.add_dentry(root, "etc", 10);
        let file = k.add_dentry(etc, "hosts", 11);
        k.resolve_dentry(file, 1);

        let out = k.alloc_user(256);
        let req = k.alloc_user(ERPC_REQUEST_LEN as u64);
        k.write_user_bytes(req, &resolve_request(PathKey::new(11, 1, 0), out, 256, 77));
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));

        let buf = k.read_user_bytes(out, 256);
        let chunks: Vec<_> = decode_chunks(&buf).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.challenge == 77));
        assert_eq!(chunks[0].name, b"hosts");
        assert_eq!(chunks[2].name, b"/");
        assert_eq!(join_segments(chunks.iter().map(|c| c.name)), "/etc/hosts");
    }

    #[test]
    fn small_buffer_counts_size_exceeded() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let file = k.add_dentry(root, "f", 11);
        k.resolve_dentry(file, 1);

        let out = k.alloc_user(24);
        let req = k.alloc_user(ERPC_REQUEST_LEN as u64);
        k.write_user_bytes(req, &resolve_request(PathKey::new(11, 1, 0), out, 24, 1));
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));
        assert_eq!(k.resolver_stats_total().erpc_size_exceeded, 1);
    }

    #[test]
    fn cache_miss_is_counted() {
        let k = SimKernel::new();
        let out = k.alloc_user(256);
        let req = k.alloc_user(ERPC_REQUEST_LEN as u64);
        k.write_user_bytes(req, &resolve_request(PathKey::new(99, 1, 0), out, 256, 1));
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));
        assert_eq!(k.resolver_stats_total().erpc_cache_miss, 1);
    }

    #[test]
    fn discarder_ops_require_the_agent() {
        let k = SimKernel::new();
        k.set_constant(RuntimeConst::RuntimePid, AGENT as u64);
        let mut request = [0u8; ERPC_REQUEST_LEN];
        request[0] = ErpcOp::DiscardPid as u8;
        let payload = DiscardPidRequest {
            event_type: EventType::Open as u32,
            pid: 77,
            timeout: 0,
        };
        request[8..24].copy_from_slice(bytes_of(&payload));
        let req = k.alloc_user(ERPC_REQUEST_LEN as u64);
        k.write_user_bytes(req, &request);

        k.set_current(1000, 1000);
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));
        assert!(!discarders::is_discarded_by_pid(&k, EventType::Open, 77));
        assert_eq!(k.resolver_stats_total().erpc_denied, 1);

        k.set_current(AGENT, AGENT);
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));
        assert!(discarders::is_discarded_by_pid(&k, EventType::Open, 77));
    }

    #[test]
    fn parent_read_out_writes_one_key() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let dir = k.add_dentry(root, "var", 10);
        let file = k.add_dentry(dir, "log", 11);
        k.resolve_dentry(file, 1);

        let out = k.alloc_user(64);
        let req = k.alloc_user(ERPC_REQUEST_LEN as u64);
        let mut request = resolve_request(PathKey::new(11, 1, 0), out, 64, 5);
        request[0] = ErpcOp::ResolveParentDentry as u8;
        k.write_user_bytes(req, &request);
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));

        let buf = k.read_user_bytes(out, 20);
        assert_eq!(read_plain::<PathKey>(&buf), Some(PathKey::new(10, 1, 0)));
    }

    #[test]
    fn ringbuf_usage_is_sampled_into_telemetry() {
        let k = SimKernel::new();
        let req = k.alloc_user(ERPC_REQUEST_LEN as u64);
        let mut request = [0u8; ERPC_REQUEST_LEN];
        request[0] = ErpcOp::GetRingbufUsage as u8;
        k.write_user_bytes(req, &request);
        k.set_ringbuf_usage(4096);
        k.run(handle_erpc_request(&k, crate::consts::RPC_CMD, req));
        assert_eq!(k.telemetry().lookup(&0).unwrap().ringbuf_usage, 4096);
    }
}
