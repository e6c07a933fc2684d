//! Dentry resolver.
//!
//! Walks a dentry chain towards the filesystem root and records every
//! segment in the path cache. One program invocation handles at most
//! `DR_MAX_ITERATION_DEPTH` segments, then tail-calls itself with the walk
//! position saved in the syscall cache entry:
//!
//! ```text
//!   leaf ─► parent ─► ... ─► root ('/')         one chunk = 47 segments
//!   └────────── chunk 0 ──────────┘└── chunk 1 ──┘ ...  at most 29 chunks
//! ```
//!
//! When a chunk stops on the cap it leaves an empty sentinel at the next key,
//! so a read-out of a truncated walk terminates. The next chunk overwrites it.

use crate::activity_dump;
use crate::consts::{event_flags, DR_DISCARDER_DEPTH, DR_MAX_ITERATION_DEPTH, DR_MAX_TAIL_CALL, SEGMENT_BUFFER_LEN};
use crate::discarders;
use crate::event::EventType;
use crate::kernel::{Kernel, Next, Prog};
use crate::kobj;
use crate::path::{insert_segment, PathKey, PathLeaf};
use crate::stats;
use crate::syscall_cache::{peek_syscall, update_syscall};

/// What the callback program does once a walk ends.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DentryCallback {
    /// Leave the syscall entry for a later hook.
    None = 0,
    EmitSyscall = 1,
    ParseArgsEnvs = 2,
}

impl DentryCallback {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => DentryCallback::EmitSyscall,
            2 => DentryCallback::ParseArgsEnvs,
            _ => DentryCallback::None,
        }
    }
}

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverError {
    Invalid = -1,
    Discarded = -2,
    Error = -3,
    TailCallExhausted = -4,
}

/// Walk state carried across tail calls in the syscall cache entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolverInput {
    pub key: PathKey,
    pub dentry: u64,
    /// Event type whose inode discarders are checked, 0 for none.
    pub discarder_event_type: u32,
    pub callback: u32,
    pub iteration: u32,
    pub ret: i32,
    /// Header flags to add to the emitted event.
    pub flags: u32,
    /// Which file of a multi-file event is being walked.
    pub pass: u32,
}

impl ResolverInput {
    pub fn new(key: PathKey, dentry: u64, discarder_event_type: EventType, callback: DentryCallback) -> Self {
        Self {
            key,
            dentry,
            discarder_event_type: discarder_event_type as u32,
            callback: callback as u32,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> Option<ResolverError> {
        match self.ret {
            -1 => Some(ResolverError::Invalid),
            -2 => Some(ResolverError::Discarded),
            -3 => Some(ResolverError::Error),
            -4 => Some(ResolverError::TailCallExhausted),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Root reached.
    Done,
    /// Chunk cap hit; the input points at the next dentry.
    Continue,
    Failed(ResolverError),
}

fn parent_key<K: Kernel>(k: &K, dentry: u64, parent: u64, key: &PathKey) -> PathKey {
    if parent == 0 || parent == dentry {
        return PathKey::ZERO;
    }
    let (ino, _) = kobj::effective_ino(k, kobj::dentry_inode(k, parent));
    PathKey::new(ino, key.mount_id, key.path_id)
}

fn is_discarded_at_depth<K: Kernel>(k: &K, input: &ResolverInput, key: &PathKey, depth: u32) -> bool {
    let Some(t) = EventType::from_u32(input.discarder_event_type) else {
        return false;
    };
    if t == EventType::Any || input.iteration != 0 || depth >= DR_DISCARDER_DEPTH {
        return false;
    }
    discarders::is_discarded_by_inode(k, t, key.mount_id, key.ino, depth == 0)
}

/// Resolves one chunk of the walk described by `input`.
pub fn resolve_chunk<K: Kernel>(k: &K, input: &mut ResolverInput) -> Step {
    let mut dentry = input.dentry;
    let mut key = input.key;
    let mut name = [0u8; SEGMENT_BUFFER_LEN];

    for depth in 0..DR_MAX_ITERATION_DEPTH {
        let parent = kobj::dentry_parent(k, dentry);
        let next_key = parent_key(k, dentry, parent, &key);

        if is_discarded_at_depth(k, input, &key, depth) {
            if !activity_dump::is_current_traced(k) {
                return Step::Failed(ResolverError::Discarded);
            }
            input.flags |= event_flags::SAVED_BY_AD as u32;
        }

        if key.ino == 0 {
            return Step::Failed(ResolverError::Invalid);
        }

        let len = kobj::dentry_name(k, dentry, &mut name);
        let leaf = PathLeaf::new(next_key, &name[..len]);
        if insert_segment(k, &key, &leaf).is_err() {
            return Step::Failed(ResolverError::Error);
        }

        if len == 0 || name[0] == b'/' || next_key.is_zero() {
            return Step::Done;
        }
        dentry = parent;
        key = next_key;
    }

    if insert_segment(k, &key, &PathLeaf::sentinel()).is_err() {
        return Step::Failed(ResolverError::Error);
    }
    input.dentry = dentry;
    input.key = key;
    input.iteration += 1;
    Step::Continue
}

fn count_failure<K: Kernel>(k: &K, err: ResolverError) {
    stats::resolver(k, |s| match err {
        ResolverError::Invalid => s.invalid += 1,
        ResolverError::Discarded => s.discarded += 1,
        ResolverError::Error => s.error += 1,
        ResolverError::TailCallExhausted => s.tail_call_exhausted += 1,
    });
}

/// Saves `input` in the current syscall entry and starts the walk.
pub fn start_resolver<K: Kernel>(k: &K, input: ResolverInput) -> Next {
    match update_syscall(k, EventType::Any, |entry| entry.resolver = input) {
        Some(()) => Next::TailCall(Prog::DentryResolver),
        None => Next::Done,
    }
}

/// Body of the `DentryResolver` tail-call target.
pub fn dentry_resolver_program<K: Kernel>(k: &K) -> Next {
    let Some(entry) = peek_syscall(k, EventType::Any) else {
        return Next::Done;
    };
    let mut input = entry.resolver;
    let next = match resolve_chunk(k, &mut input) {
        Step::Done => {
            input.ret = 0;
            Next::TailCall(Prog::DentryCallback)
        }
        Step::Continue if input.iteration < DR_MAX_TAIL_CALL => Next::TailCall(Prog::DentryResolver),
        Step::Continue => {
            input.ret = ResolverError::TailCallExhausted as i32;
            count_failure(k, ResolverError::TailCallExhausted);
            Next::TailCall(Prog::DentryCallback)
        }
        Step::Failed(err) => {
            input.ret = err as i32;
            count_failure(k, err);
            if err == ResolverError::Discarded {
                stats::filter(k, entry.event_type, |s| s.inode_discarded += 1);
            }
            Next::TailCall(Prog::DentryCallback)
        }
    };
    let _ = update_syscall(k, EventType::Any, |entry| {
        entry.resolver = input;
        if input.ret == ResolverError::Discarded as i32 {
            entry.discarded = true;
        }
    });
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erpc::read_path;
    use crate::path::lookup_segment;
    use crate::sim::SimKernel;

    fn walk(k: &SimKernel, dentry: u64, mount_id: u32) -> (Step, u32) {
        let key = kobj::dentry_key(k, dentry, mount_id);
        let mut input = ResolverInput::new(key, dentry, EventType::Any, DentryCallback::None);
        loop {
            match resolve_chunk(k, &mut input) {
                Step::Continue if input.iteration < DR_MAX_TAIL_CALL => continue,
                step => return (step, input.iteration),
            }
        }
    }

    #[test]
    fn short_path_resolves_in_one_chunk() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let etc = k.add_dentry(root, "etc", 10);
        let passwd = k.add_dentry(etc, "passwd", 11);

        assert_eq!(walk(&k, passwd, 1), (Step::Done, 0));
        let leaf = lookup_segment(&k, &PathKey::new(11, 1, 0)).unwrap();
        assert_eq!(leaf.name_bytes(), b"passwd");
        assert_eq!(leaf.parent, PathKey::new(10, 1, 0));
        assert!(lookup_segment(&k, &PathKey::new(2, 1, 0)).unwrap().is_root());
        assert_eq!(read_path(&k, PathKey::new(11, 1, 0)).as_deref(), Some("/etc/passwd"));
    }

    #[test]
    fn deep_path_chains_chunks_and_round_trips() {
        let k = SimKernel::new();
        let mut dentry = k.root_dentry(2);
        let mut expected = String::new();
        // 1362 components plus the root fill every chunk exactly
        for i in 0..1362u64 {
            let name = format!("d{}", i);
            expected.push('/');
            expected.push_str(&name);
            dentry = k.add_dentry(dentry, &name, 100 + i);
        }
        let (step, iteration) = walk(&k, dentry, 3);
        assert_eq!(step, Step::Done);
        assert_eq!(iteration, DR_MAX_TAIL_CALL - 1);
        let leaf_key = PathKey::new(100 + 1361, 3, 0);
        assert_eq!(read_path(&k, leaf_key), Some(expected));
    }

    #[test]
    fn too_deep_path_exhausts_tail_calls() {
        let k = SimKernel::new();
        let mut dentry = k.root_dentry(2);
        for i in 0..1400u64 {
            dentry = k.add_dentry(dentry, "x", 100 + i);
        }
        let (step, iteration) = walk(&k, dentry, 3);
        assert_eq!(step, Step::Continue);
        assert_eq!(iteration, DR_MAX_TAIL_CALL);
    }

    #[test]
    fn zero_inode_is_invalid() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let negative = k.add_dentry(root, "ghost", 0);
        assert_eq!(walk(&k, negative, 1).0, Step::Failed(ResolverError::Invalid));
    }

    #[test]
    fn parent_discarder_stops_the_walk() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let tmp = k.add_dentry(root, "tmp", 10);
        let file = k.add_dentry(tmp, "a", 11);
        discarders::discard_inode(&k, EventType::Open, 1, 10, false, 0);

        let key = kobj::dentry_key(&k, file, 1);
        let mut input = ResolverInput::new(key, file, EventType::Open, DentryCallback::None);
        assert_eq!(resolve_chunk(&k, &mut input), Step::Failed(ResolverError::Discarded));

        let mut input = ResolverInput::new(key, file, EventType::Mkdir, DentryCallback::None);
        assert_eq!(resolve_chunk(&k, &mut input), Step::Done);
    }
}
