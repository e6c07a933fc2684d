//! Exec argument and environment extraction.
//!
//! Arguments and environment variables are NUL-separated strings in the
//! `[arg_start, arg_end)` and `[env_start, env_end)` ranges of the new mm.
//! Each string becomes a `(u32 size, bytes)` record in an ARGS_ENVS stream
//! identified by a random id; a chunk is sent whenever the 256-byte value
//! buffer would overflow. The parser tail-calls itself, `ARGS_PER_TAIL_CALL`
//! strings per call and `MAX_ARGS_ENVS_TAIL_CALLS` calls per stream.

use crate::consts::{
    ARGS_ENVS_BUFFER_LEN, ARGS_PER_TAIL_CALL, MAX_ARGS_ELEMENTS, MAX_ARGS_ENVS_TAIL_CALLS,
    MAX_ARG_SIZE,
};
use crate::emit::send_event;
use crate::event::EventType;
use crate::kernel::{plain, Kernel, Map, Next, Prog, UpdateFlag};
use crate::kobj;

const PHASE_ARGS: u32 = 0;
const PHASE_ENVS: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArgsEnvsParser {
    pub cursor: u64,
    pub end: u64,
    pub envs_start: u64,
    pub envs_end: u64,
    pub args_id: u32,
    pub envs_id: u32,
    pub phase: u32,
    pub count: u32,
    pub tail_calls: u32,
    pub args_truncated: u32,
    pub envs_truncated: u32,
    pub _pad: u32,
}

plain!(ArgsEnvsParser);

impl ArgsEnvsParser {
    fn stream_id(&self) -> u32 {
        if self.phase == PHASE_ARGS {
            self.args_id
        } else {
            self.envs_id
        }
    }

    fn mark_truncated(&mut self) {
        if self.phase == PHASE_ARGS {
            self.args_truncated = 1;
        } else {
            self.envs_truncated = 1;
        }
    }

    fn truncated(&self) -> u32 {
        if self.phase == PHASE_ARGS {
            self.args_truncated
        } else {
            self.envs_truncated
        }
    }
}

/// Prepares the parser for the image just installed in `task`.
pub fn start_parser<K: Kernel>(k: &K, task: u64) -> bool {
    let (arg_start, arg_end, env_start, env_end) = kobj::task_args_envs_bounds(k, task);
    let parser = ArgsEnvsParser {
        cursor: arg_start,
        end: arg_end,
        envs_start: env_start,
        envs_end: env_end,
        args_id: k.random_u32() | 1,
        envs_id: k.random_u32() | 1,
        ..ArgsEnvsParser::default()
    };
    let _ = k.args_envs_event().with_mut(&0, |ev| ev.size = 0);
    k.args_envs_parser().store(&0, &parser, UpdateFlag::Any).is_ok()
}

fn flush<K: Kernel>(k: &K, parser: &ArgsEnvsParser) {
    let _ = k.args_envs_event().with_mut(&0, |ev| {
        if ev.size == 0 && parser.truncated() == 0 {
            return;
        }
        ev.id = parser.stream_id();
        ev.truncated = parser.truncated();
        send_event(k, EventType::ArgsEnvs, ev);
        ev.size = 0;
        ev.value = [0; ARGS_ENVS_BUFFER_LEN];
    });
}

/// Appends one record, flushing first when it would not fit.
fn append<K: Kernel>(k: &K, parser: &ArgsEnvsParser, value: &[u8]) {
    let record_len = 4 + value.len();
    let full = k
        .args_envs_event()
        .lookup(&0)
        .map(|ev| ev.size as usize + record_len > ARGS_ENVS_BUFFER_LEN)
        .unwrap_or(false);
    if full {
        flush(k, parser);
    }
    let _ = k.args_envs_event().with_mut(&0, |ev| {
        let at = ev.size as usize;
        if at + record_len > ARGS_ENVS_BUFFER_LEN {
            return;
        }
        ev.value[at..at + 4].copy_from_slice(&(value.len() as u32).to_ne_bytes());
        ev.value[at + 4..at + record_len].copy_from_slice(value);
        ev.size += record_len as u32;
    });
}

/// Body of the `ArgsEnvsParser` tail-call target.
pub fn args_envs_parser_program<K: Kernel>(k: &K) -> Next {
    let Some(mut parser) = k.args_envs_parser().lookup(&0) else {
        return Next::Done;
    };
    let mut buf = [0u8; MAX_ARG_SIZE];
    let mut phase_done = false;

    for _ in 0..ARGS_PER_TAIL_CALL {
        if parser.cursor >= parser.end {
            phase_done = true;
            break;
        }
        let remaining = (parser.end - parser.cursor).min(MAX_ARG_SIZE as u64) as usize;
        let Some(len) = k.read_user_str(parser.cursor, &mut buf[..remaining]) else {
            parser.mark_truncated();
            phase_done = true;
            break;
        };
        append(k, &parser, &buf[..len]);
        parser.count += 1;
        parser.cursor += len as u64 + 1;
        if len + 1 >= MAX_ARG_SIZE {
            // the string did not fit; the cursor no longer sits on a boundary
            parser.mark_truncated();
            phase_done = true;
            break;
        }
        if parser.count >= MAX_ARGS_ELEMENTS {
            parser.mark_truncated();
            phase_done = true;
            break;
        }
    }

    if !phase_done {
        parser.tail_calls += 1;
        if parser.tail_calls >= MAX_ARGS_ENVS_TAIL_CALLS {
            parser.mark_truncated();
            phase_done = true;
        }
    }

    if phase_done {
        flush(k, &parser);
        if parser.phase == PHASE_ENVS {
            crate::process::finish_exec(k, &parser);
            return Next::Done;
        }
        parser.phase = PHASE_ENVS;
        parser.cursor = parser.envs_start;
        parser.end = parser.envs_end;
        parser.count = 0;
        parser.tail_calls = 0;
    }
    if k.args_envs_parser().store(&0, &parser, UpdateFlag::Any).is_err() {
        return Next::Done;
    }
    Next::TailCall(Prog::ArgsEnvsParser)
}

/// Splits an ARGS_ENVS value into its strings.
pub fn decode_records(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = value;
    core::iter::from_fn(move || {
        let size = u32::from_ne_bytes(rest.get(..4)?.try_into().ok()?) as usize;
        let record = rest.get(4..4 + size)?;
        rest = &rest[4 + size..];
        Some(record)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_decode_in_order() {
        let mut value = Vec::new();
        for s in [&b"ls"[..], b"-la", b""] {
            value.extend_from_slice(&(s.len() as u32).to_ne_bytes());
            value.extend_from_slice(s);
        }
        let decoded: Vec<&[u8]> = decode_records(&value).collect();
        assert_eq!(decoded, vec![&b"ls"[..], b"-la", b""]);
    }
}
