// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire-format message types for the host<->jail and jail<->subjail channels.
//!
//! Every message is a tagged, fixed-upper-bound (10 KiB) record. Fixed-size inline
//! byte arrays carry text fields instead of length-prefixed strings, matching the
//! framing of the system this crate's message set was modeled on; receivers always
//! force a trailing NUL before interpreting a text field, so a peer that sends a
//! non-terminated buffer can't run the reader off the end of the array.

use data_model::static_assert_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Upper bound on the encoded size of any message, including its 8-byte tag header.
pub const MAXSIZE: usize = 1024 * 10;

const HEADER_LEN: usize = 8;
pub const NAME_LEN: usize = 128;
pub const FUNCNAME_LEN: usize = 256;
pub const CHUNKNAME_LEN: usize = 512;
pub const ERRORMSG_LEN: usize = 1024;
pub const MAX_PARAMS: usize = 16;
pub const HOSTVAR_BUF_LEN: usize = 1024;
pub const SCRIPT_CONTENT_LEN: usize = MAXSIZE - HEADER_LEN - 32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("field {field} ({len} bytes) exceeds the {cap} byte inline buffer")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        cap: usize,
    },
    #[error("message has more than {max} arguments")]
    TooManyArgs { max: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u32),
    #[error("message payload truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Hello = 0,
    Quit = 1,
    NewSubjail = 2,
    SubjailAlive = 3,
    ScriptString = 4,
    ScriptFile = 5,
    HostVariable = 6,
    ScriptCall = 7,
    ScriptInfo = 8,
    ScriptResult = 9,
    FunctionCall = 10,
    FunctionReturn = 11,
}

impl Tag {
    fn from_u32(v: u32) -> Option<Tag> {
        Some(match v {
            0 => Tag::Hello,
            1 => Tag::Quit,
            2 => Tag::NewSubjail,
            3 => Tag::SubjailAlive,
            4 => Tag::ScriptString,
            5 => Tag::ScriptFile,
            6 => Tag::HostVariable,
            7 => Tag::ScriptCall,
            8 => Tag::ScriptInfo,
            9 => Tag::ScriptResult,
            10 => Tag::FunctionCall,
            11 => Tag::FunctionReturn,
            _ => return None,
        })
    }

    /// Whether this message type hands an ancillary fd across with it. `FunctionReturn`
    /// carries one only optionally (see [`Message::FunctionReturn`]).
    pub fn carries_fd(self) -> bool {
        matches!(
            self,
            Tag::NewSubjail | Tag::ScriptFile | Tag::ScriptCall | Tag::FunctionReturn
        )
    }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct HelloPayload {
    pid: i32,
    _pad: u32,
}
static_assert_size!(HelloPayload, 8);

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct SubjailAlivePayload {
    index: u32,
    pid: i32,
}
static_assert_size!(SubjailAlivePayload, 8);

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy)]
struct ScriptStringPayload {
    content: [u8; SCRIPT_CONTENT_LEN],
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct ScriptFilePayload {
    chunk_name: [u8; CHUNKNAME_LEN],
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct HostVariablePayload {
    name: [u8; NAME_LEN],
    table_index: i32,
    variant_tag: u8,
    _pad: [u8; 3],
    int_value: i64,
    double_value: f64,
    string_len: u32,
    string_buf: [u8; HOSTVAR_BUF_LEN],
    _pad2: [u8; 4],
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct ScriptCallPayload {
    name: [u8; NAME_LEN],
    fdmem_occupied: u64,
    param_count: u32,
    _pad: u32,
    params: [u64; MAX_PARAMS],
}
static_assert_size!(ScriptCallPayload, NAME_LEN + 8 + 4 + 4 + 8 * MAX_PARAMS);

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct ScriptInfoPayload {
    script_id: u64,
}
static_assert_size!(ScriptInfoPayload, 8);

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct ScriptResultPayload {
    success: u8,
    _pad: [u8; 7],
    error_msg: [u8; ERRORMSG_LEN],
    script_id: u64,
    return_ptr: u64,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
pub struct FunctionArg {
    pub addr: u64,
    pub size: u64,
}
static_assert_size!(FunctionArg, 16);

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct FunctionCallPayload {
    name: [u8; FUNCNAME_LEN],
    return_arg: FunctionArg,
    arg_count: u32,
    _pad: u32,
    args: [FunctionArg; MAX_PARAMS],
}

const FUNCTION_OUTCOME_OK: u8 = 0;
const FUNCTION_OUTCOME_FAILED: u8 = 1;
const FUNCTION_OUTCOME_INVALID_FD: u8 = 2;

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
struct FunctionReturnPayload {
    code: u8,
    _pad: [u8; 7],
}
static_assert_size!(FunctionReturnPayload, 8);

/// A host-supplied or script-supplied value, passed by value in a [`Message::HostVariable`].
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Nil,
    Int(i64),
    Double(f64),
    String(String),
}

/// The outcome of running a script chunk, as reported in [`Message::ScriptResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    Ok { return_ptr: Option<u64> },
    Error(String),
}

/// The outcome of one RPC invocation, as reported in [`Message::FunctionReturn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionOutcome {
    Ok,
    Failed,
    /// The handler produced a return fd but sending it failed with `EBADF` (the fd went
    /// stale between the handler returning and the send). The engine retried the send
    /// once without the fd; the caller's return buffer still holds whatever the handler
    /// wrote, but no fd was delivered.
    InvalidFd,
}

/// One message exchanged over an [`crate::channel::Channel`].
#[derive(Debug, Clone)]
pub enum Message {
    /// Sent by both ends right after a direct channel is established, carrying the
    /// sender's own pid.
    Hello { pid: i32 },
    /// Requests cooperative shutdown of the receiver's message loop.
    Quit,
    /// Sent controller->jail with one ancillary fd: the child end of a freshly created
    /// direct channel the jail should connect to a new subjail.
    NewSubjail,
    /// Sent subjail->jail->controller once a forked subjail has connected its end of the
    /// direct channel.
    SubjailAlive { index: u32, pid: i32 },
    /// Inline script source text to run.
    ScriptString { content: String },
    /// A script file to run, identified by an ancillary fd plus a display name.
    ScriptFile { chunk_name: String },
    /// A named value pushed from host to script (or vice versa), optionally indexed into
    /// a string table.
    HostVariable {
        name: String,
        table_index: Option<u32>,
        value: Variant,
    },
    /// Invokes a script chunk already staged in shared memory (see the `shmem` crate),
    /// carrying the arena fd as an ancillary descriptor plus up to 16 virtual-pointer
    /// argument slots.
    ScriptCall {
        name: String,
        fdmem_occupied: u64,
        params: Vec<u64>,
    },
    /// Acknowledges a `ScriptString`/`ScriptFile`/`ScriptCall`, assigning it an opaque id.
    ScriptInfo { script_id: u64 },
    /// Reports the outcome of the script run identified by `script_id`.
    ScriptResult {
        outcome: ScriptOutcome,
        script_id: u64,
    },
    /// A script-originated call into a host RPC function; remote argument/return locations
    /// are (address, size) pairs into the caller's own address space.
    FunctionCall {
        name: String,
        args: Vec<FunctionArg>,
        return_arg: FunctionArg,
    },
    /// The response to a `FunctionCall`, optionally carrying a return fd.
    FunctionReturn { outcome: FunctionOutcome },
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Hello { .. } => Tag::Hello,
            Message::Quit => Tag::Quit,
            Message::NewSubjail => Tag::NewSubjail,
            Message::SubjailAlive { .. } => Tag::SubjailAlive,
            Message::ScriptString { .. } => Tag::ScriptString,
            Message::ScriptFile { .. } => Tag::ScriptFile,
            Message::HostVariable { .. } => Tag::HostVariable,
            Message::ScriptCall { .. } => Tag::ScriptCall,
            Message::ScriptInfo { .. } => Tag::ScriptInfo,
            Message::ScriptResult { .. } => Tag::ScriptResult,
            Message::FunctionCall { .. } => Tag::FunctionCall,
            Message::FunctionReturn { .. } => Tag::FunctionReturn,
        }
    }

    /// Encodes this message into `buf`, which must be at least [`MAXSIZE`] bytes.
    /// Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        assert!(buf.len() >= MAXSIZE, "encode buffer must be MAXSIZE bytes");
        buf[..MAXSIZE].fill(0);
        buf[0..4].copy_from_slice(&(self.tag() as u32).to_ne_bytes());

        let payload = &mut buf[HEADER_LEN..];
        let written = match self {
            Message::Hello { pid } => write_payload(
                payload,
                &HelloPayload {
                    pid: *pid,
                    _pad: 0,
                },
            ),
            Message::Quit | Message::NewSubjail => 0,
            Message::SubjailAlive { index, pid } => write_payload(
                payload,
                &SubjailAlivePayload {
                    index: *index,
                    pid: *pid,
                },
            ),
            Message::ScriptString { content } => {
                let mut p = ScriptStringPayload {
                    content: [0; SCRIPT_CONTENT_LEN],
                };
                copy_into("content", content.as_bytes(), &mut p.content)?;
                write_payload(payload, &p)
            }
            Message::ScriptFile { chunk_name } => {
                let mut p = ScriptFilePayload {
                    chunk_name: [0; CHUNKNAME_LEN],
                };
                copy_into("chunk_name", chunk_name.as_bytes(), &mut p.chunk_name)?;
                write_payload(payload, &p)
            }
            Message::HostVariable {
                name,
                table_index,
                value,
            } => {
                let mut p = HostVariablePayload {
                    name: [0; NAME_LEN],
                    table_index: table_index.map(|i| i as i32).unwrap_or(-1),
                    variant_tag: 0,
                    _pad: [0; 3],
                    int_value: 0,
                    double_value: 0.0,
                    string_len: 0,
                    string_buf: [0; HOSTVAR_BUF_LEN],
                    _pad2: [0; 4],
                };
                copy_into("name", name.as_bytes(), &mut p.name)?;
                match value {
                    Variant::Nil => p.variant_tag = 0,
                    Variant::Int(v) => {
                        p.variant_tag = 1;
                        p.int_value = *v;
                    }
                    Variant::Double(v) => {
                        p.variant_tag = 2;
                        p.double_value = *v;
                    }
                    Variant::String(s) => {
                        p.variant_tag = 3;
                        copy_into("value", s.as_bytes(), &mut p.string_buf)?;
                        p.string_len = s.as_bytes().len() as u32;
                    }
                }
                write_payload(payload, &p)
            }
            Message::ScriptCall {
                name,
                fdmem_occupied,
                params,
            } => {
                if params.len() > MAX_PARAMS {
                    return Err(Error::TooManyArgs { max: MAX_PARAMS });
                }
                let mut p = ScriptCallPayload {
                    name: [0; NAME_LEN],
                    fdmem_occupied: *fdmem_occupied,
                    param_count: params.len() as u32,
                    _pad: 0,
                    params: [0; MAX_PARAMS],
                };
                copy_into("name", name.as_bytes(), &mut p.name)?;
                p.params[..params.len()].copy_from_slice(params);
                write_payload(payload, &p)
            }
            Message::ScriptInfo { script_id } => write_payload(
                payload,
                &ScriptInfoPayload {
                    script_id: *script_id,
                },
            ),
            Message::ScriptResult { outcome, script_id } => {
                let mut p = ScriptResultPayload {
                    success: 0,
                    _pad: [0; 7],
                    error_msg: [0; ERRORMSG_LEN],
                    script_id: *script_id,
                    return_ptr: 0,
                };
                match outcome {
                    ScriptOutcome::Ok { return_ptr } => {
                        p.success = 1;
                        p.return_ptr = return_ptr.unwrap_or(0);
                    }
                    ScriptOutcome::Error(msg) => {
                        p.success = 0;
                        copy_into("error_msg", msg.as_bytes(), &mut p.error_msg)?;
                    }
                }
                write_payload(payload, &p)
            }
            Message::FunctionCall {
                name,
                args,
                return_arg,
            } => {
                if args.len() > MAX_PARAMS {
                    return Err(Error::TooManyArgs { max: MAX_PARAMS });
                }
                let mut p = FunctionCallPayload {
                    name: [0; FUNCNAME_LEN],
                    return_arg: *return_arg,
                    arg_count: args.len() as u32,
                    _pad: 0,
                    args: [FunctionArg { addr: 0, size: 0 }; MAX_PARAMS],
                };
                copy_into("name", name.as_bytes(), &mut p.name)?;
                p.args[..args.len()].copy_from_slice(args);
                write_payload(payload, &p)
            }
            Message::FunctionReturn { outcome } => write_payload(
                payload,
                &FunctionReturnPayload {
                    code: match outcome {
                        FunctionOutcome::Ok => FUNCTION_OUTCOME_OK,
                        FunctionOutcome::Failed => FUNCTION_OUTCOME_FAILED,
                        FunctionOutcome::InvalidFd => FUNCTION_OUTCOME_INVALID_FD,
                    },
                    _pad: [0; 7],
                },
            ),
        };
        Ok(HEADER_LEN + written)
    }

    /// Decodes a message from the first `len` bytes of `buf`.
    pub fn decode(buf: &[u8], len: usize) -> Result<Message> {
        if len < 4 {
            return Err(Error::Truncated {
                expected: 4,
                got: len,
            });
        }
        let tag_val = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let tag = Tag::from_u32(tag_val).ok_or(Error::UnknownTag(tag_val))?;
        let payload = &buf[HEADER_LEN.min(len)..len];

        Ok(match tag {
            Tag::Hello => {
                let p: HelloPayload = read_payload(payload)?;
                Message::Hello { pid: p.pid }
            }
            Tag::Quit => Message::Quit,
            Tag::NewSubjail => Message::NewSubjail,
            Tag::SubjailAlive => {
                let p: SubjailAlivePayload = read_payload(payload)?;
                Message::SubjailAlive {
                    index: p.index,
                    pid: p.pid,
                }
            }
            Tag::ScriptString => {
                let mut p: ScriptStringPayload = read_payload(payload)?;
                Message::ScriptString {
                    content: cstr_defensive(&mut p.content),
                }
            }
            Tag::ScriptFile => {
                let mut p: ScriptFilePayload = read_payload(payload)?;
                Message::ScriptFile {
                    chunk_name: cstr_defensive(&mut p.chunk_name),
                }
            }
            Tag::HostVariable => {
                let mut p: HostVariablePayload = read_payload(payload)?;
                let value = match p.variant_tag {
                    1 => Variant::Int(p.int_value),
                    2 => Variant::Double(p.double_value),
                    3 => {
                        let len = (p.string_len as usize).min(HOSTVAR_BUF_LEN - 1);
                        p.string_buf[len] = 0;
                        Variant::String(cstr_defensive(&mut p.string_buf))
                    }
                    _ => Variant::Nil,
                };
                Message::HostVariable {
                    name: cstr_defensive(&mut p.name),
                    table_index: (p.table_index >= 0).then_some(p.table_index as u32),
                    value,
                }
            }
            Tag::ScriptCall => {
                let mut p: ScriptCallPayload = read_payload(payload)?;
                let count = (p.param_count as usize).min(MAX_PARAMS);
                Message::ScriptCall {
                    name: cstr_defensive(&mut p.name),
                    fdmem_occupied: p.fdmem_occupied,
                    params: p.params[..count].to_vec(),
                }
            }
            Tag::ScriptInfo => {
                let p: ScriptInfoPayload = read_payload(payload)?;
                Message::ScriptInfo {
                    script_id: p.script_id,
                }
            }
            Tag::ScriptResult => {
                let mut p: ScriptResultPayload = read_payload(payload)?;
                let outcome = if p.success != 0 {
                    ScriptOutcome::Ok {
                        return_ptr: (p.return_ptr != 0).then_some(p.return_ptr),
                    }
                } else {
                    ScriptOutcome::Error(cstr_defensive(&mut p.error_msg))
                };
                Message::ScriptResult {
                    outcome,
                    script_id: p.script_id,
                }
            }
            Tag::FunctionCall => {
                let mut p: FunctionCallPayload = read_payload(payload)?;
                let count = (p.arg_count as usize).min(MAX_PARAMS);
                Message::FunctionCall {
                    name: cstr_defensive(&mut p.name),
                    args: p.args[..count].to_vec(),
                    return_arg: p.return_arg,
                }
            }
            Tag::FunctionReturn => {
                let p: FunctionReturnPayload = read_payload(payload)?;
                Message::FunctionReturn {
                    outcome: match p.code {
                        FUNCTION_OUTCOME_OK => FunctionOutcome::Ok,
                        FUNCTION_OUTCOME_INVALID_FD => FunctionOutcome::InvalidFd,
                        _ => FunctionOutcome::Failed,
                    },
                }
            }
        })
    }
}

fn write_payload<T: AsBytes>(dst: &mut [u8], payload: &T) -> usize {
    let bytes = payload.as_bytes();
    dst[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}

fn read_payload<T: FromBytes + FromZeroes + Clone>(src: &[u8]) -> Result<T> {
    let size = std::mem::size_of::<T>();
    if src.len() < size {
        // Tolerate a short read by zero-extending: a truncated message still decodes,
        // with the missing tail treated as zero, rather than failing outright.
        let mut owned = vec![0u8; size];
        owned[..src.len()].copy_from_slice(src);
        return Ok(T::read_from(&owned[..]).expect("buffer sized to T"));
    }
    Ok(T::read_from(&src[..size]).expect("buffer sized to T"))
}

/// Copies `src` into `dst`, reserving the last byte for a guaranteed NUL terminator.
fn copy_into(field: &'static str, src: &[u8], dst: &mut [u8]) -> Result<()> {
    if src.len() > dst.len() - 1 {
        return Err(Error::FieldTooLong {
            field,
            len: src.len(),
            cap: dst.len() - 1,
        });
    }
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()] = 0;
    Ok(())
}

/// Forces a trailing NUL before converting a possibly-forged inline buffer to a `String`,
/// defending against a peer that sends a non-terminated text field.
fn cstr_defensive(buf: &mut [u8]) -> String {
    let last = buf.len() - 1;
    buf[last] = 0;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(last);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_string_round_trips_through_encode_decode() {
        let msg = Message::ScriptString {
            content: "print('hi')".to_string(),
        };
        let mut buf = vec![0u8; MAXSIZE];
        let len = msg.encode(&mut buf).unwrap();
        let decoded = Message::decode(&buf, len).unwrap();
        assert!(matches!(decoded, Message::ScriptString { content } if content == "print('hi')"));
    }

    /// A peer that fills an inline text field all the way to its capacity without ever
    /// writing a NUL must not make the decoder read past the buffer or panic; the
    /// defensive NUL-forcing in `cstr_defensive` should instead yield the field
    /// truncated to one byte short of capacity.
    #[test]
    fn non_terminated_script_string_buffer_does_not_run_off_the_end() {
        let mut buf = vec![0u8; MAXSIZE];
        buf[0..4].copy_from_slice(&(Tag::ScriptString as u32).to_ne_bytes());
        let payload = &mut buf[HEADER_LEN..HEADER_LEN + SCRIPT_CONTENT_LEN];
        payload.fill(b'A');

        let decoded = Message::decode(&buf, MAXSIZE).unwrap();
        match decoded {
            Message::ScriptString { content } => {
                assert_eq!(content.len(), SCRIPT_CONTENT_LEN - 1);
                assert!(content.bytes().all(|b| b == b'A'));
            }
            other => panic!("expected ScriptString, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected_rather_than_panicking() {
        let mut buf = vec![0u8; MAXSIZE];
        buf[0..4].copy_from_slice(&0xdead_beefu32.to_ne_bytes());
        let err = Message::decode(&buf, MAXSIZE).unwrap_err();
        assert!(matches!(err, Error::UnknownTag(0xdead_beef)));
    }

    #[test]
    fn field_longer_than_its_inline_buffer_is_rejected() {
        let overlong = "x".repeat(SCRIPT_CONTENT_LEN + 1);
        let msg = Message::ScriptString { content: overlong };
        let mut buf = vec![0u8; MAXSIZE];
        let err = msg.encode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FieldTooLong { field: "content", .. }));
    }
}
