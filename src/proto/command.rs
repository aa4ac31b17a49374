//! 命令帧编解码
//!
//! 帧格式: `command [NUL arg]*`，没有额外的结束符。
//! 连接本身就是 drone 的身份，所以帧里不带 worker id。

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::job::JobId;

/// 字段分隔符
pub const NULL_CHAR: u8 = 0;

/// 协议解析错误，属于非致命错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    #[error("empty frame")]
    Empty,
    #[error("{command}: expected {expected} argument(s)")]
    Arity { command: &'static str, expected: usize },
    #[error("{command}: invalid integer {value:?}")]
    InvalidNumber { command: &'static str, value: String },
    #[error("frame is not valid utf-8")]
    Utf8,
}

/// drone 发给 queen 的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Grab,
    Done(JobId),
    Fail(JobId),
    SchedLater { job_id: JobId, delay: u64 },
    Sleep,
    Ping,
    CanDo(String),
    CanNoDo(String),
    /// 格式正确但无法识别的命令，回复 `unknown`
    Unknown(String),
}

impl Command {
    /// 命令名
    pub fn name(&self) -> &str {
        match self {
            Command::Grab => "grab",
            Command::Done(_) => "done",
            Command::Fail(_) => "fail",
            Command::SchedLater { .. } => "sched_later",
            Command::Sleep => "sleep",
            Command::Ping => "ping",
            Command::CanDo(_) => "can_do",
            Command::CanNoDo(_) => "can_no_do",
            Command::Unknown(name) => name,
        }
    }

    /// 编码为帧，`decode` 的逆操作
    pub fn encode(&self) -> Bytes {
        let args: Vec<String> = match self {
            Command::Done(id) | Command::Fail(id) => vec![id.to_string()],
            Command::SchedLater { job_id, delay } => vec![job_id.to_string(), delay.to_string()],
            Command::CanDo(func) | Command::CanNoDo(func) => vec![func.clone()],
            _ => Vec::new(),
        };
        join(self.name().as_bytes(), args.iter().map(|a| a.as_bytes()))
    }
}

/// 解码一帧
///
/// 单参数命令只在第一个 NUL 处切分，参数是剩余的全部字节；
/// `sched_later` 再对参数切分一次。无参数命令忽略多余字段。
/// 空帧的命令名为空串，按未知命令处理。
pub fn decode(frame: &[u8]) -> Result<Command, ProtoError> {
    let mut parts = frame.splitn(2, |b| *b == NULL_CHAR);
    let name = std::str::from_utf8(parts.next().unwrap_or_default()).map_err(|_| ProtoError::Utf8)?;
    let rest = parts.next();

    let cmd = match name {
        "grab" => Command::Grab,
        "sleep" => Command::Sleep,
        "ping" => Command::Ping,
        "done" => Command::Done(parse_id("done", required("done", rest)?)?),
        "fail" => Command::Fail(parse_id("fail", required("fail", rest)?)?),
        "sched_later" => {
            let mut args = required("sched_later", rest)?.splitn(2, |b| *b == NULL_CHAR);
            let job_id = args.next().unwrap_or_default();
            let delay = args.next().ok_or(ProtoError::Arity {
                command: "sched_later",
                expected: 2,
            })?;
            Command::SchedLater {
                job_id: parse_id("sched_later", job_id)?,
                delay: parse_number("sched_later", delay)?,
            }
        }
        "can_do" => Command::CanDo(utf8(required("can_do", rest)?)?),
        "can_no_do" => Command::CanNoDo(utf8(required("can_no_do", rest)?)?),
        other => Command::Unknown(other.to_string()),
    };
    Ok(cmd)
}

/// queen 发给 drone 的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Nop,
    Unknown,
    NoJob,
    WaitForJob,
    /// 任务分派帧，内容为任务的 JSON 表示
    Dispatch(Bytes),
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::Pong => Bytes::from_static(b"pong"),
            Reply::Nop => Bytes::from_static(b"nop"),
            Reply::Unknown => Bytes::from_static(b"unknown"),
            Reply::NoJob => Bytes::from_static(b"no_job"),
            Reply::WaitForJob => Bytes::from_static(b"wait_for_job"),
            Reply::Dispatch(body) => body.clone(),
        }
    }

    /// drone 端解析 queen 的消息
    pub fn decode(frame: &[u8]) -> Result<Reply, ProtoError> {
        match frame {
            [] => Err(ProtoError::Empty),
            b"pong" => Ok(Reply::Pong),
            b"nop" => Ok(Reply::Nop),
            b"unknown" => Ok(Reply::Unknown),
            b"no_job" => Ok(Reply::NoJob),
            b"wait_for_job" => Ok(Reply::WaitForJob),
            body => Ok(Reply::Dispatch(Bytes::copy_from_slice(body))),
        }
    }
}

fn join<'a>(name: &[u8], args: impl Iterator<Item = &'a [u8]>) -> Bytes {
    let mut buf = BytesMut::with_capacity(name.len() + 16);
    buf.put_slice(name);
    for arg in args {
        buf.put_u8(NULL_CHAR);
        buf.put_slice(arg);
    }
    buf.freeze()
}

fn required<'a>(command: &'static str, rest: Option<&'a [u8]>) -> Result<&'a [u8], ProtoError> {
    rest.ok_or(ProtoError::Arity { command, expected: 1 })
}

fn utf8(raw: &[u8]) -> Result<String, ProtoError> {
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::Utf8)
}

fn parse_id(command: &'static str, raw: &[u8]) -> Result<JobId, ProtoError> {
    parse_number(command, raw)
}

fn parse_number<T: std::str::FromStr>(command: &'static str, raw: &[u8]) -> Result<T, ProtoError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtoError::Utf8)?;
    text.trim().parse().map_err(|_| ProtoError::InvalidNumber {
        command,
        value: text.to_string(),
    })
}
