//! 连接抽象 - 阻塞式收发不透明字节帧

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::BrokerConfig;

/// 连接错误类型，对会话是致命的
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
    #[error("frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// 传输层协作接口
///
/// `send` 与 `receive` 可能在不同线程上同时调用，`close` 之后
/// 阻塞中的 `receive` 必须返回错误。
pub trait Connection: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), ConnectionError>;

    fn receive(&self) -> Result<Bytes, ConnectionError>;

    fn close(&self);
}

/// 基于 TCP 的连接，每帧前加 4 字节大端长度
pub struct TcpConnection {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    max_frame_len: usize,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(stream)),
            writer: Mutex::new(writer),
            max_frame_len,
        })
    }

    /// 按配置的帧上限和写超时创建连接
    pub fn from_config(stream: TcpStream, config: &BrokerConfig) -> Result<Self, ConnectionError> {
        Self::new(stream, config.max_frame_len)?.with_write_timeout(config.write_timeout())
    }

    /// 对端停止读取时，阻塞的 `send` 在超时后返回错误，而不是卡住分派线程
    pub fn with_write_timeout(self, timeout: Option<Duration>) -> Result<Self, ConnectionError> {
        self.writer.lock().set_write_timeout(timeout)?;
        Ok(self)
    }

    /// 对端地址
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr, ConnectionError> {
        Ok(self.writer.lock().peer_addr()?)
    }
}

impl Connection for TcpConnection {
    fn send(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if frame.len() > self.max_frame_len {
            return Err(ConnectionError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        let mut buf = BytesMut::with_capacity(4 + frame.len());
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);

        let mut writer = self.writer.lock();
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    fn receive(&self) -> Result<Bytes, ConnectionError> {
        let mut reader = self.reader.lock();
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ConnectionError::Closed),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(ConnectionError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        Ok(Bytes::from(body))
    }

    fn close(&self) {
        // 读端阻塞在 read_exact 上，不能去抢 reader 锁
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both) {
            log::debug!("shutdown of tcp connection failed: {}", e);
        }
    }
}
