//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为通道层对外暴露的错误语义提供集中定义：绑定冲突、建连失败、关闭后使用等；
//! - 传输实现层的 [`LinkError`] 只在这里被翻译，调用方无需理解平台错误码。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可以用 `?` 传播；
//! - 可恢复错误（绑定冲突、建连失败）以 `Err` 返回，从不 panic；
//! - 缓冲操作（`recv`/`peek`/`rollback`/`append_to_buffer`）不产生错误。

use std::io;
use std::path::PathBuf;

use spark_transport::{ErrorCategory, LinkError, TransportKind, TransportSocketAddr};
use thiserror::Error;

use crate::ChannelId;

/// 通道层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“端口被占用”“连接没建成”“通道已关闭”等情况显式化，
///   取代静默失败或未定义的传输行为；
/// - **契约 (What)**：
///   - `BindConflict` 可恢复，调用方可以换端口重试；
///   - `ConnectFailed` 恰好交付给等待该次建连的调用方一次；
///   - `Closed` 只由 `send`/`send_all` 产生，缓冲读取在关闭后依然可用；
/// - **风险 (Trade-offs)**：`LinkError` 作为 `source` 保留，日志中可以看到稳定错误码与原始 `io::Error`。
#[derive(Debug, Error)]
pub enum ChannelError {
    /// 监听端口已被其他套接字占用，或无权绑定。
    #[error("port {port} is already in use")]
    BindConflict {
        port: u16,
        #[source]
        source: LinkError,
    },

    /// 其他监听创建失败。
    #[error("failed to listen on port {port}")]
    Listen {
        port: u16,
        #[source]
        source: LinkError,
    },

    /// 出站建连没有完成。
    #[error("failed to connect to {remote}")]
    ConnectFailed {
        remote: TransportSocketAddr,
        #[source]
        source: LinkError,
    },

    /// 通道已关闭。
    #[error("channel {id} is closed")]
    Closed { id: ChannelId },

    /// 报文通道尚未得知对端地址。
    #[error("datagram channel {id} has no remote peer yet")]
    NoPeer { id: ChannelId },

    /// 传输层拒绝排队写入。
    #[error("channel {id} failed to queue a write")]
    Write {
        id: ChannelId,
        #[source]
        source: LinkError,
    },

    /// 端口已被另一种传输类型的监听器占用。
    #[error("port {port} is held by a {active} listener, {requested} was requested")]
    KindMismatch {
        port: u16,
        active: TransportKind,
        requested: TransportKind,
    },

    /// 端口 0 只能用于创建监听器，不能用于收取或停止。
    #[error("port 0 names no particular listener")]
    EphemeralAccept,

    /// 事件循环线程已退出。
    #[error("event loop is not running")]
    EventLoopStopped,

    /// 事件循环线程无法启动。
    #[error("failed to start the event loop")]
    EventLoopStart(#[source] io::Error),

    /// 建连请求在得到结果前被丢弃。
    #[error("open request was cancelled before completion")]
    Cancelled,

    /// 配置加载失败。
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChannelError {
    /// 将监听创建失败归类为冲突或一般失败；无法投递命令时视为事件循环已停止。
    pub(crate) fn from_listen(port: u16, source: LinkError) -> Self {
        match source.category() {
            ErrorCategory::Closed => ChannelError::EventLoopStopped,
            ErrorCategory::AddrInUse => ChannelError::BindConflict { port, source },
            _ if source.io_kind() == Some(io::ErrorKind::PermissionDenied) => {
                ChannelError::BindConflict { port, source }
            }
            _ => ChannelError::Listen { port, source },
        }
    }

    /// 是否为可换端口重试的绑定冲突。
    pub fn is_bind_conflict(&self) -> bool {
        matches!(self, ChannelError::BindConflict { .. })
    }
}

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
