use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream as TokioTcpStream;

/// 默认读块大小：单次 `read` 最多取出的字节数。
const DEFAULT_READ_CHUNK: usize = 16 * 1024;
/// 默认 `listen` backlog。
const DEFAULT_BACKLOG: u32 = 1024;

/// TCP 套接字层配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把监听阶段（`SO_REUSEADDR`、backlog）与连接阶段（`TCP_NODELAY`、`SO_LINGER`、读块大小）
///   的可调参数收敛到一个值类型，监听器与出站建连共享同一份配置；
/// - 通道层的文本配置最终被翻译为该结构，传输层不解析配置文件。
///
/// ## 契约（What）
/// - 所有 `with_*` 方法按值返回新配置，便于链式构造；
/// - `read_chunk_size` 为 0 时按 1 处理，避免读泵空转；
/// - `linger = None` 表示沿用内核默认；`Some(Duration::ZERO)` 会在关闭时触发 RST。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
    reuse_address: bool,
    backlog: u32,
    read_chunk_size: usize,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger: None,
            reuse_address: true,
            backlog: DEFAULT_BACKLOG,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

impl TcpSocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn reuse_address(&self) -> bool {
        self.reuse_address
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }

    /// 将连接级选项写入已建立的流。
    pub(crate) fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)
    }

    /// `listen` 所需的 backlog，超出 `i32` 时截断。
    pub(crate) fn backlog_i32(&self) -> i32 {
        i32::try_from(self.backlog).unwrap_or(i32::MAX)
    }
}
