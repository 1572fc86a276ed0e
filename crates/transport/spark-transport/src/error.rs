use std::io;

/// 传输错误的粗粒度分类，供通道层决定映射到哪一类公开错误。
///
/// - `AddrInUse`：监听端口已被占用（绑定冲突），调用方可换端口重试；
/// - `Retryable`：瞬时网络故障（连接被拒、重置等），由调用方决定是否重试；
/// - `NonRetryable`：配置或权限类错误；
/// - `Closed`：连接句柄背后的 I/O 任务已经退出。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    AddrInUse,
    Retryable,
    NonRetryable,
    Closed,
}

/// 传输实现层统一错误。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TCP/UDP 两个实现 crate 共用一个错误形状：稳定错误码 + 文案 + 分类 + 底层 `io::Error`；
/// - 通道层只依据 [`ErrorCategory`] 做映射，不需要理解具体平台错误。
///
/// ## 契约（What）
/// - `code`：形如 `spark.transport.tcp.bind_failed` 的稳定字符串，适合作为日志字段与告警键；
/// - `category`：由 [`LinkError::io`] 根据 `io::ErrorKind` 自动推导；
/// - `source`：若错误源于系统调用则保留原始 `io::Error`。
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LinkError {
    code: &'static str,
    message: String,
    category: ErrorCategory,
    #[source]
    source: Option<io::Error>,
}

impl LinkError {
    /// 由 I/O 错误构造，并按错误种类归类。
    pub fn io(code: &'static str, operation: &str, error: io::Error) -> Self {
        Self {
            code,
            message: format!("{operation}: {error}"),
            category: categorize_io_error(&error),
            source: Some(error),
        }
    }

    /// I/O 任务已退出、句柄不再可用。
    pub fn closed(code: &'static str, operation: &str) -> Self {
        Self {
            code,
            message: format!("{operation}: connection task has terminated"),
            category: ErrorCategory::Closed,
            source: None,
        }
    }

    /// 自定义分类与文案。
    pub fn new(code: &'static str, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            code,
            message: message.into(),
            category,
            source: None,
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层 `io::ErrorKind`（若有）。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        self.source.as_ref().map(io::Error::kind)
    }

    /// 是否为监听端口冲突。
    pub fn is_addr_in_use(&self) -> bool {
        self.category == ErrorCategory::AddrInUse
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => ErrorCategory::AddrInUse,
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported => ErrorCategory::NonRetryable,
        _ => ErrorCategory::NonRetryable,
    }
}
