//! 日志订阅器安装入口。

use tracing::dispatcher;
use tracing_subscriber::EnvFilter;

/// 安装失败原因。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TelemetryError {
    /// 进程内已经存在全局订阅器。
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// 安装 `fmt` 订阅器，过滤规则取自 `RUST_LOG`，缺省为 `info`。
///
/// # 教案式说明
/// - **意图（Why）**：二进制或测试只需调用一次即可看到通道层的结构化日志；
/// - **契约（What）**：重复调用，或外部已设置全局订阅器时，返回 [`TelemetryError::AlreadyInstalled`]
///   且不做任何修改。
pub fn init_tracing() -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

