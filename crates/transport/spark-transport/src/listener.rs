use std::fmt;
use std::time::Duration;

use crate::{TransportKind, TransportSocketAddr};

/// 监听套接字的不透明句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 监听管理器只需要两件事：知道实际绑定的端口、在需要时停止监听；
/// - 把“停止”做成同步语义，调用返回后端口即可被重新绑定。
///
/// ## 契约（What）
/// - `local_addr`：绑定完成后的真实地址，端口 0 已被替换为系统分配值；
/// - `stop_listening`：幂等，只发出停止信号，不阻塞；
/// - `wait_released`：阻塞等待底层监听套接字真正关闭，超时返回 `false`；
///   调用方负责避免在事件循环线程上调用；
/// - 句柄被丢弃时同样视为停止。
pub trait ListenerHandle: Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> TransportKind;

    fn local_addr(&self) -> TransportSocketAddr;

    fn stop_listening(&self);

    fn wait_released(&self, timeout: Duration) -> bool;
}
