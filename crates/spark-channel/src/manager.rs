use std::sync::Arc;

use spark_transport::{TransportKind, TransportProvider};

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::connector::{Connector, OpenRequest};
use crate::error::ChannelError;
use crate::registry::ChannelRegistry;
use crate::runtime::{EventLoop, TokioTransport};

/// 通道层对上层协议引擎暴露的全部入口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把出站连接器、入站注册表与事件循环组装为一个显式构造、显式销毁的对象，
///   取代进程级的全局注册表；
/// - 所有方法可从任意线程调用，且都不会为等待网络活动而阻塞。
///
/// ## 契约（What）
/// - `new`：启动专属事件循环线程并使用 [`TokioTransport`]；
/// - `with_provider`：注入任意 [`TransportProvider`]（测试或自定义运行时），不启动线程；
/// - 被丢弃时先停止所有监听并关闭未收取的通道，再停止事件循环。
pub struct ChannelManager {
    config: ChannelConfig,
    connector: Connector,
    registry: ChannelRegistry,
    // 最后析构：注册表停止监听时循环仍在运行。
    event_loop: Option<Arc<EventLoop>>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        config.validate()?;
        let event_loop = Arc::new(EventLoop::start(&config.event_loop)?);
        let provider = Arc::new(TokioTransport::new(Arc::clone(&event_loop), &config));
        let mut manager = Self::with_provider(config, provider);
        manager.event_loop = Some(event_loop);
        Ok(manager)
    }

    pub fn with_provider(config: ChannelConfig, provider: Arc<dyn TransportProvider>) -> Self {
        let iface = config.server.listen_iface;
        let connector = Connector::new(Arc::clone(&provider), iface);
        let registry = ChannelRegistry::new(provider, iface, config.event_loop.stop_timeout());
        Self {
            config,
            connector,
            registry,
            event_loop: None,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// 向 `listen_iface:port` 发起出站建连。
    pub fn open_new_channel(
        &self,
        kind: TransportKind,
        port: u16,
    ) -> Result<OpenRequest, ChannelError> {
        self.connector.open(kind, port)
    }

    /// 回调形式的 [`ChannelManager::open_new_channel`]。
    pub fn open_new_channel_with<F>(
        &self,
        kind: TransportKind,
        port: u16,
        on_ready: F,
    ) -> Result<(), ChannelError>
    where
        F: FnOnce(Result<Channel, ChannelError>) + Send + 'static,
    {
        self.connector.open_with(kind, port, on_ready)
    }

    /// 确保 TCP 监听存在，返回绑定端口；`0` 请求临时端口。
    pub fn bind(&self, port: u16) -> Result<u16, ChannelError> {
        self.registry.start_listener(TransportKind::Stream, port)
    }

    pub fn start_listener(&self, kind: TransportKind, port: u16) -> Result<u16, ChannelError> {
        self.registry.start_listener(kind, port)
    }

    pub fn accept_new_channel(
        &self,
        kind: TransportKind,
        port: u16,
    ) -> Result<Option<Channel>, ChannelError> {
        self.registry.accept_new_channel(kind, port)
    }

    pub fn stop_accepting_new_channels(
        &self,
        kind: TransportKind,
        port: u16,
    ) -> Result<(), ChannelError> {
        self.registry.stop_accepting_new_channels(kind, port)
    }

    pub fn listening_ports(&self) -> Vec<u16> {
        self.registry.listening_ports()
    }

    pub fn pending_len(&self, port: u16) -> usize {
        self.registry.pending_len(port)
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }
}
