#![deny(unsafe_code)]
#![doc = r#"
# spark-channel

## 设计动机（Why）
- **定位**：位于原始套接字 I/O 与上层协议引擎之间，把 TCP 字节流与 UDP 报文关联统一为
  [`Channel`]：缓冲收取、窥视、回滚、发送与生命周期状态；
- **问题域**：I/O 在专属事件循环线程上发生，调用方线程随时可能收取、发送、监听或发起连接，
  本 crate 负责在两者之间维持一致的并发语义。

## 核心契约（What）
- [`ChannelManager`]：对上层暴露的全部入口（`open_new_channel`、`bind`、`start_listener`、
  `accept_new_channel`、`stop_accepting_new_channels`）；
- [`Channel`]：缓冲操作在同一把互斥锁内执行，字节顺序与网络到达顺序一致；
- [`OpenRequest`]：出站建连的显式结果，成功与失败都可观测；
- [`ChannelRegistry`]：端口 → 监听句柄 + 入站 FIFO 队列，由单一互斥区保护。

## 实现策略（How）
- 事件循环是运行单线程 Tokio 运行时的专属线程（[`EventLoop`]），跨线程请求以命令的形式投递；
- 传输细节隐藏在 [`spark_transport::TransportProvider`] 之后，默认实现为 [`TokioTransport`]，
  测试可以注入内存实现；
- 日志统一使用 `tracing`，[`telemetry::init_tracing`] 提供一次性的订阅器安装入口。

## 风险与考量（Trade-offs）
- `accept_new_channel` 是非阻塞轮询，需要阻塞语义的调用方应自行轮询或叠加通知机制；
- 本层不设超时，超时策略属于上层协议引擎。
"#]

mod channel;
pub mod config;
mod connector;
pub mod error;
mod manager;
mod registry;
pub mod runtime;
pub mod telemetry;

pub use channel::{Channel, ChannelId, ChannelState};
pub use config::ChannelConfig;
pub use connector::{Connector, OpenRequest};
pub use error::{ChannelError, ConfigError};
pub use manager::ChannelManager;
pub use registry::ChannelRegistry;
pub use runtime::{EventLoop, TokioTransport};
pub use spark_transport::{TransportKind, TransportSocketAddr};
