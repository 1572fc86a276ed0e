#![deny(unsafe_code)]
#![doc = "spark-transport: 通道层与事件循环传输提供方之间的契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：通道层（`spark-channel`）只关心“字节到达”“写出字节”“关闭连接”，不应直接依赖 Tokio 或具体套接字类型。"]
#![doc = "- **What**：定义地址、传输种类、投递回调（`ConnectionObserver`）、连接句柄、待启动端点、监听句柄以及 `TransportProvider`。"]
#![doc = "- **How**：所有契约均为对象安全的 trait，TCP/UDP 实现 crate 与测试用内存实现都只需依赖本 crate。"]

pub mod addr;
pub mod connection;
pub mod error;
pub mod kind;
pub mod listener;
pub mod provider;
pub mod release;

pub use addr::TransportSocketAddr;
pub use connection::{
    ConnectionObserver, DatagramConnection, PendingDatagram, PendingStream, StreamConnection,
};
pub use error::{ErrorCategory, LinkError};
pub use kind::{ParseKindError, TransportKind};
pub use listener::ListenerHandle;
pub use provider::{AcceptFn, DatagramOutcome, StreamOutcome, TransportProvider};
pub use release::{ReleaseGuard, ReleaseWaiter, release_latch};
