//! 集成测试支撑模块。
//!
//! # 模块定位（Why）
//! - 注册表与连接器的场景测试不依赖真实套接字：[`memory::MemoryTransport`] 以确定性的方式
//!   模拟建连、监听、入站连接与报文到达；
//! - 每个测试文件通过 `mod support;` 引入，只使用其中的一部分，因此允许未使用的辅助函数。

#![allow(dead_code, unused_imports)]

pub mod memory;

use std::sync::Arc;

use spark_channel::{Channel, ChannelConfig, ChannelManager, TransportKind};

pub use memory::{MemoryDatagramPeer, MemoryStreamPeer, MemoryTransport};

/// 以内存传输构造的管理器。
pub fn memory_manager() -> (ChannelManager, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let manager = ChannelManager::with_provider(ChannelConfig::default(), transport.clone());
    (manager, transport)
}

/// 一条已建立的出站字节流通道；内存传输同步交付结果。
pub fn connected_stream(manager: &ChannelManager) -> Channel {
    let mut request = manager
        .open_new_channel(TransportKind::Stream, 7000)
        .expect("request accepted");
    request
        .try_take()
        .expect("memory transport resolves immediately")
        .expect("connect succeeds")
}
