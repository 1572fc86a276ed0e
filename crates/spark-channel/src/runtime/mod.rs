//! 事件循环线程与基于 Tokio 的传输提供方。

mod event_loop;
mod tokio_transport;

pub use event_loop::EventLoop;
pub use tokio_transport::TokioTransport;
