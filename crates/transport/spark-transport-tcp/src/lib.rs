#![deny(unsafe_code)]
#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：在 Tokio 运行时上实现 `spark-transport` 的字节流契约，
  为通道层提供“同步绑定、异步接受、推送式读取、有序写出”的 TCP 端点。
- **架构角色**：`spark-channel` 的事件循环只通过 [`TcpListener`]、[`connect`]
  与 [`PendingTcpStream`] 接触 TCP，不直接操作 Tokio 套接字。

## 核心契约（What）
- [`TcpListener::bind`] 在调用线程上同步完成绑定与 `listen`，端口冲突立即以
  `LinkError`（分类 `AddrInUse`）返回，返回值携带系统分配的真实端口；
- [`TcpListener::serve`] 拆分出可跨线程持有的 [`TcpListenerHandle`] 与必须在运行时内
  驱动的 [`AcceptLoop`]；
- [`connect`] 与 `AcceptLoop` 产出的 [`PendingTcpStream`] 在 `start` 之前不读取任何字节，
  保证观察者先于首个字节就位。

## 实现策略（How）
- 绑定阶段使用 `socket2` 设置 `SO_REUSEADDR` 与 backlog，再交给 Tokio；
- 每条连接拆分为读半部与写半部：读泵把数据块推送给观察者，写任务消费无界有序队列；
- 关闭时写任务先冲刷队列，再半关闭写方向并通知读泵退出。

## 风险与考量（Trade-offs）
- 写队列无界，慢速对端会导致内存增长；调用方需自行控制发送速率。
"#]

mod config;
mod connection;
mod error;
mod listener;

pub use config::TcpSocketConfig;
pub use connection::{PendingTcpStream, TcpConnection, connect};
pub use listener::{AcceptLoop, TcpListener, TcpListenerHandle};
