use std::fmt;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EventLoopConfig;
use crate::error::ChannelError;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Task),
    Shutdown,
}

/// 独占 I/O 的事件循环线程。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所有套接字 I/O 由一个专属线程上的单线程 Tokio 运行时驱动，调用方线程从不直接触碰循环内部；
/// - 跨线程请求（建连、启动接受循环）被包装成命令投递到无界队列，由循环线程按序执行。
///
/// ## 契约（What）
/// - [`EventLoop::submit`] 可从任意线程调用；任务在循环线程上、运行时上下文内执行，
///   因此可以直接 `tokio::spawn`；
/// - 任务必须快速返回，长时间工作应 `spawn` 为异步任务；
/// - [`EventLoop::shutdown`] 幂等：投递 `Shutdown`、等待线程退出，运行时随之销毁，
///   其上的全部套接字任务一并终止；被丢弃时自动执行。
///
/// ## 注意事项（Trade-offs）
/// - 在循环线程自身上调用 `shutdown` 时不会 `join`，以免自等待。
pub struct EventLoop {
    commands: mpsc::UnboundedSender<Command>,
    handle: Handle,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventLoop {
    /// 构建运行时并启动循环线程。
    pub fn start(config: &EventLoopConfig) -> Result<Self, ChannelError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(config.thread_name.clone())
            .build()
            .map_err(ChannelError::EventLoopStart)?;
        let handle = runtime.handle().clone();
        let (commands, mut rx) = mpsc::unbounded_channel::<Command>();
        let name = config.thread_name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(command) = rx.recv().await {
                        match command {
                            Command::Run(task) => task(),
                            Command::Shutdown => break,
                        }
                    }
                });
                debug!("event loop exiting");
            })
            .map_err(ChannelError::EventLoopStart)?;
        debug!(thread = %name, "event loop started");
        Ok(Self {
            commands,
            handle,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
            name,
        })
    }

    /// 把任务投递到循环线程执行。
    pub fn submit<F>(&self, task: F) -> Result<(), ChannelError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.commands
            .send(Command::Run(Box::new(task)))
            .map_err(|_| ChannelError::EventLoopStopped)
    }

    /// 运行时句柄，供需要在循环上启动异步任务的传输端点使用。
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前线程是否为循环线程；其他运行时的工作线程返回 `false`。
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// 停止循环并等待线程退出。
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if self.is_loop_thread() {
            return;
        }
        if thread.join().is_err() {
            warn!(thread = %self.name, "event loop thread panicked");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
