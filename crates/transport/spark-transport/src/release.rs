use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

/// 创建一对“释放闩锁”：守卫由持有套接字的 I/O 任务保管，等待端由句柄保管。
///
/// 守卫被丢弃（任务结束或从未运行）即视为套接字已释放；I/O 任务应先丢弃套接字、再丢弃守卫。
pub fn release_latch() -> (ReleaseGuard, ReleaseWaiter) {
    let (tx, rx) = mpsc::channel();
    (
        ReleaseGuard { _tx: tx },
        ReleaseWaiter {
            rx: Mutex::new(Some(rx)),
        },
    )
}

/// 套接字持有方保管的守卫。
#[derive(Debug)]
pub struct ReleaseGuard {
    _tx: mpsc::Sender<()>,
}

/// 句柄一侧的等待端。
#[derive(Debug)]
pub struct ReleaseWaiter {
    rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ReleaseWaiter {
    /// 阻塞等待守卫被丢弃，至多 `timeout`。
    ///
    /// 会阻塞当前线程；不得在驱动该套接字的事件循环线程上调用。
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut slot = self.rx.lock();
        let Some(rx) = slot.as_ref() else {
            return true;
        };
        let released = matches!(
            rx.recv_timeout(timeout),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
        if released {
            *slot = None;
        }
        released
    }

    /// 非阻塞查询。
    pub fn is_released(&self) -> bool {
        let mut slot = self.rx.lock();
        let Some(rx) = slot.as_ref() else {
            return true;
        };
        let released = matches!(rx.try_recv(), Err(mpsc::TryRecvError::Disconnected));
        if released {
            *slot = None;
        }
        released
    }
}
