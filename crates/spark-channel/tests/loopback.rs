//! 真实套接字上的端到端回环测试。
//!
//! # 测试目标（Why）
//! - 通过 [`ChannelManager::new`] 启动专属事件循环，验证 TCP/UDP 通道在回环接口上的完整生命周期；
//! - 停止监听后同一端口可立即重新监听。
//!
//! # 测试方法（How）
//! - 测试体大多运行在普通线程上（不进入 Tokio 运行时），与协议引擎的调用方式一致；
//! - 另有测试在多线程 Tokio 运行时的工作线程上调用，停止后同样必须立即释放端口；
//! - 网络活动异步发生，断言通过带截止时间的轮询完成。

use std::thread;
use std::time::{Duration, Instant};

use spark_channel::{Channel, ChannelConfig, ChannelManager, TransportKind};

const DEADLINE: Duration = Duration::from_secs(5);

fn manager() -> ChannelManager {
    ChannelManager::new(ChannelConfig::default()).expect("event loop starts")
}

fn poll_until<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let started = Instant::now();
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(started.elapsed() < DEADLINE, "condition not reached before deadline");
        thread::sleep(Duration::from_millis(5));
    }
}

fn accept(manager: &ChannelManager, kind: TransportKind, port: u16) -> Channel {
    poll_until(|| manager.accept_new_channel(kind, port).expect("accept"))
}

fn recv_exactly(channel: &Channel, len: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    poll_until(|| {
        collected.extend_from_slice(&channel.recv());
        (collected.len() >= len).then_some(())
    });
    collected
}

#[test]
fn tcp_channels_exchange_bytes_and_port_is_reusable_after_stop() {
    let manager = manager();
    let port = manager.bind(0).expect("bind ephemeral");
    assert_ne!(port, 0);
    assert_eq!(manager.listening_ports(), vec![port]);

    let client = manager
        .open_new_channel(TransportKind::Stream, port)
        .expect("request posted")
        .wait()
        .expect("connected");
    let server = accept(&manager, TransportKind::Stream, port);
    assert_eq!(server.local_addr().port(), port);

    client.send(b"INVITE sip:alice@127.0.0.1 SIP/2.0\r\n\r\n").unwrap();
    assert_eq!(
        recv_exactly(&server, 38),
        b"INVITE sip:alice@127.0.0.1 SIP/2.0\r\n\r\n"
    );

    server.send(b"SIP/2.0 180 Ringing\r\n\r\n").unwrap();
    let reply = recv_exactly(&client, 23);
    assert_eq!(reply, b"SIP/2.0 180 Ringing\r\n\r\n");

    client.close();
    server.close();
    manager
        .stop_accepting_new_channels(TransportKind::Stream, port)
        .expect("stop");
    assert!(manager.listening_ports().is_empty());

    assert_eq!(manager.bind(port).expect("rebind same port"), port);
}

#[test]
fn connect_to_closed_port_is_reported() {
    let manager = manager();
    let port = manager.bind(0).expect("bind");
    manager
        .stop_accepting_new_channels(TransportKind::Stream, port)
        .expect("stop");

    let result = manager
        .open_new_channel(TransportKind::Stream, port)
        .expect("request posted")
        .wait();
    assert!(matches!(
        result,
        Err(spark_channel::ChannelError::ConnectFailed { .. })
    ));
}

#[test]
fn udp_channels_exchange_datagrams_and_listener_re_arms() {
    let manager = manager();
    let port = manager
        .start_listener(TransportKind::Datagram, 0)
        .expect("bind ephemeral");
    let server = manager
        .accept_new_channel(TransportKind::Datagram, port)
        .expect("accept")
        .expect("listener channel is queued immediately");

    let client = manager
        .open_new_channel(TransportKind::Datagram, port)
        .expect("request posted")
        .wait()
        .expect("socket opened");
    assert_eq!(client.remote_addr().map(|addr| addr.port()), Some(port));

    client.send(b"REGISTER").unwrap();
    assert_eq!(recv_exactly(&server, 8), b"REGISTER");
    let remote = server.remote_addr().expect("sender recorded");
    assert_eq!(remote.port(), client.local_addr().port());

    server.send(b"200 OK").unwrap();
    assert_eq!(recv_exactly(&client, 6), b"200 OK");

    server.close();
    assert_eq!(manager.pending_len(port), 1);
    let next = manager
        .accept_new_channel(TransportKind::Datagram, port)
        .expect("accept")
        .expect("re-armed channel");
    client.send(b"BYE").unwrap();
    assert_eq!(recv_exactly(&next, 3), b"BYE");

    client.close();
    manager
        .stop_accepting_new_channels(TransportKind::Datagram, port)
        .expect("stop");
    assert_eq!(
        manager
            .start_listener(TransportKind::Datagram, port)
            .expect("rebind same port"),
        port
    );
}

const REBIND_ROUNDS: usize = 20;

#[tokio::test(flavor = "multi_thread")]
async fn stop_inside_a_runtime_releases_the_tcp_port_before_returning() {
    let manager = manager();
    for _ in 0..REBIND_ROUNDS {
        let port = manager.bind(0).expect("bind ephemeral");
        manager
            .stop_accepting_new_channels(TransportKind::Stream, port)
            .expect("stop");
        assert_eq!(manager.bind(port).expect("rebind same port"), port);
        manager
            .stop_accepting_new_channels(TransportKind::Stream, port)
            .expect("stop again");
    }
    assert!(manager.listening_ports().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_inside_a_runtime_releases_the_udp_port_before_returning() {
    let manager = manager();
    for _ in 0..REBIND_ROUNDS {
        let port = manager
            .start_listener(TransportKind::Datagram, 0)
            .expect("bind ephemeral");
        manager
            .stop_accepting_new_channels(TransportKind::Datagram, port)
            .expect("stop");
        assert_eq!(
            manager
                .start_listener(TransportKind::Datagram, port)
                .expect("rebind same port"),
            port
        );
        manager
            .stop_accepting_new_channels(TransportKind::Datagram, port)
            .expect("stop again");
    }
    assert!(manager.listening_ports().is_empty());
}
