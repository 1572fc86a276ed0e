//! 通道层配置。
//!
//! TOML 布局按 `[server]`、`[tcp]`、`[udp]`、`[event_loop]` 分段，所有字段均有默认值，
//! 未知键会被拒绝。

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use spark_transport_tcp::TcpSocketConfig;
use spark_transport_udp::{MAX_DATAGRAM_SIZE, UdpSocketOptions};

use crate::error::ConfigError;

/// 通道层完整配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 监听接口、套接字选项与事件循环参数集中在一处，`ChannelManager::new` 只接收这一份值；
/// - `server.listen_iface` 同时决定监听器绑定的接口与出站通道拨号的主机。
///
/// ## 契约（What）
/// - 缺省字段取 [`Default`] 中的值；
/// - [`ChannelConfig::from_toml_str`] / [`ChannelConfig::load`] 在解析后执行取值校验。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub server: ServerConfig,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub event_loop: EventLoopConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// 监听器绑定的接口，也是出站通道连接的目标主机。
    pub listen_iface: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_iface: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    pub nodelay: bool,
    pub reuse_address: bool,
    pub read_chunk_size: usize,
    pub backlog: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            reuse_address: true,
            read_chunk_size: 16 * 1024,
            backlog: 1024,
        }
    }
}

impl TcpConfig {
    pub fn to_socket_config(&self) -> TcpSocketConfig {
        TcpSocketConfig::new()
            .with_nodelay(self.nodelay)
            .with_reuse_address(self.reuse_address)
            .with_read_chunk_size(self.read_chunk_size)
            .with_backlog(self.backlog)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UdpConfig {
    /// 出站报文套接字是否 `connect` 到目标，只接收该对端的报文。
    pub associate_peer: bool,
    pub max_datagram_size: usize,
    pub broadcast: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            associate_peer: true,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            broadcast: false,
        }
    }
}

impl UdpConfig {
    pub fn to_socket_options(&self) -> UdpSocketOptions {
        UdpSocketOptions::default()
            .with_broadcast(self.broadcast)
            .with_max_datagram_size(self.max_datagram_size)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventLoopConfig {
    pub thread_name: String,
    /// 非运行时线程停止监听后等待端口释放的上限（毫秒）。
    pub stop_timeout_ms: u64,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            thread_name: "spark-channel-loop".to_owned(),
            stop_timeout_ms: 1000,
        }
    }
}

impl EventLoopConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl ChannelConfig {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ChannelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp.read_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "tcp.read_chunk_size",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if !(1..=MAX_DATAGRAM_SIZE).contains(&self.udp.max_datagram_size) {
            return Err(ConfigError::Invalid {
                key: "udp.max_datagram_size",
                reason: format!("must be within 1..={MAX_DATAGRAM_SIZE}"),
            });
        }
        if self.event_loop.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "event_loop.thread_name",
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ChannelConfig::from_toml_str("").expect("defaults");
        assert_eq!(config, ChannelConfig::default());
        assert_eq!(config.server.listen_iface, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.udp.associate_peer);
        assert_eq!(config.event_loop.stop_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ChannelConfig::from_toml_str(
            r#"
            [server]
            listen_iface = "0.0.0.0"

            [udp]
            associate_peer = false
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.listen_iface, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(!config.udp.associate_peer);
        assert_eq!(config.udp.max_datagram_size, MAX_DATAGRAM_SIZE);
        assert_eq!(config.tcp, TcpConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ChannelConfig::from_toml_str("[tcp]\nno_delay = true\n").expect_err("typo");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_values_are_invalid() {
        let err = ChannelConfig::from_toml_str("[udp]\nmax_datagram_size = 70000\n")
            .expect_err("too large");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "udp.max_datagram_size",
                ..
            }
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ChannelConfig::load("/nonexistent/spark-channel.toml").expect_err("missing");
        match err {
            ConfigError::Io { path, .. } => {
                assert!(path.ends_with("spark-channel.toml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn tcp_section_maps_onto_socket_config() {
        let tcp = TcpConfig {
            nodelay: false,
            read_chunk_size: 512,
            ..TcpConfig::default()
        };
        let socket = tcp.to_socket_config();
        assert!(!socket.nodelay());
        assert_eq!(socket.read_chunk_size(), 512);
        assert_eq!(socket.backlog(), 1024);
    }
}
