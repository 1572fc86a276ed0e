use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// `TransportSocketAddr` 为 TCP/UDP 两类通道提供统一的 Socket 地址表达。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - **统一抽象**：通道层在流与报文两种传输之间共享同一地址结构，避免各处直接拼接 `host:port`。
/// - **可扩展性**：保留 `non_exhaustive`，为未来扩展（如 Unix Domain Socket）预留空间。
///
/// ## 合同（What）
/// - `V4` 与 `V6` 分别表示 IPv4/IPv6，端口号为主机序 `u16`。
/// - `Display` 提供稳定字符串格式，适合日志字段使用。
/// - 端口 `0` 表示“由操作系统分配临时端口”，仅在绑定场景有意义。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum TransportSocketAddr {
    /// IPv4 地址。
    V4 { addr: [u8; 4], port: u16 },
    /// IPv6 地址。
    V6 { addr: [u16; 8], port: u16 },
}

impl TransportSocketAddr {
    /// 由 IP 与端口构造地址。
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self::from(SocketAddr::new(ip, port))
    }

    /// 本地回环地址 `127.0.0.1:port`。
    pub fn loopback_v4(port: u16) -> Self {
        Self::V4 {
            addr: Ipv4Addr::LOCALHOST.octets(),
            port,
        }
    }

    /// 返回端口号。
    pub fn port(&self) -> u16 {
        match self {
            Self::V4 { port, .. } | Self::V6 { port, .. } => *port,
        }
    }

    /// 返回 IP 部分。
    pub fn ip(&self) -> IpAddr {
        match self {
            Self::V4 { addr, .. } => IpAddr::V4(Ipv4Addr::from(*addr)),
            Self::V6 { addr, .. } => IpAddr::V6(Ipv6Addr::from(*addr)),
        }
    }

    /// 保持 IP 不变、替换端口，常用于“同一接口、不同端口”的建连与监听。
    pub fn with_port(self, port: u16) -> Self {
        match self {
            Self::V4 { addr, .. } => Self::V4 { addr, port },
            Self::V6 { addr, .. } => Self::V6 { addr, port },
        }
    }

    /// 同族的未指定地址（`0.0.0.0:0` 或 `[::]:0`），用于打开出站报文套接字。
    pub fn unspecified_like(&self) -> Self {
        match self {
            Self::V4 { .. } => Self::V4 {
                addr: [0; 4],
                port: 0,
            },
            Self::V6 { .. } => Self::V6 {
                addr: [0; 8],
                port: 0,
            },
        }
    }

    /// 将 IPv6 地址从 8 段转换为 `Ipv6Addr`。
    pub fn as_ipv6_addr(&self) -> Option<Ipv6Addr> {
        match self {
            Self::V6 { addr, .. } => Some(Ipv6Addr::from(*addr)),
            _ => None,
        }
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSocketAddr::V4 { addr, port } => write!(
                f,
                "{}.{}.{}.{}:{}",
                addr[0], addr[1], addr[2], addr[3], port
            ),
            TransportSocketAddr::V6 { addr, port } => {
                let segments: Vec<String> = addr
                    .iter()
                    .map(|segment| format!("{:x}", segment))
                    .collect();
                write!(f, "[{}]:{}", segments.join(":"), port)
            }
        }
    }
}

impl From<SocketAddr> for TransportSocketAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl From<TransportSocketAddr> for SocketAddr {
    fn from(addr: TransportSocketAddr) -> Self {
        match addr {
            TransportSocketAddr::V4 { addr, port } => SocketAddr::from((addr, port)),
            TransportSocketAddr::V6 { addr, port } => {
                SocketAddr::from((Ipv6Addr::from(addr), port))
            }
        }
    }
}
