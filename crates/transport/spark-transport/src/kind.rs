use std::fmt;
use std::str::FromStr;

/// 通道背后的传输种类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 用封闭枚举替代 `"tcp"`/`"udp"` 字符串，编译期即可穷举两类行为差异（关闭、发送目标、入站建模）。
///
/// ## 合同（What）
/// - `Stream`：可靠字节流（TCP），一个连接对应一个通道；
/// - `Datagram`：无连接报文关联（UDP），远端地址随报文学习；
/// - `scheme()` 返回稳定的小写标识，供日志与配置使用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// 可靠字节流。
    Stream,
    /// 无连接报文。
    Datagram,
}

impl TransportKind {
    /// 协议标识（`"tcp"` / `"udp"`）。
    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Stream => "tcp",
            TransportKind::Datagram => "udp",
        }
    }

    /// 是否为字节流。
    pub fn is_stream(self) -> bool {
        matches!(self, TransportKind::Stream)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// 无法识别的传输种类文本。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport kind `{0}`, expected `tcp` or `udp`")]
pub struct ParseKindError(pub String);

impl FromStr for TransportKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(TransportKind::Stream),
            "udp" | "datagram" => Ok(TransportKind::Datagram),
            _ => Err(ParseKindError(s.to_owned())),
        }
    }
}
