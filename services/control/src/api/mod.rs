//! 控制协议的响应编码层。

pub(crate) mod xml;
