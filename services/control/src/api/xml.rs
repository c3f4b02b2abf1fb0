//! GameStream XML 响应文档：`root` 根元素 + `status_code` 属性 + 标量子节点。
//!
//! 客户端只解析文档内的 `status_code` 属性，HTTP 层除路由 404 外一律 200。

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

/// 一棵待序列化的响应文档。
#[derive(Debug, Clone)]
pub(crate) struct XmlDoc {
    http_status: StatusCode,
    attrs: Vec<(&'static str, String)>,
    children: Vec<XmlNode>,
}

/// 文档子节点：叶子文本或嵌套元素。
#[derive(Debug, Clone)]
pub(crate) struct XmlNode {
    name: String,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub(crate) fn put(&mut self, name: impl Into<String>, value: impl ToString) {
        self.children.push(XmlNode {
            name: name.into(),
            text: value.to_string(),
            children: Vec::new(),
        });
    }
}

impl XmlDoc {
    /// 带协议状态码的空文档。
    pub(crate) fn with_status(code: u16) -> Self {
        Self {
            http_status: StatusCode::OK,
            attrs: vec![("status_code", code.to_string())],
            children: Vec::new(),
        }
    }

    /// 错误文档：状态码 + 状态消息。
    pub(crate) fn error(code: u16, message: impl Into<String>) -> Self {
        let mut doc = Self::with_status(code);
        doc.attrs.push(("status_message", message.into()));
        doc
    }

    /// 追加根元素属性。
    pub(crate) fn attr(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.attrs.push((name, value.into()));
        self
    }

    /// 覆盖 HTTP 层状态码（仅路由 404 使用）。
    pub(crate) fn http_status(mut self, status: StatusCode) -> Self {
        self.http_status = status;
        self
    }

    /// 写入标量子节点。
    pub(crate) fn put(&mut self, name: impl Into<String>, value: impl ToString) {
        self.children.push(XmlNode {
            name: name.into(),
            text: value.to_string(),
            children: Vec::new(),
        });
    }

    /// 追加嵌套子节点。
    pub(crate) fn push(&mut self, node: XmlNode) {
        self.children.push(node);
    }

    /// 序列化为 XML 文本。
    pub(crate) fn render(&self) -> String {
        let mut writer = Writer::new(Vec::new());
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)));

        let mut root = BytesStart::new("root");
        for (name, value) in &self.attrs {
            root.push_attribute((*name, value.as_str()));
        }
        let _ = writer.write_event(Event::Start(root));
        for child in &self.children {
            write_node(&mut writer, child);
        }
        let _ = writer.write_event(Event::End(BytesEnd::new("root")));

        String::from_utf8(writer.into_inner()).unwrap_or_default()
    }
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) {
    let _ = writer.write_event(Event::Start(BytesStart::new(node.name.as_str())));
    if !node.text.is_empty() {
        let _ = writer.write_event(Event::Text(BytesText::new(&node.text)));
    }
    for child in &node.children {
        write_node(writer, child);
    }
    let _ = writer.write_event(Event::End(BytesEnd::new(node.name.as_str())));
}

impl IntoResponse for XmlDoc {
    fn into_response(self) -> Response {
        (
            self.http_status,
            [
                (header::CONTENT_TYPE, "text/xml; charset=utf-8"),
                (header::CONNECTION, "close"),
            ],
            self.render(),
        )
            .into_response()
    }
}
