//! Minimal streaming XML writer for the status page.

use std::fmt::{Display, Write};

pub const STATUS_CONTENT_TYPE: &str = "text/xml";

/// Writes nested tags with attributes and escaped content.
///
/// Attributes are only valid directly after `tag`, before any content or
/// child tag.
#[derive(Debug, Default)]
pub struct XmlWriter {
    out: String,
    stack: Vec<String>,
    start_tag_open: bool,
}

fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_start_tag(&mut self) {
        if self.start_tag_open {
            self.out.push('>');
            self.start_tag_open = false;
        }
    }

    pub fn tag(&mut self, name: &str) -> &mut Self {
        self.close_start_tag();
        self.out.push('<');
        self.out.push_str(name);
        self.stack.push(name.to_string());
        self.start_tag_open = true;
        self
    }

    pub fn attr(&mut self, name: &str, value: impl Display) -> &mut Self {
        debug_assert!(self.start_tag_open, "attribute {name} outside a start tag");
        let value = escape(&value.to_string());
        let _ = write!(self.out, " {name}=\"{value}\"");
        self
    }

    pub fn content(&mut self, text: impl Display) -> &mut Self {
        self.close_start_tag();
        self.out.push_str(&escape(&text.to_string()));
        self
    }

    pub fn end(&mut self) -> &mut Self {
        let Some(name) = self.stack.pop() else {
            return self;
        };
        if self.start_tag_open {
            self.out.push_str("/>");
            self.start_tag_open = false;
        } else {
            let _ = write!(self.out, "</{name}>");
        }
        self
    }

    /// Close any open tags and return the document.
    pub fn finish(mut self) -> String {
        while !self.stack.is_empty() {
            self.end();
        }
        self.out
    }
}
