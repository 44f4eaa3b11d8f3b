use serde_json::{Map, Value};

/// Everything needed to render and deliver one message. Built per message
/// and dropped once the send returns.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub template: &'static str,
    pub context: Map<String, Value>,
    pub recipients: Vec<String>,
    pub from: String,
    pub subject: String,
}

impl RenderJob {
    pub fn into_email(self, html_body: String) -> OutboundEmail {
        OutboundEmail {
            to: self.recipients,
            from: self.from,
            subject: self.subject,
            html_body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    pub html_body: String,
}
