use serde::{Deserialize, Serialize};

/// Requests understood by the UI helper, discriminated by `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum HelperRequest {
    Dialog(DialogRequest),
    Webview(WebviewRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogRequest {
    pub title: String,
    pub style: DialogStyle,
    pub text1: String,
    pub text2: String,
    pub button_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogStyle {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebviewRequest {
    pub name: String,
    pub url: String,
}

impl HelperRequest {
    pub fn about(version: &str) -> Self {
        HelperRequest::Dialog(DialogRequest {
            title: "About".to_string(),
            style: DialogStyle::Info,
            text1: "Koishi Desktop".to_string(),
            text2: format!("v{version}"),
            button_count: 1,
        })
    }

    pub fn already_running() -> Self {
        HelperRequest::Dialog(DialogRequest {
            title: "Already Running".to_string(),
            style: DialogStyle::Info,
            text1: "Koishi is already running.".to_string(),
            text2: "You can find the Koishi icon from notification area. \
                    Tap the Koishi icon to perform action."
                .to_string(),
            button_count: 1,
        })
    }

    pub fn webview(name: impl Into<String>, url: impl Into<String>) -> Self {
        HelperRequest::Webview(WebviewRequest {
            name: name.into(),
            url: url.into(),
        })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            HelperRequest::Dialog(_) => "dialog",
            HelperRequest::Webview(_) => "webview",
        }
    }
}
