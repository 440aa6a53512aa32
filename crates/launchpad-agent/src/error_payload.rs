use crate::error::{DemoError, format_error_chain};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

/// JSON error body returned to callers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(code: &str, message: impl Into<String>, hint: Option<String>) -> ErrorPayload {
    ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    }
}

impl From<&DemoError> for ErrorPayload {
    fn from(err: &DemoError) -> Self {
        let message = match err {
            DemoError::Internal(inner) => format_error_chain(inner),
            other => other.to_string(),
        };
        encode(err.code(), message, err.hint().map(str::to_string))
    }
}
