//! Tags wrapped around synthetic content so the model can tell it apart
//! from real tool output.

pub const TOOL_ERROR_TAG: &str = "tool_error";
pub const USER_CANCELLATION_TAG: &str = "user_cancellation";
pub const STOP_EVENT_TAG: &str = "stop_event";

/// Reply used for tool calls that never got an answer.
pub const NO_RESPONSE: &str =
    "<user_cancellation>Tool call was interrupted before it produced a response.</user_cancellation>";

/// Assistant placeholder that keeps roles alternating.
pub const ACKNOWLEDGEMENT: &str = "Understood.";

pub fn wrap(tag: &str, text: &str) -> String {
    format!("<{tag}>{text}</{tag}>")
}

pub fn tool_error(tool_name: &str, message: &str) -> String {
    wrap(TOOL_ERROR_TAG, &format!("{tool_name} failed: {message}"))
}

pub fn user_cancellation(text: &str) -> String {
    wrap(USER_CANCELLATION_TAG, text)
}

pub fn stop_event(reason: &str) -> String {
    wrap(STOP_EVENT_TAG, reason)
}

pub fn is_user_cancellation(text: &str) -> bool {
    text.starts_with(&format!("<{USER_CANCELLATION_TAG}>"))
}
