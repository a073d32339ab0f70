//! Messages exchanged with the caller of the interactive shell.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use serde::{Deserialize, Serialize};

/// Structured status messages, serialised as
/// `{"type": "info", "message": "..."}` and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Info { message: String },
    Error { message: String },
    Connected,
    Disconnected,
}

impl ControlMessage {
    pub fn info(message: impl Into<String>) -> Self {
        ControlMessage::Info { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error { message: message.into() }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| Error::Json { source })
    }
}

/// Whether `text` is a structured control message rather than terminal input.
///
/// Any JSON object with a string `"type"` field counts, so that control
/// messages mixed into the input stream aren't typed into the shell.
pub fn is_control_message(text: &str) -> bool {
    let t = text.trim_start();
    if !t.starts_with('{') {
        return false;
    }
    match serde_json::from_str::<serde_json::Value>(t) {
        Ok(v) => v.get("type").is_some_and(|ty| ty.is_string()),
        Err(_) => false,
    }
}

/// Emitted by [`run_shell()`](crate::run_shell)
#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    Control(ControlMessage),
    /// Raw terminal output, stdout and stderr combined
    Output(Vec<u8>),
}

/// Input to [`run_shell()`](crate::run_shell)
#[derive(Debug, Clone, PartialEq)]
pub enum ShellInput {
    /// Keystrokes. Structured control messages are ignored.
    Text(String),
    Binary(Vec<u8>),
}

impl ShellInput {
    /// The bytes to send to the terminal, if any
    pub fn terminal_bytes(&self) -> Option<&[u8]> {
        match self {
            ShellInput::Text(t) if is_control_message(t) => {
                debug!("Ignoring control message in input");
                None
            }
            ShellInput::Text(t) => Some(t.as_bytes()),
            ShellInput::Binary(b) => Some(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::*;

    #[test]
    fn control_json() {
        assert_eq!(
            ControlMessage::info("hi").to_json().unwrap(),
            r#"{"type":"info","message":"hi"}"#
        );
        assert_eq!(ControlMessage::Connected.to_json().unwrap(), r#"{"type":"connected"}"#);
        assert_eq!(
            ControlMessage::Disconnected.to_json().unwrap(),
            r#"{"type":"disconnected"}"#
        );
        let m: ControlMessage =
            serde_json::from_str(r#"{"type":"error","message":"Auth failed"}"#).unwrap();
        assert_eq!(m, ControlMessage::error("Auth failed"));
    }

    #[test]
    fn control_in_input() {
        assert!(is_control_message(r#"{"type":"resize","cols":100}"#));
        assert!(is_control_message(r#"  {"type":"connected"}"#));
        assert!(!is_control_message(r#"{"type":3}"#));
        assert!(!is_control_message("{ls"));
        assert!(!is_control_message("ls -l\r"));

        assert_eq!(ShellInput::Text("ls\r".into()).terminal_bytes(), Some(&b"ls\r"[..]));
        assert_eq!(ShellInput::Text(r#"{"type":"x"}"#.into()).terminal_bytes(), None);
        assert_eq!(ShellInput::Binary(vec![3]).terminal_bytes(), Some(&[3u8][..]));
    }
}
