//! Styled terminal messages for the user-facing surface. Diagnostic
//! detail goes through `tracing`; these are the lines an operator reads.

use crossterm::style::Stylize;

/// Width of the action column in terminal output
pub const ACTION_WIDTH: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Info,
    Success,
    Highlight,
    Error,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub action: String,
    pub details: String,
}

impl Message {
    pub fn new(action: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            details: details.into(),
        }
    }
}

pub fn show_message(message_type: MessageType, message: &Message) {
    let action = format!("{:>width$}", message.action, width = ACTION_WIDTH);
    let styled = match message_type {
        MessageType::Info => action.cyan(),
        MessageType::Success => action.green().bold(),
        MessageType::Highlight => action.yellow().bold(),
        MessageType::Error => action.red().bold(),
    };
    if message_type == MessageType::Error {
        eprintln!("{} {}", styled, message.details);
    } else {
        println!("{} {}", styled, message.details);
    }
}

#[macro_export]
macro_rules! show_message {
    ($message_type:expr, $message:expr) => {
        $crate::cli::display::show_message($message_type, &$message)
    };
}
