//! User-facing reply texts.

use crate::message::Sender;
use crate::session::ChatId;

/// `/help` text, naming the configured inactivity window.
pub fn help(expiry_minutes: i64) -> String {
    let unit = if expiry_minutes == 1 { "minute" } else { "minutes" };
    format!(
        "This bot relays your messages to an AI assistant.\n\n\
Commands:\n\
/start - Start a conversation (you will be asked for your API key)\n\
/end - End the conversation and forget your key\n\
/stop - Same as /end\n\
/help - This help message\n\
/echo [text] - Echo your message\n\
/info - Get chat information\n\n\
Conversations end automatically after {expiry_minutes} {unit} without messages."
    )
}

pub const SESSION_STARTED: &str = "Welcome! 👋\n\n\
To talk to the assistant, send your API key (it starts with \"sk-\").\n\
The key is kept in memory only for this conversation and is never stored.\n\n\
Send /end at any time to finish.";

pub const SESSION_ALREADY_RUNNING: &str =
    "A conversation is already in progress. Send /end to finish it before starting a new one.";

pub const SESSION_ENDED: &str = "Conversation ended. Your API key has been forgotten. Send /start to begin again.";

pub const NOTHING_TO_END: &str = "There is no conversation to end. Send /start to begin one.";

pub const CREDENTIAL_FORMAT: &str =
    "That doesn't look like an API key. Please send a key that starts with \"sk-\", or /end to cancel.";

pub const CREDENTIAL_ACCEPTED: &str = "API key accepted ✅ You can start chatting now.\n\n\
Tip: delete the message containing your key from this chat.";

pub const CREDENTIAL_REJECTED: &str =
    "The API key was rejected. The conversation has been closed; send /start to try again with another key.";

pub const UPSTREAM_AUTH: &str = "Your API key is no longer valid, so the conversation has been closed. \
Send /start to begin a new one with a working key.";

pub const UPSTREAM_RATE_LIMIT: &str =
    "The assistant is receiving too many requests right now. Please wait a moment and send your message again.";

pub const UPSTREAM_OTHER: &str = "Sorry, something went wrong while contacting the assistant. Please try again.";

pub const SESSION_GONE: &str = "This conversation is no longer active. Send /start to begin a new one.";

pub const ECHO_USAGE: &str = "Please provide some text to echo. Example: /echo Hello World";

/// Reply for plain text when no conversation is running.
pub fn plain_echo(text: &str) -> String {
    format!(
        "You said: \"{text}\"\n\nType /help to see available commands, or /start to talk to the assistant."
    )
}

pub fn echo(text: &str) -> String {
    format!("Echo: {text}")
}

/// `/info` output.
pub fn chat_info(chat_id: ChatId, chat_kind: Option<&str>, sender: Option<&Sender>) -> String {
    let mut info = String::from("Chat Information:\n");
    info.push_str(&format!("Chat ID: {chat_id}\n"));
    info.push_str(&format!("Chat Type: {}\n", chat_kind.unwrap_or("unknown")));

    if let Some(user) = sender {
        let or_unset = |v: &Option<String>| v.clone().unwrap_or_else(|| "Not set".to_string());
        info.push_str("\nUser Information:\n");
        info.push_str(&format!("User ID: {}\n", user.id));
        info.push_str(&format!("Username: {}\n", or_unset(&user.username)));
        info.push_str(&format!("First Name: {}\n", or_unset(&user.first_name)));
        info.push_str(&format!("Last Name: {}\n", or_unset(&user.last_name)));
        info.push_str(&format!("Is Bot: {}\n", user.is_bot));
    }

    info
}
