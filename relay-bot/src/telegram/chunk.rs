//! Splitting long replies to fit Telegram's per-message limit.

/// Maximum characters per Telegram text message.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Split a message into chunks of at most `max_chars` characters.
///
/// Cuts prefer a paragraph break, then a line break, then a sentence end,
/// then a space within the window, falling back to a hard cut. Every chunk
/// is trimmed and empty chunks are dropped, so joining the chunks gives the
/// original text up to whitespace at the cut points.
pub fn split_message(message: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = message.trim();

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_pos = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .or_else(|| window.rfind(". ").map(|p| p + 1))
            .or_else(|| window.rfind(' '))
            .filter(|&p| p > 0)
            .unwrap_or(limit);

        let chunk = remaining[..split_pos].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[split_pos..].trim_start();
    }

    chunks
}
