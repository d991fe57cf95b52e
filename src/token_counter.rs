//! Local token counting for `POST /v1/messages/count_tokens` (§4.6).
//!
//! Approximates the upstream tokenizer well enough for client-side budgeting
//! without spending a quota-consuming upstream call. Family-dependent: Claude
//! and Gemini tokenizers diverge slightly on whitespace/punctuation handling.

use crate::anthropic::{ContentBlock, MessagesRequest};
use crate::models::ModelFamily;

/// Average characters per token, calibrated per family at a coarse level.
const CLAUDE_CHARS_PER_TOKEN: f64 = 3.8;
const GEMINI_CHARS_PER_TOKEN: f64 = 4.2;

pub fn count_tokens(request: &MessagesRequest, family: ModelFamily) -> u32 {
    let mut chars: usize = 0;

    if let Some(system) = &request.system {
        chars += system.joined_text().len();
    }

    for message in &request.messages {
        for block in message.content.clone().into_blocks() {
            chars += block_chars(&block);
        }
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            chars += tool.name.len();
            chars += tool.description.as_deref().map(str::len).unwrap_or(0);
            chars += tool.input_schema.to_string().len();
        }
    }

    let ratio = match family {
        ModelFamily::Claude => CLAUDE_CHARS_PER_TOKEN,
        ModelFamily::Gemini => GEMINI_CHARS_PER_TOKEN,
        ModelFamily::Other => CLAUDE_CHARS_PER_TOKEN,
    };

    ((chars as f64) / ratio).ceil() as u32
}

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.len(),
        ContentBlock::Thinking { thinking, .. } => thinking.len(),
        ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
        ContentBlock::ToolResult { content, .. } => content.as_ref().map(|c| c.to_string().len()).unwrap_or(0),
        ContentBlock::Image { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{Message, MessageContent, Role};

    fn sample(text: &str) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![Message { role: Role::User, content: MessageContent::Text(text.to_string()) }],
            system: None,
            tools: None,
            tool_choice: None,
            max_tokens: 50,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            thinking: None,
        }
    }

    #[test]
    fn counts_scale_with_text_length() {
        let short = count_tokens(&sample("hi"), ModelFamily::Claude);
        let long = count_tokens(&sample(&"word ".repeat(100)), ModelFamily::Claude);
        assert!(long > short);
    }

    #[test]
    fn family_affects_ratio() {
        let request = sample(&"word ".repeat(50));
        let claude = count_tokens(&request, ModelFamily::Claude);
        let gemini = count_tokens(&request, ModelFamily::Gemini);
        assert_ne!(claude, gemini);
    }
}
