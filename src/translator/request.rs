//! Anthropic request → Google `generateContent` request (§4.4.1).

use serde_json::{json, Value};

use crate::anthropic::{ContentBlock, ImageSource, Message, MessagesRequest, Role};
use crate::google::{Content, GenerateContentRequest, GenerationConfig, Part, ThinkingConfig, Tool};
use crate::models::{ModelDescriptor, ModelFamily};

use super::schema::{sanitize_tool_name, SchemaSanitizer};
use super::signature_cache::SignatureCache;

const GEMINI_MAX_OUTPUT_TOKENS: u32 = 65_536;

pub struct RequestTranslator<'a> {
    pub schema_sanitizer: &'a SchemaSanitizer,
    pub signature_cache: &'a SignatureCache,
}

impl<'a> RequestTranslator<'a> {
    pub fn new(schema_sanitizer: &'a SchemaSanitizer, signature_cache: &'a SignatureCache) -> Self {
        Self { schema_sanitizer, signature_cache }
    }

    pub fn translate(&self, request: &MessagesRequest, descriptor: &ModelDescriptor) -> GenerateContentRequest {
        let gemini = descriptor.family == ModelFamily::Gemini;

        let system_instruction = request.system.as_ref().map(|system| Content {
            role: "system".to_string(),
            parts: vec![Part::text(system.joined_text())],
        });

        let contents: Vec<Content> = request
            .messages
            .iter()
            .map(|message| self.convert_message(message, gemini))
            .collect();

        let mut generation_config = GenerationConfig {
            max_output_tokens: Some(if gemini {
                request.max_tokens.min(GEMINI_MAX_OUTPUT_TOKENS)
            } else {
                request.max_tokens
            }),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop_sequences.clone(),
            thinking_config: None,
        };

        if descriptor.is_thinking {
            let wants_thinking = request.thinking.as_ref().map(|t| t.is_enabled()).unwrap_or(false);
            if wants_thinking {
                let budget = request.thinking.as_ref().and_then(|t| t.budget_tokens);
                let clamped = clamp_thinking_budget(budget, request.max_tokens);
                generation_config.thinking_config = Some(ThinkingConfig {
                    include_thoughts: true,
                    thinking_budget: clamped,
                });
            }
        }

        let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
            vec![Tool {
                function_declarations: tools
                    .iter()
                    .map(|tool| crate::google::FunctionDeclaration {
                        name: sanitize_tool_name(&tool.name),
                        description: tool.description.clone(),
                        parameters: self.schema_sanitizer.sanitize(&tool.input_schema, gemini),
                    })
                    .collect(),
            }]
        });

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
        }
    }

    /// One-paragraph hint enabling interleaved thinking for Claude-family
    /// thinking models used with tools (§4.4.1). Appended to the system
    /// instruction when applicable.
    pub fn interleaved_thinking_hint(&self, descriptor: &ModelDescriptor, request: &MessagesRequest) -> Option<&'static str> {
        let uses_tools = request.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        let wants_thinking = request.thinking.as_ref().map(|t| t.is_enabled()).unwrap_or(false);
        if descriptor.family == ModelFamily::Claude && descriptor.is_thinking && uses_tools && wants_thinking {
            Some(
                "You may interleave brief reasoning between tool calls; reasoning blocks preceding \
                 a tool call will be preserved verbatim across turns via their signature.",
            )
        } else {
            None
        }
    }

    fn convert_message(&self, message: &Message, gemini: bool) -> Content {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };

        let mut parts: Vec<Part> = Vec::new();
        let mut thinking_parts: Vec<Part> = Vec::new();
        let mut text_parts: Vec<Part> = Vec::new();
        let mut tool_parts: Vec<Part> = Vec::new();

        for block in message.content.clone().into_blocks() {
            match block {
                ContentBlock::Text { text } => text_parts.push(Part::text(text)),
                ContentBlock::Image { source } => parts.push(convert_image(&source)),
                ContentBlock::ToolUse { id, name, input } => {
                    let signature = self.signature_cache.signature_for_tool_use(&id);
                    tool_parts.push(Part::function_call(name, input, signature));
                }
                ContentBlock::ToolResult { content, .. } => {
                    let response = content.unwrap_or(Value::Null);
                    parts.push(Part::function_response("tool_result", json!({ "content": response })));
                }
                ContentBlock::Thinking { thinking, signature } => {
                    let valid_signature = signature
                        .as_deref()
                        .filter(|sig| self.signature_cache.is_valid(sig))
                        .map(|s| s.to_string())
                        .or_else(|| signature.clone());
                    if let Some(sig) = &valid_signature {
                        if self.signature_cache.is_valid(sig) {
                            thinking_parts.push(Part::thought(thinking, Some(sig.clone())));
                        }
                        // Signature present but invalid/unrecoverable: drop the block.
                    }
                    // No signature at all: drop the block (cannot be trusted upstream).
                }
            }
        }

        // Claude-family: filter trailing unsigned thinking parts.
        if !gemini {
            while thinking_parts.last().map(|p| p.thought_signature.is_none()).unwrap_or(false) {
                thinking_parts.pop();
            }
        }

        // Deterministic reorder: thinking* -> text* -> tool_use*.
        let mut ordered = Vec::with_capacity(thinking_parts.len() + text_parts.len() + tool_parts.len() + parts.len());
        ordered.append(&mut thinking_parts);
        ordered.append(&mut text_parts);
        ordered.append(&mut tool_parts);
        ordered.append(&mut parts);

        Content { role: role.to_string(), parts: ordered }
    }
}

fn convert_image(source: &ImageSource) -> Part {
    match source {
        ImageSource::Base64 { media_type, data } => Part {
            inline_data: Some(crate::google::InlineData {
                mime_type: media_type.clone(),
                data: data.clone(),
            }),
            ..Default::default()
        },
        ImageSource::Url { url } => Part {
            file_data: Some(crate::google::FileData {
                mime_type: "application/octet-stream".to_string(),
                file_uri: url.clone(),
            }),
            ..Default::default()
        },
    }
}

/// Clamps `thinkingBudget` to `max_tokens - 1`; drops it entirely if that
/// clamp would leave it at or below zero (§4.4.1).
fn clamp_thinking_budget(requested: Option<u32>, max_tokens: u32) -> Option<u32> {
    let ceiling = max_tokens.saturating_sub(1);
    if ceiling == 0 {
        return None;
    }
    match requested {
        Some(budget) => Some(budget.min(ceiling)),
        None => Some(ceiling),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{MessageContent, SystemPrompt};
    use crate::models::ModelCatalog;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelCatalog::default_catalog().get_or_default(id)
    }

    fn sample_request() -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("Hi".to_string()),
            }],
            system: Some(SystemPrompt::Text("be terse".to_string())),
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
    fn maps_roles_and_system_text() {
        let sanitizer = SchemaSanitizer::new();
        let cache = SignatureCache::new();
        let translator = RequestTranslator::new(&sanitizer, &cache);
        let request = sample_request();
        let translated = translator.translate(&request, &descriptor("claude-sonnet-4-5"));
        assert_eq!(translated.contents[0].role, "user");
        assert_eq!(translated.system_instruction.unwrap().parts[0].text.as_deref(), Some("be terse"));
    }

    #[test]
    fn clamps_thinking_budget_below_max_tokens() {
        assert_eq!(clamp_thinking_budget(Some(1000), 50), Some(49));
        assert_eq!(clamp_thinking_budget(None, 1), None);
        assert_eq!(clamp_thinking_budget(Some(10), 1), None);
    }

    #[test]
    fn drops_thinking_blocks_with_no_signature() {
        let sanitizer = SchemaSanitizer::new();
        let cache = SignatureCache::new();
        let translator = RequestTranslator::new(&sanitizer, &cache);
        let mut request = sample_request();
        request.messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Thinking { thinking: "hmm".to_string(), signature: None },
                ContentBlock::Text { text: "answer".to_string() },
            ]),
        });
        let translated = translator.translate(&request, &descriptor("claude-sonnet-4-5"));
        let assistant_content = &translated.contents[1];
        assert_eq!(assistant_content.parts.len(), 1);
        assert_eq!(assistant_content.parts[0].text.as_deref(), Some("answer"));
    }
}
