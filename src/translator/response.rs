//! Google `generateContent` response → Anthropic `message` (§4.4.2, non-streaming).

use uuid::Uuid;

use crate::anthropic::{map_stop_reason, ContentBlock, MessagesResponse, Usage};
use crate::google::GenerateContentResponse;
use crate::models::ModelFamily;

use super::signature_cache::{SignatureCache, MIN_SIGNATURE_LENGTH};

pub struct ResponseTranslator<'a> {
    pub signature_cache: &'a SignatureCache,
}

impl<'a> ResponseTranslator<'a> {
    pub fn new(signature_cache: &'a SignatureCache) -> Self {
        Self { signature_cache }
    }

    pub fn translate(
        &self,
        response: &GenerateContentResponse,
        requested_model: &str,
        family: ModelFamily,
    ) -> MessagesResponse {
        let candidate = response.candidates.first();
        let mut blocks = Vec::new();
        let mut has_tool_use = false;

        if let Some(candidate) = candidate {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(function_call) = &part.function_call {
                        let tool_use_id = format!("toolu_{}", Uuid::new_v4().simple());
                        if let Some(signature) = &part.thought_signature {
                            self.signature_cache.record(&tool_use_id, signature, family);
                        }
                        blocks.push(ContentBlock::ToolUse {
                            id: tool_use_id,
                            name: function_call.name.clone(),
                            input: function_call.args.clone(),
                        });
                        has_tool_use = true;
                    } else if part.is_thought() {
                        let signature = part.thought_signature.clone().unwrap_or_default();
                        if signature.len() >= MIN_SIGNATURE_LENGTH {
                            blocks.push(ContentBlock::Thinking {
                                thinking: part.text.clone().unwrap_or_default(),
                                signature: Some(signature),
                            });
                        }
                    } else if let Some(text) = &part.text {
                        blocks.push(ContentBlock::Text { text: text.clone() });
                    }
                }
            }
        }

        let finish_reason = candidate.and_then(|c| c.finish_reason.as_deref());
        let stop_reason = map_stop_reason(finish_reason, has_tool_use);
        let usage = response.usage_metadata.map(compute_usage).unwrap_or_default();

        MessagesResponse {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            kind: "message",
            role: "assistant",
            model: requested_model.to_string(),
            content: blocks,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage,
        }
    }
}

fn compute_usage(metadata: crate::google::UsageMetadata) -> Usage {
    Usage {
        input_tokens: (metadata.prompt_token_count - metadata.cached_content_token_count).max(0),
        output_tokens: metadata.candidates_token_count,
        cache_read_input_tokens: metadata.cached_content_token_count,
        cache_creation_input_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::{Candidate, Content, Part, UsageMetadata};

    #[test]
    fn happy_path_text_response() {
        let cache = SignatureCache::new();
        let translator = ResponseTranslator::new(&cache);
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content { role: "model".to_string(), parts: vec![Part::text("Hello!")] }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: 2,
                candidates_token_count: 2,
                cached_content_token_count: 0,
            }),
        };
        let translated = translator.translate(&response, "claude-sonnet-4-5", ModelFamily::Claude);
        assert_eq!(translated.stop_reason, Some("end_turn"));
        assert_eq!(translated.usage.input_tokens, 2);
        assert_eq!(translated.usage.output_tokens, 2);
        match &translated.content[0] {
            ContentBlock::Text { text } => assert_eq!(text, "Hello!"),
            _ => panic!("expected a text block"),
        }
    }

    #[test]
    fn tool_use_takes_stop_reason_priority() {
        let cache = SignatureCache::new();
        let translator = ResponseTranslator::new(&cache);
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::function_call("get_weather", serde_json::json!({"city": "SF"}), None)],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: None,
        };
        let translated = translator.translate(&response, "claude-sonnet-4-5", ModelFamily::Claude);
        assert_eq!(translated.stop_reason, Some("tool_use"));
    }

    #[test]
    fn caches_signature_for_tool_use_id() {
        let cache = SignatureCache::new();
        let translator = ResponseTranslator::new(&cache);
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::function_call(
                        "get_weather",
                        serde_json::json!({}),
                        Some("a-long-enough-signature".to_string()),
                    )],
                }),
                finish_reason: None,
            }],
            usage_metadata: None,
        };
        let translated = translator.translate(&response, "claude-sonnet-4-5", ModelFamily::Claude);
        let ContentBlock::ToolUse { id, .. } = &translated.content[0] else {
            panic!("expected tool_use block");
        };
        assert_eq!(cache.signature_for_tool_use(id).as_deref(), Some("a-long-enough-signature"));
    }
}
