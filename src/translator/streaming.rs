//! Google streaming response → Anthropic SSE event sequence (§4.4.3).

use uuid::Uuid;

use crate::anthropic::{
    map_stop_reason, ContentBlockStart, Delta, MessageDeltaFields, MessagesResponse, PartialUsage, StreamEvent, Usage,
};
use crate::google::GenerateContentResponse;
use crate::models::ModelFamily;

use super::signature_cache::{SignatureCache, MIN_SIGNATURE_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingTagMode {
    Passthrough,
    Strip,
    Native,
}

impl ThinkingTagMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "passthrough" => Some(Self::Passthrough),
            "strip" => Some(Self::Strip),
            "native" => Some(Self::Native),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

struct OpenBlock {
    index: usize,
    kind: BlockKind,
    signature: Option<String>,
}

/// Per-response streaming state. One instance per in-flight `/v1/messages`
/// streaming request; not shared across requests.
pub struct StreamTranslator<'a> {
    signature_cache: &'a SignatureCache,
    mode: ThinkingTagMode,
    next_index: usize,
    open: Option<OpenBlock>,
    tag_state: TagAutomaton,
}

impl<'a> StreamTranslator<'a> {
    pub fn new(signature_cache: &'a SignatureCache, mode: ThinkingTagMode) -> Self {
        Self {
            signature_cache,
            mode,
            next_index: 0,
            open: None,
            tag_state: TagAutomaton::new(),
        }
    }

    pub fn message_start(&self, requested_model: &str, prompt_tokens: i64) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: format!("msg_{}", Uuid::new_v4().simple()),
                kind: "message",
                role: "assistant",
                model: requested_model.to_string(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: prompt_tokens,
                    output_tokens: 0,
                    cache_read_input_tokens: 0,
                    cache_creation_input_tokens: 0,
                },
            },
        }
    }

    /// Process one upstream chunk, returning the Anthropic events it produces.
    pub fn process_chunk(&mut self, chunk: &GenerateContentResponse, family: ModelFamily) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let Some(candidate) = chunk.candidates.first() else {
            return events;
        };
        let Some(content) = &candidate.content else {
            return events;
        };

        for part in &content.parts {
            if let Some(function_call) = &part.function_call {
                self.close_open_block(&mut events);
                let tool_id = format!("toolu_{}", Uuid::new_v4().simple());
                if let Some(signature) = &part.thought_signature {
                    self.signature_cache.record(&tool_id, signature, family);
                }
                let index = self.open_block(BlockKind::ToolUse, None, &mut events);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlockStart::ToolUse {
                        id: tool_id,
                        name: function_call.name.clone(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });
                let partial_json = serde_json::to_string(&function_call.args).unwrap_or_default();
                events.push(StreamEvent::ContentBlockDelta { index, delta: Delta::InputJsonDelta { partial_json } });
            } else if part.is_thought() {
                let signature = part.thought_signature.clone();
                if self.open.as_ref().map(|b| b.kind) != Some(BlockKind::Thinking) {
                    self.close_open_block(&mut events);
                    let index = self.open_block(BlockKind::Thinking, signature.clone(), &mut events);
                    events.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlockStart::Thinking { thinking: String::new() },
                    });
                }
                if let Some(open) = &mut self.open {
                    if signature.is_some() {
                        open.signature = signature;
                    }
                }
                if let Some(text) = &part.text {
                    let index = self.open.as_ref().unwrap().index;
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::ThinkingDelta { thinking: text.clone() },
                    });
                }
            } else if let Some(text) = &part.text {
                self.process_text(text, &mut events);
            }
        }

        events
    }

    fn process_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        match self.mode {
            ThinkingTagMode::Passthrough => self.emit_text(text, events),
            ThinkingTagMode::Strip | ThinkingTagMode::Native => {
                for segment in self.tag_state.feed(text) {
                    match segment {
                        TagSegment::Plain(chunk) => self.emit_text(&chunk, events),
                        TagSegment::ThinkingOpen => {
                            if self.mode == ThinkingTagMode::Native {
                                self.close_open_block(events);
                                let index = self.open_block(BlockKind::Thinking, None, events);
                                events.push(StreamEvent::ContentBlockStart {
                                    index,
                                    content_block: ContentBlockStart::Thinking { thinking: String::new() },
                                });
                            } else {
                                self.close_open_block(events);
                            }
                        }
                        TagSegment::ThinkingText(chunk) => {
                            if self.mode == ThinkingTagMode::Native {
                                if let Some(open) = &self.open {
                                    let index = open.index;
                                    events.push(StreamEvent::ContentBlockDelta {
                                        index,
                                        delta: Delta::ThinkingDelta { thinking: chunk },
                                    });
                                }
                            }
                            // Strip mode: discarded.
                        }
                        TagSegment::ThinkingClose => {
                            if self.mode == ThinkingTagMode::Native {
                                if let Some(open) = &mut self.open {
                                    open.signature = Some(synthesize_signature());
                                }
                                self.close_open_block(events);
                            }
                        }
                    }
                }
            }
        }
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        if self.open.as_ref().map(|b| b.kind) != Some(BlockKind::Text) {
            self.close_open_block(events);
            let index = self.open_block(BlockKind::Text, None, events);
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::Text { text: String::new() },
            });
        }
        let index = self.open.as_ref().unwrap().index;
        events.push(StreamEvent::ContentBlockDelta { index, delta: Delta::TextDelta { text: text.to_string() } });
    }

    fn open_block(&mut self, kind: BlockKind, signature: Option<String>, _events: &mut [StreamEvent]) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(OpenBlock { index, kind, signature });
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open.take() {
            if open.kind == BlockKind::Thinking {
                let signature = open.signature.unwrap_or_default();
                if signature.len() >= MIN_SIGNATURE_LENGTH {
                    events.push(StreamEvent::ContentBlockDelta {
                        index: open.index,
                        delta: Delta::SignatureDelta { signature },
                    });
                }
            }
            events.push(StreamEvent::ContentBlockStop { index: open.index });
        }
    }

    /// Flushes any partial tag buffer and closes the current block, then
    /// emits `message_delta`/`message_stop`.
    pub fn finish(&mut self, finish_reason: Option<&str>, has_tool_use: bool, output_tokens: i64) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(remainder) = self.tag_state.flush() {
            self.process_text(&remainder, &mut events);
        }
        self.close_open_block(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaFields {
                stop_reason: Some(map_stop_reason(finish_reason, has_tool_use)),
                stop_sequence: None,
            },
            usage: PartialUsage { output_tokens },
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

fn synthesize_signature() -> String {
    format!("native-thinking-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagState {
    Text,
    MaybeOpen,
    Thinking,
    MaybeClose,
}

enum TagSegment {
    Plain(String),
    ThinkingOpen,
    ThinkingText(String),
    ThinkingClose,
}

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

/// 4-state automaton matching literal `<thinking>`/`</thinking>` tags across
/// chunk boundaries. `partial` buffers a prospective tag match; flushed as
/// plain/thinking text on `flush()` if it never completes.
struct TagAutomaton {
    state: TagState,
    partial: String,
}

impl TagAutomaton {
    fn new() -> Self {
        Self { state: TagState::Text, partial: String::new() }
    }

    fn feed(&mut self, input: &str) -> Vec<TagSegment> {
        let mut segments = Vec::new();
        let mut plain = String::new();
        let mut thinking = String::new();

        for ch in input.chars() {
            match self.state {
                TagState::Text => {
                    if ch == '<' {
                        self.partial.push(ch);
                        self.state = TagState::MaybeOpen;
                    } else {
                        plain.push(ch);
                    }
                }
                TagState::MaybeOpen => {
                    self.partial.push(ch);
                    if OPEN_TAG.starts_with(&self.partial) {
                        if self.partial == OPEN_TAG {
                            if !plain.is_empty() {
                                segments.push(TagSegment::Plain(std::mem::take(&mut plain)));
                            }
                            segments.push(TagSegment::ThinkingOpen);
                            self.partial.clear();
                            self.state = TagState::Thinking;
                        }
                    } else {
                        plain.push_str(&self.partial);
                        self.partial.clear();
                        self.state = TagState::Text;
                    }
                }
                TagState::Thinking => {
                    if ch == '<' {
                        self.partial.push(ch);
                        self.state = TagState::MaybeClose;
                    } else {
                        thinking.push(ch);
                    }
                }
                TagState::MaybeClose => {
                    self.partial.push(ch);
                    if CLOSE_TAG.starts_with(&self.partial) {
                        if self.partial == CLOSE_TAG {
                            if !thinking.is_empty() {
                                segments.push(TagSegment::ThinkingText(std::mem::take(&mut thinking)));
                            }
                            segments.push(TagSegment::ThinkingClose);
                            self.partial.clear();
                            self.state = TagState::Text;
                        }
                    } else {
                        thinking.push_str(&self.partial);
                        self.partial.clear();
                        self.state = TagState::Thinking;
                    }
                }
            }
        }

        if !plain.is_empty() {
            segments.push(TagSegment::Plain(plain));
        }
        if !thinking.is_empty() {
            segments.push(TagSegment::ThinkingText(thinking));
        }
        segments
    }

    /// Called at stream end: whatever is left in `partial` never completed a
    /// tag and is flushed back as ordinary content in its originating state.
    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let leftover = std::mem::take(&mut self.partial);
        self.state = TagState::Text;
        Some(leftover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::{Candidate, Content, Part};

    fn chunk_with_text(text: &str) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content { role: "model".to_string(), parts: vec![Part::text(text)] }),
                finish_reason: None,
            }],
            usage_metadata: None,
        }
    }

    #[test]
    fn emits_text_block_start_delta_stop() {
        let cache = SignatureCache::new();
        let mut translator = StreamTranslator::new(&cache, ThinkingTagMode::Passthrough);
        let events = translator.process_chunk(&chunk_with_text("Let me "), ModelFamily::Claude);
        assert_eq!(events.len(), 2); // content_block_start + content_block_delta
        let finish_events = translator.finish(Some("STOP"), false, 5);
        assert!(matches!(finish_events.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn tool_use_after_text_closes_text_block_first() {
        let cache = SignatureCache::new();
        let mut translator = StreamTranslator::new(&cache, ThinkingTagMode::Passthrough);
        translator.process_chunk(&chunk_with_text("Let me "), ModelFamily::Claude);
        let chunk = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::function_call("get_weather", serde_json::json!({"city": "SF"}), None)],
                }),
                finish_reason: None,
            }],
            usage_metadata: None,
        };
        let events = translator.process_chunk(&chunk, ModelFamily::Claude);
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 1, .. }));
    }

    #[test]
    fn passthrough_mode_is_identity_over_thinking_tags() {
        let cache = SignatureCache::new();
        let mut translator = StreamTranslator::new(&cache, ThinkingTagMode::Passthrough);
        let events = translator.process_chunk(&chunk_with_text("<thinking>hmm</thinking>done"), ModelFamily::Claude);
        let StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text }, .. } = &events[1] else {
            panic!("expected a text delta");
        };
        assert_eq!(text, "<thinking>hmm</thinking>done");
    }

    #[test]
    fn native_mode_synthesizes_thinking_block_across_chunk_boundary() {
        let cache = SignatureCache::new();
        let mut translator = StreamTranslator::new(&cache, ThinkingTagMode::Native);
        let mut events = translator.process_chunk(&chunk_with_text("<thin"), ModelFamily::Claude);
        events.extend(translator.process_chunk(&chunk_with_text("king>hmm</thinking>done"), ModelFamily::Claude));
        let opened_thinking = events.iter().any(|e| {
            matches!(e, StreamEvent::ContentBlockStart { content_block: ContentBlockStart::Thinking { .. }, .. })
        });
        assert!(opened_thinking);
    }

    #[test]
    fn strip_mode_discards_thinking_text() {
        let cache = SignatureCache::new();
        let mut translator = StreamTranslator::new(&cache, ThinkingTagMode::Strip);
        let events = translator.process_chunk(&chunk_with_text("<thinking>hmm</thinking>done"), ModelFamily::Claude);
        let joined: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text }, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(joined, "done");
    }
}
