//! Format Translator (§4.4): Anthropic Messages API <-> Google `generateContent`.

pub mod request;
pub mod response;
pub mod schema;
pub mod signature_cache;
pub mod streaming;

pub use request::RequestTranslator;
pub use response::ResponseTranslator;
pub use schema::SchemaSanitizer;
pub use signature_cache::SignatureCache;
pub use streaming::{StreamTranslator, ThinkingTagMode};

/// Shared translation state for one process: schema cache and thought-signature
/// cache both need to live across requests, not per-request.
pub struct Translators {
    pub schema_sanitizer: SchemaSanitizer,
    pub signature_cache: SignatureCache,
}

impl Translators {
    pub fn new() -> Self {
        Self {
            schema_sanitizer: SchemaSanitizer::new(),
            signature_cache: SignatureCache::new(),
        }
    }

    pub fn request_translator(&self) -> RequestTranslator<'_> {
        RequestTranslator::new(&self.schema_sanitizer, &self.signature_cache)
    }

    pub fn response_translator(&self) -> ResponseTranslator<'_> {
        ResponseTranslator::new(&self.signature_cache)
    }

    pub fn stream_translator(&self, mode: ThinkingTagMode) -> StreamTranslator<'_> {
        StreamTranslator::new(&self.signature_cache, mode)
    }
}

impl Default for Translators {
    fn default() -> Self {
        Self::new()
    }
}
