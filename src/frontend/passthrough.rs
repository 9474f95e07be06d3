// The identity frontend: callers already speak IR. This is the reference
// implementation of the Frontend contract; every conversion is the identity.

use crate::adapter::{AdapterMetadata, Capabilities, DialectStream, Frontend};
use crate::error::GatewayError;
use crate::ir::stream::{ChunkStream, StreamChunk};
use crate::ir::{ChatRequest, ChatResponse};

pub struct IrFrontend {
    metadata: AdapterMetadata,
}

impl IrFrontend {
    pub fn new() -> Self {
        Self {
            metadata: AdapterMetadata::new("ir-passthrough", "ir", Capabilities::default()),
        }
    }
}

impl Default for IrFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontend for IrFrontend {
    type Request = ChatRequest;
    type Response = ChatResponse;
    type StreamItem = StreamChunk;

    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    fn to_ir(&self, inbound: ChatRequest) -> Result<ChatRequest, GatewayError> {
        inbound.validate()?;
        Ok(inbound)
    }

    fn from_ir(
        &self,
        response: ChatResponse,
        _original: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        Ok(response)
    }

    fn stream_from_ir(
        &self,
        stream: ChunkStream,
        _original: &ChatRequest,
    ) -> DialectStream<StreamChunk> {
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Message;

    #[test]
    fn conversions_are_the_identity() {
        let frontend = IrFrontend::new();
        let request = ChatRequest::new(vec![Message::user("hello")]);
        let converted = frontend.to_ir(request.clone()).unwrap();
        assert_eq!(converted, request);
    }

    #[test]
    fn invalid_requests_are_still_rejected() {
        let frontend = IrFrontend::new();
        assert!(frontend.to_ir(ChatRequest::new(vec![])).is_err());
    }
}
