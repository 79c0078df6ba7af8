pub mod extract;
pub mod overlay;
pub mod retry;
pub mod stream;
pub mod upstream;
pub mod validate;

pub use extract::{ExtractError, ExtractedCall, ExtractedCalls, extract_json_from_text,
    generate_call_id, parse_function_calls};
pub use overlay::{
    OverlayStrength, SchemaShapeError, apply_schema_overlay, apply_tool_overlay,
    check_schema_shape,
};
pub use retry::{
    RetryPolicy, StructuredFailure, StructuredRunError, StructuredSuccess,
    run_structured_exchange,
};
pub use stream::{StreamMode, StreamTelemetry, reassemble_sse};
pub use upstream::{
    ExchangeFuture, UpstreamBuildError, UpstreamClient, UpstreamError, UpstreamExchange,
    UpstreamReply,
    UpstreamStreamReply, build_upstream_body, message_content,
};
pub use validate::{ValidationError, validate_against_schema};
