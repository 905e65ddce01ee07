pub mod core;

pub use self::core::{
    DEFAULT_API_HOSTNAME, DEFAULT_MODEL, FragmentStream, ReplicateClient, ReplicateError,
    ResponseStreamer, SseEvent, parse_event,
};
