/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Per-participant agent driving the turn coordinator.
pub mod live_session;
/// Rep counting.
pub mod progress_service;
/// Room creation, joining and termination.
pub mod room_service;
/// Session change subscriptions over the change feed.
pub mod session_feed;
/// Server-Sent Events streaming of session changes.
pub mod sse_service;
/// Storage connection supervisor with reconnect backoff.
pub mod storage_supervisor;
/// Conditional turn initialisation and advance.
pub mod turn_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;

#[cfg(test)]
pub(crate) mod test_support;
