// =============================================================================
// API Module
// =============================================================================
//
// The gateway's network surface: the HTTP router, the WebSocket session
// handler, the JSON message codec, and the scheduled-trigger auth extractor.

pub mod auth;
pub mod messages;
pub mod rest;
pub mod ws;
