// Layer 1 - Data Connectors
// Bybit public stream and the AI analysis endpoint

pub mod stream;
pub mod websocket;
pub mod ai_client;

// Re-export commonly used items for convenience
pub use stream::{MessageCallback, StreamClient, StreamError};
pub use websocket::{BybitWebSocket, WebSocketStats};
pub use ai_client::{AiAnalysis, AiClientStats, AnalysisError, ChatGptClient};
