pub mod backoff;
pub mod manager;
pub mod parser;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use manager::{FeedConfig, FeedStatus, StatusEvent, StreamManager, SubscriptionHandle};
pub use parser::{parse_frame, ParsedFrame};
pub use transport::{BinanceTickerTransport, FeedFrame, FeedTransport, ScriptedTransport};
