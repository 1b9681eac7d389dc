//! Market-data ingestion: candle model, upstream sources, and the
//! backfill walker that seeds a tape with history before going live.

pub mod backfill;
pub mod candle;
pub mod sim;
pub mod source;

pub use backfill::{BackfillOptions, BackfillReport, Backfiller};
pub use candle::{Candle, Timeframe};
pub use sim::SimFeed;
pub use source::CandleSource;
