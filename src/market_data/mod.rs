pub mod gap_engine;
pub mod series_store;
pub mod tick_folder;
pub mod time_grid;

// Re-export the core series types for convenient access (e.g. `use crate::market_data::SeriesStore`).
pub use gap_engine::{Arrival, FillPolicy, TimingStats};
pub use series_store::{SeriesChange, SeriesStore};
pub use tick_folder::{Amendment, FeedStats, FoldOutcome, TickFolder, TickRoute};
