// Market data module entrypoint
pub mod adapters; // venue-specific translation (e.g. Upbit)
pub mod markets;  // symbol <-> market id directory
