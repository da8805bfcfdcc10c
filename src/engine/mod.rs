// Engine module entrypoint
pub mod book;  // snapshot + delta order book
pub mod types; // canonical records shared by adapters and caches
