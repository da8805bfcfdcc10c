// Bounded caches backing the trade / order / my-trade streams
pub mod bounded; // plain FIFO tape (public trades)
pub mod keyed;   // upsert-by-key tape (orders, my trades)

pub use bounded::BoundedSequence;
pub use keyed::BoundedKeyedSequence;
