//! On-disk stores: the per-shard binary tick cache and the parquet tables.
//!
//! Stage A writes each input shard to a fixed-width binary cache file so
//! later passes (tail quantiles, partitioned write, event-to-clock
//! synthesis) can re-read ticks without re-parsing raw CSV. The durable,
//! queryable outputs are parquet tables: per-year tick partitions and
//! per-year labeled-event tables. Consumers look columns up by name and
//! fail with a schema error when a required column is missing.

pub mod cache;
pub mod event_table;
pub mod tick_table;

pub use cache::{TickCacheReader, TickCacheWriter};
pub use event_table::{EventTableReader, EventTableWriter};
pub use tick_table::{PartitionedTickWriter, TickTableReader, TickTableWriter};
