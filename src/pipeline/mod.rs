//! Engine pipeline
//!
//! `SplatEngine` ties fusion, sorting, persistence and render hand-off
//! together around a shared map.

pub mod engine;
pub mod sorter;

pub use engine::{AnchorError, SharedMap, SplatEngine, SplatEngineBuilder};
pub use sorter::{
    needs_resort, sort_back_to_front, BackgroundSorter, SortBuffer, SortOrder, SortSnapshot, SortSource, SortStamp,
};
