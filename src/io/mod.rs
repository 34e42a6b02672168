//! Map persistence

pub mod map_file;

pub use map_file::{
    decode_map, encode_map, read_map, write_map, MapFileContents, MapFileError, MapSummary, MAP_MAGIC,
    MAP_VERSION,
};
