pub mod aggregator;
pub mod detection;
pub mod geometry;
pub mod image_source;
pub mod merge_engine;
pub mod tile_planner;
