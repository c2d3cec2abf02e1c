pub mod config;
pub mod recolor;
pub mod simulate;
