//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了与后端存储同步的机制，包括加载合并和写后批量刷新。

pub mod common;
pub mod gate;
pub mod write_behind;

pub use gate::LoadGate;
pub use write_behind::{WriteBehindStats, WriteBehindStore};
