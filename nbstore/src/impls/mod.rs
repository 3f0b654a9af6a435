//! Concrete storage backends.
//!
//! | backend             | doc | blob | sync | awareness | persistence |
//! |---------------------|-----|------|------|-----------|-------------|
//! | `local`             |  ✓  |  ✓   |  ✓   |           | RocksDB     |
//! | `local` (v1 layout) |  ✓  |  ✓   |      |           | RocksDB     |
//! | `broadcast_channel` |     |      |      |     ✓     | none        |
//! | `cloud`             |  ✓  |      |      |     ✓     | server      |

pub mod broadcast_channel;
pub mod cloud;
pub mod local;
