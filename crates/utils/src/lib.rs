//! Process-wide helpers shared by the node agent binaries.

pub mod logging;
pub mod version;
