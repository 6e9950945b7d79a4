//! CLI Commands

pub mod machine;
pub mod master;
pub mod plan;
pub mod status;
