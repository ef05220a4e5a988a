pub mod job;
pub mod status;
