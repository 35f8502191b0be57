pub mod acl;
pub mod entry;
pub mod host;
pub mod ineligible;
pub mod job;
pub mod label;
