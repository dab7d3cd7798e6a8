pub mod archive;
pub mod backup;
pub mod combine;
pub mod consolidate;
pub mod grading;
pub mod naming;
pub mod orchestrator; // process / extract / split / clear / complete
pub mod report;
pub mod roster;
pub mod split;
