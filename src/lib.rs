//! Scheduled export of database relations to spreadsheets, mailed as
//! attachments.

pub mod config;
pub mod db;
pub mod export;
pub mod job;
pub mod mime;
pub mod model;
pub mod scheduler;
pub mod smtp;
