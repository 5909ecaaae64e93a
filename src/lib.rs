//! SQL Server backup migration: remote backup, staging through container,
//! host and local machine, compression and upload to S3-compatible storage.

pub mod core;
pub mod utils;
