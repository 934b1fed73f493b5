//! Azure Blob Storage driver / Azure Blob 存储驱动
//!
//! Every request, server-side included, is authorized by a service SAS
//! signed locally with the account key.

pub mod config;
pub mod driver;
pub mod factory;
pub mod types;

pub use config::AzureConfig;
pub use driver::AzureBlobDriver;
pub use factory::AzureProviderFactory;
