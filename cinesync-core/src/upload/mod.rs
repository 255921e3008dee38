pub mod repository;
pub mod service;

pub use repository::UploadSessionRepository;
pub use service::{spawn_cleanup, ExpireSummary, UploadService};
