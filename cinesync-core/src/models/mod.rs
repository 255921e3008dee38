pub mod device;
pub mod id;
pub mod session;
pub mod upload;
pub mod video;

pub use device::DeviceDescriptor;
pub use id::{generate_id, DeviceId, MovieId, SessionId, StorageHandle, UploadId};
pub use session::{mint_pin, Session};
pub use upload::{UploadSession, UploadStatus};
pub use video::{content_type_for, RegisteredVideo, VideoCatalog};
