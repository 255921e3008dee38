pub mod coordinator;
pub mod drift;
pub mod follower;
pub mod timeline;

pub use coordinator::{CommandOutbound, RosterStatus, SyncCoordinator};
pub use drift::{CorrectionAction, DriftController, DriftQuality};
pub use follower::{FollowerState, StatusOutbound, SyncFollower};
pub use timeline::MasterTimeline;
