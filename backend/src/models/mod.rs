//! Domain models.

pub mod gav;
pub mod notification;
pub mod project_version;
pub mod refresh_status;
pub mod response;
pub mod schedule;
pub mod version;
pub mod version_mismatch;

pub use gav::{Gav, ParentEvent, ProjectCoordinates, ALL_VERSIONS};
pub use notification::{Notification, NotificationAction, NotificationResponse, NotificationStatus};
pub use project_version::{ArtifactDetail, ArtifactFile, ProjectVersionData};
pub use refresh_status::RefreshStatus;
pub use response::{BatchResponse, RefreshResponse};
pub use schedule::{ScheduleFrequency, ScheduleInfo, ScheduleInstance};
pub use version_mismatch::VersionMismatch;
