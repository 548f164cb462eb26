//! YouTube Data API v3 comment source
//!
//! Pages through `commentThreads.list` for one video and maps API errors
//! onto the shared [`ServiceError`](commentline_core::ServiceError)
//! taxonomy (`quotaExceeded` pauses, `commentsDisabled` is fatal).

pub mod api;
pub mod schema;
pub mod video_id;

pub use api::{DEFAULT_BASE_URL, YouTubeSource};
pub use video_id::{extract_video_id, is_video_id};
