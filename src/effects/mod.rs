//! Side effects the services register for remote post events.
//!
//! - `MediaCascade`: the media service drops media of deleted posts
//! - `SearchProjection`: the search service indexes created posts and
//!   removes deleted ones

pub mod media;
pub mod search;

pub use media::MediaCascade;
pub use search::{cached_search, SearchProjection};
