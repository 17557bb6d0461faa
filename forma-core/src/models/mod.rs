pub mod content;
pub mod debrief;
pub mod session;

pub use content::{
    parse_generated, FocusArea, GeneratedContent, OverloadDigest, PrHighlight, StreakContext,
};
pub use debrief::{DebriefTrigger, SessionDebrief};
pub use session::WorkoutSession;
