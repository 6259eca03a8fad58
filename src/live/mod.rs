//! Live read side
//!
//! Readers see an in-flight answer grow without re-querying on every
//! fragment. [`reconstruct`] merges finalized rows with the chunk log,
//! [`ViewStore`] shares live queries between readers, and
//! [`LiveConversation`] ties the two together for one conversation.

pub mod conversation;
pub mod query;
pub mod reconstruct;
pub mod view_store;

pub use conversation::{LiveConversation, LiveSnapshot};
pub use query::{
    LiveQuery, QueryDescriptor, QueryResult, QuerySource, ResultStatus, StoreQuerySource,
};
pub use reconstruct::{in_flight_message, reconstruct};
pub use view_store::{
    SharedView, ViewOptions, ViewPhase, ViewStore, ViewSubscription, ANONYMOUS_SCOPE,
    DEFAULT_VIEW_TTL,
};
