// File: `crates/plebsync-core/src/lib.rs`
pub mod account;
pub mod comment;
pub mod merge;
pub mod page;
pub mod sort;
pub mod subplebbit;

pub use account::{
    Account, AccountComment, AccountCommentReply, AccountId, AccountSubplebbit, AccountVote,
    ProtocolOptions, Signer,
};
pub use comment::{Author, Cid, Comment, CommentContent, CommentUpdate};
pub use merge::Merge;
pub use page::{EntryPoint, Page, Pages};
pub use sort::{SortAlgorithm, SortType};
pub use subplebbit::{Role, RoleKind, Subplebbit};
