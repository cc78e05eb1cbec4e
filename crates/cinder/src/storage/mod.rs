//! Piece storage: the file set, its handle cache, piece verification and
//! resume records.
pub mod cache;
pub mod files;
pub mod resume;
pub mod wrapper;

pub use files::FileSet;
pub use resume::ResumeRecord;
pub use wrapper::{PieceOutcome, StorageWrapper};
