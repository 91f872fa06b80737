//! # wimcore — WIM (Windows Imaging) archive engine
//!
//! Format guarantees (frozen):
//! - All numeric fields are little-endian; never negotiated
//! - Content is addressed by SHA-1; identical streams are stored exactly once
//! - Compressed resources are chunked at 32,768 uncompressed bytes; every
//!   chunk is compressed independently and is randomly accessible through
//!   the chunk offset table
//! - A chunk whose compressed form would not be smaller is stored verbatim,
//!   with its stored size equal to its uncompressed size
//! - The codec (LZX or XPRESS) is a header flag; both codecs are stateless
//!   between chunks
//! - Empty streams reference no blob; the format elides empty content
//! - The validating reader rejects malformed input; reserved resource bits
//!   are masked with a warning only in lenient mode

pub mod error;
pub mod header;
pub mod codec;
pub mod integrity;
pub mod resource;
pub mod blob;
pub mod tree;
pub mod security;
pub mod metadata;
pub mod xmldata;
pub mod backend;
pub mod capture;
pub mod apply;
pub mod pool;
pub mod archive;

// Flat re-exports for the most common types.
pub use error::{ErrorKind, Result, WimError};
pub use header::{WimHeader, WIM_CHUNK_SIZE};
pub use codec::CodecKind;
pub use integrity::{sha1_of, Sha1Hash, SHA1_LEN, ZERO_HASH};
pub use resource::ResourceEntry;
pub use blob::{BlobDescriptor, BlobSource, BlobTable};
pub use tree::{Dentry, FileTimes, FileTree, Inode, Stream, StreamKind};
pub use security::SecurityTable;
pub use xmldata::ImageInfo;
pub use backend::{ApplyTarget, CaptureSource, FileRef};
pub use capture::{CaptureConfig, CaptureStats};
pub use apply::{ApplyOptions, ApplyStats, CancelToken};
pub use archive::{Image, OpenOptions, WimFile};
