//! Client-side counterpart to the store: walks a local directory tree and
//! decides what to upload.

pub mod directory_record;
