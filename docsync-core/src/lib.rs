mod client;
mod library;

pub use client::{LibraryClient, PARTIAL_SUFFIX};
pub use library::{
    ApiErrorClass, ChangeKind, ChangePage, LibraryError, RemoteChangeEvent, RemoteFileVersion,
    RemoteItemKind, RemoteLibrary, UploadedFile,
};
pub use reqwest::StatusCode;
