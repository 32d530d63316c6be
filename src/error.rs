use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid array index: {0}")]
    InvalidIndex(u64),

    #[error("range {offset}+{size} exceeds array size {array_size}")]
    InvalidRange {
        offset: u64,
        size: u64,
        array_size: u64,
    },

    #[error("user metadata size {size} exceeds limit {max}")]
    UserMetadataTooLarge { size: u64, max: u64 },

    #[error("access beyond end of store file: offset {offset}, file size {file_size}")]
    OutOfBounds { offset: u64, file_size: u64 },

    #[error("store file is corrupted: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
