use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("could not retrieve '{0}' remotely or from disk")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to parse reference data from '{source_url}': {detail}")]
    Parse { source_url: String, detail: String },
}
