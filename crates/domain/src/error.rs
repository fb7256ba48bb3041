/// Error type for `sa-domain`. The only producer today is `Config`
/// parsing (§1.3/§6); kept as an enum rather than a bare `String` so
/// `sa-engine`'s `EngineError::Config` has something to `#[from]`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
