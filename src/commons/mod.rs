//! Common types used by the various coral components.
pub mod api;
pub mod error;
pub mod ext_serde;

//------------ Response Aliases ----------------------------------------------

pub use self::error::Error;

pub type CoralResult<T> = std::result::Result<T, self::error::Error>;
pub type CoralEmptyResult = std::result::Result<(), self::error::Error>;
