//! Common types used by the various components.

pub mod audit;
pub mod error;

pub use self::error::Error;


//------------ Response Aliases ----------------------------------------------

pub type PkiEmptyResult = std::result::Result<(), self::error::Error>;
pub type PkiResult<T> = std::result::Result<T, self::error::Error>;
