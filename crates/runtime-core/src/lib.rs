//! Runtime Core - Foundation for lockstep training ranks
//!
//! Provides the error taxonomy, configuration, numeric values, and the
//! serializer and clock collaborators shared by the collective, metric and
//! checkpoint crates.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod numeric;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock, SESSION_TIME_FORMAT};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use config::{CheckpointConfig, GroupConfig, MetricsConfig, RuntimeConfig};
pub use error::{Error, ErrorKind, Result};
pub use numeric::{ArrayData, DType, NdArray, Numeric};
pub use types::*;
