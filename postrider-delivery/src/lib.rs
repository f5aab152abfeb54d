pub mod dialer;
pub mod dns;
pub mod dsn;
pub mod error;
pub mod retry;

pub use dialer::{ConnectHook, Connection, DialConfig, Dialer, NoConnectHook};
pub use dns::{DnsConfig, MxCandidate, MxResolver};
pub use dsn::{ComposedDsn, DsnConfig, compose_dsn};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use retry::RetryPolicy;
