//! Dispatch macro for the [`Adapter`](crate::db::Adapter) enum.
//!
//! Every dialect exposes the same method names, so most `Adapter` methods are a single
//! match that forwards to the variant. The macro writes that match once, including the
//! feature-gated SQL Server arm.

/// Bind the inner adapter of every variant to `$a` and evaluate `$body`.
///
/// # Example
///
/// ```ignore
/// dispatch_adapter!(self, a => a.pool_stats())
/// ```
macro_rules! dispatch_adapter {
    ($adapter:expr, $a:ident => $body:expr) => {
        match $adapter {
            $crate::db::Adapter::Sqlite($a) => $body,
            $crate::db::Adapter::MySql($a) => $body,
            $crate::db::Adapter::Postgres($a) => $body,
            #[cfg(feature = "mssql")]
            $crate::db::Adapter::Mssql($a) => $body,
        }
    };
}

pub(crate) use dispatch_adapter;
